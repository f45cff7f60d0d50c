//! Position lifecycle management for 15-minute up/down prediction markets.
//!
//! The [`LifecycleManager`] opens positions with maker-only limit buys, tracks
//! them until filled, and closes them on profit target, stop loss or an adverse
//! move of the underlying ("flip guard"). A [`RedemptionMonitor`] redeems
//! positions in resolved markets on its own timer.
//!
//! Venue access goes through the [`OrderGateway`] trait. [`PaperGateway`] is an
//! in-process implementation for paper trading and tests.

pub mod circuit_breaker;
pub mod closer;
pub mod entry;
pub mod error;
pub mod exit;
pub mod gateway;
pub mod in_flight;
pub mod journal;
pub mod ledger;
pub mod manager;
pub mod market;
pub mod paper;
pub mod redemption;
pub mod tick_loop;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use closer::{CloseGroup, CloseMode, CloseReason, CloseReport, PositionCloser, RetryPolicy, TokenCloseOutcome};
pub use entry::{EntryOutcome, EntrySkip, PendingEntryOrder};
pub use error::LifecycleError;
pub use exit::{ExitOutcome, ExitTrigger};
pub use gateway::{GatewayError, OpenOrder, OrderAck, OrderGateway, OrderRequest, OrderStatus, OrderType, Side};
pub use journal::{JournalSummary, SharedJournal, TradeJournal, TradeKind, TradeRecord};
pub use ledger::{FillRecord, Position, PositionLedger, SharedLedger};
pub use manager::{LifecycleManager, LifecycleStatus, Operation, PendingExitOrder, TickError, TickReport};
pub use market::{MarketDescriptor, MarketSnapshot};
pub use paper::{PaperFill, PaperGateway};
pub use redemption::{
    MarketResolver, PositionStore, RedemptionError, RedemptionMonitor, RedemptionPass, RedemptionReceipt,
    RedemptionState, Redeemer,
};
pub use tick_loop::TickLoop;
