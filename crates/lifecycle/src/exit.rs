//! Exit decision logic.
//!
//! Conditions are checked in a fixed order and only the first satisfied one
//! fires per tick:
//!
//! 1. flip guard (pending): cancel resting entries when the underlying is too
//!    close to the price to beat;
//! 2. flip guard (filled): taker-close every open position in the market;
//! 3. profit target: maker-close every uncovered position at the target;
//! 4. stop loss: taker-close every open position in the market.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use updown_core::{LifecycleConfig, StrategyConfig};

use crate::closer::{CloseMode, CloseReason, CloseReport, RetryPolicy};
use crate::ledger::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    FlipGuardPending,
    FlipGuardFilled,
    ProfitTarget,
    StopLoss,
}

impl ExitTrigger {
    /// Execution style for closes caused by this trigger.
    #[must_use]
    pub fn close_mode(self, config: &StrategyConfig, settings: &LifecycleConfig) -> CloseMode {
        match self {
            ExitTrigger::ProfitTarget => CloseMode::Maker {
                price: config.profit_target(),
            },
            ExitTrigger::StopLoss => CloseMode::Aggressive {
                retry: RetryPolicy::StopLoss {
                    retry_delay: settings.stop_loss_retry_delay(),
                    emergency_price: settings.min_tick,
                },
            },
            ExitTrigger::FlipGuardPending | ExitTrigger::FlipGuardFilled => CloseMode::Aggressive {
                retry: RetryPolicy::SingleAttempt,
            },
        }
    }

    #[must_use]
    pub fn close_reason(self) -> CloseReason {
        match self {
            ExitTrigger::ProfitTarget => CloseReason::ProfitTarget,
            ExitTrigger::StopLoss => CloseReason::StopLoss,
            ExitTrigger::FlipGuardPending | ExitTrigger::FlipGuardFilled => CloseReason::FlipGuard,
        }
    }
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::FlipGuardPending => write!(f, "flip_guard_pending"),
            ExitTrigger::FlipGuardFilled => write!(f, "flip_guard_filled"),
            ExitTrigger::ProfitTarget => write!(f, "profit_target"),
            ExitTrigger::StopLoss => write!(f, "stop_loss"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    CancelPendingEntries,
    Close {
        trigger: ExitTrigger,
        position_ids: Vec<String>,
    },
}

/// Everything the exit conditions look at for one market.
#[derive(Debug)]
pub struct ExitInputs<'a> {
    pub config: &'a StrategyConfig,
    /// Profit-target tolerance as a probability.
    pub epsilon: Decimal,
    /// |current - price to beat|, when a snapshot is available.
    pub distance: Option<Decimal>,
    pub has_pending_entries: bool,
    /// Open positions of the market, oldest first.
    pub positions: &'a [Position],
    /// Current bid per token. Positions without a bid are not evaluated for
    /// profit target or stop loss.
    pub bids: &'a HashMap<String, Decimal>,
    /// Position ids already covered by a resting profit-target sell.
    pub covered: &'a HashSet<String>,
}

#[must_use]
pub fn evaluate(inputs: &ExitInputs<'_>) -> ExitDecision {
    let config = inputs.config;
    let below = |threshold: Option<Decimal>| match (inputs.distance, threshold) {
        (Some(distance), Some(threshold)) => distance < threshold,
        _ => false,
    };

    if inputs.has_pending_entries && below(config.flip_guard_pending_distance) {
        return ExitDecision::CancelPendingEntries;
    }

    if inputs.positions.is_empty() {
        return ExitDecision::Hold;
    }

    let all_ids = || -> Vec<String> { inputs.positions.iter().map(|p| p.id.clone()).collect() };

    if below(config.flip_guard_filled_distance) {
        return ExitDecision::Close {
            trigger: ExitTrigger::FlipGuardFilled,
            position_ids: all_ids(),
        };
    }

    let bid_of = |p: &Position| inputs.bids.get(&p.token_id).copied();

    let target = config.profit_target() - inputs.epsilon;
    if inputs
        .positions
        .iter()
        .any(|p| bid_of(p).is_some_and(|bid| bid >= target))
    {
        let uncovered: Vec<String> = inputs
            .positions
            .iter()
            .filter(|p| !inputs.covered.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();
        if uncovered.is_empty() {
            return ExitDecision::Hold;
        }
        return ExitDecision::Close {
            trigger: ExitTrigger::ProfitTarget,
            position_ids: uncovered,
        };
    }

    let stop = config.stop_loss();
    if inputs
        .positions
        .iter()
        .any(|p| bid_of(p).is_some_and(|bid| bid <= stop))
    {
        return ExitDecision::Close {
            trigger: ExitTrigger::StopLoss,
            position_ids: all_ids(),
        };
    }

    ExitDecision::Hold
}

/// Result of the exit phase of a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Nothing to do.
    Idle,
    /// Another exit still holds the exit flag.
    InFlight,
    PendingEntriesCancelled {
        cancelled: Vec<String>,
        failed: Vec<String>,
    },
    Closed {
        trigger: ExitTrigger,
        report: CloseReport,
    },
}

impl ExitOutcome {
    /// Entry handling is skipped for the rest of the tick after any exit action.
    #[must_use]
    pub fn skips_entry(&self) -> bool {
        !matches!(self, ExitOutcome::Idle)
    }
}
