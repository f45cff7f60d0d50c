//! Entry side of the lifecycle: preconditions, direction selection, maker
//! order placement, and tracking of resting entry orders until they fill.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use updown_core::{Direction, LifecycleConfig, StrategyConfig};

use crate::circuit_breaker::CircuitBreaker;
use crate::gateway::{round_shares, GatewayError, OrderGateway, OrderRequest};
use crate::ledger::{FillRecord, Position};
use crate::market::{MarketDescriptor, MarketSnapshot};

// =============================================================================
// Pending Entry Orders
// =============================================================================

/// A resting maker buy waiting to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntryOrder {
    pub order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub direction: Direction,
    /// Collateral committed (`shares * limit_price`).
    pub size: Decimal,
    pub shares: Decimal,
    pub limit_price: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl PendingEntryOrder {
    /// Builds the position created when this order fills at its limit price.
    #[must_use]
    pub fn into_position(self) -> Position {
        let fill = FillRecord::new(self.order_id, self.limit_price, self.size);
        Position::from_fill(self.market_id, self.token_id, self.direction, fill)
    }
}

/// Entry-side state: resting orders (at most one per token) and the anti-chase flag.
#[derive(Debug, Default)]
pub struct EntryController {
    pending: HashMap<String, PendingEntryOrder>,
    dip_observed: bool,
    market_id: Option<String>,
}

impl EntryController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to `market_id`. On a change, the anti-chase flag is reset and
    /// pending orders for other markets are returned for cancellation.
    pub fn roll_to_market(&mut self, market_id: &str) -> Vec<PendingEntryOrder> {
        if self.market_id.as_deref() == Some(market_id) {
            return Vec::new();
        }
        self.market_id = Some(market_id.to_string());
        self.dip_observed = false;
        self.take_stale(market_id)
    }

    /// Removes and returns pending orders that belong to any market other than `market_id`.
    pub fn take_stale(&mut self, market_id: &str) -> Vec<PendingEntryOrder> {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, order)| order.market_id != market_id)
            .map(|(token, _)| token.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|token| self.pending.remove(&token))
            .collect()
    }

    #[must_use]
    pub fn market_id(&self) -> Option<&str> {
        self.market_id.as_deref()
    }

    /// Records the ask seen for a held token. An ask below the entry threshold
    /// re-arms entries in a market where a position is already held.
    pub fn observe_price(&mut self, price: Decimal, entry_threshold: Decimal) {
        if price < entry_threshold {
            self.dip_observed = true;
        }
    }

    #[must_use]
    pub fn dip_observed(&self) -> bool {
        self.dip_observed
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    #[must_use]
    pub fn has_pending_for(&self, token_id: &str) -> bool {
        self.pending.contains_key(token_id)
    }

    #[must_use]
    pub fn has_pending_in_market(&self, market_id: &str) -> bool {
        self.pending.values().any(|o| o.market_id == market_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingEntryOrder> {
        self.pending.values()
    }

    /// Collateral committed to resting entry orders.
    #[must_use]
    pub fn committed_size(&self) -> Decimal {
        self.pending.values().map(|o| o.size).sum()
    }

    /// Tracks a newly placed order and consumes the anti-chase observation.
    pub fn record_submission(&mut self, order: PendingEntryOrder) {
        self.dip_observed = false;
        self.pending.insert(order.token_id.clone(), order);
    }

    /// Puts back an order whose cancellation failed.
    pub fn restore(&mut self, order: PendingEntryOrder) {
        self.pending.entry(order.token_id.clone()).or_insert(order);
    }

    pub fn remove(&mut self, token_id: &str) -> Option<PendingEntryOrder> {
        self.pending.remove(token_id)
    }

    /// Removes and returns every order placed at or before `as_of` that is no
    /// longer in `open_ids`. A resting order that left the book is treated as filled.
    pub fn take_filled(
        &mut self,
        open_ids: &HashSet<String>,
        as_of: DateTime<Utc>,
    ) -> Vec<PendingEntryOrder> {
        let filled: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, o)| o.placed_at <= as_of && !open_ids.contains(&o.order_id))
            .map(|(token, _)| token.clone())
            .collect();
        filled
            .into_iter()
            .filter_map(|token| self.pending.remove(&token))
            .collect()
    }

    /// Drops all tracking. Returns what was dropped so callers can log or cancel it.
    pub fn clear(&mut self) -> Vec<PendingEntryOrder> {
        self.dip_observed = false;
        self.pending.drain().map(|(_, order)| order).collect()
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Why no entry was attempted this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EntrySkip {
    Disabled,
    Inactive,
    NoMarket,
    CircuitOpen { message: String },
    ExposureLimit { exposure: Decimal, limit: Decimal },
    PriceDivergence { distance: Decimal, required: Decimal },
    TooEarly { remaining_secs: u64, max_secs: u64 },
    InFlight,
    PriceUnavailable { message: String },
    NoQualifyingSide,
    AntiChase,
    AlreadyPending { token_id: String },
    OrderTooSmall,
    /// Exit handling consumed the tick.
    ExitActive,
}

impl std::fmt::Display for EntrySkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrySkip::Disabled => write!(f, "strategy disabled"),
            EntrySkip::Inactive => write!(f, "trading not started"),
            EntrySkip::NoMarket => write!(f, "no live market"),
            EntrySkip::CircuitOpen { message } => write!(f, "circuit breaker open: {message}"),
            EntrySkip::ExposureLimit { exposure, limit } => {
                write!(f, "exposure {exposure} at limit {limit}")
            }
            EntrySkip::PriceDivergence { distance, required } => {
                write!(f, "distance {distance} below required {required}")
            }
            EntrySkip::TooEarly {
                remaining_secs,
                max_secs,
            } => write!(f, "{remaining_secs}s remaining, entries open below {max_secs}s"),
            EntrySkip::InFlight => write!(f, "entry already in flight"),
            EntrySkip::PriceUnavailable { message } => write!(f, "price unavailable: {message}"),
            EntrySkip::NoQualifyingSide => write!(f, "no side at entry price"),
            EntrySkip::AntiChase => write!(f, "waiting for a dip before re-entering"),
            EntrySkip::AlreadyPending { token_id } => {
                write!(f, "entry already pending for {token_id}")
            }
            EntrySkip::OrderTooSmall => write!(f, "order rounds to zero shares"),
            EntrySkip::ExitActive => write!(f, "exit handling this tick"),
        }
    }
}

/// Result of one entry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Skipped(EntrySkip),
    Submitted(PendingEntryOrder),
    Failed {
        token_id: String,
        error: GatewayError,
        breaker_tripped: bool,
    },
}

impl EntryOutcome {
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        matches!(self, EntryOutcome::Submitted(_))
    }
}

/// Inputs to the static entry preconditions.
#[derive(Debug)]
pub struct EntryContext<'a> {
    pub config: &'a StrategyConfig,
    pub settings: &'a LifecycleConfig,
    pub active: bool,
    pub snapshot: Option<&'a MarketSnapshot>,
    pub breaker: &'a CircuitBreaker,
    /// Open position size plus collateral committed to resting entries.
    pub exposure: Decimal,
    pub balance: Option<Decimal>,
}

/// Checks preconditions 1-6 in order and returns the market to trade.
///
/// # Errors
///
/// Returns the first failing precondition as an [`EntrySkip`].
pub fn check_preconditions<'a>(
    ctx: &EntryContext<'a>,
) -> Result<(&'a MarketSnapshot, &'a MarketDescriptor), EntrySkip> {
    if !ctx.active {
        return Err(EntrySkip::Inactive);
    }
    if !ctx.config.enabled {
        return Err(EntrySkip::Disabled);
    }

    let snapshot = ctx.snapshot.ok_or(EntrySkip::NoMarket)?;
    let market = snapshot
        .market
        .as_ref()
        .filter(|m| m.has_tokens() && !m.resolved)
        .ok_or(EntrySkip::NoMarket)?;

    ctx.breaker
        .can_trade()
        .map_err(|e| EntrySkip::CircuitOpen {
            message: e.to_string(),
        })?;

    if let Some(balance) = ctx.balance {
        let limit = balance * ctx.settings.max_exposure_fraction;
        if ctx.exposure >= limit {
            return Err(EntrySkip::ExposureLimit {
                exposure: ctx.exposure,
                limit,
            });
        }
    }

    if let Some(required) = ctx.config.price_difference {
        let distance = snapshot.distance();
        if distance < required {
            return Err(EntrySkip::PriceDivergence { distance, required });
        }
    }

    let max_secs = ctx.config.entry_time_remaining_max_secs;
    if snapshot.time_remaining_secs >= max_secs {
        return Err(EntrySkip::TooEarly {
            remaining_secs: snapshot.time_remaining_secs,
            max_secs,
        });
    }

    Ok((snapshot, market))
}

/// Picks the side whose ask has reached the entry threshold. When both have,
/// `tie_break` wins.
#[must_use]
pub fn select_direction(
    up_price: Decimal,
    down_price: Decimal,
    threshold: Decimal,
    tie_break: Direction,
) -> Option<Direction> {
    let price_of = |d: Direction| match d {
        Direction::Up => up_price,
        Direction::Down => down_price,
    };
    [tie_break, tie_break.opposite()]
        .into_iter()
        .find(|&d| price_of(d) >= threshold)
}

/// Shares bought with `trade_size` collateral at `limit_price`, rounded down.
#[must_use]
pub fn size_order(trade_size: Decimal, limit_price: Decimal) -> Decimal {
    if limit_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_shares(trade_size / limit_price)
}

/// Submits a post-only limit buy and returns the order to track.
///
/// # Errors
///
/// Returns the gateway error, including venue-reported rejections.
pub async fn place_entry<G: OrderGateway + ?Sized>(
    gateway: &G,
    market_id: &str,
    token_id: &str,
    direction: Direction,
    limit_price: Decimal,
    shares: Decimal,
) -> Result<PendingEntryOrder, GatewayError> {
    let placed_at = Utc::now();
    let ack = gateway
        .submit_order(OrderRequest::maker_buy(token_id, limit_price, shares))
        .await?
        .into_result()?;

    Ok(PendingEntryOrder {
        order_id: ack.order_id,
        market_id: market_id.to_string(),
        token_id: token_id.to_string(),
        direction,
        size: shares * limit_price,
        shares,
        limit_price,
        placed_at,
    })
}
