//! In-memory ledger of open positions.
//!
//! A position's share count is always derived from its fill records
//! (`fill_size / fill_price` per fill), never from the current price. Partial
//! closes scale every fill record proportionally so that `size` stays equal to
//! the sum of the fill sizes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use updown_core::Direction;
use uuid::Uuid;

/// Ledger shared between the tick path and the redemption monitor.
pub type SharedLedger = Arc<RwLock<PositionLedger>>;

// =============================================================================
// Fill Records
// =============================================================================

/// One executed entry fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: String,
    /// Price paid per share (probability).
    pub fill_price: Decimal,
    /// Collateral spent.
    pub fill_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl FillRecord {
    #[must_use]
    pub fn new(order_id: impl Into<String>, fill_price: Decimal, fill_size: Decimal) -> Self {
        Self {
            order_id: order_id.into(),
            fill_price,
            fill_size,
            timestamp: Utc::now(),
        }
    }

    /// Shares acquired by this fill.
    #[must_use]
    pub fn shares(&self) -> Decimal {
        if self.fill_price.is_zero() {
            return Decimal::ZERO;
        }
        self.fill_size / self.fill_price
    }
}

// =============================================================================
// Position
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market_id: String,
    pub token_id: String,
    pub direction: Direction,
    /// Collateral committed; always the sum of `filled_orders[].fill_size`.
    pub size: Decimal,
    /// Volume-weighted entry price.
    pub entry_price: Decimal,
    /// Latest bid observed for the token.
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub filled_orders: Vec<FillRecord>,
    pub entry_timestamp: DateTime<Utc>,
}

impl Position {
    /// Opens a position from its first fill.
    #[must_use]
    pub fn from_fill(
        market_id: impl Into<String>,
        token_id: impl Into<String>,
        direction: Direction,
        fill: FillRecord,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.into(),
            token_id: token_id.into(),
            direction,
            size: fill.fill_size,
            entry_price: fill.fill_price,
            current_price: fill.fill_price,
            unrealized_pnl: Decimal::ZERO,
            entry_timestamp: fill.timestamp,
            filled_orders: vec![fill],
        }
    }

    /// Appends a fill and recomputes size and the average entry price.
    pub fn add_fill(&mut self, fill: FillRecord) {
        self.filled_orders.push(fill);
        self.recompute();
    }

    /// Shares held, from fill records.
    #[must_use]
    pub fn shares(&self) -> Decimal {
        self.filled_orders.iter().map(FillRecord::shares).sum()
    }

    /// Updates the current price and unrealized P&L.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = self.shares() * price - self.size;
    }

    /// Removes `shares` from the position by scaling every fill record.
    ///
    /// Returns the collateral (cost basis) released. Asking for more shares than
    /// are held empties the position.
    pub fn reduce_shares(&mut self, shares: Decimal) -> Decimal {
        let held = self.shares();
        if held.is_zero() || shares <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let before = self.size;
        let remaining = if shares >= held {
            Decimal::ZERO
        } else {
            (held - shares) / held
        };

        for fill in &mut self.filled_orders {
            fill.fill_size *= remaining;
        }
        self.recompute();

        before - self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size <= Decimal::ZERO
    }

    fn recompute(&mut self) {
        self.size = self.filled_orders.iter().map(|f| f.fill_size).sum();
        let shares = self.shares();
        if !shares.is_zero() {
            self.entry_price = self.size / shares;
        }
        self.unrealized_pnl = shares * self.current_price - self.size;
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Result of closing part of a set of positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedSlice {
    /// Positions removed entirely.
    pub closed: Vec<Position>,
    /// Ids of positions that were reduced but remain open.
    pub reduced: Vec<String>,
    /// Collateral released across closed and reduced positions.
    pub cost_basis: Decimal,
    /// Shares actually taken out of the ledger.
    pub shares: Decimal,
}

/// Open positions in entry order (oldest first).
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: Vec<Position>,
}

impl PositionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedLedger {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn add(&mut self, position: Position) {
        self.positions.push(position);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn positions_for_market(&self, market_id: &str) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|p| p.market_id == market_id)
            .cloned()
            .collect()
    }

    /// Clones the positions with the given ids, in ledger order.
    #[must_use]
    pub fn by_ids(&self, ids: &[String]) -> Vec<Position> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.positions
            .iter()
            .filter(|p| wanted.contains(p.id.as_str()))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn has_position_in_market(&self, market_id: &str) -> bool {
        self.positions.iter().any(|p| p.market_id == market_id)
    }

    /// Collateral committed across all open positions.
    #[must_use]
    pub fn total_exposure(&self) -> Decimal {
        self.positions.iter().map(|p| p.size).sum()
    }

    #[must_use]
    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }

    #[must_use]
    pub fn shares_by_token(&self) -> BTreeMap<String, Decimal> {
        let mut totals = BTreeMap::new();
        for position in &self.positions {
            *totals.entry(position.token_id.clone()).or_insert(Decimal::ZERO) += position.shares();
        }
        totals
    }

    /// Marks every position on `token_id` at `price`. Returns how many were updated.
    pub fn mark_token(&mut self, token_id: &str, price: Decimal) -> usize {
        let mut marked = 0;
        for position in self.positions.iter_mut().filter(|p| p.token_id == token_id) {
            position.mark(price);
            marked += 1;
        }
        marked
    }

    /// Removes positions by id. Unknown ids are ignored, so repeating a call is a no-op.
    pub fn remove_by_ids(&mut self, ids: &[String]) -> Vec<Position> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.positions)
            .into_iter()
            .partition(|p| wanted.contains(p.id.as_str()));
        self.positions = kept;
        removed
    }

    /// Takes `shares` out of the given positions, oldest first.
    ///
    /// Positions fully consumed are removed; the last one touched may be reduced.
    pub fn close_shares(&mut self, ids: &[String], shares: Decimal) -> ClosedSlice {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut slice = ClosedSlice::default();
        let mut remaining = shares;

        for position in self
            .positions
            .iter_mut()
            .filter(|p| wanted.contains(p.id.as_str()))
        {
            if remaining <= Decimal::ZERO {
                break;
            }
            let held = position.shares();
            let take = remaining.min(held);
            slice.cost_basis += position.reduce_shares(take);
            slice.shares += take;
            remaining -= take;
            if !position.is_empty() {
                slice.reduced.push(position.id.clone());
            }
        }

        let (closed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.positions)
            .into_iter()
            .partition(|p| wanted.contains(p.id.as_str()) && p.is_empty());
        self.positions = kept;
        slice.closed = closed;
        slice
    }
}
