//! Trade journal: every fill, failed close and redemption, with realized P&L.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use updown_core::Direction;
use uuid::Uuid;

use crate::gateway::Side;

pub type SharedJournal = Arc<RwLock<TradeJournal>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Entry,
    ProfitTarget,
    StopLoss,
    FlipGuard,
    Manual,
    Redemption,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeKind::Entry => write!(f, "entry"),
            TradeKind::ProfitTarget => write!(f, "profit_target"),
            TradeKind::StopLoss => write!(f, "stop_loss"),
            TradeKind::FlipGuard => write!(f, "flip_guard"),
            TradeKind::Manual => write!(f, "manual"),
            TradeKind::Redemption => write!(f, "redemption"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub kind: TradeKind,
    pub market_id: String,
    pub token_id: String,
    pub direction: Direction,
    pub side: Side,
    pub order_id: Option<String>,
    /// Execution price (probability). Zero for failed records.
    pub price: Decimal,
    pub shares: Decimal,
    /// Collateral spent (buys) or received (sells, redemptions).
    pub amount: Decimal,
    /// Estimated taker fee.
    pub fee: Decimal,
    /// Realized P&L; `None` for entries and failures.
    pub realized_pnl: Option<Decimal>,
    pub position_ids: Vec<String>,
    pub success: bool,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    #[must_use]
    pub fn new(
        kind: TradeKind,
        market_id: impl Into<String>,
        token_id: impl Into<String>,
        direction: Direction,
        side: Side,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            market_id: market_id.into(),
            token_id: token_id.into(),
            direction,
            side,
            order_id: None,
            price: Decimal::ZERO,
            shares: Decimal::ZERO,
            amount: Decimal::ZERO,
            fee: Decimal::ZERO,
            realized_pnl: None,
            position_ids: Vec::new(),
            success: true,
            note: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    #[must_use]
    pub fn with_execution(mut self, price: Decimal, shares: Decimal, amount: Decimal) -> Self {
        self.price = price;
        self.shares = shares;
        self.amount = amount;
        self
    }

    #[must_use]
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    #[must_use]
    pub fn with_pnl(mut self, pnl: Decimal) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    #[must_use]
    pub fn with_positions(mut self, ids: Vec<String>) -> Self {
        self.position_ids = ids;
        self
    }

    #[must_use]
    pub fn failed(mut self, note: impl Into<String>) -> Self {
        self.success = false;
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Journal totals surfaced in the manager status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalSummary {
    pub trades: usize,
    pub failed: usize,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
}

#[derive(Debug, Default)]
pub struct TradeJournal {
    records: Vec<TradeRecord>,
    summary: JournalSummary,
}

impl TradeJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedJournal {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record(&mut self, record: TradeRecord) {
        self.summary.trades += 1;
        self.summary.fees += record.fee;
        if !record.success {
            self.summary.failed += 1;
        }
        if let Some(pnl) = record.realized_pnl {
            self.summary.realized_pnl += pnl;
            if pnl > Decimal::ZERO {
                self.summary.wins += 1;
            } else if pnl < Decimal::ZERO {
                self.summary.losses += 1;
            }
        }
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    #[must_use]
    pub fn summary(&self) -> &JournalSummary {
        &self.summary
    }

    #[must_use]
    pub fn realized_pnl(&self) -> Decimal {
        self.summary.realized_pnl
    }

    /// Share of P&L-bearing trades that were profitable.
    #[must_use]
    pub fn win_rate(&self) -> Option<f64> {
        let decided = self.summary.wins + self.summary.losses;
        if decided == 0 {
            return None;
        }
        Some(f64::from(self.summary.wins) / f64::from(decided))
    }

    /// # Errors
    ///
    /// Returns an error if a record fails to serialize.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records)
    }
}
