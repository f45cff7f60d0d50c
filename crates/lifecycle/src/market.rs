use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use updown_core::Direction;

/// A single 15-minute up/down market.
///
/// Token index 0 is the UP outcome, index 1 is DOWN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDescriptor {
    pub id: String,
    pub token_ids: [String; 2],
    pub end_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    pub condition_id: String,
}

impl MarketDescriptor {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        up_token: impl Into<String>,
        down_token: impl Into<String>,
        end_timestamp: DateTime<Utc>,
        condition_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token_ids: [up_token.into(), down_token.into()],
            end_timestamp,
            resolved: false,
            condition_id: condition_id.into(),
        }
    }

    #[must_use]
    pub fn with_resolved(mut self, resolved: bool) -> Self {
        self.resolved = resolved;
        self
    }

    #[must_use]
    pub fn token_for(&self, direction: Direction) -> &str {
        &self.token_ids[direction.token_index()]
    }

    /// Outcome a token belongs to, if it is one of this market's tokens.
    #[must_use]
    pub fn direction_of(&self, token_id: &str) -> Option<Direction> {
        self.token_ids
            .iter()
            .position(|t| t == token_id)
            .and_then(Direction::from_token_index)
    }

    /// Both outcome tokens are known and distinct.
    #[must_use]
    pub fn has_tokens(&self) -> bool {
        let [up, down] = &self.token_ids;
        !up.is_empty() && !down.is_empty() && up != down
    }
}

/// Per-tick view of the underlying price and the active market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Latest underlying reference price.
    pub current_price: Decimal,
    /// Underlying price at the market's open; UP wins if the close is above it.
    pub price_to_beat: Decimal,
    /// Market currently trading, if any.
    pub market: Option<MarketDescriptor>,
    pub time_remaining_secs: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    #[must_use]
    pub fn new(
        current_price: Decimal,
        price_to_beat: Decimal,
        market: Option<MarketDescriptor>,
        time_remaining_secs: u64,
    ) -> Self {
        Self {
            current_price,
            price_to_beat,
            market,
            time_remaining_secs,
            timestamp: Utc::now(),
        }
    }

    /// Absolute distance between the underlying and the price to beat.
    #[must_use]
    pub fn distance(&self) -> Decimal {
        (self.current_price - self.price_to_beat).abs()
    }

    #[must_use]
    pub fn market_id(&self) -> Option<&str> {
        self.market.as_ref().map(|m| m.id.as_str())
    }
}
