//! Order gateway abstraction.
//!
//! The lifecycle manager never talks to a venue directly. Everything it needs from
//! the exchange goes through [`OrderGateway`]: quotes, fee rates, the open-order
//! list used for fill detection, and order submission/cancellation.
//!
//! Prices on this boundary are probabilities in `(0, 1)`; sizes are shares.

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal places accepted by the venue for share quantities.
pub const SHARE_DECIMALS: u32 = 2;

/// Rounds a share quantity toward zero to the venue's precision.
///
/// Rounding down guarantees a sell never asks for more shares than are held.
#[must_use]
pub fn round_shares(shares: Decimal) -> Decimal {
    shares.round_dp_with_strategy(SHARE_DECIMALS, RoundingStrategy::ToZero)
}

// =============================================================================
// Order Types
// =============================================================================

/// Side of an order (buy/sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy outcome shares. Quotes on this side are asks.
    Buy,
    /// Sell outcome shares. Quotes on this side are bids.
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type determining fill behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-til-Cancelled: rests on the book until filled or cancelled.
    Gtc,
    /// Fill-or-Kill: fills entirely or not at all.
    Fok,
    /// Fill-and-Kill: fills what is available, cancels the rest.
    Fak,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Gtc => write!(f, "GTC"),
            OrderType::Fok => write!(f, "FOK"),
            OrderType::Fak => write!(f, "FAK"),
        }
    }
}

/// Parameters for order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Outcome token to trade.
    pub token_id: String,

    /// Order side.
    pub side: Side,

    /// Number of shares.
    pub size: Decimal,

    /// Limit price (probability).
    pub price: Decimal,

    /// Reject instead of taking liquidity.
    pub post_only: bool,

    /// Order type determining fill behavior.
    pub order_type: OrderType,
}

impl OrderRequest {
    /// Post-only GTC limit buy. Used for every entry.
    #[must_use]
    pub fn maker_buy(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Buy,
            size,
            price,
            post_only: true,
            order_type: OrderType::Gtc,
        }
    }

    /// Post-only GTC limit sell. Used for profit-target exits.
    #[must_use]
    pub fn maker_sell(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Sell,
            size,
            price,
            post_only: true,
            order_type: OrderType::Gtc,
        }
    }

    /// Immediate FAK sell that crosses the book. Used for stop-loss, flip-guard
    /// and manual exits.
    #[must_use]
    pub fn taker_sell(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Sell,
            size,
            price,
            post_only: false,
            order_type: OrderType::Fak,
        }
    }

    /// Collateral value of this order if fully filled.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Status of an order as reported on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting on the book.
    Live,
    /// Some shares matched, remainder resting or killed.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Killed without (further) fills.
    Cancelled,
    /// Refused by the venue.
    Rejected,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Live => write!(f, "LIVE"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    /// Shares matched at submission time.
    pub filled_size: Decimal,
    /// Average price of the matched shares.
    pub avg_fill_price: Option<Decimal>,
    /// Venue message accompanying a rejection.
    pub error: Option<String>,
}

impl OrderAck {
    /// Acknowledgement of an order now resting on the book.
    #[must_use]
    pub fn live(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Live,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            error: None,
        }
    }

    #[must_use]
    pub fn matched(order_id: impl Into<String>, requested: Decimal, filled: Decimal, price: Decimal) -> Self {
        let status = if filled >= requested {
            OrderStatus::Filled
        } else if filled > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Cancelled
        };
        Self {
            order_id: order_id.into(),
            status,
            filled_size: filled,
            avg_fill_price: (filled > Decimal::ZERO).then_some(price),
            error: None,
        }
    }

    #[must_use]
    pub fn rejected(order_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Rejected,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            error: Some(reason.into()),
        }
    }

    /// Converts a venue-reported rejection into an error so callers handle both
    /// failure paths the same way.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Rejected`] when the status is `Rejected`.
    pub fn into_result(self) -> Result<Self, GatewayError> {
        if self.status == OrderStatus::Rejected {
            return Err(GatewayError::rejected(
                self.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(self)
    }
}

/// An order currently resting on the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by an [`OrderGateway`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Order was rejected by the venue.
    #[error("Order rejected: {reason}")]
    Rejected {
        /// Rejection reason from the venue.
        reason: String,
    },

    /// Not enough collateral or shares to execute the order.
    #[error("Insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        /// Amount required for the order.
        required: Decimal,
        /// Amount currently available.
        available: Decimal,
    },

    /// Token transfer allowance not granted to the exchange.
    #[error("Insufficient allowance for token {token_id}")]
    InsufficientAllowance {
        /// Token lacking an allowance.
        token_id: String,
    },

    /// Nothing on the book to trade against.
    #[error("No liquidity for token {token_id}")]
    NoLiquidity {
        /// Token with an empty book side.
        token_id: String,
    },

    /// Price moved past the limit before the order reached the book.
    #[error("Price moved for token {token_id}")]
    PriceMoved {
        /// Token whose price moved.
        token_id: String,
    },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Order id unknown to the venue (already filled, cancelled or never placed).
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Gateway lacks credentials or endpoints.
    #[error("Gateway not configured: {0}")]
    NotConfigured(String),

    /// Any other API failure.
    #[error("API error: {0}")]
    Api(String),
}

impl GatewayError {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn no_liquidity(token_id: impl Into<String>) -> Self {
        Self::NoLiquidity {
            token_id: token_id.into(),
        }
    }

    /// Returns true if the same request may succeed when repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::NoLiquidity { .. }
                | GatewayError::PriceMoved { .. }
                | GatewayError::RateLimited { .. }
                | GatewayError::Network(_)
                | GatewayError::Timeout(_)
        )
    }

    /// Returns true for balance or allowance shortfalls, which repeating the
    /// request cannot fix.
    #[must_use]
    pub fn is_balance_error(&self) -> bool {
        matches!(
            self,
            GatewayError::InsufficientBalance { .. } | GatewayError::InsufficientAllowance { .. }
        )
    }
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// Venue operations required by the lifecycle manager.
///
/// Implementations must be cheap to call concurrently: the position closer
/// submits one order per token in parallel.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Best price for `side`: the ask for [`Side::Buy`], the bid for [`Side::Sell`].
    ///
    /// # Errors
    /// - `GatewayError::NoLiquidity` - Book side is empty
    /// - `GatewayError::Network` / `Timeout` - Transport failure
    async fn get_price(&self, token_id: &str, side: Side) -> Result<Decimal, GatewayError>;

    /// Taker fee rate for a token, in basis points.
    async fn get_fee_rate_bps(&self, token_id: &str) -> Result<u32, GatewayError>;

    /// All of this account's orders still resting on the book.
    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Submits a single order.
    ///
    /// A venue rejection may be reported either as an error or as an
    /// acknowledgement with [`OrderStatus::Rejected`].
    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError>;

    /// Cancels a resting order.
    ///
    /// # Errors
    /// - `GatewayError::OrderNotFound` - Order already filled or cancelled
    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_shares_truncates() {
        assert_eq!(round_shares(dec!(6.153846)), dec!(6.15));
        assert_eq!(round_shares(dec!(2.109999)), dec!(2.10));
        assert_eq!(round_shares(dec!(0.009)), dec!(0.00));
    }

    #[test]
    fn test_order_constructors() {
        let buy = OrderRequest::maker_buy("up", dec!(0.95), dec!(2.10));
        assert!(buy.post_only);
        assert_eq!(buy.order_type, OrderType::Gtc);
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.notional(), dec!(1.9950));

        let sell = OrderRequest::taker_sell("up", dec!(0.90), dec!(3));
        assert!(!sell.post_only);
        assert_eq!(sell.order_type, OrderType::Fak);
        assert_eq!(sell.side, Side::Sell);
    }

    #[test]
    fn test_ack_status_from_fill() {
        assert_eq!(
            OrderAck::matched("a", dec!(5), dec!(5), dec!(0.9)).status,
            OrderStatus::Filled
        );
        assert_eq!(
            OrderAck::matched("a", dec!(5), dec!(2), dec!(0.9)).status,
            OrderStatus::PartiallyFilled
        );
        let empty = OrderAck::matched("a", dec!(5), Decimal::ZERO, dec!(0.9));
        assert_eq!(empty.status, OrderStatus::Cancelled);
        assert_eq!(empty.avg_fill_price, None);
    }

    #[test]
    fn test_rejected_ack_into_result() {
        let err = OrderAck::rejected("a", "post-only would cross")
            .into_result()
            .unwrap_err();
        assert_eq!(err, GatewayError::rejected("post-only would cross"));
        assert!(OrderAck::live("b").into_result().is_ok());
    }

    #[test]
    fn test_error_classification() {
        assert!(GatewayError::no_liquidity("t").is_retryable());
        assert!(GatewayError::Timeout("slow".into()).is_retryable());
        assert!(!GatewayError::rejected("bad").is_retryable());

        let balance = GatewayError::InsufficientBalance {
            required: dec!(2),
            available: dec!(1),
        };
        assert!(balance.is_balance_error());
        assert!(!balance.is_retryable());
        assert!(GatewayError::InsufficientAllowance {
            token_id: "t".into()
        }
        .is_balance_error());
    }
}
