//! Paper trading gateway.
//!
//! An in-process stand-in for the exchange that implements [`OrderGateway`],
//! [`MarketResolver`] and [`Redeemer`]. Quotes are set by the host; post-only
//! orders rest until [`PaperGateway::match_resting_orders`] finds the quote
//! through their limit, and taker orders fill immediately against the quote.
//!
//! # Example
//!
//! ```
//! use updown_lifecycle::paper::PaperGateway;
//! use updown_lifecycle::gateway::{OrderGateway, Side};
//! use updown_core::PaperConfig;
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() {
//!     let gateway = PaperGateway::new(PaperConfig::default());
//!     gateway.set_quote("up-token", dec!(0.95), dec!(0.96));
//!     let ask = gateway.get_price("up-token", Side::Buy).await.unwrap();
//!     assert_eq!(ask, dec!(0.96));
//! }
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use updown_core::{Direction, PaperConfig};
use uuid::Uuid;

use crate::gateway::{
    GatewayError, OpenOrder, OrderAck, OrderGateway, OrderRequest, OrderType, Side,
};
use crate::market::MarketDescriptor;
use crate::redemption::{MarketResolver, RedemptionError, RedemptionReceipt, Redeemer};

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Quote {
    bid: Decimal,
    ask: Decimal,
    /// Shares available at the bid; unlimited when `None`.
    bid_depth: Option<Decimal>,
}

/// A fill produced by the paper book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperFill {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub shares: Decimal,
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    holdings: HashMap<String, Decimal>,
    quotes: HashMap<String, Quote>,
    resting: Vec<OpenOrder>,
    submitted: Vec<OrderRequest>,
    cancelled: Vec<String>,
    fills: Vec<PaperFill>,
    fail_submit: VecDeque<GatewayError>,
    fail_cancel: VecDeque<GatewayError>,
    fail_open_orders: VecDeque<GatewayError>,
    fail_redeem: VecDeque<RedemptionError>,
    markets: HashMap<String, MarketDescriptor>,
    winners: HashMap<String, Direction>,
    redemption_calls: Vec<(String, u32)>,
}

impl PaperState {
    fn new(initial_balance: Decimal) -> Self {
        Self {
            balance: initial_balance,
            holdings: HashMap::new(),
            quotes: HashMap::new(),
            resting: Vec::new(),
            submitted: Vec::new(),
            cancelled: Vec::new(),
            fills: Vec::new(),
            fail_submit: VecDeque::new(),
            fail_cancel: VecDeque::new(),
            fail_open_orders: VecDeque::new(),
            fail_redeem: VecDeque::new(),
            markets: HashMap::new(),
            winners: HashMap::new(),
            redemption_calls: Vec::new(),
        }
    }

    fn held(&self, token_id: &str) -> Decimal {
        self.holdings.get(token_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Shares not already committed to resting sells.
    fn available_shares(&self, token_id: &str) -> Decimal {
        let reserved: Decimal = self
            .resting
            .iter()
            .filter(|o| o.side == Side::Sell && o.token_id == token_id)
            .map(|o| o.size)
            .sum();
        self.held(token_id) - reserved
    }

    fn add_holding(&mut self, token_id: &str, shares: Decimal) {
        *self.holdings.entry(token_id.to_string()).or_insert(Decimal::ZERO) += shares;
    }
}

// =============================================================================
// Paper Gateway
// =============================================================================

/// Simulated exchange for paper trading and tests.
///
/// Cloning is cheap and clones share the same book.
#[derive(Clone)]
pub struct PaperGateway {
    config: PaperConfig,
    state: Arc<RwLock<PaperState>>,
    rng: Arc<RwLock<StdRng>>,
}

impl std::fmt::Debug for PaperGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperGateway")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PaperGateway {
    #[must_use]
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            state: Arc::new(RwLock::new(PaperState::new(config.initial_balance))),
            rng: Arc::new(RwLock::new(rng)),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PaperConfig {
        &self.config
    }

    // ==================== Book ====================

    /// Sets the top of book for a token with unlimited bid depth.
    pub fn set_quote(&self, token_id: &str, bid: Decimal, ask: Decimal) {
        self.state.write().quotes.insert(
            token_id.to_string(),
            Quote {
                bid,
                ask,
                bid_depth: None,
            },
        );
    }

    pub fn set_quote_with_depth(&self, token_id: &str, bid: Decimal, ask: Decimal, bid_depth: Decimal) {
        self.state.write().quotes.insert(
            token_id.to_string(),
            Quote {
                bid,
                ask,
                bid_depth: Some(bid_depth),
            },
        );
    }

    /// Removes a token's quote; price lookups then fail with no liquidity.
    pub fn clear_quote(&self, token_id: &str) {
        self.state.write().quotes.remove(token_id);
    }

    /// Fills resting orders whose limit the current quote has reached.
    ///
    /// Buys fill when the ask is at or below the limit, sells when the bid is at
    /// or above it. Fills execute at the limit price.
    pub fn match_resting_orders(&self) -> Vec<PaperFill> {
        let mut state = self.state.write();
        let resting = std::mem::take(&mut state.resting);
        let mut fills = Vec::new();

        for order in resting {
            let crossed = state.quotes.get(&order.token_id).is_some_and(|q| match order.side {
                Side::Buy => q.ask <= order.price,
                Side::Sell => q.bid >= order.price,
            });
            if !crossed {
                state.resting.push(order);
                continue;
            }

            let shares = order.size - order.filled_size;
            match order.side {
                // Collateral was reserved when the order was placed.
                Side::Buy => state.add_holding(&order.token_id, shares),
                Side::Sell => {
                    state.add_holding(&order.token_id, -shares);
                    state.balance += shares * order.price;
                }
            }

            debug!(
                order_id = %order.order_id,
                token = %order.token_id,
                side = %order.side,
                price = %order.price,
                shares = %shares,
                "Paper resting order filled"
            );
            let fill = PaperFill {
                order_id: order.order_id,
                token_id: order.token_id,
                side: order.side,
                price: order.price,
                shares,
            };
            state.fills.push(fill.clone());
            fills.push(fill);
        }

        fills
    }

    // ==================== Accounts ====================

    pub fn credit_shares(&self, token_id: &str, shares: Decimal) {
        self.state.write().add_holding(token_id, shares);
    }

    #[must_use]
    pub fn holdings(&self, token_id: &str) -> Decimal {
        self.state.read().held(token_id)
    }

    #[must_use]
    pub fn balance(&self) -> Decimal {
        self.state.read().balance
    }

    // ==================== Failure Injection ====================

    /// Fails the next submission with `error` before it reaches the book.
    pub fn fail_next_submit(&self, error: GatewayError) {
        self.state.write().fail_submit.push_back(error);
    }

    pub fn fail_next_cancel(&self, error: GatewayError) {
        self.state.write().fail_cancel.push_back(error);
    }

    pub fn fail_next_open_orders(&self, error: GatewayError) {
        self.state.write().fail_open_orders.push_back(error);
    }

    pub fn fail_next_redeem(&self, error: RedemptionError) {
        self.state.write().fail_redeem.push_back(error);
    }

    // ==================== Markets ====================

    pub fn register_market(&self, market: MarketDescriptor) {
        self.state.write().markets.insert(market.id.clone(), market);
    }

    /// Marks a registered market resolved in favour of `winner`.
    pub fn resolve_market(&self, market_id: &str, winner: Direction) {
        let mut state = self.state.write();
        if let Some(market) = state.markets.get_mut(market_id) {
            market.resolved = true;
            state.winners.insert(market_id.to_string(), winner);
            info!(market = %market_id, winner = %winner, "Paper market resolved");
        }
    }

    // ==================== History ====================

    /// Orders that reached the book, in submission order.
    #[must_use]
    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.read().submitted.clone()
    }

    #[must_use]
    pub fn cancelled_orders(&self) -> Vec<String> {
        self.state.read().cancelled.clone()
    }

    #[must_use]
    pub fn fills(&self) -> Vec<PaperFill> {
        self.state.read().fills.clone()
    }

    /// `(condition_id, index_set)` of every successful redeem call.
    #[must_use]
    pub fn redemption_calls(&self) -> Vec<(String, u32)> {
        self.state.read().redemption_calls.clone()
    }

    // ==================== Simulation ====================

    fn should_fill(&self) -> bool {
        let mut rng = self.rng.write();
        rng.gen::<f64>() < self.config.fill_rate
    }

    fn generate_order_id(&self) -> String {
        format!("paper-{}", Uuid::new_v4())
    }

    async fn simulate_latency(&self) {
        if self.config.simulate_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.simulate_latency_ms)).await;
        }
    }

    fn process_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError> {
        let order_id = self.generate_order_id();

        if order.price <= Decimal::ZERO || order.price >= Decimal::ONE {
            return Ok(OrderAck::rejected(order_id, format!("invalid price {}", order.price)));
        }
        if order.size <= Decimal::ZERO {
            return Ok(OrderAck::rejected(order_id, format!("invalid size {}", order.size)));
        }

        let should_fill = order.post_only || self.should_fill();
        let mut state = self.state.write();
        state.submitted.push(order.clone());

        match order.side {
            Side::Buy => {
                let required = order.notional();
                if required > state.balance {
                    return Err(GatewayError::InsufficientBalance {
                        required,
                        available: state.balance,
                    });
                }
            }
            Side::Sell => {
                let available = state.available_shares(&order.token_id);
                if order.size > available {
                    return Err(GatewayError::InsufficientBalance {
                        required: order.size,
                        available,
                    });
                }
            }
        }

        if order.post_only {
            if order.side == Side::Buy {
                state.balance -= order.notional();
            }
            state.resting.push(OpenOrder {
                order_id: order_id.clone(),
                token_id: order.token_id.clone(),
                side: order.side,
                price: order.price,
                size: order.size,
                filled_size: Decimal::ZERO,
            });
            return Ok(OrderAck::live(order_id));
        }

        let Some(quote) = state.quotes.get(&order.token_id).copied() else {
            return Err(GatewayError::no_liquidity(&order.token_id));
        };
        if !should_fill {
            return Ok(OrderAck::matched(order_id, order.size, Decimal::ZERO, order.price));
        }

        match order.side {
            Side::Buy => {
                if order.price < quote.ask {
                    return Ok(OrderAck::matched(order_id, order.size, Decimal::ZERO, order.price));
                }
                state.balance -= order.size * quote.ask;
                state.add_holding(&order.token_id, order.size);
                state.fills.push(PaperFill {
                    order_id: order_id.clone(),
                    token_id: order.token_id.clone(),
                    side: Side::Buy,
                    price: quote.ask,
                    shares: order.size,
                });
                Ok(OrderAck::matched(order_id, order.size, order.size, quote.ask))
            }
            Side::Sell => {
                if order.price > quote.bid {
                    return Ok(OrderAck::matched(order_id, order.size, Decimal::ZERO, order.price));
                }
                let depth = quote.bid_depth.unwrap_or(order.size);
                let filled = match order.order_type {
                    OrderType::Fok if depth < order.size => Decimal::ZERO,
                    _ => order.size.min(depth),
                };
                if filled > Decimal::ZERO {
                    state.add_holding(&order.token_id, -filled);
                    state.balance += filled * quote.bid;
                    state.fills.push(PaperFill {
                        order_id: order_id.clone(),
                        token_id: order.token_id.clone(),
                        side: Side::Sell,
                        price: quote.bid,
                        shares: filled,
                    });
                }
                Ok(OrderAck::matched(order_id, order.size, filled, quote.bid))
            }
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn get_price(&self, token_id: &str, side: Side) -> Result<Decimal, GatewayError> {
        let state = self.state.read();
        let quote = state
            .quotes
            .get(token_id)
            .ok_or_else(|| GatewayError::no_liquidity(token_id))?;
        let price = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        if price <= Decimal::ZERO {
            return Err(GatewayError::no_liquidity(token_id));
        }
        Ok(price)
    }

    async fn get_fee_rate_bps(&self, _token_id: &str) -> Result<u32, GatewayError> {
        Ok(self.config.fee_rate_bps)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let mut state = self.state.write();
        if let Some(error) = state.fail_open_orders.pop_front() {
            return Err(error);
        }
        Ok(state.resting.clone())
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError> {
        self.simulate_latency().await;

        if let Some(error) = self.state.write().fail_submit.pop_front() {
            return Err(error);
        }
        self.process_order(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.simulate_latency().await;

        let mut state = self.state.write();
        if let Some(error) = state.fail_cancel.pop_front() {
            return Err(error);
        }
        let index = state
            .resting
            .iter()
            .position(|o| o.order_id == order_id)
            .ok_or_else(|| GatewayError::OrderNotFound(order_id.to_string()))?;
        let order = state.resting.remove(index);
        if order.side == Side::Buy {
            state.balance += (order.size - order.filled_size) * order.price;
        }
        state.cancelled.push(order.order_id);
        Ok(())
    }
}

#[async_trait]
impl MarketResolver for PaperGateway {
    async fn fetch_market(&self, market_id: &str) -> Result<MarketDescriptor, RedemptionError> {
        self.state
            .read()
            .markets
            .get(market_id)
            .cloned()
            .ok_or_else(|| RedemptionError::Resolver {
                market_id: market_id.to_string(),
                reason: "unknown market".to_string(),
            })
    }
}

#[async_trait]
impl Redeemer for PaperGateway {
    async fn redeem(&self, condition_id: &str, index_set: u32) -> Result<RedemptionReceipt, RedemptionError> {
        let mut state = self.state.write();
        if let Some(error) = state.fail_redeem.pop_front() {
            return Err(error);
        }

        let failure = |reason: &str| RedemptionError::Redeem {
            condition_id: condition_id.to_string(),
            index_set,
            reason: reason.to_string(),
        };

        let market = state
            .markets
            .values()
            .find(|m| m.condition_id == condition_id)
            .cloned()
            .ok_or_else(|| failure("unknown condition"))?;
        if !market.resolved {
            return Err(failure("market not resolved"));
        }
        let direction = [Direction::Up, Direction::Down]
            .into_iter()
            .find(|d| d.index_set() == index_set)
            .ok_or_else(|| failure("invalid index set"))?;

        let token_id = market.token_for(direction).to_string();
        let shares = state.holdings.remove(&token_id).unwrap_or(Decimal::ZERO);
        let payout = if state.winners.get(&market.id) == Some(&direction) {
            shares
        } else {
            Decimal::ZERO
        };
        state.balance += payout;
        state.redemption_calls.push((condition_id.to_string(), index_set));

        info!(
            market = %market.id,
            token = %token_id,
            shares = %shares,
            payout = %payout,
            "Paper redemption"
        );

        Ok(RedemptionReceipt {
            success: true,
            amount: Some(payout),
            tx_hash: Some(format!("paper-tx-{}", Uuid::new_v4())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn gateway() -> PaperGateway {
        PaperGateway::new(PaperConfig {
            initial_balance: dec!(100),
            ..Default::default()
        })
    }

    // ==================== Quote Tests ====================

    #[tokio::test]
    async fn test_price_by_side() {
        let g = gateway();
        g.set_quote("up", dec!(0.95), dec!(0.96));
        assert_eq!(g.get_price("up", Side::Buy).await.unwrap(), dec!(0.96));
        assert_eq!(g.get_price("up", Side::Sell).await.unwrap(), dec!(0.95));
    }

    #[tokio::test]
    async fn test_missing_quote_is_no_liquidity() {
        let g = gateway();
        let err = g.get_price("up", Side::Sell).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoLiquidity { .. }));
    }

    // ==================== Maker Tests ====================

    #[tokio::test]
    async fn test_maker_buy_rests_and_reserves_collateral() {
        let g = gateway();
        g.set_quote("up", dec!(0.95), dec!(0.965));

        let ack = g
            .submit_order(OrderRequest::maker_buy("up", dec!(0.95), dec!(2.1)))
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::Live);
        assert_eq!(g.balance(), dec!(98.005));
        assert_eq!(g.get_open_orders().await.unwrap().len(), 1);
        assert!(g.match_resting_orders().is_empty());
    }

    #[tokio::test]
    async fn test_resting_buy_fills_when_ask_reaches_limit() {
        let g = gateway();
        g.set_quote("up", dec!(0.95), dec!(0.965));
        g.submit_order(OrderRequest::maker_buy("up", dec!(0.95), dec!(2)))
            .await
            .unwrap();

        g.set_quote("up", dec!(0.94), dec!(0.95));
        let fills = g.match_resting_orders();

        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(0.95));
        assert_eq!(g.holdings("up"), dec!(2));
        assert!(g.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_refunds_reservation() {
        let g = gateway();
        let ack = g
            .submit_order(OrderRequest::maker_buy("up", dec!(0.5), dec!(10)))
            .await
            .unwrap();
        assert_eq!(g.balance(), dec!(95));

        g.cancel_order(&ack.order_id).await.unwrap();
        assert_eq!(g.balance(), dec!(100));
        assert_eq!(g.cancelled_orders(), vec![ack.order_id.clone()]);

        let err = g.cancel_order(&ack.order_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_resting_sell_reserves_shares() {
        let g = gateway();
        g.credit_shares("up", dec!(4));
        g.submit_order(OrderRequest::maker_sell("up", dec!(0.99), dec!(4)))
            .await
            .unwrap();

        let err = g
            .submit_order(OrderRequest::taker_sell("up", dec!(0.5), dec!(1)))
            .await
            .unwrap_err();
        assert!(err.is_balance_error());
    }

    // ==================== Taker Tests ====================

    #[tokio::test]
    async fn test_taker_sell_above_bid_is_killed() {
        let g = gateway();
        g.credit_shares("up", dec!(4));
        g.set_quote("up", dec!(0.9), dec!(0.92));

        let ack = g
            .submit_order(OrderRequest::taker_sell("up", dec!(0.91), dec!(4)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Cancelled);
        assert_eq!(g.holdings("up"), dec!(4));
    }

    #[tokio::test]
    async fn test_zero_fill_rate_never_fills_taker() {
        let g = PaperGateway::new(PaperConfig {
            fill_rate: 0.0,
            random_seed: Some(7),
            ..Default::default()
        });
        g.credit_shares("up", dec!(4));
        g.set_quote("up", dec!(0.9), dec!(0.92));

        let ack = g
            .submit_order(OrderRequest::taker_sell("up", dec!(0.9), dec!(4)))
            .await
            .unwrap();
        assert_eq!(ack.filled_size, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_invalid_price_rejected() {
        let g = gateway();
        let ack = g
            .submit_order(OrderRequest::maker_buy("up", dec!(1.2), dec!(1)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);
        assert!(ack.into_result().is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_does_not_reach_book() {
        let g = gateway();
        g.fail_next_submit(GatewayError::RateLimited { retry_after_secs: 1 });
        assert!(g
            .submit_order(OrderRequest::maker_buy("up", dec!(0.5), dec!(1)))
            .await
            .is_err());
        assert!(g.submitted_orders().is_empty());
        assert_eq!(g.balance(), dec!(100));
    }

    // ==================== Redemption Tests ====================

    #[tokio::test]
    async fn test_redeem_pays_winner_only() {
        let g = gateway();
        g.register_market(MarketDescriptor::new("m1", "up", "down", Utc::now(), "c1"));
        g.credit_shares("up", dec!(5));
        g.credit_shares("down", dec!(3));

        let err = g.redeem("c1", 1).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Redeem { .. }));

        g.resolve_market("m1", Direction::Down);
        assert!(g.fetch_market("m1").await.unwrap().resolved);

        let up = g.redeem("c1", 1).await.unwrap();
        let down = g.redeem("c1", 2).await.unwrap();
        assert_eq!(up.amount, Some(dec!(0)));
        assert_eq!(down.amount, Some(dec!(3)));
        assert_eq!(g.balance(), dec!(103));
        assert_eq!(g.holdings("down"), Decimal::ZERO);
    }
}
