//! Position closer.
//!
//! Positions are grouped by token and each group is closed with exactly one
//! order per pass. Share quantities come from the fill records, never from the
//! current price. Tokens are closed concurrently and independently: a failure
//! on one token does not affect the others.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};
use updown_core::Direction;

use crate::gateway::{round_shares, GatewayError, OrderAck, OrderGateway, OrderRequest, Side};
use crate::journal::TradeKind;
use crate::ledger::Position;

const BPS_DIVISOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

// =============================================================================
// Aggregation
// =============================================================================

/// All positions on one token, closed as a single order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseGroup {
    pub token_id: String,
    pub market_id: String,
    pub direction: Direction,
    /// Ids in ledger order (oldest first).
    pub position_ids: Vec<String>,
    /// Collateral committed across the group.
    pub total_size: Decimal,
    /// Exact shares held across the group.
    pub total_shares: Decimal,
}

impl CloseGroup {
    /// Shares to put on the order, rounded down to venue precision.
    #[must_use]
    pub fn order_shares(&self) -> Decimal {
        round_shares(self.total_shares)
    }
}

/// Groups positions by token. Output is ordered by token id.
#[must_use]
pub fn aggregate(positions: &[Position]) -> Vec<CloseGroup> {
    let mut groups: BTreeMap<&str, CloseGroup> = BTreeMap::new();
    for position in positions {
        let group = groups
            .entry(position.token_id.as_str())
            .or_insert_with(|| CloseGroup {
                token_id: position.token_id.clone(),
                market_id: position.market_id.clone(),
                direction: position.direction,
                position_ids: Vec::new(),
                total_size: Decimal::ZERO,
                total_shares: Decimal::ZERO,
            });
        group.position_ids.push(position.id.clone());
        group.total_size += position.size;
        group.total_shares += position.shares();
    }
    groups.into_values().collect()
}

// =============================================================================
// Modes and Reasons
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// One taker attempt at the current bid.
    SingleAttempt,
    /// Immediate attempt, one retry after `retry_delay`, then a last-resort
    /// pass at `emergency_price`.
    StopLoss {
        retry_delay: Duration,
        emergency_price: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseMode {
    /// Post-only limit sell resting at `price`.
    Maker { price: Decimal },
    /// Taker sell against the current bid.
    Aggressive { retry: RetryPolicy },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "note", rename_all = "snake_case")]
pub enum CloseReason {
    ProfitTarget,
    StopLoss,
    FlipGuard,
    Manual(String),
}

impl CloseReason {
    #[must_use]
    pub fn trade_kind(&self) -> TradeKind {
        match self {
            CloseReason::ProfitTarget => TradeKind::ProfitTarget,
            CloseReason::StopLoss => TradeKind::StopLoss,
            CloseReason::FlipGuard => TradeKind::FlipGuard,
            CloseReason::Manual(_) => TradeKind::Manual,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ProfitTarget => write!(f, "profit target"),
            CloseReason::StopLoss => write!(f, "stop loss"),
            CloseReason::FlipGuard => write!(f, "flip guard"),
            CloseReason::Manual(note) => write!(f, "manual: {note}"),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TokenCloseOutcome {
    /// Maker sell resting on the book; positions stay open until it fills.
    Resting {
        order_id: String,
        price: Decimal,
        shares: Decimal,
    },
    /// Every share sold.
    Filled {
        order_ids: Vec<String>,
        avg_price: Decimal,
        shares: Decimal,
        proceeds: Decimal,
        fee: Decimal,
        attempts: u32,
    },
    /// Some shares sold; the rest remain open.
    Partial {
        order_ids: Vec<String>,
        avg_price: Decimal,
        requested: Decimal,
        filled: Decimal,
        proceeds: Decimal,
        fee: Decimal,
        attempts: u32,
        error: Option<GatewayError>,
    },
    /// Nothing sold.
    Failed {
        error: GatewayError,
        attempts: u32,
        /// Positions remain open after every permitted attempt.
        requires_attention: bool,
    },
    /// No order was sent (e.g. the group rounds to zero shares).
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenClose {
    pub group: CloseGroup,
    pub outcome: TokenCloseOutcome,
}

/// Per-token results of one close operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    pub reason: CloseReason,
    pub tokens: Vec<TokenClose>,
}

impl CloseReport {
    #[must_use]
    pub fn empty(reason: CloseReason) -> Self {
        Self {
            reason,
            tokens: Vec::new(),
        }
    }

    /// Every token either sold out or has a resting sell.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tokens.iter().all(|t| {
            matches!(
                t.outcome,
                TokenCloseOutcome::Filled { .. } | TokenCloseOutcome::Resting { .. }
            )
        })
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.tokens.iter().any(|t| {
            matches!(
                t.outcome,
                TokenCloseOutcome::Failed { .. } | TokenCloseOutcome::Partial { .. }
            )
        })
    }

    pub fn resting(&self) -> impl Iterator<Item = &TokenClose> {
        self.tokens
            .iter()
            .filter(|t| matches!(t.outcome, TokenCloseOutcome::Resting { .. }))
    }

    #[must_use]
    pub fn total_proceeds(&self) -> Decimal {
        self.tokens
            .iter()
            .map(|t| match &t.outcome {
                TokenCloseOutcome::Filled { proceeds, .. }
                | TokenCloseOutcome::Partial { proceeds, .. } => *proceeds,
                _ => Decimal::ZERO,
            })
            .sum()
    }
}

// =============================================================================
// Closer
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Pass {
    AtBid,
    AtBidAfter(Duration),
    AtPrice(Decimal),
}

#[derive(Debug, Default)]
struct Execution {
    order_ids: Vec<String>,
    filled: Decimal,
    proceeds: Decimal,
    attempts: u32,
    last_error: Option<GatewayError>,
}

/// Executes closes against an [`OrderGateway`].
pub struct PositionCloser<'a, G: OrderGateway + ?Sized> {
    gateway: &'a G,
}

impl<'a, G: OrderGateway + ?Sized> PositionCloser<'a, G> {
    #[must_use]
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    /// Closes every group concurrently, one order per token per pass.
    pub async fn close(&self, groups: Vec<CloseGroup>, mode: &CloseMode, reason: CloseReason) -> CloseReport {
        info!(
            reason = %reason,
            tokens = groups.len(),
            "Closing positions"
        );
        let tokens = join_all(groups.into_iter().map(|group| self.close_group(group, mode))).await;
        CloseReport { reason, tokens }
    }

    async fn close_group(&self, group: CloseGroup, mode: &CloseMode) -> TokenClose {
        let shares = group.order_shares();
        let outcome = if shares <= Decimal::ZERO {
            warn!(token = %group.token_id, shares = %group.total_shares, "Close skipped, below minimum size");
            TokenCloseOutcome::Skipped {
                reason: format!("{} shares rounds to zero", group.total_shares),
            }
        } else {
            match mode {
                CloseMode::Maker { price } => self.place_maker(&group, *price, shares).await,
                CloseMode::Aggressive { retry } => self.sell_aggressive(&group, retry, shares).await,
            }
        };
        TokenClose { group, outcome }
    }

    async fn place_maker(&self, group: &CloseGroup, price: Decimal, shares: Decimal) -> TokenCloseOutcome {
        let result = self
            .gateway
            .submit_order(OrderRequest::maker_sell(&group.token_id, price, shares))
            .await
            .and_then(OrderAck::into_result);

        match result {
            Ok(ack) => {
                info!(
                    token = %group.token_id,
                    order_id = %ack.order_id,
                    price = %price,
                    shares = %shares,
                    "Profit-target sell resting"
                );
                TokenCloseOutcome::Resting {
                    order_id: ack.order_id,
                    price,
                    shares,
                }
            }
            Err(e) => {
                warn!(token = %group.token_id, error = %e, "Profit-target sell failed");
                TokenCloseOutcome::Failed {
                    error: e,
                    attempts: 1,
                    requires_attention: false,
                }
            }
        }
    }

    async fn sell_aggressive(&self, group: &CloseGroup, retry: &RetryPolicy, shares: Decimal) -> TokenCloseOutcome {
        let token = group.token_id.as_str();
        let fee_bps = match self.gateway.get_fee_rate_bps(token).await {
            Ok(bps) => bps,
            Err(e) => {
                warn!(token = %token, error = %e, "Fee rate unavailable, assuming zero");
                0
            }
        };

        let passes: Vec<Pass> = match retry {
            RetryPolicy::SingleAttempt => vec![Pass::AtBid],
            RetryPolicy::StopLoss {
                retry_delay,
                emergency_price,
            } => vec![
                Pass::AtBid,
                Pass::AtBidAfter(*retry_delay),
                Pass::AtPrice(*emergency_price),
            ],
        };

        let mut exec = Execution::default();
        for pass in passes {
            let remaining = round_shares(shares - exec.filled);
            if remaining <= Decimal::ZERO {
                break;
            }
            if exec.last_error.as_ref().is_some_and(GatewayError::is_balance_error) {
                warn!(token = %token, "Balance error, not retrying");
                break;
            }

            let price = match pass {
                Pass::AtBid => self.current_bid(token).await,
                Pass::AtBidAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    self.current_bid(token).await
                }
                Pass::AtPrice(price) => {
                    warn!(token = %token, price = %price, "Emergency sell at minimum tick");
                    Ok(price)
                }
            };
            let price = match price {
                Ok(price) => price,
                Err(e) => {
                    warn!(token = %token, error = %e, "No bid for taker sell");
                    exec.last_error = Some(e);
                    continue;
                }
            };

            exec.attempts += 1;
            self.submit_taker(token, price, remaining, &mut exec).await;
        }

        let fee = exec.proceeds * Decimal::from(fee_bps) / BPS_DIVISOR;
        let avg_price = if exec.filled.is_zero() {
            Decimal::ZERO
        } else {
            exec.proceeds / exec.filled
        };

        if exec.filled >= shares {
            TokenCloseOutcome::Filled {
                order_ids: exec.order_ids,
                avg_price,
                shares: exec.filled,
                proceeds: exec.proceeds,
                fee,
                attempts: exec.attempts,
            }
        } else if exec.filled > Decimal::ZERO {
            warn!(
                token = %token,
                requested = %shares,
                filled = %exec.filled,
                "Taker close partially filled"
            );
            TokenCloseOutcome::Partial {
                order_ids: exec.order_ids,
                avg_price,
                requested: shares,
                filled: exec.filled,
                proceeds: exec.proceeds,
                fee,
                attempts: exec.attempts,
                error: exec.last_error,
            }
        } else {
            let error = exec
                .last_error
                .unwrap_or_else(|| GatewayError::no_liquidity(token));
            error!(
                token = %token,
                positions = ?group.position_ids,
                attempts = exec.attempts,
                error = %error,
                "Taker close failed, positions need manual intervention"
            );
            TokenCloseOutcome::Failed {
                error,
                attempts: exec.attempts,
                requires_attention: true,
            }
        }
    }

    async fn current_bid(&self, token: &str) -> Result<Decimal, GatewayError> {
        self.gateway.get_price(token, Side::Sell).await
    }

    async fn submit_taker(&self, token: &str, price: Decimal, shares: Decimal, exec: &mut Execution) {
        info!(token = %token, price = %price, shares = %shares, "Submitting taker sell");
        let result = self
            .gateway
            .submit_order(OrderRequest::taker_sell(token, price, shares))
            .await
            .and_then(OrderAck::into_result);

        match result {
            Ok(ack) => {
                if ack.filled_size > Decimal::ZERO {
                    let fill_price = ack.avg_fill_price.unwrap_or(price);
                    exec.filled += ack.filled_size;
                    exec.proceeds += ack.filled_size * fill_price;
                    exec.order_ids.push(ack.order_id);
                }
                exec.last_error = (ack.filled_size < shares).then(|| GatewayError::no_liquidity(token));
            }
            Err(e) => {
                warn!(token = %token, error = %e, "Taker sell failed");
                exec.last_error = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FillRecord;
    use crate::paper::PaperGateway;
    use rust_decimal_macros::dec;
    use updown_core::PaperConfig;

    fn position(token: &str, price: Decimal, size: Decimal) -> Position {
        Position::from_fill("m1", token, Direction::Up, FillRecord::new("o", price, size))
    }

    fn gateway_holding(token: &str, shares: Decimal, bid: Decimal) -> PaperGateway {
        let gateway = PaperGateway::new(PaperConfig::default());
        gateway.credit_shares(token, shares);
        gateway.set_quote(token, bid, bid + dec!(0.01));
        gateway
    }

    fn stop_loss_mode() -> CloseMode {
        CloseMode::Aggressive {
            retry: RetryPolicy::StopLoss {
                retry_delay: Duration::from_millis(1),
                emergency_price: dec!(0.01),
            },
        }
    }

    // ==================== Aggregation Tests ====================

    #[test]
    fn test_aggregate_two_positions_one_token() {
        let positions = vec![
            position("up", dec!(0.65), dec!(2)),
            position("up", dec!(0.65), dec!(2)),
        ];
        let groups = aggregate(&positions);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total_size, dec!(4));
        assert_eq!(groups[0].order_shares(), dec!(6.15));
        assert_eq!(groups[0].position_ids.len(), 2);
    }

    #[test]
    fn test_aggregate_uses_fills_not_current_price() {
        let mut p = position("up", dec!(0.5), dec!(2));
        p.mark(dec!(0.9));
        let groups = aggregate(&[p]);
        assert_eq!(groups[0].total_shares, dec!(4));
    }

    #[test]
    fn test_aggregate_splits_tokens() {
        let positions = vec![
            position("up", dec!(0.5), dec!(1)),
            position("down", dec!(0.5), dec!(1)),
            position("up", dec!(0.5), dec!(1)),
        ];
        let groups = aggregate(&positions);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].token_id, "down");
        assert_eq!(groups[1].position_ids.len(), 2);
    }

    // ==================== Maker Tests ====================

    #[tokio::test]
    async fn test_maker_close_rests_one_order_per_token() {
        let gateway = gateway_holding("up", dec!(10), dec!(0.992));
        let positions = vec![
            position("up", dec!(0.95), dec!(2)),
            position("up", dec!(0.95), dec!(2)),
        ];

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&positions),
                &CloseMode::Maker { price: dec!(0.99) },
                CloseReason::ProfitTarget,
            )
            .await;

        assert!(report.is_complete());
        assert_eq!(report.resting().count(), 1);
        let submitted = gateway.submitted_orders();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].post_only);
        assert_eq!(submitted[0].price, dec!(0.99));
        assert_eq!(submitted[0].size, dec!(4.21));
    }

    // ==================== Aggressive Tests ====================

    #[tokio::test]
    async fn test_taker_close_fills_at_bid_with_fee() {
        let gateway = PaperGateway::new(PaperConfig {
            fee_rate_bps: 100,
            ..Default::default()
        });
        gateway.credit_shares("up", dec!(10));
        gateway.set_quote("up", dec!(0.905), dec!(0.915));

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2))]),
                &stop_loss_mode(),
                CloseReason::StopLoss,
            )
            .await;

        match &report.tokens[0].outcome {
            TokenCloseOutcome::Filled {
                shares,
                avg_price,
                proceeds,
                fee,
                attempts,
                ..
            } => {
                assert_eq!(*shares, dec!(4));
                assert_eq!(*avg_price, dec!(0.905));
                assert_eq!(*proceeds, dec!(3.62));
                assert_eq!(*fee, dec!(0.0362));
                assert_eq!(*attempts, 1);
            }
            other => panic!("Expected fill, got {other:?}"),
        }
        assert!(!gateway.submitted_orders()[0].post_only);
    }

    #[tokio::test]
    async fn test_stop_loss_retries_then_emergency() {
        let gateway = gateway_holding("up", dec!(4), dec!(0.9));
        gateway.fail_next_submit(GatewayError::Timeout("first".into()));
        gateway.fail_next_submit(GatewayError::Network("second".into()));

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2))]),
                &stop_loss_mode(),
                CloseReason::StopLoss,
            )
            .await;

        match &report.tokens[0].outcome {
            TokenCloseOutcome::Filled { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("Expected fill on emergency pass, got {other:?}"),
        }
        assert_eq!(gateway.submitted_orders().last().unwrap().price, dec!(0.01));
    }

    #[tokio::test]
    async fn test_balance_error_is_not_retried() {
        let gateway = gateway_holding("up", dec!(4), dec!(0.9));
        gateway.fail_next_submit(GatewayError::InsufficientAllowance {
            token_id: "up".into(),
        });

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2))]),
                &stop_loss_mode(),
                CloseReason::StopLoss,
            )
            .await;

        match &report.tokens[0].outcome {
            TokenCloseOutcome::Failed {
                error,
                attempts,
                requires_attention,
            } => {
                assert!(error.is_balance_error());
                assert_eq!(*attempts, 1);
                assert!(*requires_attention);
            }
            other => panic!("Expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_retry() {
        let gateway = gateway_holding("up", dec!(4), dec!(0.9));
        gateway.fail_next_submit(GatewayError::Timeout("slow".into()));

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2))]),
                &CloseMode::Aggressive {
                    retry: RetryPolicy::SingleAttempt,
                },
                CloseReason::FlipGuard,
            )
            .await;

        assert!(report.has_failures());
        assert_eq!(gateway.submitted_orders().len(), 0);
    }

    #[tokio::test]
    async fn test_partial_fill_reported() {
        let gateway = PaperGateway::new(PaperConfig::default());
        gateway.credit_shares("up", dec!(4));
        gateway.set_quote_with_depth("up", dec!(0.9), dec!(0.92), dec!(1.5));

        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2))]),
                &CloseMode::Aggressive {
                    retry: RetryPolicy::SingleAttempt,
                },
                CloseReason::Manual("test".into()),
            )
            .await;

        match &report.tokens[0].outcome {
            TokenCloseOutcome::Partial {
                requested, filled, ..
            } => {
                assert_eq!(*requested, dec!(4));
                assert_eq!(*filled, dec!(1.5));
            }
            other => panic!("Expected partial, got {other:?}"),
        }
        assert!(report.has_failures());
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_one_token_failure_does_not_block_other() {
        let gateway = PaperGateway::new(PaperConfig::default());
        gateway.credit_shares("up", dec!(4));
        gateway.credit_shares("down", dec!(4));
        gateway.set_quote("up", dec!(0.9), dec!(0.92));

        let mut down = position("down", dec!(0.5), dec!(2));
        down.direction = Direction::Down;
        let report = PositionCloser::new(&gateway)
            .close(
                aggregate(&[position("up", dec!(0.5), dec!(2)), down]),
                &CloseMode::Aggressive {
                    retry: RetryPolicy::SingleAttempt,
                },
                CloseReason::FlipGuard,
            )
            .await;

        let by_token: BTreeMap<_, _> = report
            .tokens
            .iter()
            .map(|t| (t.group.token_id.as_str(), &t.outcome))
            .collect();
        assert!(matches!(by_token["up"], TokenCloseOutcome::Filled { .. }));
        assert!(matches!(by_token["down"], TokenCloseOutcome::Failed { .. }));
    }
}
