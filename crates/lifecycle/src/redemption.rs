//! Redemption of resolved markets.
//!
//! Runs on its own low-frequency timer, independent of the tick loop. Each pass
//! groups unredeemed ledger positions by market, checks resolution, and calls
//! `redeem` once per distinct outcome index set per market. Redeemed ids are
//! remembered for the life of the process so they are never redeemed twice.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gateway::Side;
use crate::journal::{SharedJournal, TradeKind, TradeRecord};
use crate::ledger::Position;
use crate::market::MarketDescriptor;

// =============================================================================
// Collaborators
// =============================================================================

/// Receipt returned by the redemption capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    pub success: bool,
    /// Collateral received, when the venue reports it.
    pub amount: Option<Decimal>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RedemptionError {
    #[error("Failed to fetch market {market_id}: {reason}")]
    Resolver { market_id: String, reason: String },

    #[error("Redeem failed for condition {condition_id} index set {index_set}: {reason}")]
    Redeem {
        condition_id: String,
        index_set: u32,
        reason: String,
    },

    #[error("Token {token_id} is not an outcome of market {market_id}")]
    UnknownToken { market_id: String, token_id: String },
}

/// Looks up market resolution status.
#[async_trait]
pub trait MarketResolver: Send + Sync {
    async fn fetch_market(&self, market_id: &str) -> Result<MarketDescriptor, RedemptionError>;
}

/// Exchanges outcome tokens of a resolved market for collateral.
#[async_trait]
pub trait Redeemer: Send + Sync {
    async fn redeem(&self, condition_id: &str, index_set: u32) -> Result<RedemptionReceipt, RedemptionError>;
}

/// Host-side view of the ledger used by the monitor.
pub trait PositionStore: Send + Sync {
    fn positions(&self) -> Vec<Position>;

    /// Removes positions; unknown ids are ignored.
    fn remove_positions_by_ids(&self, ids: &[String]) -> Vec<Position>;
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionState {
    Pending,
    ResolvedUnredeemed,
    Redeemed,
}

/// One successful `redeem` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemedGroup {
    pub market_id: String,
    pub index_set: u32,
    pub position_ids: Vec<String>,
    pub amount: Option<Decimal>,
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedemptionPass {
    pub markets_checked: usize,
    pub unresolved: Vec<String>,
    pub redeemed: Vec<RedeemedGroup>,
    pub errors: Vec<RedemptionError>,
}

// =============================================================================
// Monitor
// =============================================================================

pub struct RedemptionMonitor<R, D, S>
where
    R: MarketResolver + ?Sized,
    D: Redeemer + ?Sized,
    S: PositionStore + ?Sized,
{
    resolver: Arc<R>,
    redeemer: Arc<D>,
    store: Arc<S>,
    journal: Option<SharedJournal>,
    redeemed_ids: HashSet<String>,
    states: HashMap<String, RedemptionState>,
}

impl<R, D, S> RedemptionMonitor<R, D, S>
where
    R: MarketResolver + ?Sized,
    D: Redeemer + ?Sized,
    S: PositionStore + ?Sized,
{
    #[must_use]
    pub fn new(resolver: Arc<R>, redeemer: Arc<D>, store: Arc<S>) -> Self {
        Self {
            resolver,
            redeemer,
            store,
            journal: None,
            redeemed_ids: HashSet::new(),
            states: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: SharedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    #[must_use]
    pub fn state(&self, market_id: &str) -> Option<RedemptionState> {
        self.states.get(market_id).copied()
    }

    #[must_use]
    pub fn is_redeemed(&self, position_id: &str) -> bool {
        self.redeemed_ids.contains(position_id)
    }

    /// Runs one redemption pass.
    pub async fn run_once(&mut self) -> RedemptionPass {
        let mut pass = RedemptionPass::default();

        let mut by_market: BTreeMap<String, Vec<Position>> = BTreeMap::new();
        for position in self.store.positions() {
            if self.redeemed_ids.contains(&position.id) {
                continue;
            }
            by_market.entry(position.market_id.clone()).or_default().push(position);
        }

        for (market_id, positions) in by_market {
            pass.markets_checked += 1;

            let market = match self.resolver.fetch_market(&market_id).await {
                Ok(market) => market,
                Err(e) => {
                    warn!(market = %market_id, error = %e, "Resolution lookup failed, will retry");
                    pass.errors.push(e);
                    continue;
                }
            };

            if !market.resolved {
                debug!(market = %market_id, "Market not resolved yet");
                self.states.insert(market_id.clone(), RedemptionState::Pending);
                pass.unresolved.push(market_id);
                continue;
            }
            self.states
                .insert(market_id.clone(), RedemptionState::ResolvedUnredeemed);

            let mut by_index: BTreeMap<u32, Vec<Position>> = BTreeMap::new();
            for position in positions {
                match market.direction_of(&position.token_id) {
                    Some(direction) => by_index
                        .entry(direction.index_set())
                        .or_default()
                        .push(position),
                    None => {
                        let e = RedemptionError::UnknownToken {
                            market_id: market_id.clone(),
                            token_id: position.token_id.clone(),
                        };
                        warn!(error = %e, "Skipping position");
                        pass.errors.push(e);
                    }
                }
            }

            let mut all_redeemed = true;
            for (index_set, group) in by_index {
                match self.redeem_group(&market, index_set, group).await {
                    Ok(Some(redeemed)) => pass.redeemed.push(redeemed),
                    Ok(None) => {}
                    Err(e) => {
                        all_redeemed = false;
                        pass.errors.push(e);
                    }
                }
            }

            if all_redeemed {
                self.states.insert(market_id, RedemptionState::Redeemed);
            }
        }

        pass
    }

    async fn redeem_group(
        &mut self,
        market: &MarketDescriptor,
        index_set: u32,
        group: Vec<Position>,
    ) -> Result<Option<RedeemedGroup>, RedemptionError> {
        // Positions closed since the pass started must not be redeemed.
        let live: HashSet<String> = self.store.positions().into_iter().map(|p| p.id).collect();
        let group: Vec<Position> = group.into_iter().filter(|p| live.contains(&p.id)).collect();
        if group.is_empty() {
            return Ok(None);
        }

        let receipt = self.redeemer.redeem(&market.condition_id, index_set).await;
        let receipt = match receipt {
            Ok(receipt) if receipt.success => receipt,
            Ok(_) => {
                let e = RedemptionError::Redeem {
                    condition_id: market.condition_id.clone(),
                    index_set,
                    reason: "redeem reported failure".to_string(),
                };
                warn!(market = %market.id, error = %e, "Redemption unsuccessful, will retry");
                return Err(e);
            }
            Err(e) => {
                warn!(market = %market.id, error = %e, "Redemption failed, will retry");
                return Err(e);
            }
        };

        let ids: Vec<String> = group.iter().map(|p| p.id.clone()).collect();
        self.redeemed_ids.extend(ids.iter().cloned());
        let removed = self.store.remove_positions_by_ids(&ids);

        info!(
            market = %market.id,
            index_set,
            positions = ids.len(),
            amount = ?receipt.amount,
            "Redeemed positions"
        );

        if let Some(journal) = &self.journal {
            let cost: Decimal = removed.iter().map(|p| p.size).sum();
            let shares: Decimal = removed.iter().map(Position::shares).sum();
            let first = &group[0];
            let mut record = TradeRecord::new(
                TradeKind::Redemption,
                &market.id,
                &first.token_id,
                first.direction,
                Side::Sell,
            )
            .with_positions(ids.clone());
            if let Some(tx) = &receipt.tx_hash {
                record = record.with_order(tx);
            }
            if let Some(amount) = receipt.amount {
                let price = if shares.is_zero() {
                    Decimal::ZERO
                } else {
                    amount / shares
                };
                record = record
                    .with_execution(price, shares, amount)
                    .with_pnl(amount - cost);
            }
            journal.write().record(record);
        }

        Ok(Some(RedeemedGroup {
            market_id: market.id.clone(),
            index_set,
            position_ids: ids,
            amount: receipt.amount,
        }))
    }

    /// Runs passes every `interval` until `shutdown` flips to `true`.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Redemption monitor started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let pass = self.run_once().await;
                    if !pass.redeemed.is_empty() || !pass.errors.is_empty() {
                        info!(
                            checked = pass.markets_checked,
                            redeemed = pass.redeemed.len(),
                            errors = pass.errors.len(),
                            "Redemption pass complete"
                        );
                    }
                }
            }
        }

        info!("Redemption monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::TradeJournal;
    use crate::ledger::{FillRecord, PositionLedger, SharedLedger};
    use crate::paper::PaperGateway;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use updown_core::{Direction, PaperConfig};

    struct LedgerStore(SharedLedger);

    impl PositionStore for LedgerStore {
        fn positions(&self) -> Vec<Position> {
            self.0.read().positions().to_vec()
        }

        fn remove_positions_by_ids(&self, ids: &[String]) -> Vec<Position> {
            self.0.write().remove_by_ids(ids)
        }
    }

    fn market() -> MarketDescriptor {
        MarketDescriptor::new("m1", "up", "down", Utc::now(), "cond-1")
    }

    fn setup() -> (Arc<PaperGateway>, SharedLedger, Arc<LedgerStore>) {
        let gateway = Arc::new(PaperGateway::new(PaperConfig::default()));
        gateway.register_market(market());
        let ledger = PositionLedger::shared();
        let store = Arc::new(LedgerStore(ledger.clone()));
        (gateway, ledger, store)
    }

    fn add(ledger: &SharedLedger, gateway: &PaperGateway, token: &str, direction: Direction) -> String {
        let p = Position::from_fill("m1", token, direction, FillRecord::new("o", dec!(0.5), dec!(2)));
        gateway.credit_shares(token, p.shares());
        let id = p.id.clone();
        ledger.write().add(p);
        id
    }

    #[tokio::test]
    async fn test_unresolved_market_stays_pending() {
        let (gateway, ledger, store) = setup();
        add(&ledger, &gateway, "up", Direction::Up);

        let mut monitor = RedemptionMonitor::new(gateway.clone(), gateway.clone(), store);
        let pass = monitor.run_once().await;

        assert_eq!(pass.unresolved, vec!["m1".to_string()]);
        assert_eq!(monitor.state("m1"), Some(RedemptionState::Pending));
        assert!(gateway.redemption_calls().is_empty());
        assert_eq!(ledger.read().len(), 1);
    }

    #[tokio::test]
    async fn test_redeems_once_per_index_set() {
        let (gateway, ledger, store) = setup();
        add(&ledger, &gateway, "up", Direction::Up);
        add(&ledger, &gateway, "up", Direction::Up);
        add(&ledger, &gateway, "down", Direction::Down);
        gateway.resolve_market("m1", Direction::Up);

        let journal = TradeJournal::shared();
        let mut monitor =
            RedemptionMonitor::new(gateway.clone(), gateway.clone(), store).with_journal(journal.clone());
        let pass = monitor.run_once().await;

        assert_eq!(
            gateway.redemption_calls(),
            vec![("cond-1".to_string(), 1), ("cond-1".to_string(), 2)]
        );
        assert_eq!(pass.redeemed.len(), 2);
        assert!(ledger.read().is_empty());
        assert_eq!(monitor.state("m1"), Some(RedemptionState::Redeemed));

        let journal = journal.read();
        assert_eq!(journal.records().len(), 2);
        // Winner pays 8 for 4 cost, loser pays 0 for 2 cost.
        assert_eq!(journal.realized_pnl(), dec!(2));
    }

    #[tokio::test]
    async fn test_failed_redeem_retried_next_pass() {
        let (gateway, ledger, store) = setup();
        let id = add(&ledger, &gateway, "up", Direction::Up);
        gateway.resolve_market("m1", Direction::Up);
        gateway.fail_next_redeem(RedemptionError::Redeem {
            condition_id: "cond-1".into(),
            index_set: 1,
            reason: "rpc down".into(),
        });

        let mut monitor = RedemptionMonitor::new(gateway.clone(), gateway.clone(), store);
        let first = monitor.run_once().await;
        assert_eq!(first.errors.len(), 1);
        assert!(ledger.read().contains(&id));
        assert_eq!(monitor.state("m1"), Some(RedemptionState::ResolvedUnredeemed));

        let second = monitor.run_once().await;
        assert_eq!(second.redeemed.len(), 1);
        assert!(monitor.is_redeemed(&id));
        assert!(!ledger.read().contains(&id));
    }

    #[tokio::test]
    async fn test_redeemed_ids_never_redeemed_again() {
        let (gateway, ledger, store) = setup();
        let id = add(&ledger, &gateway, "up", Direction::Up);
        gateway.resolve_market("m1", Direction::Up);

        let mut monitor = RedemptionMonitor::new(gateway.clone(), gateway.clone(), store);
        monitor.run_once().await;

        // Host re-inserts the same position (e.g. a stale snapshot); it must be skipped.
        let again = Position {
            id: id.clone(),
            ..Position::from_fill("m1", "up", Direction::Up, FillRecord::new("o", dec!(0.5), dec!(2)))
        };
        ledger.write().add(again);

        let pass = monitor.run_once().await;
        assert_eq!(pass.markets_checked, 0);
        assert_eq!(gateway.redemption_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_resolver_error_is_not_fatal() {
        let (gateway, ledger, store) = setup();
        let p = Position::from_fill("unknown", "x", Direction::Up, FillRecord::new("o", dec!(0.5), dec!(1)));
        ledger.write().add(p);

        let mut monitor = RedemptionMonitor::new(gateway.clone(), gateway, store);
        let pass = monitor.run_once().await;
        assert!(matches!(pass.errors[0], RedemptionError::Resolver { .. }));
        assert_eq!(ledger.read().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (gateway, _ledger, store) = setup();
        let monitor = RedemptionMonitor::new(gateway.clone(), gateway, store);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(monitor.run(Duration::from_millis(10), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
