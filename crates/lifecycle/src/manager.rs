//! The position lifecycle manager.
//!
//! One [`LifecycleManager`] drives one market deployment. An external driver
//! feeds it market snapshots and calls [`LifecycleManager::on_tick`]; each tick
//! runs, in order:
//!
//! 1. fill detection for resting entry and profit-target orders;
//! 2. market rollover (cancel resting entries left on a previous market);
//! 3. the exit phase, under the exit flag;
//! 4. the entry phase, under the entry flag, unless the exit phase acted.
//!
//! The two in-flight flags are independent, so an entry that is still awaiting
//! the gateway never blocks an exit. No lock is held across a gateway call.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use updown_core::{Direction, LifecycleConfig, StrategyConfig};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::closer::{
    self, CloseMode, CloseReason, CloseReport, PositionCloser, RetryPolicy, TokenClose, TokenCloseOutcome,
};
use crate::entry::{self, EntryContext, EntryController, EntryOutcome, EntrySkip, PendingEntryOrder};
use crate::error::LifecycleError;
use crate::exit::{self, ExitDecision, ExitInputs, ExitOutcome};
use crate::gateway::{GatewayError, OrderGateway, Side};
use crate::in_flight::InFlightFlag;
use crate::journal::{JournalSummary, SharedJournal, TradeJournal, TradeKind, TradeRecord};
use crate::ledger::{Position, PositionLedger, SharedLedger};
use crate::market::MarketSnapshot;
use crate::redemption::PositionStore;

// =============================================================================
// Tracking Types
// =============================================================================

/// A resting profit-target sell and the positions it will close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExitOrder {
    pub order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub direction: Direction,
    pub position_ids: Vec<String>,
    pub limit_price: Decimal,
    pub shares: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// Operation an error is attributed to in the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Entry,
    Exit,
    Cancel,
    FillDetection,
    Redemption,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Entry => write!(f, "entry"),
            Operation::Exit => write!(f, "exit"),
            Operation::Cancel => write!(f, "cancel"),
            Operation::FillDetection => write!(f, "fill_detection"),
            Operation::Redemption => write!(f, "redemption"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickError {
    pub operation: Operation,
    pub message: String,
}

/// Everything one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Resting entry orders cancelled because the market changed.
    pub rolled_over: Vec<String>,
    /// Positions created from filled entry orders.
    pub entry_fills: Vec<String>,
    /// Profit-target orders detected filled.
    pub exit_fills: Vec<String>,
    pub exit: ExitOutcome,
    pub entry: EntryOutcome,
    pub errors: Vec<TickError>,
}

impl TickReport {
    fn new() -> Self {
        Self {
            rolled_over: Vec::new(),
            entry_fills: Vec::new(),
            exit_fills: Vec::new(),
            exit: ExitOutcome::Idle,
            entry: EntryOutcome::Skipped(EntrySkip::Inactive),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Snapshot of the manager for hosts and operators.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub active: bool,
    pub enabled: bool,
    pub market_id: Option<String>,
    pub time_remaining_secs: Option<u64>,
    pub balance: Option<Decimal>,
    pub positions: Vec<Position>,
    pub pending_entries: Vec<PendingEntryOrder>,
    pub pending_exits: Vec<PendingExitOrder>,
    pub total_exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub journal: JournalSummary,
    /// Order failures since start, as counted by the circuit breaker.
    pub failed_orders: u32,
    pub consecutive_failures: u32,
    pub breaker_tripped: bool,
    pub entry_in_flight: bool,
    pub exit_in_flight: bool,
    /// Most recent error per operation.
    pub last_errors: BTreeMap<Operation, String>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    active: bool,
    snapshot: Option<MarketSnapshot>,
    balance: Option<Decimal>,
    last_errors: BTreeMap<Operation, String>,
}

// =============================================================================
// Manager
// =============================================================================

pub struct LifecycleManager<G: OrderGateway + ?Sized> {
    gateway: Arc<G>,
    config: RwLock<StrategyConfig>,
    settings: LifecycleConfig,
    ledger: SharedLedger,
    journal: SharedJournal,
    breaker: CircuitBreaker,
    entry: Mutex<EntryController>,
    pending_exits: Mutex<HashMap<String, PendingExitOrder>>,
    entry_flag: InFlightFlag,
    exit_flag: InFlightFlag,
    state: RwLock<RuntimeState>,
}

impl<G: OrderGateway + ?Sized> std::fmt::Debug for LifecycleManager<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field("settings", &self.settings)
            .field("breaker", &self.breaker)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<G: OrderGateway + ?Sized> LifecycleManager<G> {
    /// Creates an inactive manager. Call [`start_trading`](Self::start_trading) to begin.
    #[must_use]
    pub fn new(gateway: Arc<G>, config: StrategyConfig, settings: LifecycleConfig) -> Self {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default().with_max_consecutive_failures(settings.max_consecutive_failures),
        );
        Self {
            gateway,
            config: RwLock::new(config),
            settings,
            ledger: PositionLedger::shared(),
            journal: TradeJournal::shared(),
            breaker,
            entry: Mutex::new(EntryController::new()),
            pending_exits: Mutex::new(HashMap::new()),
            entry_flag: InFlightFlag::new("entry"),
            exit_flag: InFlightFlag::new("exit"),
            state: RwLock::new(RuntimeState::default()),
        }
    }

    /// Shares a ledger with other components (e.g. a redemption monitor).
    #[must_use]
    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = ledger;
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: SharedJournal) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    #[must_use]
    pub fn journal(&self) -> SharedJournal {
        Arc::clone(&self.journal)
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    #[must_use]
    pub fn settings(&self) -> &LifecycleConfig {
        &self.settings
    }

    #[must_use]
    pub fn config(&self) -> StrategyConfig {
        self.config.read().clone()
    }

    // ==================== Control ====================

    /// Replaces the strategy parameters. Takes effect on the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] and keeps the old parameters when the
    /// new ones are invalid.
    pub fn update_config(&self, config: StrategyConfig) -> Result<(), LifecycleError> {
        config.validate()?;
        info!(
            enabled = config.enabled,
            entry = %config.entry_price,
            target = %config.profit_target_price,
            stop = %config.stop_loss_price,
            size = %config.trade_size,
            "Strategy configuration updated"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// Known collateral balance, used for the exposure cap. `None` disables the cap.
    pub fn set_balance(&self, balance: Option<Decimal>) {
        self.state.write().balance = balance;
    }

    /// Starts trading and clears a tripped circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] if the current configuration is invalid.
    pub fn start_trading(&self) -> Result<(), LifecycleError> {
        self.config.read().validate()?;
        self.breaker.reset();
        self.state.write().active = true;
        info!("Trading started");
        Ok(())
    }

    /// Stops trading immediately. Does not wait for in-flight gateway calls;
    /// orders they place afterwards are left untracked and logged.
    pub fn stop_trading(&self) {
        self.state.write().active = false;

        for order in self.entry.lock().clear() {
            warn!(
                order_id = %order.order_id,
                token = %order.token_id,
                "Resting entry order no longer tracked after stop"
            );
        }
        for (order_id, order) in self.pending_exits.lock().drain() {
            warn!(
                order_id = %order_id,
                token = %order.token_id,
                positions = order.position_ids.len(),
                "Resting profit-target order no longer tracked after stop"
            );
        }
        self.entry_flag.force_clear();
        self.exit_flag.force_clear();
        info!("Trading stopped");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn update_market_data(&self, snapshot: MarketSnapshot) {
        self.state.write().snapshot = Some(snapshot);
    }

    // ==================== Queries ====================

    #[must_use]
    pub fn get_status(&self) -> LifecycleStatus {
        let config = self.config.read().clone();
        let (active, market_id, time_remaining_secs, balance, last_errors) = {
            let state = self.state.read();
            (
                state.active,
                state
                    .snapshot
                    .as_ref()
                    .and_then(MarketSnapshot::market_id)
                    .map(str::to_string),
                state.snapshot.as_ref().map(|s| s.time_remaining_secs),
                state.balance,
                state.last_errors.clone(),
            )
        };
        let (positions, total_exposure, unrealized_pnl) = {
            let ledger = self.ledger.read();
            (
                ledger.positions().to_vec(),
                ledger.total_exposure(),
                ledger.total_unrealized_pnl(),
            )
        };
        let pending_entries: Vec<PendingEntryOrder> = self.entry.lock().pending().cloned().collect();
        let pending_exits: Vec<PendingExitOrder> = self.pending_exits.lock().values().cloned().collect();

        LifecycleStatus {
            active,
            enabled: config.enabled,
            market_id,
            time_remaining_secs,
            balance,
            positions,
            pending_entries,
            pending_exits,
            total_exposure,
            unrealized_pnl,
            journal: self.journal.read().summary().clone(),
            failed_orders: self.breaker.failed_orders(),
            consecutive_failures: self.breaker.consecutive_failures(),
            breaker_tripped: self.breaker.is_tripped(),
            entry_in_flight: self.entry_flag.is_set(),
            exit_in_flight: self.exit_flag.is_set(),
            last_errors,
        }
    }

    #[must_use]
    pub fn get_trades(&self) -> Vec<TradeRecord> {
        self.journal.read().records().to_vec()
    }

    #[must_use]
    pub fn get_positions(&self) -> Vec<Position> {
        self.ledger.read().positions().to_vec()
    }

    /// Removes positions by id. Repeating the call is a no-op.
    pub fn remove_positions_by_ids(&self, ids: &[String]) -> Vec<Position> {
        let removed = self.ledger.write().remove_by_ids(ids);
        if !removed.is_empty() {
            self.forget_exit_coverage(ids);
        }
        removed
    }

    /// Records an error reported by a collaborator running outside the tick.
    pub fn record_external_error(&self, operation: Operation, message: impl Into<String>) {
        self.state.write().last_errors.insert(operation, message.into());
    }

    // ==================== Manual Closes ====================

    /// Taker-closes one position.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::ExitInFlight`] if another close holds the exit flag
    /// - [`LifecycleError::PositionNotFound`] if the id is not in the ledger
    pub async fn close_position_manually(
        &self,
        position_id: &str,
        reason: &str,
    ) -> Result<CloseReport, LifecycleError> {
        let _guard = self
            .exit_flag
            .try_begin(self.settings.in_flight_timeout())
            .ok_or(LifecycleError::ExitInFlight)?;
        if !self.ledger.read().contains(position_id) {
            return Err(LifecycleError::PositionNotFound(position_id.to_string()));
        }

        info!(position = %position_id, reason = %reason, "Manual close requested");
        let mut report = TickReport::new();
        Ok(self
            .close_positions(
                &[position_id.to_string()],
                &Self::manual_mode(),
                CloseReason::Manual(reason.to_string()),
                &mut report,
            )
            .await)
    }

    /// Taker-closes every open position across all markets.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ExitInFlight`] if another close holds the exit flag.
    pub async fn close_all_positions_manually(&self, reason: &str) -> Result<CloseReport, LifecycleError> {
        let _guard = self
            .exit_flag
            .try_begin(self.settings.in_flight_timeout())
            .ok_or(LifecycleError::ExitInFlight)?;

        let ids: Vec<String> = self.ledger.read().positions().iter().map(|p| p.id.clone()).collect();
        info!(positions = ids.len(), reason = %reason, "Manual close of all positions requested");
        let mut report = TickReport::new();
        Ok(self
            .close_positions(&ids, &Self::manual_mode(), CloseReason::Manual(reason.to_string()), &mut report)
            .await)
    }

    fn manual_mode() -> CloseMode {
        CloseMode::Aggressive {
            retry: RetryPolicy::SingleAttempt,
        }
    }

    // ==================== Tick ====================

    /// Runs one lifecycle iteration. Never fails; errors are collected in the
    /// report and the most recent one per operation is kept for the status.
    pub async fn on_tick(&self) -> TickReport {
        let mut report = TickReport::new();
        if !self.is_active() {
            return report;
        }

        let snapshot = self.state.read().snapshot.clone();
        let config = self.config.read().clone();

        self.detect_fills(&mut report).await;
        self.roll_over(snapshot.as_ref(), &mut report).await;

        report.exit = self.run_exit(&config, snapshot.as_ref(), &mut report).await;
        report.entry = if report.exit.skips_entry() {
            EntryOutcome::Skipped(EntrySkip::ExitActive)
        } else {
            self.run_entry(&config, snapshot.as_ref(), &mut report).await
        };

        if let EntryOutcome::Skipped(reason) = &report.entry {
            debug!(reason = %reason, "Entry skipped");
        }
        report
    }

    async fn roll_over(&self, snapshot: Option<&MarketSnapshot>, report: &mut TickReport) {
        let Some(market_id) = snapshot.and_then(MarketSnapshot::market_id) else {
            return;
        };

        let stale = {
            let mut entry = self.entry.lock();
            let previous = entry.market_id().map(str::to_string);
            let mut stale = entry.roll_to_market(market_id);
            if previous.as_deref().is_some_and(|p| p != market_id) {
                info!(from = ?previous, to = %market_id, "Market rolled over");
            }
            stale.extend(entry.take_stale(market_id));
            stale
        };

        for order in stale {
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => {
                    info!(order_id = %order.order_id, market = %order.market_id, "Cancelled entry on previous market");
                    report.rolled_over.push(order.order_id);
                }
                Err(GatewayError::OrderNotFound(_)) => {
                    // Gone from the book before the cancel arrived.
                    let id = self.apply_entry_fill(order);
                    report.entry_fills.push(id);
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "Failed to cancel entry on previous market");
                    self.note_error(Operation::Cancel, e.to_string(), report);
                    self.entry.lock().restore(order);
                }
            }
        }
    }

    // ==================== Fill Detection ====================

    async fn detect_fills(&self, report: &mut TickReport) {
        let tracking = self.entry.lock().has_pending() || !self.pending_exits.lock().is_empty();
        if !tracking {
            return;
        }

        // Orders placed after this instant may legitimately be missing from the listing.
        let as_of = Utc::now();
        let open_ids: HashSet<String> = match self.gateway.get_open_orders().await {
            Ok(orders) => orders.into_iter().map(|o| o.order_id).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to fetch open orders");
                self.note_error(Operation::FillDetection, e.to_string(), report);
                return;
            }
        };

        let filled_entries = self.entry.lock().take_filled(&open_ids, as_of);
        for order in filled_entries {
            let id = self.apply_entry_fill(order);
            report.entry_fills.push(id);
        }

        let filled_exits: Vec<PendingExitOrder> = {
            let mut exits = self.pending_exits.lock();
            let done: Vec<String> = exits
                .values()
                .filter(|o| o.placed_at <= as_of && !open_ids.contains(&o.order_id))
                .map(|o| o.order_id.clone())
                .collect();
            done.into_iter().filter_map(|id| exits.remove(&id)).collect()
        };
        for order in filled_exits {
            report.exit_fills.push(order.order_id.clone());
            self.apply_exit_fill(order);
        }
    }

    fn apply_entry_fill(&self, order: PendingEntryOrder) -> String {
        let record = TradeRecord::new(
            TradeKind::Entry,
            &order.market_id,
            &order.token_id,
            order.direction,
            Side::Buy,
        )
        .with_order(&order.order_id)
        .with_execution(order.limit_price, order.shares, order.size);

        let position = order.into_position();
        let id = position.id.clone();
        info!(
            position = %id,
            market = %position.market_id,
            token = %position.token_id,
            direction = %position.direction,
            price = %position.entry_price,
            size = %position.size,
            "Entry filled"
        );

        self.ledger.write().add(position);
        self.journal.write().record(record.with_positions(vec![id.clone()]));
        self.breaker.record_success();
        id
    }

    fn apply_exit_fill(&self, order: PendingExitOrder) {
        let removed = self.ledger.write().remove_by_ids(&order.position_ids);
        if removed.is_empty() {
            debug!(order_id = %order.order_id, "Profit-target fill for positions already closed");
            return;
        }

        let cost: Decimal = removed.iter().map(|p| p.size).sum();
        let proceeds = order.shares * order.limit_price;
        let pnl = proceeds - cost;
        info!(
            order_id = %order.order_id,
            token = %order.token_id,
            positions = removed.len(),
            pnl = %pnl,
            "Profit target filled"
        );

        let ids: Vec<String> = removed.into_iter().map(|p| p.id).collect();
        self.journal.write().record(
            TradeRecord::new(
                TradeKind::ProfitTarget,
                &order.market_id,
                &order.token_id,
                order.direction,
                Side::Sell,
            )
            .with_order(&order.order_id)
            .with_execution(order.limit_price, order.shares, proceeds)
            .with_pnl(pnl)
            .with_positions(ids),
        );
    }

    // ==================== Exit Phase ====================

    async fn run_exit(
        &self,
        config: &StrategyConfig,
        snapshot: Option<&MarketSnapshot>,
        report: &mut TickReport,
    ) -> ExitOutcome {
        let Some(_guard) = self.exit_flag.try_begin(self.settings.in_flight_timeout()) else {
            debug!("Exit already in flight");
            return ExitOutcome::InFlight;
        };
        let Some(market_id) = snapshot.and_then(MarketSnapshot::market_id) else {
            return ExitOutcome::Idle;
        };

        let has_pending_entries = self.entry.lock().has_pending_in_market(market_id);
        let tokens: BTreeSet<String> = self
            .ledger
            .read()
            .positions_for_market(market_id)
            .into_iter()
            .map(|p| p.token_id)
            .collect();
        if tokens.is_empty() && !has_pending_entries {
            return ExitOutcome::Idle;
        }

        let bids = self.refresh_bids(&tokens, config, report).await;
        let positions = self.ledger.read().positions_for_market(market_id);
        let covered = self.covered_positions();

        let inputs = ExitInputs {
            config,
            epsilon: self.settings.price_epsilon_probability(),
            distance: snapshot.map(MarketSnapshot::distance),
            has_pending_entries,
            positions: &positions,
            bids: &bids,
            covered: &covered,
        };

        match exit::evaluate(&inputs) {
            ExitDecision::Hold => ExitOutcome::Idle,
            ExitDecision::CancelPendingEntries => {
                warn!(
                    market = %market_id,
                    distance = ?inputs.distance,
                    "Flip guard: cancelling pending entries"
                );
                self.cancel_pending_entries(market_id, report).await
            }
            ExitDecision::Close { trigger, position_ids } => {
                info!(
                    market = %market_id,
                    trigger = %trigger,
                    positions = position_ids.len(),
                    "Exit triggered"
                );
                let mode = trigger.close_mode(config, &self.settings);
                let close = self
                    .close_positions(&position_ids, &mode, trigger.close_reason(), report)
                    .await;
                ExitOutcome::Closed {
                    trigger,
                    report: close,
                }
            }
        }
    }

    /// Fetches the bid of each held token to mark positions to market, and its
    /// ask for the anti-chase observation.
    async fn refresh_bids(
        &self,
        tokens: &BTreeSet<String>,
        config: &StrategyConfig,
        report: &mut TickReport,
    ) -> HashMap<String, Decimal> {
        let mut bids = HashMap::new();
        for token in tokens {
            match self.gateway.get_price(token, Side::Sell).await {
                Ok(bid) => {
                    self.ledger.write().mark_token(token, bid);
                    bids.insert(token.clone(), bid);
                }
                Err(e) => {
                    warn!(token = %token, error = %e, "Bid unavailable, exit checks skip this token");
                    self.note_error(Operation::Exit, e.to_string(), report);
                }
            }
            // Entries qualify on the ask, so the dip is judged on the ask too.
            match self.gateway.get_price(token, Side::Buy).await {
                Ok(ask) => self.entry.lock().observe_price(ask, config.entry_threshold()),
                Err(e) => debug!(token = %token, error = %e, "Ask unavailable, no anti-chase observation"),
            }
        }
        bids
    }

    fn covered_positions(&self) -> HashSet<String> {
        self.pending_exits
            .lock()
            .values()
            .flat_map(|o| o.position_ids.iter().cloned())
            .collect()
    }

    async fn cancel_pending_entries(&self, market_id: &str, report: &mut TickReport) -> ExitOutcome {
        let orders: Vec<PendingEntryOrder> = self
            .entry
            .lock()
            .pending()
            .filter(|o| o.market_id == market_id)
            .cloned()
            .collect();

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();
        for order in orders {
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => {
                    self.entry.lock().remove(&order.token_id);
                    info!(order_id = %order.order_id, token = %order.token_id, "Pending entry cancelled");
                    cancelled.push(order.order_id);
                }
                Err(e) => {
                    // An order that already left the book is picked up by fill detection.
                    warn!(order_id = %order.order_id, error = %e, "Failed to cancel pending entry");
                    self.note_error(Operation::Cancel, e.to_string(), report);
                    failed.push(order.order_id);
                }
            }
        }
        ExitOutcome::PendingEntriesCancelled { cancelled, failed }
    }

    // ==================== Closing ====================

    async fn close_positions(
        &self,
        ids: &[String],
        mode: &CloseMode,
        reason: CloseReason,
        report: &mut TickReport,
    ) -> CloseReport {
        let blocked = if matches!(mode, CloseMode::Aggressive { .. }) {
            self.cancel_resting_exits(ids, report).await
        } else {
            HashMap::new()
        };

        let (held, positions): (Vec<Position>, Vec<Position>) = self
            .ledger
            .read()
            .by_ids(ids)
            .into_iter()
            .partition(|p| blocked.contains_key(&p.token_id));

        let placed_at = Utc::now();
        let mut close = if positions.is_empty() {
            CloseReport::empty(reason)
        } else {
            PositionCloser::new(self.gateway.as_ref())
                .close(closer::aggregate(&positions), mode, reason)
                .await
        };

        // Shares still reserved by a sell we could not cancel: nothing was sent.
        close.tokens.extend(closer::aggregate(&held).into_iter().filter_map(|group| {
            let error = blocked.get(&group.token_id)?.clone();
            Some(TokenClose {
                group,
                outcome: TokenCloseOutcome::Failed {
                    error,
                    attempts: 0,
                    requires_attention: true,
                },
            })
        }));

        self.apply_close_report(&close, placed_at, report);
        close
    }

    /// Cancels resting profit-target sells on the tokens of `ids`. Returns the
    /// tokens whose sells could not be cancelled, with the cancel error; their
    /// shares stay reserved.
    async fn cancel_resting_exits(
        &self,
        ids: &[String],
        report: &mut TickReport,
    ) -> HashMap<String, GatewayError> {
        let tokens: HashSet<String> = self.ledger.read().by_ids(ids).into_iter().map(|p| p.token_id).collect();
        let resting: Vec<PendingExitOrder> = self
            .pending_exits
            .lock()
            .values()
            .filter(|o| tokens.contains(&o.token_id))
            .cloned()
            .collect();

        let mut blocked = HashMap::new();
        for order in resting {
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => {
                    info!(order_id = %order.order_id, token = %order.token_id, "Cancelled resting profit-target sell");
                    self.pending_exits.lock().remove(&order.order_id);
                }
                Err(GatewayError::OrderNotFound(_)) => {
                    self.pending_exits.lock().remove(&order.order_id);
                    report.exit_fills.push(order.order_id.clone());
                    self.apply_exit_fill(order);
                }
                Err(e) => {
                    warn!(
                        order_id = %order.order_id,
                        token = %order.token_id,
                        error = %e,
                        "Could not cancel resting profit-target sell, token excluded from close"
                    );
                    self.note_error(Operation::Cancel, e.to_string(), report);
                    blocked.insert(order.token_id, e);
                }
            }
        }
        blocked
    }

    fn apply_close_report(&self, close: &CloseReport, placed_at: DateTime<Utc>, report: &mut TickReport) {
        let kind = close.reason.trade_kind();
        let note = match &close.reason {
            CloseReason::Manual(note) => Some(note.clone()),
            _ => None,
        };

        for token in &close.tokens {
            let group = &token.group;
            let record = || {
                let record = TradeRecord::new(kind, &group.market_id, &group.token_id, group.direction, Side::Sell);
                match &note {
                    Some(note) => record.with_note(note),
                    None => record,
                }
            };

            match &token.outcome {
                TokenCloseOutcome::Resting {
                    order_id,
                    price,
                    shares,
                } => {
                    self.pending_exits.lock().insert(
                        order_id.clone(),
                        PendingExitOrder {
                            order_id: order_id.clone(),
                            market_id: group.market_id.clone(),
                            token_id: group.token_id.clone(),
                            direction: group.direction,
                            position_ids: group.position_ids.clone(),
                            limit_price: *price,
                            shares: *shares,
                            placed_at,
                        },
                    );
                    self.breaker.record_success();
                }
                TokenCloseOutcome::Filled {
                    order_ids,
                    avg_price,
                    shares,
                    proceeds,
                    fee,
                    ..
                } => {
                    let removed = self.remove_positions_by_ids(&group.position_ids);
                    let cost: Decimal = removed.iter().map(|p| p.size).sum();
                    let pnl = *proceeds - *fee - cost;
                    info!(token = %group.token_id, shares = %shares, pnl = %pnl, "Positions closed");
                    self.journal.write().record(
                        record()
                            .with_order(order_ids.join(","))
                            .with_execution(*avg_price, *shares, *proceeds)
                            .with_fee(*fee)
                            .with_pnl(pnl)
                            .with_positions(group.position_ids.clone()),
                    );
                    self.breaker.record_success();
                }
                TokenCloseOutcome::Partial {
                    order_ids,
                    avg_price,
                    requested,
                    filled,
                    proceeds,
                    fee,
                    ..
                } => {
                    let slice = self.ledger.write().close_shares(&group.position_ids, *filled);
                    let closed_ids: Vec<String> = slice.closed.iter().map(|p| p.id.clone()).collect();
                    self.forget_exit_coverage(&closed_ids);
                    let pnl = *proceeds - *fee - slice.cost_basis;
                    warn!(
                        token = %group.token_id,
                        requested = %requested,
                        filled = %filled,
                        "Close partially filled, remainder stays open"
                    );
                    self.note_error(
                        Operation::Exit,
                        format!("partial close of {}: {filled} of {requested}", group.token_id),
                        report,
                    );
                    let mut ids = closed_ids;
                    ids.extend(slice.reduced.iter().cloned());
                    self.journal.write().record(
                        record()
                            .with_order(order_ids.join(","))
                            .with_execution(*avg_price, *filled, *proceeds)
                            .with_fee(*fee)
                            .with_pnl(pnl)
                            .with_positions(ids)
                            .with_note(format!("partial: {filled} of {requested}")),
                    );
                    self.breaker.record_success();
                }
                TokenCloseOutcome::Failed {
                    error: close_error,
                    requires_attention,
                    ..
                } => {
                    if *requires_attention {
                        error!(
                            token = %group.token_id,
                            positions = ?group.position_ids,
                            "Positions remain open and need manual intervention"
                        );
                    }
                    self.journal.write().record(
                        record()
                            .with_positions(group.position_ids.clone())
                            .failed(close_error.to_string()),
                    );
                    self.record_failure(Operation::Exit, close_error, report);
                }
                TokenCloseOutcome::Skipped { reason } => {
                    warn!(token = %group.token_id, reason = %reason, "Close skipped");
                }
            }
        }
    }

    fn forget_exit_coverage(&self, ids: &[String]) {
        let gone: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut exits = self.pending_exits.lock();
        for order in exits.values_mut() {
            order.position_ids.retain(|id| !gone.contains(id.as_str()));
        }
        exits.retain(|order_id, order| {
            let keep = !order.position_ids.is_empty();
            if !keep {
                warn!(order_id = %order_id, "Resting profit-target sell no longer covers any position");
            }
            keep
        });
    }

    // ==================== Entry Phase ====================

    async fn run_entry(
        &self,
        config: &StrategyConfig,
        snapshot: Option<&MarketSnapshot>,
        report: &mut TickReport,
    ) -> EntryOutcome {
        let exposure = self.ledger.read().total_exposure() + self.entry.lock().committed_size();
        let (active, balance) = {
            let state = self.state.read();
            (state.active, state.balance)
        };
        let ctx = EntryContext {
            config,
            settings: &self.settings,
            active,
            snapshot,
            breaker: &self.breaker,
            exposure,
            balance,
        };
        let market = match entry::check_preconditions(&ctx) {
            Ok((_, market)) => market,
            Err(skip) => return EntryOutcome::Skipped(skip),
        };

        let Some(_guard) = self.entry_flag.try_begin(self.settings.in_flight_timeout()) else {
            return EntryOutcome::Skipped(EntrySkip::InFlight);
        };

        let up_token = market.token_for(Direction::Up);
        let down_token = market.token_for(Direction::Down);
        let (up, down) = tokio::join!(
            self.gateway.get_price(up_token, Side::Buy),
            self.gateway.get_price(down_token, Side::Buy)
        );
        let (up, down) = match (up, down) {
            (Ok(up), Ok(down)) => (up, down),
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "Entry prices unavailable");
                return EntryOutcome::Skipped(EntrySkip::PriceUnavailable {
                    message: e.to_string(),
                });
            }
        };

        let threshold = config.entry_threshold();
        let Some(direction) = entry::select_direction(up, down, threshold, self.settings.entry_tie_break) else {
            return EntryOutcome::Skipped(EntrySkip::NoQualifyingSide);
        };
        let token_id = market.token_for(direction).to_string();

        let holds_position = self.ledger.read().has_position_in_market(&market.id);
        {
            let entry = self.entry.lock();
            if holds_position && !entry.dip_observed() {
                return EntryOutcome::Skipped(EntrySkip::AntiChase);
            }
            if entry.has_pending_for(&token_id) {
                return EntryOutcome::Skipped(EntrySkip::AlreadyPending { token_id });
            }
        }

        let limit = config.entry_limit_price();
        let shares = entry::size_order(config.trade_size, limit);
        if shares <= Decimal::ZERO {
            return EntryOutcome::Skipped(EntrySkip::OrderTooSmall);
        }

        info!(
            market = %market.id,
            direction = %direction,
            up_ask = %up,
            down_ask = %down,
            limit = %limit,
            shares = %shares,
            "Placing entry order"
        );

        match entry::place_entry(self.gateway.as_ref(), &market.id, &token_id, direction, limit, shares).await {
            Ok(order) => {
                if !self.is_active() {
                    warn!(order_id = %order.order_id, "Entry placed after stop, order left untracked");
                    return EntryOutcome::Submitted(order);
                }
                self.entry.lock().record_submission(order.clone());
                self.breaker.record_success();
                EntryOutcome::Submitted(order)
            }
            Err(e) => {
                warn!(token = %token_id, error = %e, "Entry order failed");
                let breaker_tripped = self.record_failure(Operation::Entry, &e, report);
                EntryOutcome::Failed {
                    token_id,
                    error: e,
                    breaker_tripped,
                }
            }
        }
    }

    // ==================== Errors ====================

    fn note_error(&self, operation: Operation, message: String, report: &mut TickReport) {
        self.state.write().last_errors.insert(operation, message.clone());
        report.errors.push(TickError { operation, message });
    }

    /// Counts an order failure. Returns true if it tripped the breaker, which
    /// also stops trading.
    fn record_failure(&self, operation: Operation, error: &GatewayError, report: &mut TickReport) -> bool {
        let message = error.to_string();
        self.note_error(operation, message.clone(), report);
        let tripped = self.breaker.record_failure(message);
        if tripped {
            self.state.write().active = false;
            error!(
                failures = self.breaker.consecutive_failures(),
                "Circuit breaker tripped, trading halted until restart"
            );
        }
        tripped
    }
}

impl<G: OrderGateway + ?Sized> PositionStore for LifecycleManager<G> {
    fn positions(&self) -> Vec<Position> {
        self.get_positions()
    }

    fn remove_positions_by_ids(&self, ids: &[String]) -> Vec<Position> {
        LifecycleManager::remove_positions_by_ids(self, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketDescriptor;
    use crate::paper::PaperGateway;
    use rust_decimal_macros::dec;
    use updown_core::PaperConfig;

    fn market() -> MarketDescriptor {
        MarketDescriptor::new("m1", "up", "down", Utc::now(), "c1")
    }

    fn manager() -> (Arc<PaperGateway>, LifecycleManager<PaperGateway>) {
        let gateway = Arc::new(PaperGateway::new(PaperConfig::default()));
        let config = StrategyConfig {
            enabled: true,
            ..Default::default()
        };
        let manager = LifecycleManager::new(gateway.clone(), config, LifecycleConfig::default());
        (gateway, manager)
    }

    fn hold(manager: &LifecycleManager<PaperGateway>, gateway: &PaperGateway, price: Decimal) -> String {
        let order = PendingEntryOrder {
            order_id: "entry-1".into(),
            market_id: "m1".into(),
            token_id: "up".into(),
            direction: Direction::Up,
            size: dec!(2) * price,
            shares: dec!(2),
            limit_price: price,
            placed_at: Utc::now(),
        };
        gateway.credit_shares("up", dec!(2));
        manager.apply_entry_fill(order)
    }

    // ==================== Control Tests ====================

    #[test]
    fn test_start_rejects_invalid_config() {
        let gateway = Arc::new(PaperGateway::new(PaperConfig::default()));
        let config = StrategyConfig {
            stop_loss_price: dec!(99),
            profit_target_price: dec!(95),
            ..Default::default()
        };
        let manager = LifecycleManager::new(gateway, config, LifecycleConfig::default());
        assert!(matches!(manager.start_trading(), Err(LifecycleError::Config(_))));
        assert!(!manager.is_active());
    }

    #[test]
    fn test_update_config_keeps_old_on_error() {
        let (_, manager) = manager();
        let bad = StrategyConfig {
            trade_size: Decimal::ZERO,
            ..Default::default()
        };
        assert!(manager.update_config(bad).is_err());
        assert_eq!(manager.config().trade_size, dec!(2));
    }

    #[tokio::test]
    async fn test_inactive_tick_does_nothing() {
        let (gateway, manager) = manager();
        manager.update_market_data(MarketSnapshot::new(dec!(100), dec!(50), Some(market()), 60));
        let report = manager.on_tick().await;
        assert_eq!(report.entry, EntryOutcome::Skipped(EntrySkip::Inactive));
        assert!(gateway.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_stop_trading_clears_tracking_and_flags() {
        let (gateway, manager) = manager();
        gateway.set_quote("up", dec!(0.96), dec!(0.965));
        gateway.set_quote("down", dec!(0.03), dec!(0.04));
        manager.update_market_data(MarketSnapshot::new(dec!(100), dec!(50), Some(market()), 60));
        manager.start_trading().unwrap();

        let report = manager.on_tick().await;
        assert!(report.entry.is_submitted());

        let _held = manager.exit_flag.try_begin(manager.settings.in_flight_timeout());
        manager.stop_trading();

        let status = manager.get_status();
        assert!(!status.active);
        assert!(status.pending_entries.is_empty());
        assert!(!status.exit_in_flight);
    }

    // ==================== Ordering Tests ====================

    #[tokio::test]
    async fn test_exit_runs_while_entry_in_flight() {
        let (gateway, manager) = manager();
        hold(&manager, &gateway, dec!(0.95));
        gateway.set_quote("up", dec!(0.905), dec!(0.915));
        gateway.set_quote("down", dec!(0.08), dec!(0.09));
        manager.update_market_data(MarketSnapshot::new(dec!(100), dec!(50), Some(market()), 60));
        manager.start_trading().unwrap();

        let _entry = manager.entry_flag.try_begin(manager.settings.in_flight_timeout());
        let report = manager.on_tick().await;

        match report.exit {
            ExitOutcome::Closed { trigger, report } => {
                assert_eq!(trigger, exit::ExitTrigger::StopLoss);
                assert!(report.is_complete());
            }
            other => panic!("Expected stop-loss close, got {other:?}"),
        }
        assert!(manager.get_positions().is_empty());
    }

    #[tokio::test]
    async fn test_manual_close_rejected_while_exit_in_flight() {
        let (gateway, manager) = manager();
        let id = hold(&manager, &gateway, dec!(0.95));

        let held = manager.exit_flag.try_begin(manager.settings.in_flight_timeout());
        let err = manager.close_position_manually(&id, "test").await.unwrap_err();
        assert_eq!(err, LifecycleError::ExitInFlight);
        drop(held);

        let err = manager.close_position_manually("missing", "test").await.unwrap_err();
        assert!(matches!(err, LifecycleError::PositionNotFound(_)));
    }

    // ==================== Breaker Tests ====================

    #[tokio::test]
    async fn test_breaker_trip_halts_trading() {
        let gateway = Arc::new(PaperGateway::new(PaperConfig::default()));
        let config = StrategyConfig {
            enabled: true,
            ..Default::default()
        };
        let settings = LifecycleConfig {
            max_consecutive_failures: 2,
            ..Default::default()
        };
        let manager = LifecycleManager::new(gateway.clone(), config, settings);
        gateway.set_quote("up", dec!(0.96), dec!(0.965));
        gateway.set_quote("down", dec!(0.03), dec!(0.04));
        manager.update_market_data(MarketSnapshot::new(dec!(100), dec!(50), Some(market()), 60));
        manager.start_trading().unwrap();

        gateway.fail_next_submit(GatewayError::Network("down".into()));
        gateway.fail_next_submit(GatewayError::Network("down".into()));

        let first = manager.on_tick().await;
        assert!(matches!(first.entry, EntryOutcome::Failed { breaker_tripped: false, .. }));
        let second = manager.on_tick().await;
        assert!(matches!(second.entry, EntryOutcome::Failed { breaker_tripped: true, .. }));

        let status = manager.get_status();
        assert!(!status.active);
        assert!(status.breaker_tripped);
        assert_eq!(status.last_errors.get(&Operation::Entry).map(String::as_str), Some("Network error: down"));

        manager.start_trading().unwrap();
        assert!(!manager.get_status().breaker_tripped);
    }
}
