//! Timer-driven host for [`LifecycleManager::on_tick`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::gateway::OrderGateway;
use crate::manager::LifecycleManager;

/// Calls `on_tick` on a fixed interval. A tick that reports errors is followed
/// by an extra backoff sleep before the next one.
pub struct TickLoop<G: OrderGateway + ?Sized> {
    manager: Arc<LifecycleManager<G>>,
    interval: Duration,
    backoff: Duration,
}

impl<G: OrderGateway + ?Sized + 'static> TickLoop<G> {
    /// Uses the tick interval and backoff from the manager's settings.
    #[must_use]
    pub fn new(manager: Arc<LifecycleManager<G>>) -> Self {
        let interval = manager.settings().tick_interval();
        let backoff = manager.settings().tick_error_backoff();
        Self {
            manager,
            interval,
            backoff,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Tick loop started"
        );

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    let report = self.manager.on_tick().await;
                    if report.has_errors() {
                        for e in &report.errors {
                            warn!(tick = ticks, operation = %e.operation, error = %e.message, "Tick error");
                        }
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        info!(ticks, "Tick loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperGateway;
    use updown_core::{LifecycleConfig, PaperConfig, StrategyConfig};

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let gateway = Arc::new(PaperGateway::new(PaperConfig::default()));
        let manager = Arc::new(LifecycleManager::new(
            gateway,
            StrategyConfig::default(),
            LifecycleConfig::default(),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(
            TickLoop::new(manager)
                .with_interval(Duration::from_millis(5))
                .run(rx),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
