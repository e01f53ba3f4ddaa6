//! Periodic self-health checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{EngineCommand, EngineContext};
use crate::coordination::{Coordinator, Observed, dispatch};
use crate::reconcile::RECONCILE_INTERVAL;
use crate::reporter::Tier;
use crate::traits::{Fetcher, SharedStore, SignalService};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub tick: Duration,
    /// Scanners are restarted after this long without a completed poll.
    pub stall_after: Duration,
    /// Claim locks older than this are released.
    pub stale_lock: Duration,
    /// Interval at which the blocked-requester cache is emptied.
    pub blocked_clear: Duration,
    pub reconcile_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
            stall_after: Duration::from_secs(8),
            stale_lock: Duration::from_secs(10),
            blocked_clear: Duration::from_secs(90),
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }
}

/// Watchdog for the engine's whole lifetime.
pub struct Watchdog<F: Fetcher, S: SharedStore, R: SignalService> {
    ctx: Arc<EngineContext<F>>,
    coordinator: Arc<Coordinator<S, R>>,
    config: WatchdogConfig,
    last_blocked_clear: Instant,
}

impl<F: Fetcher, S: SharedStore, R: SignalService> Watchdog<F, S, R> {
    pub fn new(
        ctx: Arc<EngineContext<F>>,
        coordinator: Arc<Coordinator<S, R>>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            config,
            last_blocked_clear: Instant::now(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                () = token.cancelled() => break,
            }
            self.check(Instant::now()).await;
        }
        tracing::debug!("Watchdog stopped");
    }

    /// One round of checks. Coordination signals come first; a kill skips
    /// everything else this round.
    pub async fn check(&mut self, now: Instant) {
        match self.coordinator.poll_local().await {
            Ok(Some(observed)) => {
                dispatch(&self.ctx, Tier::Local, observed);
                if observed == Observed::Kill {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Local signal read failed"),
        }

        if let Err(e) = self.ctx.ledger.prune(self.config.stale_lock).await {
            tracing::debug!(error = %e, "Prune skipped");
        }

        if now.duration_since(self.last_blocked_clear) >= self.config.blocked_clear {
            self.ctx.blocked.invalidate_all();
            self.last_blocked_clear = now;
            tracing::debug!("Blocked-requester cache cleared");
        }

        if !self.ctx.is_running() {
            return;
        }
        let Ok(stats) = self.ctx.ledger.stats().await else {
            return;
        };
        let over = |age: Option<u64>, limit: Duration| {
            age.is_none_or(|ms| Duration::from_millis(ms) > limit)
        };
        if over(stats.last_scan_age_ms, self.config.stall_after) {
            let idle = Duration::from_millis(stats.last_scan_age_ms.unwrap_or_default());
            self.ctx.send(EngineCommand::RestartScanners { idle });
        }
        if over(stats.last_reconcile_age_ms, self.config.reconcile_interval) {
            self.ctx.send(EngineCommand::Reconcile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Origin, RunState};
    use crate::models::{ClaimGroupId, GroupKey};
    use crate::store::keys;
    use crate::testutil::{MemoryStore, MockFetcher, MockReporter, MockSignalService, TestHarness};

    fn watchdog(harness: &TestHarness, store: &MemoryStore) -> Watchdog<MockFetcher, MemoryStore, MockSignalService> {
        let coordinator = Coordinator::new(
            store.clone(),
            MockSignalService::new(),
            GroupKey::sanitize("team"),
            Duration::from_secs(1),
        );
        Watchdog::new(
            harness.context.clone(),
            Arc::new(coordinator),
            WatchdogConfig::default(),
        )
    }

    #[tokio::test]
    async fn kill_is_dispatched_before_anything_else() {
        let mut harness = TestHarness::new(MockFetcher::new(), MockReporter::new());
        let store = MemoryStore::new();
        let mut dog = watchdog(&harness, &store);
        store.put(keys::KILL, "1");

        dog.check(Instant::now()).await;
        let commands = harness.drain_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], EngineCommand::Kill));
    }

    #[tokio::test]
    async fn local_run_flag_starts_the_engine() {
        let mut harness = TestHarness::new(MockFetcher::new(), MockReporter::new());
        harness.state.send_replace(RunState::Stopped);
        let store = MemoryStore::new();
        let mut dog = watchdog(&harness, &store);
        store.put("run.TEAM", "1");

        dog.check(Instant::now()).await;
        let commands = harness.drain_commands();
        assert!(matches!(
            commands.as_slice(),
            [EngineCommand::Start {
                origin: Origin::LocalSignal
            }]
        ));
    }

    #[tokio::test]
    async fn stalled_scanners_and_overdue_reconcile() {
        let mut harness = TestHarness::new(MockFetcher::new(), MockReporter::new());
        let store = MemoryStore::new();
        let mut dog = watchdog(&harness, &store);

        // No scan and no reconciliation yet.
        dog.check(Instant::now()).await;
        let commands = harness.drain_commands();
        assert!(commands.iter().any(|c| matches!(c, EngineCommand::RestartScanners { .. })));
        assert!(commands.iter().any(|c| matches!(c, EngineCommand::Reconcile)));

        // A fresh scan clears the stall.
        harness.ledger.record_scan(3);
        dog.check(Instant::now()).await;
        let commands = harness.drain_commands();
        assert!(!commands.iter().any(|c| matches!(c, EngineCommand::RestartScanners { .. })));
    }

    #[tokio::test]
    async fn stopped_engine_is_left_alone() {
        let mut harness = TestHarness::new(MockFetcher::new(), MockReporter::new());
        harness.state.send_replace(RunState::Stopped);
        let store = MemoryStore::new();
        let mut dog = watchdog(&harness, &store);
        dog.check(Instant::now()).await;
        assert!(harness.drain_commands().is_empty());
    }

    #[tokio::test]
    async fn blocked_cache_is_cleared_periodically() {
        let harness = TestHarness::new(MockFetcher::new(), MockReporter::new());
        let store = MemoryStore::new();
        let mut dog = watchdog(&harness, &store);
        let id = ClaimGroupId::from("3BLOCKED");
        harness.context.blocked.insert(id.clone(), ()).await;

        let t0 = Instant::now();
        dog.check(t0 + Duration::from_secs(30)).await;
        assert!(harness.context.blocked.contains_key(&id));
        dog.check(t0 + Duration::from_secs(91)).await;
        harness.context.blocked.run_pending_tasks().await;
        assert!(!harness.context.blocked.contains_key(&id));
    }
}
