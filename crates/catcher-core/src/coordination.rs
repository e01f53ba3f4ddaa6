//! RUN/STOP/KILL coordination across instances of one operator group.
//!
//! Two tiers carry the same signals: the local shared store (same machine,
//! read by the watchdog every tick) and the remote signal service (every
//! machine, polled every few seconds). Each tier keeps a last-seen cache so
//! an unchanged value is never acted on twice. The `DEFAULT` group has no
//! remote tier.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::{EngineCommand, EngineContext, Origin};
use crate::error::AppError;
use crate::models::{GroupKey, Signal};
use crate::reporter::{EngineEvent, Tier};
use crate::store::{flag, is_set, keys};
use crate::traits::{Fetcher, SharedStore, SignalService};

/// Remote tier poll interval.
pub const REMOTE_POLL: Duration = Duration::from_secs(3);

/// A change picked up by one of the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Run,
    Stop,
    Kill,
    KillCleared,
}

impl Observed {
    /// Supervisor command for a change seen on `tier`.
    pub fn command(self, tier: Tier) -> EngineCommand {
        let origin = match tier {
            Tier::Local => Origin::LocalSignal,
            Tier::Remote => Origin::RemoteSignal,
        };
        match self {
            Observed::Run => EngineCommand::Start { origin },
            Observed::Stop => EngineCommand::Stop { origin },
            Observed::Kill => EngineCommand::Kill,
            Observed::KillCleared => EngineCommand::KillCleared,
        }
    }

    fn signal(self) -> Option<Signal> {
        match self {
            Observed::Run => Some(Signal::Run),
            Observed::Stop => Some(Signal::Stop),
            Observed::Kill => Some(Signal::Kill),
            Observed::KillCleared => None,
        }
    }
}

#[derive(Debug, Default)]
struct SeenCache {
    local_run: Option<Signal>,
    remote_run: Option<Signal>,
    local_kill: bool,
    remote_kill: bool,
}

fn run_value(signal: Signal) -> &'static str {
    flag(signal == Signal::Run)
}

fn parse_run(value: Option<&str>) -> Option<Signal> {
    match value.map(str::trim) {
        Some("1") | Some("RUN") => Some(Signal::Run),
        Some("0") | Some("STOP") => Some(Signal::Stop),
        _ => None,
    }
}

/// Reads and writes coordination signals for one group.
pub struct Coordinator<S: SharedStore, R: SignalService> {
    store: S,
    remote: R,
    group: GroupKey,
    timeout: Duration,
    seen: Mutex<SeenCache>,
}

impl<S: SharedStore, R: SignalService> Coordinator<S, R> {
    pub fn new(store: S, remote: R, group: GroupKey, timeout: Duration) -> Self {
        Self {
            store,
            remote,
            group,
            timeout,
            seen: Mutex::new(SeenCache::default()),
        }
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    pub fn remote_enabled(&self) -> bool {
        !self.group.is_default()
    }

    fn seen(&self) -> MutexGuard<'_, SeenCache> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn remote_call<T>(
        &self,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_millis() as u64))?
    }

    /// Load the current values into the last-seen caches without acting on
    /// them, so signals written before this process started are not
    /// replayed.
    pub async fn prime(&self) {
        let local_kill = self.store.get(keys::KILL).await.ok().flatten();
        let local_run = self.store.get(&keys::run(&self.group)).await.ok().flatten();
        {
            let mut seen = self.seen();
            seen.local_kill = is_set(local_kill.as_deref());
            seen.local_run = parse_run(local_run.as_deref());
        }
        if !self.remote_enabled() {
            return;
        }
        let remote_kill = self.remote_call(self.remote.get_kill()).await;
        let remote_run = self.remote_call(self.remote.get(&self.group)).await;
        let mut seen = self.seen();
        match remote_kill {
            Ok(kill) => seen.remote_kill = kill,
            Err(e) => tracing::debug!(error = %e, "Remote kill flag unavailable"),
        }
        match remote_run {
            Ok(run) => seen.remote_run = run,
            Err(e) => tracing::debug!(error = %e, group = %self.group, "Remote signal unavailable"),
        }
    }

    /// Read the local tier. Kill takes priority: while it is set, run flags
    /// are not looked at.
    pub async fn poll_local(&self) -> Result<Option<Observed>, AppError> {
        let kill = is_set(self.store.get(keys::KILL).await?.as_deref());
        {
            let mut seen = self.seen();
            if kill != seen.local_kill {
                seen.local_kill = kill;
                return Ok(Some(if kill {
                    Observed::Kill
                } else {
                    Observed::KillCleared
                }));
            }
        }
        if kill {
            return Ok(None);
        }
        let value = self.store.get(&keys::run(&self.group)).await?;
        let Some(signal) = parse_run(value.as_deref()) else {
            return Ok(None);
        };
        let mut seen = self.seen();
        if seen.local_run == Some(signal) {
            return Ok(None);
        }
        seen.local_run = Some(signal);
        Ok(Some(if signal == Signal::Run {
            Observed::Run
        } else {
            Observed::Stop
        }))
    }

    /// Read the remote tier. A remote kill change is mirrored into the local
    /// store so same-host instances pick it up without a round-trip.
    pub async fn poll_remote(&self) -> Result<Option<Observed>, AppError> {
        if !self.remote_enabled() {
            return Ok(None);
        }
        let kill = self.remote_call(self.remote.get_kill()).await?;
        let kill_changed = {
            let mut seen = self.seen();
            let changed = kill != seen.remote_kill;
            seen.remote_kill = kill;
            if changed {
                seen.local_kill = kill;
            }
            changed
        };
        if kill_changed {
            self.store.set(keys::KILL, flag(kill)).await?;
            return Ok(Some(if kill {
                Observed::Kill
            } else {
                Observed::KillCleared
            }));
        }
        if kill {
            return Ok(None);
        }

        let Some(signal) = self.remote_call(self.remote.get(&self.group)).await? else {
            return Ok(None);
        };
        let mut seen = self.seen();
        if seen.remote_run == Some(signal) || signal == Signal::Kill {
            return Ok(None);
        }
        seen.remote_run = Some(signal);
        Ok(Some(if signal == Signal::Run {
            Observed::Run
        } else {
            Observed::Stop
        }))
    }

    /// Whether either tier currently has the kill flag set. Remote errors
    /// fall back to the local flag.
    pub async fn kill_active(&self) -> bool {
        if is_set(self.store.get(keys::KILL).await.ok().flatten().as_deref()) {
            return true;
        }
        if !self.remote_enabled() {
            return false;
        }
        match self.remote_call(self.remote.get_kill()).await {
            Ok(kill) => kill,
            Err(e) => {
                tracing::debug!(error = %e, "Remote kill flag unavailable");
                false
            }
        }
    }

    /// Record a start or stop.
    ///
    /// Every origin updates `was_running`. Operator commands are written to
    /// both tiers and clear the last-seen caches. A remote signal is mirrored
    /// into the local store only. Local signals and resumes write nothing
    /// else.
    pub async fn record_run(&self, run: bool, origin: Origin) -> Result<(), AppError> {
        let signal = if run { Signal::Run } else { Signal::Stop };
        self.store.set(keys::WAS_RUNNING, flag(run)).await?;
        match origin {
            Origin::Operator => {
                self.store
                    .set(&keys::run(&self.group), run_value(signal))
                    .await?;
                if self.remote_enabled()
                    && let Err(e) = self.remote_call(self.remote.set(&self.group, signal)).await
                {
                    tracing::warn!(error = %e, group = %self.group, "Remote signal write failed");
                }
                let mut seen = self.seen();
                seen.local_run = None;
                seen.remote_run = None;
            }
            Origin::RemoteSignal => {
                self.store
                    .set(&keys::run(&self.group), run_value(signal))
                    .await?;
                self.seen().local_run = Some(signal);
            }
            Origin::LocalSignal | Origin::Resume => {}
        }
        Ok(())
    }

    /// Set or clear the kill flag on both tiers. The next poll reports the
    /// change, this instance included.
    pub async fn set_kill(&self, active: bool) -> Result<(), AppError> {
        self.store.set(keys::KILL, flag(active)).await?;
        if self.remote_enabled() {
            self.remote_call(self.remote.set_kill(active)).await?;
        }
        Ok(())
    }

    /// Whether the last session asked to be resumed: a challenge was being
    /// handled, or the engine was running.
    pub async fn resume_requested(&self) -> Result<bool, AppError> {
        let challenge = self.store.get(keys::CHALLENGE_RESUME).await?;
        let was_running = self.store.get(keys::WAS_RUNNING).await?;
        Ok(is_set(challenge.as_deref()) || is_set(was_running.as_deref()))
    }

    pub async fn was_running(&self) -> Result<bool, AppError> {
        Ok(is_set(self.store.get(keys::WAS_RUNNING).await?.as_deref()))
    }

    pub async fn clear_challenge_resume(&self) -> Result<(), AppError> {
        self.store.remove(keys::CHALLENGE_RESUME).await
    }
}

/// Forward an observed change to the supervisor.
pub fn dispatch<F: Fetcher>(ctx: &EngineContext<F>, tier: Tier, observed: Observed) {
    match observed.signal() {
        Some(signal) => ctx.report(EngineEvent::SignalObserved { tier, signal }),
        None => tracing::info!(%tier, "Kill switch cleared"),
    }
    ctx.send(observed.command(tier));
}

/// Poll the remote tier until `token` is cancelled. Returns immediately for
/// the `DEFAULT` group.
pub async fn run_remote_poller<F, S, R>(
    ctx: Arc<EngineContext<F>>,
    coordinator: Arc<Coordinator<S, R>>,
    token: CancellationToken,
) where
    F: Fetcher,
    S: SharedStore,
    R: SignalService,
{
    if !coordinator.remote_enabled() {
        tracing::debug!("Remote coordination disabled for the default group");
        return;
    }
    loop {
        tokio::select! {
            () = tokio::time::sleep(REMOTE_POLL) => {}
            () = token.cancelled() => break,
        }
        match coordinator.poll_remote().await {
            Ok(Some(observed)) => dispatch(&ctx, Tier::Remote, observed),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Remote signal poll failed"),
        }
    }
}
