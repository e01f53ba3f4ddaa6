//! Verification-challenge handling.
//!
//! A challenge moves the handler from `Idle` to `Detecting`; the supervisor
//! suspends the run and persists whether it should resume. The challenge
//! page is then shown on a [`ChallengeSurface`] and polled until its markers
//! disappear, at which point the handler is `Resolved` and the persisted flag
//! is cleared.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::classify::check_listing_reply;
use crate::context::{EngineCommand, EngineContext};
use crate::error::AppError;
use crate::reporter::Source;
use crate::store::{flag, is_set, keys};
use crate::traits::{Accept, ChallengeSurface, Fetcher, SharedStore};

/// Interval between two checks of an open challenge.
pub const RESOLUTION_POLL: Duration = Duration::from_millis(500);
/// Pause between resolution and the automatic restart.
pub const RESUME_DELAY: Duration = Duration::from_secs(1);
/// Delay before the first probe of a run.
pub const PROBE_FIRST_DELAY: Duration = Duration::from_secs(60);
/// Probes closer together than this are skipped.
pub const PROBE_MIN_GAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Idle,
    Detecting,
    AwaitingResolution,
    Resolved,
}

impl ChallengeState {
    /// Whether a new challenge may be picked up in this state.
    pub fn accepts_detection(&self) -> bool {
        matches!(self, ChallengeState::Idle | ChallengeState::Resolved)
    }

    /// Whether a challenge is currently being handled.
    pub fn is_active(&self) -> bool {
        !self.accepts_detection()
    }
}

/// Drives one challenge at a time through its states.
pub struct InterruptionHandler<S: SharedStore, C: ChallengeSurface> {
    store: S,
    surface: C,
    state: watch::Sender<ChallengeState>,
    poll: Duration,
}

impl<S: SharedStore, C: ChallengeSurface> InterruptionHandler<S, C> {
    pub fn new(store: S, surface: C) -> Self {
        Self {
            store,
            surface,
            state: watch::Sender::new(ChallengeState::Idle),
            poll: RESOLUTION_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<ChallengeState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ChallengeState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChallengeState) {
        self.state.send_replace(state);
    }

    /// `Idle`/`Resolved` to `Detecting`. Returns false if a challenge is
    /// already being handled.
    pub fn detect(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.accepts_detection() {
                *state = ChallengeState::Detecting;
                true
            } else {
                false
            }
        })
    }

    /// Persist whether the engine should resume once the challenge is
    /// solved. Written to its own key so that no start or stop clobbers it.
    pub async fn persist(&self, was_running: bool) -> Result<(), AppError> {
        self.store
            .set(keys::CHALLENGE_RESUME, flag(was_running))
            .await
    }

    /// Show the challenge at `url` and wait for it to be solved.
    ///
    /// Returns the persisted resume flag, or `None` if `token` fired first.
    /// The surface is closed either way.
    pub async fn await_resolution(&self, url: &str, token: &CancellationToken) -> Option<bool> {
        if let Err(e) = self.surface.open(url).await {
            tracing::warn!(error = %e, %url, "Cannot open challenge surface; solve it manually");
        }
        self.set_state(ChallengeState::AwaitingResolution);

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.poll) => {}
                () = token.cancelled() => {
                    self.close().await;
                    return None;
                }
            }
            match self.surface.is_present().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => tracing::debug!(error = %e, "Challenge check failed"),
            }
        }

        self.set_state(ChallengeState::Resolved);
        self.close().await;
        let resume = match self.store.get(keys::CHALLENGE_RESUME).await {
            Ok(v) => is_set(v.as_deref()),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read resume flag");
                false
            }
        };
        if let Err(e) = self.store.remove(keys::CHALLENGE_RESUME).await {
            tracing::warn!(error = %e, "Cannot clear resume flag");
        }
        Some(resume)
    }

    async fn close(&self) {
        if let Err(e) = self.surface.close().await {
            tracing::debug!(error = %e, "Challenge surface close failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Probe surface
// ---------------------------------------------------------------------------

/// Headless [`ChallengeSurface`]: the operator solves the challenge in their
/// own browser; resolution is detected by re-fetching the page.
pub struct ProbeSurface<F: Fetcher> {
    fetcher: F,
    timeout: Duration,
    url: Arc<Mutex<Option<String>>>,
}

impl<F: Fetcher> Clone for ProbeSurface<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            timeout: self.timeout,
            url: self.url.clone(),
        }
    }
}

impl<F: Fetcher> ProbeSurface<F> {
    pub fn new(fetcher: F, timeout: Duration) -> Self {
        Self {
            fetcher,
            timeout,
            url: Arc::new(Mutex::new(None)),
        }
    }

    fn current(&self) -> Option<String> {
        self.url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, url: Option<String>) {
        *self
            .url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = url;
    }
}

impl<F: Fetcher> ChallengeSurface for ProbeSurface<F> {
    async fn open(&self, url: &str) -> Result<(), AppError> {
        tracing::warn!(%url, "Verification challenge: open this page in the session's browser and solve it");
        self.set_current(Some(url.to_string()));
        Ok(())
    }

    async fn is_present(&self) -> Result<bool, AppError> {
        let Some(url) = self.current() else {
            return Ok(false);
        };
        let reply = tokio::time::timeout(self.timeout, self.fetcher.fetch(&url, Accept::Html, self.timeout))
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_millis() as u64))??;
        Ok(matches!(check_listing_reply(&reply), Err(AppError::Challenge)))
    }

    async fn close(&self) -> Result<(), AppError> {
        self.set_current(None);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Time of the last probe, shared across runs.
#[derive(Debug, Default)]
pub struct ProbeClock {
    last: Mutex<Option<Instant>>,
}

impl ProbeClock {
    /// Claim a probe slot at `now`. False if the last probe is too recent.
    pub fn try_mark(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if last.is_some_and(|t| now.duration_since(t) < PROBE_MIN_GAP) {
            return false;
        }
        *last = Some(now);
        true
    }

    /// Forget the last probe so the next one runs regardless of the gap.
    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Fetch the dashboard once. `Ok(true)` if it carries a challenge.
pub async fn probe_once<F: Fetcher>(ctx: &EngineContext<F>) -> Result<bool, AppError> {
    let url = ctx.endpoints.dashboard();
    let timeout = ctx.config.timeouts.probe;
    let reply = tokio::time::timeout(timeout, ctx.fetcher.fetch(&url, Accept::Html, timeout))
        .await
        .map_err(|_| AppError::Timeout(timeout.as_millis() as u64))??;
    match check_listing_reply(&reply) {
        Err(AppError::Challenge) => Ok(true),
        Ok(()) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Low-frequency challenge probe for one run: first after
/// [`PROBE_FIRST_DELAY`], then every `probe_interval`.
pub async fn run_probe<F: Fetcher>(
    ctx: Arc<EngineContext<F>>,
    clock: Arc<ProbeClock>,
    token: CancellationToken,
) {
    let mut delay = PROBE_FIRST_DELAY;
    loop {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => break,
        }
        delay = ctx.config.probe_interval;
        if !clock.try_mark(Instant::now()) {
            continue;
        }
        match probe_once(&ctx).await {
            Ok(true) => {
                ctx.send(EngineCommand::ChallengeDetected {
                    source: Source::Probe,
                });
                break;
            }
            Ok(false) => tracing::debug!("Probe ok"),
            Err(e) => tracing::debug!(error = %e, "Probe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HttpReply;
    use crate::testutil::{
        MemoryStore, MockFetcher, MockReporter, MockSurface, TestHarness, challenge_page,
    };

    #[test]
    fn state_machine_accepts_one_challenge_at_a_time() {
        let handler = InterruptionHandler::new(MemoryStore::new(), MockSurface::new());
        assert_eq!(handler.state(), ChallengeState::Idle);
        assert!(handler.detect());
        assert_eq!(handler.state(), ChallengeState::Detecting);
        assert!(!handler.detect());
        assert!(handler.state().is_active());
    }

    #[tokio::test]
    async fn resolution_clears_the_persisted_flag() {
        let store = MemoryStore::new();
        let surface = MockSurface::new();
        let handler = Arc::new(
            InterruptionHandler::new(store.clone(), surface.clone())
                .with_poll_interval(Duration::from_millis(10)),
        );
        assert!(handler.detect());
        handler.persist(true).await.unwrap();
        assert_eq!(store.value(keys::CHALLENGE_RESUME).as_deref(), Some("1"));

        let token = CancellationToken::new();
        let waiting = {
            let handler = handler.clone();
            let token = token.clone();
            tokio::spawn(async move { handler.await_resolution("https://host.test/dashboard", &token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.state(), ChallengeState::AwaitingResolution);
        assert_eq!(surface.open_count(), 1);

        surface.solve();
        let resume = waiting.await.unwrap();
        assert_eq!(resume, Some(true));
        assert_eq!(handler.state(), ChallengeState::Resolved);
        assert_eq!(store.value(keys::CHALLENGE_RESUME), None);
        assert_eq!(surface.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        // A later challenge is picked up again.
        assert!(handler.detect());
    }

    #[tokio::test]
    async fn cancellation_closes_the_surface() {
        let surface = MockSurface::new();
        let handler = InterruptionHandler::new(MemoryStore::new(), surface.clone())
            .with_poll_interval(Duration::from_millis(10));
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(handler.await_resolution("https://host.test/", &token).await, None);
        assert_eq!(surface.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_surface_tracks_the_page() {
        let fetcher = MockFetcher::new().route("/dashboard", |url| Ok(challenge_page(url)));
        let surface = ProbeSurface::new(fetcher.clone(), Duration::from_secs(1));
        assert!(!surface.is_present().await.unwrap());

        surface.open("https://host.test/dashboard").await.unwrap();
        assert!(surface.is_present().await.unwrap());

        fetcher.set_route("/dashboard", |url| Ok(HttpReply::new(200, url, "<h1>Dashboard</h1>")));
        assert!(!surface.is_present().await.unwrap());
        surface.close().await.unwrap();
        assert_eq!(fetcher.count("/dashboard"), 2);
    }

    #[test]
    fn probe_clock_enforces_the_gap() {
        let clock = ProbeClock::default();
        let t0 = Instant::now();
        assert!(clock.try_mark(t0));
        assert!(!clock.try_mark(t0 + Duration::from_secs(60)));
        assert!(clock.try_mark(t0 + PROBE_MIN_GAP));
        clock.reset();
        assert!(clock.try_mark(t0 + PROBE_MIN_GAP));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_waits_a_minute_then_escalates() {
        let fetcher = MockFetcher::new().route("/dashboard", |url| Ok(challenge_page(url)));
        let mut harness = TestHarness::new(fetcher.clone(), MockReporter::new());
        let token = CancellationToken::new();
        let task = tokio::spawn(run_probe(
            harness.context.clone(),
            Arc::new(ProbeClock::default()),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fetcher.count("/dashboard"), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fetcher.count("/dashboard"), 1);
        task.await.unwrap();

        let commands = harness.drain_commands();
        assert!(commands.iter().any(|c| matches!(
            c,
            EngineCommand::ChallengeDetected {
                source: Source::Probe
            }
        )));
    }
}
