//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::claim::ClaimEngine;
use crate::config::EngineConfig;
use crate::context::{EngineCommand, EngineContext, RunState};
use crate::error::AppError;
use crate::ledger::{LedgerConfig, LedgerHandle, spawn_ledger};
use crate::models::{ClaimGroupId, GroupKey, HttpReply, ItemDescriptor, Signal};
use crate::reporter::{EngineEvent, EngineReporter};
use crate::traits::{Accept, ChallengeSurface, Fetcher, SharedStore, SignalService};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&str) -> Result<HttpReply, AppError> + Send + Sync>;

/// Mock fetcher that answers by URL substring.
///
/// Routes are checked in insertion order; the first pattern contained in
/// the requested URL answers. Unrouted URLs get an empty listing.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<Vec<(String, Responder)>>>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<R>(self, pattern: &str, responder: R) -> Self
    where
        R: Fn(&str) -> Result<HttpReply, AppError> + Send + Sync + 'static,
    {
        self.set_route(pattern, responder);
        self
    }

    /// Add or replace a route on a fetcher already handed out.
    pub fn set_route<R>(&self, pattern: &str, responder: R)
    where
        R: Fn(&str) -> Result<HttpReply, AppError> + Send + Sync + 'static,
    {
        let mut routes = self.routes.lock().unwrap();
        let responder: Responder = Arc::new(responder);
        match routes.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = responder,
            None => routes.push((pattern.to_string(), responder)),
        }
    }

    /// Delay every response by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.contains(pattern))
            .count()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        _accept: Accept,
        _timeout: Duration,
    ) -> Result<HttpReply, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let responder = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| url.contains(p.as_str()))
            .map(|(_, r)| r.clone());
        match responder {
            Some(r) => r(url),
            None => Ok(HttpReply::new(200, url, r#"{"results":[]}"#)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory shared store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.put(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSignalService
// ---------------------------------------------------------------------------

/// Mock remote signal service with recorded writes.
#[derive(Clone, Default)]
pub struct MockSignalService {
    signals: Arc<Mutex<HashMap<GroupKey, Signal>>>,
    kill: Arc<AtomicBool>,
    pub writes: Arc<Mutex<Vec<(GroupKey, Signal)>>>,
    pub reads: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MockSignalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a group's value as if another instance had written it.
    pub fn publish(&self, group: &GroupKey, signal: Signal) {
        self.signals.lock().unwrap().insert(group.clone(), signal);
    }

    pub fn current(&self, group: &GroupKey) -> Option<Signal> {
        self.signals.lock().unwrap().get(group).copied()
    }

    pub fn set_kill_flag(&self, active: bool) {
        self.kill.store(active, Ordering::SeqCst);
    }

    /// Make every call fail with a signal error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AppError::Signal("service unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl SignalService for MockSignalService {
    async fn get(&self, group: &GroupKey) -> Result<Option<Signal>, AppError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.current(group))
    }

    async fn set(&self, group: &GroupKey, signal: Signal) -> Result<(), AppError> {
        self.check()?;
        self.writes.lock().unwrap().push((group.clone(), signal));
        self.publish(group, signal);
        Ok(())
    }

    async fn get_kill(&self) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.kill.load(Ordering::SeqCst))
    }

    async fn set_kill(&self, active: bool) -> Result<(), AppError> {
        self.check()?;
        self.set_kill_flag(active);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSurface
// ---------------------------------------------------------------------------

/// Mock challenge surface. The challenge stays present until
/// [`solve`](Self::solve) is called.
#[derive(Clone, Default)]
pub struct MockSurface {
    present: Arc<AtomicBool>,
    pub opened: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
}

impl MockSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn solve(&self) {
        self.present.store(false, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

impl ChallengeSurface for MockSurface {
    async fn open(&self, url: &str) -> Result<(), AppError> {
        self.present.store(true, Ordering::SeqCst);
        self.opened.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn is_present(&self) -> Result<bool, AppError> {
        Ok(self.present.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock engine reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == label)
            .count()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl EngineReporter for MockReporter {
    fn report(&self, event: EngineEvent<'_>) {
        self.events.lock().unwrap().push(event.label().to_string());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Ledger, context and run token wired together, with the supervisor's
/// command channel exposed for assertions.
pub struct TestHarness {
    pub ledger: LedgerHandle,
    pub context: Arc<EngineContext<MockFetcher>>,
    pub run: CancellationToken,
    pub state: watch::Sender<RunState>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
}

impl TestHarness {
    pub fn new(fetcher: MockFetcher, reporter: MockReporter) -> Self {
        Self::with_config(fetcher, reporter, |_| {})
    }

    pub fn with_config(
        fetcher: MockFetcher,
        reporter: MockReporter,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let mut config = test_config();
        tweak(&mut config);
        let ledger = spawn_ledger(LedgerConfig {
            cooldowns: config.cooldowns.clone(),
            in_flight_cap: config.in_flight_cap,
            queue_capacity: config.queue_capacity,
            ..LedgerConfig::default()
        });
        let (tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(RunState::Running);
        let context = EngineContext::new(
            fetcher,
            config,
            ledger.clone(),
            Arc::new(reporter),
            tx,
            state_rx,
        )
        .unwrap();
        Self {
            ledger,
            context: Arc::new(context),
            run: CancellationToken::new(),
            state,
            commands,
        }
    }

    pub fn claims(&self) -> ClaimEngine<MockFetcher> {
        ClaimEngine::new(self.context.clone(), self.run.clone())
    }

    /// Commands posted so far.
    pub fn drain_commands(&mut self) -> Vec<EngineCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }
}

/// Engine config pointing at a fake host, with short timeouts.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default().with_base_url("https://host.test");
    config.timeouts.claim = Duration::from_secs(2);
    config.timeouts.listing = Duration::from_secs(2);
    config
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Listing row with the given id and slot count.
pub fn item(id: &str, slots: u32) -> ItemDescriptor {
    ItemDescriptor {
        group_id: ClaimGroupId::from(id),
        title: format!("Item {id}"),
        reward: 0.50,
        requester_id: "RTEST".to_string(),
        requester_name: "Test Requester".to_string(),
        slots,
        updated_at: None,
    }
}

/// Listing response body for `items`.
pub fn listing_json(items: &[ItemDescriptor]) -> String {
    let results: Vec<serde_json::Value> = items
        .iter()
        .map(|i| {
            serde_json::json!({
                "hit_set_id": i.group_id.as_str(),
                "title": i.title,
                "requester_id": i.requester_id,
                "requester_name": i.requester_name,
                "monetary_reward": {"amount_in_dollars": i.reward},
                "assignable_hits_count": i.slots,
                "last_updated_time": i.updated_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    serde_json::json!({ "results": results }).to_string()
}

/// Reply of a claim that redirected to the claimed work item.
pub fn work_item_redirect(claim_url: &str) -> HttpReply {
    let project = claim_url
        .split("/projects/")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("3UNKNOWN");
    HttpReply::new(
        200,
        format!("https://host.test/projects/{project}/tasks/3ASSIGNMENT0000000000000001?assignment_id=x"),
        "<html>task</html>",
    )
}

/// Reply carrying a verification challenge page.
pub fn challenge_page(url: &str) -> HttpReply {
    HttpReply::new(
        200,
        url,
        "<form action=\"/errors/validateCaptcha\"><input name=\"captchacharacters\"></form>",
    )
}
