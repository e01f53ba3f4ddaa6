use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{GroupKey, HttpReply, Signal};

/// Content type a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Json,
    Html,
}

impl Accept {
    pub fn mime(&self) -> &'static str {
        match self {
            Accept::Json => "application/json",
            Accept::Html => "text/html,application/xhtml+xml",
        }
    }
}

/// Issues one GET against the listing service with the operator's session,
/// following redirects.
///
/// Any HTTP status is a successful fetch; only transport failures and
/// timeouts are errors.
pub trait Fetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        url: &str,
        accept: Accept,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpReply, AppError>> + Send;
}

/// Small key/value store shared by every instance on this machine.
pub trait SharedStore: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Remote RUN/STOP signal per operator group plus one global kill flag.
pub trait SignalService: Send + Sync + Clone + 'static {
    fn get(&self, group: &GroupKey)
    -> impl Future<Output = Result<Option<Signal>, AppError>> + Send;

    fn set(
        &self,
        group: &GroupKey,
        signal: Signal,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_kill(&self) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn set_kill(&self, active: bool) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Isolated, operator-visible context where a verification challenge is
/// solved by a human.
pub trait ChallengeSurface: Send + Sync + Clone + 'static {
    /// Show the challenge page at `url` to the operator.
    fn open(&self, url: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Whether the page still carries challenge markers.
    fn is_present(&self) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Tear the context down.
    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Resolves the operator-group key once at startup.
pub trait GroupResolver: Send + Sync {
    fn resolve(&self) -> impl Future<Output = Result<GroupKey, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// Trivial implementations
// ---------------------------------------------------------------------------

/// Signal service used when no remote endpoint is configured. Reads nothing,
/// accepts and drops writes.
#[derive(Debug, Clone, Default)]
pub struct NullSignalService;

impl SignalService for NullSignalService {
    async fn get(&self, _group: &GroupKey) -> Result<Option<Signal>, AppError> {
        Ok(None)
    }

    async fn set(&self, _group: &GroupKey, _signal: Signal) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_kill(&self) -> Result<bool, AppError> {
        Ok(false)
    }

    async fn set_kill(&self, _active: bool) -> Result<(), AppError> {
        Ok(())
    }
}

/// Group resolver returning a fixed, pre-sanitised key.
#[derive(Debug, Clone)]
pub struct StaticGroup(pub GroupKey);

impl StaticGroup {
    pub fn new(raw: &str) -> Self {
        Self(GroupKey::sanitize(raw))
    }
}

impl GroupResolver for StaticGroup {
    async fn resolve(&self) -> Result<GroupKey, AppError> {
        Ok(self.0.clone())
    }
}
