use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use catcher_core::models::{GroupKey, Signal};

/// One stored group signal.
#[derive(Debug, Clone, Copy)]
pub struct SignalEntry {
    pub value: Signal,
    pub updated_at: DateTime<Utc>,
}

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub signals: RwLock<HashMap<GroupKey, SignalEntry>>,
    pub kill: RwLock<Option<DateTime<Utc>>>,
    /// Token protecting the kill switch (None = kill writes disabled).
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(admin_token: Option<String>) -> Self {
        Self {
            signals: RwLock::new(HashMap::new()),
            kill: RwLock::new(None),
            admin_token: admin_token.filter(|t| !t.is_empty()),
        }
    }
}
