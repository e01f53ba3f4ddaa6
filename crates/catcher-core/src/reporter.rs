//! Engine events and their sinks.
//!
//! Components never log directly; they report an [`EngineEvent`] and the
//! configured [`EngineReporter`] decides what to do with it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ClaimGroupId, ClaimRecord, GroupKey, ItemCategory, Signal};

/// Where a challenge or throttle signal was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Scanner(usize),
    Claim,
    Probe,
    Catcher,
    KeepAlive,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Scanner(i) => write!(f, "scanner {i}"),
            Source::Claim => f.write_str("claim"),
            Source::Probe => f.write_str("probe"),
            Source::Catcher => f.write_str("catcher"),
            Source::KeepAlive => f.write_str("keep-alive"),
        }
    }
}

/// Coordination tier a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => f.write_str("local"),
            Tier::Remote => f.write_str("remote"),
        }
    }
}

/// Events emitted by the engine for monitoring and the operator log.
#[derive(Debug, Clone)]
pub enum EngineEvent<'a> {
    Started {
        group: &'a GroupKey,
        scanners: usize,
    },
    Stopped {
        reason: &'a str,
    },
    StartRefused {
        reason: &'a str,
    },
    ItemsScanned {
        scanner: usize,
        count: usize,
    },
    BurstFired {
        group_id: &'a ClaimGroupId,
        blasts: u32,
        category: ItemCategory,
    },
    Claimed {
        record: &'a ClaimRecord,
    },
    BurstMissed {
        group_id: &'a ClaimGroupId,
        attempts: u32,
    },
    Throttled {
        source: Source,
        recent: usize,
        cooldown: Duration,
    },
    ScannerError {
        scanner: usize,
        error: &'a str,
        streak: u32,
    },
    ScannersRestarted {
        idle: Duration,
    },
    BatchDetected {
        group_id: &'a ClaimGroupId,
        title: &'a str,
    },
    ChallengeDetected {
        source: Source,
    },
    ChallengeResolved {
        resume: bool,
    },
    Reconciled {
        live: usize,
        believed: usize,
        queue_size: u32,
    },
    ReconcileFailed {
        error: &'a str,
    },
    SignalObserved {
        tier: Tier,
        signal: Signal,
    },
    KeepAliveFailed {
        error: &'a str,
    },
}

/// Severity of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl EngineEvent<'_> {
    /// Stable label, used by tests and log filters.
    pub fn label(&self) -> &'static str {
        match self {
            EngineEvent::Started { .. } => "started",
            EngineEvent::Stopped { .. } => "stopped",
            EngineEvent::StartRefused { .. } => "start_refused",
            EngineEvent::ItemsScanned { .. } => "items_scanned",
            EngineEvent::BurstFired { .. } => "burst_fired",
            EngineEvent::Claimed { .. } => "claimed",
            EngineEvent::BurstMissed { .. } => "burst_missed",
            EngineEvent::Throttled { .. } => "throttled",
            EngineEvent::ScannerError { .. } => "scanner_error",
            EngineEvent::ScannersRestarted { .. } => "scanners_restarted",
            EngineEvent::BatchDetected { .. } => "batch_detected",
            EngineEvent::ChallengeDetected { .. } => "challenge_detected",
            EngineEvent::ChallengeResolved { .. } => "challenge_resolved",
            EngineEvent::Reconciled { .. } => "reconciled",
            EngineEvent::ReconcileFailed { .. } => "reconcile_failed",
            EngineEvent::SignalObserved { .. } => "signal_observed",
            EngineEvent::KeepAliveFailed { .. } => "keepalive_failed",
        }
    }

    /// Operator-facing line for the activity log, or `None` for high-volume
    /// events that only go to tracing.
    pub fn describe(&self) -> Option<(Level, String)> {
        let entry = match self {
            EngineEvent::Started { group, scanners } => (
                Level::Success,
                format!("Started with {scanners} scanners (group {group})"),
            ),
            EngineEvent::Stopped { reason } => (Level::Warning, format!("Stopped: {reason}")),
            EngineEvent::StartRefused { reason } => {
                (Level::Error, format!("Start refused: {reason}"))
            }
            EngineEvent::Claimed { record } => (
                Level::Success,
                format!(
                    "Claimed {} (${:.2}, {})",
                    record.title, record.reward, record.requester_name
                ),
            ),
            EngineEvent::Throttled {
                source, cooldown, ..
            } if *cooldown >= Duration::from_millis(2500) => (
                Level::Warning,
                format!("Throttled via {source}, cooling {}ms", cooldown.as_millis()),
            ),
            EngineEvent::ScannersRestarted { idle } => (
                Level::Warning,
                format!("Scanners idle for {}s, restarting", idle.as_secs()),
            ),
            EngineEvent::BatchDetected { group_id, title } => (
                Level::Info,
                format!("Batch detected, starting catcher: {title} ({group_id})"),
            ),
            EngineEvent::ChallengeDetected { source } => (
                Level::Error,
                format!("Verification challenge detected via {source}, paused"),
            ),
            EngineEvent::ChallengeResolved { resume } => (
                Level::Success,
                if *resume {
                    "Challenge solved, resuming".to_string()
                } else {
                    "Challenge solved".to_string()
                },
            ),
            EngineEvent::ReconcileFailed { error } => {
                (Level::Warning, format!("Queue sync failed: {error}"))
            }
            EngineEvent::SignalObserved { tier, signal } => {
                (Level::Info, format!("{tier} signal {signal}"))
            }
            EngineEvent::KeepAliveFailed { error } => {
                (Level::Warning, format!("Keep-alive failed: {error}"))
            }
            _ => return None,
        };
        Some(entry)
    }
}

/// Trait for receiving engine events (decoupled logging).
pub trait EngineReporter: Send + Sync + 'static {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EngineReporter for TracingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::Started { group, scanners } => {
                tracing::info!(%group, %scanners, "Engine started");
            }
            EngineEvent::Stopped { reason } => {
                tracing::info!(%reason, "Engine stopped");
            }
            EngineEvent::StartRefused { reason } => {
                tracing::warn!(%reason, "Start refused");
            }
            EngineEvent::ItemsScanned { scanner, count } => {
                tracing::trace!(%scanner, %count, "Listing scanned");
            }
            EngineEvent::BurstFired {
                group_id,
                blasts,
                category,
            } => {
                tracing::debug!(%group_id, %blasts, %category, "Burst fired");
            }
            EngineEvent::Claimed { record } => {
                tracing::info!(
                    group_id = %record.group_id,
                    title = %record.title,
                    reward = record.reward,
                    confidence = record.confidence,
                    assignment_id = ?record.assignment_id,
                    "Item claimed"
                );
            }
            EngineEvent::BurstMissed { group_id, attempts } => {
                tracing::debug!(%group_id, %attempts, "Burst missed");
            }
            EngineEvent::Throttled {
                source,
                recent,
                cooldown,
            } => {
                tracing::debug!(%source, %recent, cooldown_ms = cooldown.as_millis() as u64, "Throttled");
            }
            EngineEvent::ScannerError {
                scanner,
                error,
                streak,
            } => {
                tracing::debug!(%scanner, %error, %streak, "Scanner request failed");
            }
            EngineEvent::ScannersRestarted { idle } => {
                tracing::warn!(idle_ms = idle.as_millis() as u64, "Scanners stalled, restarting");
            }
            EngineEvent::BatchDetected { group_id, title } => {
                tracing::info!(%group_id, %title, "Batch detected");
            }
            EngineEvent::ChallengeDetected { source } => {
                tracing::warn!(%source, "Verification challenge detected");
            }
            EngineEvent::ChallengeResolved { resume } => {
                tracing::info!(%resume, "Verification challenge resolved");
            }
            EngineEvent::Reconciled {
                live,
                believed,
                queue_size,
            } => {
                tracing::debug!(%live, %believed, %queue_size, "Queue reconciled");
            }
            EngineEvent::ReconcileFailed { error } => {
                tracing::warn!(%error, "Queue reconcile failed");
            }
            EngineEvent::SignalObserved { tier, signal } => {
                tracing::info!(%tier, %signal, "Coordination signal observed");
            }
            EngineEvent::KeepAliveFailed { error } => {
                tracing::warn!(%error, "Keep-alive failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

/// One operator-facing log line.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub level: Level,
    pub message: String,
}

#[derive(Debug, Default)]
struct ActivityInner {
    entries: VecDeque<ActivityEntry>,
    history: VecDeque<ClaimRecord>,
}

/// Bounded append-only activity log and claimed-item history. Forwards every
/// event to [`TracingReporter`] as well.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    inner: Arc<Mutex<ActivityInner>>,
    max_entries: usize,
    max_history: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(400, 80)
    }
}

impl ActivityLog {
    pub fn new(max_entries: usize, max_history: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ActivityInner::default())),
            max_entries,
            max_history,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActivityInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log entries, oldest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Claimed items, newest first.
    pub fn history(&self) -> Vec<ClaimRecord> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn push(&self, level: Level, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.entries.push_back(ActivityEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
    }
}

impl EngineReporter for ActivityLog {
    fn report(&self, event: EngineEvent<'_>) {
        if let EngineEvent::Claimed { record } = &event {
            let mut inner = self.lock();
            inner.history.push_front((*record).clone());
            while inner.history.len() > self.max_history {
                inner.history.pop_back();
            }
        }
        if let Some((level, message)) = event.describe() {
            self.push(level, message);
        }
        TracingReporter.report(event);
    }
}
