//! State shared by every task of one engine, and the command vocabulary the
//! tasks use to talk back to the supervisor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::config::EngineConfig;
use crate::error::AppError;
use crate::ledger::LedgerHandle;
use crate::models::{ClaimGroupId, ItemDescriptor};
use crate::query::Endpoints;
use crate::reporter::{EngineEvent, EngineReporter, Source};
use crate::traits::Fetcher;

/// Who asked for a start or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// This instance's operator. Broadcast to the local and remote tiers.
    Operator,
    /// The local shared store. Not re-broadcast.
    LocalSignal,
    /// The remote signal service. Mirrored into the local store only.
    RemoteSignal,
    /// Automatic resume after a challenge or on boot.
    Resume,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Operator => f.write_str("operator"),
            Origin::LocalSignal => f.write_str("local signal"),
            Origin::RemoteSignal => f.write_str("remote signal"),
            Origin::Resume => f.write_str("resume"),
        }
    }
}

/// Messages handled by the engine supervisor.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start {
        origin: Origin,
    },
    Stop {
        origin: Origin,
    },
    /// The kill flag was observed; stop and refuse to start until cleared.
    Kill,
    /// The kill flag was cleared; resume if the engine was running before.
    KillCleared,
    ChallengeDetected {
        source: Source,
    },
    ChallengeResolved,
    RestartScanners {
        idle: Duration,
    },
    Reconcile,
    BatchDetected(ItemDescriptor),
    Shutdown,
}

/// Whether the acquisition loops are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Running,
    /// Stopped by a verification challenge; resumes once it is solved.
    Suspended,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine's tasks share. Cheap to clone behind an `Arc`.
pub struct EngineContext<F: Fetcher> {
    pub fetcher: F,
    pub endpoints: Endpoints,
    pub config: EngineConfig,
    pub ledger: LedgerHandle,
    pub reporter: Arc<dyn EngineReporter>,
    /// Negative cache of claim groups whose requester is blocked.
    pub blocked: Cache<ClaimGroupId, ()>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<RunState>,
}

impl<F: Fetcher> EngineContext<F> {
    pub fn new(
        fetcher: F,
        config: EngineConfig,
        ledger: LedgerHandle,
        reporter: Arc<dyn EngineReporter>,
        commands: mpsc::UnboundedSender<EngineCommand>,
        state: watch::Receiver<RunState>,
    ) -> Result<Self, AppError> {
        let endpoints = Endpoints::new(&config.base_url)?;
        Ok(Self {
            fetcher,
            endpoints,
            config,
            ledger,
            reporter,
            blocked: Cache::builder().max_capacity(10_000).build(),
            commands,
            state,
        })
    }

    pub fn report(&self, event: EngineEvent<'_>) {
        self.reporter.report(event);
    }

    /// Post a command to the supervisor. Dropped silently once it is gone.
    pub fn send(&self, command: EngineCommand) {
        let _ = self.commands.send(command);
    }

    pub fn run_state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Record a throttle signal and ask for a reconciliation when the busy
    /// counter crosses its threshold.
    pub async fn throttled(&self, source: Source) {
        let scanner = match source {
            Source::Scanner(i) => Some(i),
            _ => None,
        };
        match self.ledger.record_throttle(scanner).await {
            Ok(outcome) => {
                self.report(EngineEvent::Throttled {
                    source,
                    recent: outcome.recent,
                    cooldown: outcome.cooldown,
                });
                if outcome.reconcile {
                    self.send(EngineCommand::Reconcile);
                }
            }
            Err(e) => tracing::debug!(error = %e, "Throttle signal dropped"),
        }
    }

    /// Whether auxiliary traffic should hold off for the global cool-down.
    pub async fn is_cooling(&self) -> bool {
        self.ledger.is_cooling().await.unwrap_or(false)
    }
}
