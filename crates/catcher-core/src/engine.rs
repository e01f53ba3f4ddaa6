//! Engine supervisor.
//!
//! One task owns the run state and serialises every start, stop, kill and
//! challenge transition. Scanners, catchers, the watchdog and the pollers
//! talk to it through [`EngineCommand`]s; operators go through an
//! [`EngineHandle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catchers::{CatcherKind, configured_catchers, run_catcher};
use crate::claim::ClaimEngine;
use crate::config::EngineConfig;
use crate::context::{EngineCommand, EngineContext, Origin, RunState};
use crate::coordination::{Coordinator, run_remote_poller};
use crate::error::AppError;
use crate::interrupt::{ChallengeState, InterruptionHandler, ProbeClock, RESUME_DELAY, run_probe};
use crate::ledger::{LedgerConfig, LedgerHandle, LedgerStats, spawn_ledger};
use crate::models::{ClaimGroupId, GroupKey};
use crate::reconcile::Reconciler;
use crate::reporter::{EngineEvent, EngineReporter, Source};
use crate::scanner::{ScannerPool, keepalive};
use crate::traits::{ChallengeSurface, Fetcher, SharedStore, SignalService};
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub instance_id: Uuid,
    pub group: GroupKey,
    pub state: RunState,
    pub challenge: ChallengeState,
    #[serde(flatten)]
    pub ledger: LedgerStats,
}

/// Collaborators an engine runs against.
pub struct EngineParts<F, S, R, C> {
    pub fetcher: F,
    pub store: S,
    pub signals: R,
    pub surface: C,
    pub reporter: Arc<dyn EngineReporter>,
}

/// An engine that has been assembled but not spawned.
pub struct Engine<F, S, R, C>
where
    F: Fetcher,
    S: SharedStore,
    R: SignalService,
    C: ChallengeSurface,
{
    ctx: Arc<EngineContext<F>>,
    coordinator: Arc<Coordinator<S, R>>,
    interrupt: InterruptionHandler<S, C>,
    state: watch::Sender<RunState>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    watchdog: WatchdogConfig,
    handle: EngineHandle,
}

impl<F, S, R, C> Engine<F, S, R, C>
where
    F: Fetcher,
    S: SharedStore,
    R: SignalService,
    C: ChallengeSurface,
{
    /// Assemble an engine. Must be called inside a tokio runtime: the ledger
    /// actor is spawned here.
    pub fn new(
        config: EngineConfig,
        group: GroupKey,
        parts: EngineParts<F, S, R, C>,
    ) -> Result<Self, AppError> {
        let ledger = spawn_ledger(LedgerConfig {
            cooldowns: config.cooldowns.clone(),
            in_flight_cap: config.in_flight_cap,
            queue_capacity: config.queue_capacity,
            ..LedgerConfig::default()
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RunState::Stopped);
        let signal_timeout = config.timeouts.signal;
        let ctx = Arc::new(EngineContext::new(
            parts.fetcher,
            config,
            ledger.clone(),
            parts.reporter,
            commands_tx.clone(),
            state_rx.clone(),
        )?);
        let coordinator = Arc::new(Coordinator::new(
            parts.store.clone(),
            parts.signals,
            group.clone(),
            signal_timeout,
        ));
        let interrupt = InterruptionHandler::new(parts.store, parts.surface);

        let handle = EngineHandle {
            instance_id: Uuid::new_v4(),
            group,
            commands: commands_tx,
            state: state_rx,
            challenge: interrupt.subscribe(),
            ledger,
        };
        Ok(Self {
            ctx,
            coordinator,
            interrupt,
            state: state_tx,
            commands: commands_rx,
            watchdog: WatchdogConfig::default(),
            handle,
        })
    }

    pub fn with_watchdog(mut self, config: WatchdogConfig) -> Self {
        self.watchdog = config;
        self
    }

    /// Interval at which an open challenge is re-checked.
    pub fn with_challenge_poll(mut self, poll: Duration) -> Self {
        self.interrupt = self.interrupt.with_poll_interval(poll);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Start the supervisor. The engine boots stopped and resumes by itself
    /// if the last session asked for it.
    pub fn spawn(self) -> EngineHandle {
        let supervisor = Supervisor {
            reconciler: Reconciler::new(self.ctx.clone()),
            ctx: self.ctx,
            coordinator: self.coordinator,
            interrupt: Arc::new(self.interrupt),
            state: self.state,
            commands: self.commands,
            lifetime: CancellationToken::new(),
            background: JoinSet::new(),
            run: None,
            resume_after_challenge: false,
            probe_clock: Arc::new(ProbeClock::default()),
            watchdog: self.watchdog,
            last_restart: None,
        };
        tokio::spawn(supervisor.run());
        self.handle
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable control surface of a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    instance_id: Uuid,
    group: GroupKey,
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<RunState>,
    challenge: watch::Receiver<ChallengeState>,
    ledger: LedgerHandle,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) -> Result<(), AppError> {
        self.commands
            .send(command)
            .map_err(|_| AppError::Generic("engine is not running".into()))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    /// Operator start. Broadcast to both coordination tiers.
    pub fn start(&self) -> Result<(), AppError> {
        self.send(EngineCommand::Start {
            origin: Origin::Operator,
        })
    }

    /// Operator stop. Broadcast to both coordination tiers; cancels a resume
    /// queued by a challenge.
    pub fn stop(&self) -> Result<(), AppError> {
        self.send(EngineCommand::Stop {
            origin: Origin::Operator,
        })
    }

    pub fn request_reconcile(&self) -> Result<(), AppError> {
        self.send(EngineCommand::Reconcile)
    }

    /// Stop everything and end the supervisor.
    pub fn shutdown(&self) -> Result<(), AppError> {
        self.send(EngineCommand::Shutdown)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn challenge_state(&self) -> ChallengeState {
        *self.challenge.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Wait until the run state equals `target`.
    pub async fn wait_for(&self, target: RunState, timeout: Duration) -> Result<(), AppError> {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map_err(|_| AppError::Timeout(timeout.as_millis() as u64))?
            .map(|_| ())
            .map_err(|_| AppError::Generic("engine is not running".into()))
    }

    /// Resolves once the supervisor has exited.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    pub async fn stats(&self) -> Result<EngineStats, AppError> {
        Ok(EngineStats {
            instance_id: self.instance_id,
            group: self.group.clone(),
            state: self.state(),
            challenge: self.challenge_state(),
            ledger: self.ledger.stats().await?,
        })
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunTasks<F: Fetcher> {
    token: CancellationToken,
    claims: ClaimEngine<F>,
    scanners: ScannerPool,
    tasks: JoinSet<()>,
    batches: HashSet<ClaimGroupId>,
}

impl<F: Fetcher> RunTasks<F> {
    async fn stop(mut self) {
        self.token.cancel();
        self.scanners.stop().await;
        while self.tasks.join_next().await.is_some() {}
    }
}

struct Supervisor<F, S, R, C>
where
    F: Fetcher,
    S: SharedStore,
    R: SignalService,
    C: ChallengeSurface,
{
    ctx: Arc<EngineContext<F>>,
    coordinator: Arc<Coordinator<S, R>>,
    interrupt: Arc<InterruptionHandler<S, C>>,
    reconciler: Reconciler<F>,
    state: watch::Sender<RunState>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    /// Cancelled on shutdown only. Parent of every run token.
    lifetime: CancellationToken,
    background: JoinSet<()>,
    run: Option<RunTasks<F>>,
    resume_after_challenge: bool,
    probe_clock: Arc<ProbeClock>,
    watchdog: WatchdogConfig,
    last_restart: Option<Instant>,
}

impl<F, S, R, C> Supervisor<F, S, R, C>
where
    F: Fetcher,
    S: SharedStore,
    R: SignalService,
    C: ChallengeSurface,
{
    async fn run(mut self) {
        tracing::info!(group = %self.coordinator.group(), "Engine supervisor started");
        self.boot().await;

        while let Some(command) = self.commands.recv().await {
            if matches!(command, EngineCommand::Shutdown) {
                break;
            }
            self.handle(command).await;
            while self.background.try_join_next().is_some() {}
        }

        self.halt().await;
        self.lifetime.cancel();
        while self.background.join_next().await.is_some() {}
        self.ctx.report(EngineEvent::Stopped { reason: "shutdown" });
        tracing::info!("Engine supervisor stopped");
    }

    async fn boot(&mut self) {
        self.coordinator.prime().await;

        let watchdog = Watchdog::new(
            self.ctx.clone(),
            self.coordinator.clone(),
            self.watchdog.clone(),
        );
        self.background.spawn(watchdog.run(self.lifetime.clone()));
        self.background.spawn(run_remote_poller(
            self.ctx.clone(),
            self.coordinator.clone(),
            self.lifetime.clone(),
        ));

        match self.coordinator.resume_requested().await {
            Ok(true) => {
                if let Err(e) = self.coordinator.clear_challenge_resume().await {
                    tracing::warn!(error = %e, "Cannot clear resume flag");
                }
                tracing::info!("Resuming previous session");
                self.ctx.send(EngineCommand::Start {
                    origin: Origin::Resume,
                });
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Cannot read resume flags"),
        }
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start { origin } => self.start(origin).await,
            EngineCommand::Stop { origin } => self.stop(origin).await,
            EngineCommand::Kill => {
                if self.halt().await {
                    self.ctx.report(EngineEvent::Stopped {
                        reason: "kill switch",
                    });
                }
            }
            EngineCommand::KillCleared => match self.coordinator.was_running().await {
                Ok(true) if self.run.is_none() => self.ctx.send(EngineCommand::Start {
                    origin: Origin::Resume,
                }),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Cannot read run flag"),
            },
            EngineCommand::ChallengeDetected { source } => self.suspend(source).await,
            EngineCommand::ChallengeResolved => self.resolved(),
            EngineCommand::RestartScanners { idle } => self.restart_scanners(idle).await,
            EngineCommand::Reconcile => {
                if self.interrupt.state().is_active() || self.reconciler.is_busy() {
                    return;
                }
                let reconciler = self.reconciler.clone();
                self.background.spawn(async move {
                    // Failures are reported by the reconciler.
                    let _ = reconciler.run().await;
                });
            }
            EngineCommand::BatchDetected(item) => {
                if let Some(run) = self.run.as_mut()
                    && run.batches.insert(item.group_id.clone())
                {
                    run.tasks.spawn(run_catcher(
                        run.claims.clone(),
                        CatcherKind::Batch(item),
                        run.token.clone(),
                    ));
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    async fn start(&mut self, origin: Origin) {
        if self.run.is_some() {
            return;
        }
        if self.interrupt.state().is_active() {
            self.ctx.report(EngineEvent::StartRefused {
                reason: "verification challenge pending",
            });
            return;
        }
        if self.coordinator.kill_active().await {
            self.ctx.report(EngineEvent::StartRefused {
                reason: "kill switch active",
            });
            return;
        }

        self.ctx.ledger.reset();
        self.ctx.blocked.invalidate_all();
        let token = self.lifetime.child_token();
        let claims = ClaimEngine::new(self.ctx.clone(), token.clone());
        let scanners = ScannerPool::start(&claims, &token);
        let mut tasks = JoinSet::new();
        let config = &self.ctx.config;
        for kind in configured_catchers(config.favorite.as_ref(), &config.watched_groups) {
            tasks.spawn(run_catcher(claims.clone(), kind, token.clone()));
        }
        tasks.spawn(keepalive(self.ctx.clone(), token.clone()));
        if config.probe_enabled {
            tasks.spawn(run_probe(
                self.ctx.clone(),
                self.probe_clock.clone(),
                token.clone(),
            ));
        }

        let scanner_count = scanners.len();
        self.run = Some(RunTasks {
            token,
            claims,
            scanners,
            tasks,
            batches: HashSet::new(),
        });
        self.last_restart = None;
        if let Err(e) = self.coordinator.record_run(true, origin).await {
            tracing::warn!(error = %e, "Cannot record run state");
        }
        self.state.send_replace(RunState::Running);
        self.ctx.report(EngineEvent::Started {
            group: self.coordinator.group(),
            scanners: scanner_count,
        });
        self.ctx.send(EngineCommand::Reconcile);
    }

    async fn stop(&mut self, origin: Origin) {
        let suspended = *self.state.borrow() == RunState::Suspended;
        let active = self.run.is_some() || suspended;
        if origin == Origin::Operator {
            self.resume_after_challenge = false;
            if let Err(e) = self.coordinator.clear_challenge_resume().await {
                tracing::warn!(error = %e, "Cannot clear resume flag");
            }
        } else if !active {
            return;
        }

        if let Some(run) = self.run.take() {
            run.stop().await;
        }
        if let Err(e) = self.coordinator.record_run(false, origin).await {
            tracing::warn!(error = %e, "Cannot record run state");
        }
        self.state.send_replace(RunState::Stopped);
        if active {
            let reason = origin.to_string();
            self.ctx.report(EngineEvent::Stopped { reason: &reason });
        }
    }

    /// Tear the current run down without touching the persisted run flags.
    /// Returns false if nothing was running.
    async fn halt(&mut self) -> bool {
        let Some(run) = self.run.take() else {
            return false;
        };
        run.stop().await;
        self.state.send_replace(RunState::Stopped);
        true
    }

    async fn suspend(&mut self, source: Source) {
        if !self.interrupt.detect() {
            return;
        }
        let run = self.run.take();
        let was_running = run.is_some();
        if let Some(run) = run {
            run.stop().await;
        }
        self.resume_after_challenge = was_running;
        if let Err(e) = self.interrupt.persist(was_running).await {
            tracing::warn!(error = %e, "Cannot persist resume flag");
        }
        if was_running {
            self.state.send_replace(RunState::Suspended);
        }
        self.ctx.report(EngineEvent::ChallengeDetected { source });

        let interrupt = self.interrupt.clone();
        let ctx = self.ctx.clone();
        let lifetime = self.lifetime.clone();
        let url = self.ctx.endpoints.dashboard();
        self.background.spawn(async move {
            if interrupt.await_resolution(&url, &lifetime).await.is_some() {
                ctx.send(EngineCommand::ChallengeResolved);
            }
        });
    }

    fn resolved(&mut self) {
        let resume = self.resume_after_challenge;
        self.resume_after_challenge = false;
        if self.run.is_none() {
            self.state.send_replace(RunState::Stopped);
        }
        self.ctx.report(EngineEvent::ChallengeResolved { resume });
        if !resume {
            return;
        }
        let ctx = self.ctx.clone();
        let lifetime = self.lifetime.clone();
        self.background.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(RESUME_DELAY) => ctx.send(EngineCommand::Start {
                    origin: Origin::Resume,
                }),
                () = lifetime.cancelled() => {}
            }
        });
    }

    async fn restart_scanners(&mut self, idle: Duration) {
        if self
            .last_restart
            .is_some_and(|t| t.elapsed() < self.watchdog.stall_after)
        {
            return;
        }
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.scanners.restart(&run.claims, &run.token).await;
        self.last_restart = Some(Instant::now());
        self.ctx.report(EngineEvent::ScannersRestarted { idle });
    }
}
