use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use catcher_client::{HttpSignalService, ReqwestFetcher};
use catcher_core::coordination::Coordinator;
use catcher_core::store::{flag, is_set, keys};
use catcher_core::{
    ActivityLog, AppError, ChallengeSurface, Engine, EngineConfig, EngineParts, FileStore,
    GroupKey, GroupResolver, HttpReply, NullSignalService, ProbeSurface, SharedStore, Signal,
    SignalService, StaticGroup, classify,
};

#[derive(Parser)]
#[command(name = "catcher", version, about = "Listing scanner and claim engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Shared {
    /// Operator group; instances in the same group follow the same RUN/STOP
    #[arg(short, long, env = "CATCHER_GROUP", default_value = "")]
    group: String,

    /// Directory of the shared store used by every instance on this machine
    #[arg(long, env = "CATCHER_STORE_DIR", default_value = ".catcher")]
    store_dir: PathBuf,

    /// Base URL of the remote signal service (omit to coordinate locally only)
    #[arg(long, env = "CATCHER_SIGNAL_URL")]
    signal_url: Option<String>,

    /// Bearer token for kill switch writes
    #[arg(long, env = "CATCHER_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        #[command(flatten)]
        shared: Shared,

        /// Session cookie sent with every request
        #[arg(long, env = "CATCHER_SESSION_COOKIE", hide_env_values = true)]
        session_cookie: Option<String>,

        /// Start scanning right away instead of waiting for a signal
        #[arg(long, default_value_t = false)]
        start: bool,

        /// Show verification challenges in a browser window
        #[arg(long, default_value_t = false)]
        browser: bool,

        /// Seconds between status lines on stdout (0 disables)
        #[arg(long, default_value_t = 30)]
        status_every: u64,
    },

    /// Show the local coordination flags
    Status {
        #[command(flatten)]
        shared: Shared,
    },

    /// Read or write the group's RUN/STOP signal
    Signal {
        #[command(flatten)]
        shared: Shared,

        #[command(subcommand)]
        action: SignalAction,
    },

    /// Engage or release the kill switch on every instance
    Kill {
        #[command(flatten)]
        shared: Shared,

        state: Toggle,
    },

    /// Classify a saved claim response
    Classify {
        /// Final URL of the response
        #[arg(short, long)]
        url: String,

        /// HTTP status of the response
        #[arg(short, long, default_value_t = 200)]
        status: u16,

        /// File holding the response body
        #[arg(short, long)]
        body: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SignalAction {
    /// Print the local and remote values
    Get,
    /// Write RUN or STOP to both tiers
    Set { value: RunStop },
}

#[derive(Clone, Copy, ValueEnum)]
enum RunStop {
    Run,
    Stop,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("catcher=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            shared,
            session_cookie,
            start,
            browser,
            status_every,
        } => cmd_run(&shared, session_cookie, start, browser, status_every).await?,
        Commands::Status { shared } => cmd_status(&shared).await?,
        Commands::Signal { shared, action } => cmd_signal(&shared, action).await?,
        Commands::Kill { shared, state } => cmd_kill(&shared, state).await?,
        Commands::Classify { url, status, body } => cmd_classify(&url, status, body)?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Collaborators chosen at runtime
// ---------------------------------------------------------------------------

/// Remote tier, or nothing when no service is configured.
#[derive(Clone)]
enum RemoteSignals {
    Http(HttpSignalService),
    Off(NullSignalService),
}

impl RemoteSignals {
    fn from_shared(shared: &Shared, timeout: Duration) -> Result<Self> {
        match shared.signal_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Ok(Self::Http(HttpSignalService::new(
                url,
                shared.admin_token.clone(),
                timeout,
            )?)),
            None => Ok(Self::Off(NullSignalService)),
        }
    }
}

impl SignalService for RemoteSignals {
    async fn get(&self, group: &GroupKey) -> Result<Option<Signal>, AppError> {
        match self {
            Self::Http(s) => s.get(group).await,
            Self::Off(s) => s.get(group).await,
        }
    }

    async fn set(&self, group: &GroupKey, signal: Signal) -> Result<(), AppError> {
        match self {
            Self::Http(s) => s.set(group, signal).await,
            Self::Off(s) => s.set(group, signal).await,
        }
    }

    async fn get_kill(&self) -> Result<bool, AppError> {
        match self {
            Self::Http(s) => s.get_kill().await,
            Self::Off(s) => s.get_kill().await,
        }
    }

    async fn set_kill(&self, active: bool) -> Result<(), AppError> {
        match self {
            Self::Http(s) => s.set_kill(active).await,
            Self::Off(s) => s.set_kill(active).await,
        }
    }
}

/// Where a verification challenge is shown.
#[derive(Clone)]
enum Surface {
    Probe(ProbeSurface<ReqwestFetcher>),
    #[cfg(feature = "browser")]
    Browser(catcher_client::BrowserSurface),
}

impl Surface {
    fn new(browser: bool, fetcher: &ReqwestFetcher, cookie: Option<&str>, timeout: Duration) -> Result<Self> {
        if browser {
            #[cfg(feature = "browser")]
            return Ok(Self::Browser(catcher_client::BrowserSurface::new(
                cookie.map(str::to_string),
            )));
            #[cfg(not(feature = "browser"))]
            bail!("--browser needs a build with the `browser` feature");
        }
        let _ = cookie;
        Ok(Self::Probe(ProbeSurface::new(fetcher.clone(), timeout)))
    }
}

impl ChallengeSurface for Surface {
    async fn open(&self, url: &str) -> Result<(), AppError> {
        match self {
            Self::Probe(s) => s.open(url).await,
            #[cfg(feature = "browser")]
            Self::Browser(s) => s.open(url).await,
        }
    }

    async fn is_present(&self) -> Result<bool, AppError> {
        match self {
            Self::Probe(s) => s.is_present().await,
            #[cfg(feature = "browser")]
            Self::Browser(s) => s.is_present().await,
        }
    }

    async fn close(&self) -> Result<(), AppError> {
        match self {
            Self::Probe(s) => s.close().await,
            #[cfg(feature = "browser")]
            Self::Browser(s) => s.close().await,
        }
    }
}

async fn group_and_store(shared: &Shared) -> Result<(GroupKey, FileStore)> {
    let group = StaticGroup::new(&shared.group).resolve().await?;
    let store = FileStore::open(&shared.store_dir)
        .with_context(|| format!("Cannot open store at {}", shared.store_dir.display()))?;
    Ok((group, store))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    shared: &Shared,
    session_cookie: Option<String>,
    start: bool,
    browser: bool,
    status_every: u64,
) -> Result<()> {
    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let (group, store) = group_and_store(shared).await?;
    let signals = RemoteSignals::from_shared(shared, config.timeouts.signal)?;
    let fetcher =
        ReqwestFetcher::new(session_cookie.as_deref()).context("Failed to create HTTP client")?;
    let surface = Surface::new(browser, &fetcher, session_cookie.as_deref(), config.timeouts.probe)?;
    let log = ActivityLog::default();

    tracing::info!(
        %group,
        base_url = %config.base_url,
        scanners = config.scanner_count,
        remote = shared.signal_url.is_some(),
        "Starting engine"
    );

    let engine = Engine::new(
        config,
        group,
        EngineParts {
            fetcher,
            store,
            signals,
            surface,
            reporter: Arc::new(log.clone()),
        },
    )?;
    let handle = engine.spawn();
    if start {
        handle.start()?;
    }

    let every = Duration::from_secs(status_every.max(1));
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick(), if status_every > 0 => {
                let stats = handle.stats().await?;
                println!("{}", serde_json::to_string(&stats)?);
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for CTRL+C")?;
                tracing::info!("Interrupted, shutting down");
                break;
            }
            () = handle.closed() => break,
        }
    }

    handle.shutdown().ok();
    if tokio::time::timeout(Duration::from_secs(10), handle.closed())
        .await
        .is_err()
    {
        tracing::warn!("Engine did not stop within 10s");
    }

    let history = log.history();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "instance_id": handle.instance_id(),
            "claimed": history.len(),
            "history": history,
        }))?
    );

    Ok(())
}

async fn cmd_status(shared: &Shared) -> Result<()> {
    let (group, store) = group_and_store(shared).await?;
    let read = |key: String| {
        let store = store.clone();
        async move { store.get(&key).await }
    };

    let status = serde_json::json!({
        "group": group.as_str(),
        "run": read(keys::run(&group)).await?,
        "kill": is_set(read(keys::KILL.to_string()).await?.as_deref()),
        "was_running": is_set(read(keys::WAS_RUNNING.to_string()).await?.as_deref()),
        "challenge_resume": is_set(read(keys::CHALLENGE_RESUME.to_string()).await?.as_deref()),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_signal(shared: &Shared, action: SignalAction) -> Result<()> {
    let (group, store) = group_and_store(shared).await?;
    let remote = RemoteSignals::from_shared(shared, Duration::from_secs(8))?;
    let remote_enabled = shared.signal_url.is_some() && !group.is_default();

    match action {
        SignalAction::Get => {
            let local = store.get(&keys::run(&group)).await?;
            let remote_value = if remote_enabled {
                remote.get(&group).await?.map(|s| s.to_string())
            } else {
                None
            };
            let out = serde_json::json!({
                "group": group.as_str(),
                "local": local,
                "remote": remote_value,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        SignalAction::Set { value } => {
            let signal = match value {
                RunStop::Run => Signal::Run,
                RunStop::Stop => Signal::Stop,
            };
            store
                .set(&keys::run(&group), flag(signal == Signal::Run))
                .await?;
            if remote_enabled {
                remote.set(&group, signal).await?;
            } else if shared.signal_url.is_some() {
                tracing::warn!("The default group is never sent to the remote service");
            }
            tracing::info!(%group, %signal, "Signal written");
        }
    }
    Ok(())
}

async fn cmd_kill(shared: &Shared, state: Toggle) -> Result<()> {
    let (group, store) = group_and_store(shared).await?;
    let remote = RemoteSignals::from_shared(shared, Duration::from_secs(8))?;
    if matches!(remote, RemoteSignals::Http(_)) && group.is_default() {
        bail!("Pass --group to reach the remote kill switch; the default group is local only");
    }
    let coordinator = Coordinator::new(store, remote, group, Duration::from_secs(8));
    let active = matches!(state, Toggle::On);
    coordinator.set_kill(active).await?;
    tracing::warn!(active, "Kill switch written");
    Ok(())
}

fn cmd_classify(url: &str, status: u16, body: Option<PathBuf>) -> Result<()> {
    let body = match body {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read body file: {}", path.display()))?,
        None => String::new(),
    };
    let verdict = classify(&HttpReply::new(status, url, body));
    let out = serde_json::json!({
        "verdict": verdict.label(),
        "detail": verdict.to_string(),
        "accepted": verdict.is_accepted(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
