//! Showrunner Daemon - Opus Execution Server
//!
//! Entry point for the Showrunner daemon. It loads the opus, starts the show
//! engine and accepts component and operator connections over TCP.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (resources/dev_opus.yaml, 127.0.0.1:8001)
//! showrunner-daemon
//!
//! # Another opus and address
//! showrunner-daemon --opus shows/tempest.yaml --listen 0.0.0.0:9000
//!
//! # Validate an opus and exit
//! showrunner-daemon --opus shows/tempest.yaml --check
//!
//! # Verbose logging
//! RUST_LOG=debug showrunner-daemon
//! ```
//!
//! # Exit codes
//!
//! - `0`: stopped by `SIGTERM` / `SIGINT`, or `--check` passed
//! - `1`: configuration, bind or other startup failure
//! - `2`: the opus failed to load and `EXIT_ON_VALIDATION_FAILURE` is set

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use showrunner_core::{
    AckFailurePolicy, CoreConfig, Opus, OpusError, ValidationFailurePolicy,
};

use server::DaemonServer;

/// Exit status when the opus cannot be loaded under the abort policy
const EXIT_INVALID_OPUS: u8 = 2;

/// Showrunner Daemon - sequences opus cues across connected components
#[derive(Parser, Debug)]
#[command(name = "showrunner-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SHOWRUNNER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Opus to load (overrides `OPUS`)
    #[arg(short = 'o', long, value_name = "FILE")]
    opus: Option<PathBuf>,

    /// Listen address (overrides `SHOWRUNNER_LISTEN`)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Reconcile component asset caches
    #[arg(long)]
    sync_assets: bool,

    /// Keep running with no opus when it fails to load
    #[arg(long)]
    keep_running_on_invalid_opus: bool,

    /// What to do when a waited-on cue is not acknowledged (block, continue)
    #[arg(long, value_name = "POLICY")]
    ack_policy: Option<AckFailurePolicy>,

    /// Validate the opus and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SHOWRUNNER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line flags win over file and environment
    fn apply(&self, config: &mut CoreConfig) {
        if let Some(ref opus) = self.opus {
            config.opus.clone_from(opus);
        }
        if let Some(listen) = self.listen {
            config.transport.listen = listen;
        }
        if self.sync_assets {
            config.sync_assets = true;
        }
        if self.keep_running_on_invalid_opus {
            config.exit_on_validation_failure = false;
        }
        if let Some(policy) = self.ack_policy {
            config.ack_policy = policy;
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "showrunner_daemon={level},showrunner_core={level},showrunner={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Load the configured opus, applying the validation failure policy
fn load_opus(config: &CoreConfig) -> Result<Option<Arc<Opus>>> {
    let policy = config.policy();
    info!(path = %config.opus.display(), %policy, "Loading opus");

    match showrunner_core::opus::load(&config.opus) {
        Ok(opus) => {
            for warning in opus.warnings() {
                warn!(%warning, "Opus warning");
            }
            info!(
                scenes = opus.scenes().len(),
                cues = opus.cue_count(),
                components = opus.component_types().len(),
                "Opus loaded"
            );
            Ok(Some(Arc::new(opus)))
        }
        Err(e) => {
            if let OpusError::Invalid { ref errors, .. } = e {
                for issue in errors.issues() {
                    error!(%issue, "Opus validation issue");
                }
            }
            match policy {
                ValidationFailurePolicy::Abort => Err(e.into()),
                ValidationFailurePolicy::Degraded => {
                    warn!(error = %e, "Continuing without an opus; cue commands will be refused");
                    Ok(None)
                }
            }
        }
    }
}

/// Notify `shutdown` on SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: Arc<Notify>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.notify_one();
    });
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut config = CoreConfig::load(args.config.as_deref()).context("Invalid configuration")?;
    args.apply(&mut config);
    if args.check {
        config.exit_on_validation_failure = true;
    }
    config.validate().context("Invalid configuration")?;

    let opus = load_opus(&config)?;
    if args.check {
        info!("Opus is valid");
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler(Arc::clone(&shutdown))?;

    let server = DaemonServer::bind(&config, opus).await?;
    server.run(shutdown).await
}

/// Map a startup failure to the process exit status
fn exit_status(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<OpusError>().is_some() {
        EXIT_INVALID_OPUS
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging first
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    info!("Showrunner daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    match run(args).await {
        Ok(()) => {
            info!("Showrunner daemon stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Daemon stopped with error");
            ExitCode::from(exit_status(&e))
        }
    }
}
