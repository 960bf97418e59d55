mod broadcast;
mod command;
mod config;
mod context;
mod control;
mod error;
mod paths;
mod registry;
mod rpc;
mod settings;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use context::AppContext;
use control::ControlSurface;
use rpc::SessionStatus;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

pub const BUILD_SHA: &str = env!("TUNNEL_SESSION_GIT_SHA");

/// Environment variable holding the log filter.
const LOG_ENV: &str = "TUNNEL_LOG";

/// How long `autostart` waits for the session to leave Starting.
const AUTOSTART_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "tunnel")]
#[command(about = "Network tunnel session manager")]
#[command(version)]
struct Cli {
    /// Storage home (defaults to $TUNNEL_SESSION_HOME or ~/.tunnel-session)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Internal: run the worker hosting the engine (used by connect-or-spawn)
    #[command(hide = true)]
    Worker,
    /// Serve the control API as JSON lines over stdin/stdout
    Control,
    /// Start the session if auto-start is enabled
    Autostart,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_worker_logging(ctx: &AppContext) -> Result<()> {
    let log_path = ctx.paths.worker_log_path()?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open worker log: {}", log_path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = AppContext::load(cli.home)?;

    match cli.command {
        Mode::Worker => {
            init_worker_logging(&ctx)?;
            worker::run_worker(ctx.paths, ctx.config).await
        }
        Mode::Control => {
            init_stderr_logging();
            let surface = ControlSurface::launch(&ctx).await?;
            let stdin = BufReader::new(tokio::io::stdin());
            control::bridge::run_bridge(surface, stdin, tokio::io::stdout()).await
        }
        Mode::Autostart => {
            init_stderr_logging();
            run_autostart(&ctx).await
        }
    }
}

async fn run_autostart(ctx: &AppContext) -> Result<()> {
    if !ctx.settings.auto_start()? {
        tracing::info!("Auto-start disabled");
        return Ok(());
    }

    let surface = ControlSurface::launch(ctx).await?;
    let mut status = surface.watch_status();
    match surface.start_vpn().await {
        Ok(_) => {
            let settled = tokio::time::timeout(
                AUTOSTART_WAIT,
                status.wait_for(|s| *s != SessionStatus::Starting),
            )
            .await;
            match settled {
                Ok(Ok(s)) => tracing::info!("Auto-start finished with status {}", *s),
                Ok(Err(_)) => tracing::warn!("Session status channel closed"),
                Err(_) => tracing::warn!("Session still starting after {:?}", AUTOSTART_WAIT),
            }
        }
        Err(e) => tracing::warn!("Auto-start failed: {}", e),
    }
    surface.shutdown().await;
    Ok(())
}
