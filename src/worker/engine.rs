//! The network engine hosted by the worker.
//!
//! The session only sees the [`EngineFactory`]/[`Engine`] pair. The production
//! engine is an external program ([`ProcessEngine`]) whose output feeds the
//! [`CommandHub`].

use crate::config::EngineConfig;
use crate::rpc::{PerAppProxyMode, StartRequest};
use crate::worker::hub::CommandHub;
use crate::worker::netdev::{self, RateTracker};
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Environment variable carrying the per-app routing mode to the engine.
pub const PER_APP_MODE_ENV: &str = "TUNNEL_PER_APP_MODE";
/// Environment variable carrying the comma-separated per-app package list.
pub const PER_APP_LIST_ENV: &str = "TUNNEL_PER_APP_LIST";

/// Time the engine gets to exit after SIGTERM before it is killed.
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(3);

const TRAFFIC_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Why an engine could not be created or started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// The engine came up without a usable tunnel address.
    NoVpnAddress,
    Failed(String),
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        request: &StartRequest,
        hub: Arc<CommandHub>,
    ) -> Result<Box<dyn Engine>, EngineFailure>;
}

#[async_trait]
pub trait Engine: Send {
    async fn start(&mut self) -> Result<(), EngineFailure>;

    /// Resolves with a reason when the engine stops on its own. Cancel-safe;
    /// pending forever when the engine is not running.
    async fn wait(&mut self) -> String;

    async fn close(&mut self) -> anyhow::Result<()>;
}

pub struct ProcessEngineFactory {
    config: EngineConfig,
    run_dir: PathBuf,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig, run_dir: PathBuf) -> Self {
        Self { config, run_dir }
    }
}

#[async_trait]
impl EngineFactory for ProcessEngineFactory {
    async fn create(
        &self,
        request: &StartRequest,
        hub: Arc<CommandHub>,
    ) -> Result<Box<dyn Engine>, EngineFailure> {
        let program = which::which(&self.config.command).map_err(|e| {
            EngineFailure::Failed(format!("engine binary {}: {}", self.config.command, e))
        })?;

        let config_path = self.run_dir.join("engine-config.json");
        std::fs::write(&config_path, &request.config).map_err(|e| {
            EngineFailure::Failed(format!("write {}: {}", config_path.display(), e))
        })?;
        let config_arg = config_path.to_string_lossy();
        let args = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace("{config}", &config_arg))
            .collect();

        let mut env = Vec::new();
        if request.per_app_mode != PerAppProxyMode::Off {
            env.push((PER_APP_MODE_ENV, request.per_app_mode.as_str().to_string()));
            env.push((PER_APP_LIST_ENV, request.per_app_list.join(",")));
        }

        Ok(Box::new(ProcessEngine {
            program,
            args,
            env,
            interface: self.config.interface.clone(),
            startup_grace: Duration::from_millis(self.config.startup_grace_ms),
            hub,
            child: None,
            tasks: Vec::new(),
        }))
    }
}

/// External engine process.
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(&'static str, String)>,
    interface: Option<String>,
    startup_grace: Duration,
    hub: Arc<CommandHub>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn start(&mut self) -> Result<(), EngineFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineFailure::Failed(format!("spawn {}: {}", self.program.display(), e))
            })?;

        tracing::info!(
            "Engine {} started with pid {:?}",
            self.program.display(),
            child.id()
        );
        if let Some(stdout) = child.stdout.take() {
            self.tasks.push(tokio::spawn(pipe_output(stdout, self.hub.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            self.tasks.push(tokio::spawn(pipe_output(stderr, self.hub.clone())));
        }
        let child = self.child.insert(child);

        tokio::time::sleep(self.startup_grace).await;
        let exited = child
            .try_wait()
            .map_err(|e| EngineFailure::Failed(format!("engine status: {}", e)))?;
        if let Some(status) = exited {
            return Err(EngineFailure::Failed(format!(
                "engine exited during startup ({})",
                status
            )));
        }

        if let Some(interface) = &self.interface {
            if netdev::read_counters(interface).is_none() {
                tracing::warn!("Interface {} did not come up", interface);
                return Err(EngineFailure::NoVpnAddress);
            }
            self.tasks.push(tokio::spawn(sample_traffic(
                interface.clone(),
                self.hub.clone(),
            )));
        }
        Ok(())
    }

    async fn wait(&mut self) -> String {
        match self.child.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => format!("engine exited ({})", status),
                Err(e) => format!("engine wait failed: {}", e),
            },
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }

        match tokio::time::timeout(ENGINE_STOP_TIMEOUT, child.wait()).await {
            Ok(result) => {
                let status = result.context("Failed to wait for engine exit")?;
                tracing::info!("Engine stopped ({})", status);
            }
            Err(_) => {
                tracing::warn!("Engine ignored SIGTERM, killing");
                child.kill().await.context("Failed to kill engine")?;
            }
        }
        Ok(())
    }
}

async fn pipe_output<R: AsyncRead + Unpin>(reader: R, hub: Arc<CommandHub>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        hub.ingest_engine_line(line);
    }
}

async fn sample_traffic(interface: String, hub: Arc<CommandHub>) {
    let mut tracker = RateTracker::default();
    let mut ticker = tokio::time::interval(TRAFFIC_SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        if let Some(counters) = netdev::read_counters(&interface) {
            hub.record_status(tracker.sample(counters, Instant::now()));
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
