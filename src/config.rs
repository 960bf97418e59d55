use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for both processes, read from `config.yaml` under the storage home.
///
/// Every section and field has a default so an absent or partial file is valid.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionTimings,
    #[serde(default)]
    pub command: CommandChannelConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Delays driving the control-side state machine.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionTimings {
    /// Wait between launching the worker and binding to it. Default: 1500
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Grace period the worker gets to shut down before teardown. Default: 2000
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Liveness probe period while Started. Default: 15
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl SessionTimings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_probe_interval_secs() -> u64 {
    15
}

/// Retry and buffering parameters for telemetry streams.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CommandChannelConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// How often the engine host pushes a status sample.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Number of log lines retained for replay.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

impl Default for CommandChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            step_delay_ms: default_step_delay_ms(),
            status_interval_ms: default_status_interval_ms(),
            log_buffer: default_log_buffer(),
        }
    }
}

impl CommandChannelConfig {
    /// Delay taken before connection attempt `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms + self.step_delay_ms * u64::from(attempt))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_step_delay_ms() -> u64 {
    50
}

fn default_status_interval_ms() -> u64 {
    2000
}

fn default_log_buffer() -> usize {
    500
}

/// Worker process lifecycle parameters.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkerConfig {
    /// Time the worker keeps serving after its session returns to Stopped.
    #[serde(default = "default_exit_linger_ms")]
    pub exit_linger_ms: u64,
    /// How long a control process waits for a spawned worker's port file.
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    /// Ping period used to detect a dead worker binding.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            exit_linger_ms: default_exit_linger_ms(),
            spawn_timeout_ms: default_spawn_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

fn default_exit_linger_ms() -> u64 {
    300
}

fn default_spawn_timeout_ms() -> u64 {
    2000
}

fn default_watchdog_interval_ms() -> u64 {
    1000
}

/// External engine program hosted by the worker.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: String,
    /// Arguments; `{config}` expands to the rendered config file path.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    /// TUN interface the engine brings up. When set it must appear within the
    /// startup grace, and its counters feed status samples.
    #[serde(default)]
    pub interface: Option<String>,
    /// Refuse to start unless the worker runs with root privileges.
    #[serde(default)]
    pub require_root: bool,
    /// Time the engine must survive after spawn to count as started.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            interface: None,
            require_root: false,
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

fn default_engine_command() -> String {
    "sing-box".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string(), "{config}".to_string()]
}

fn default_startup_grace_ms() -> u64 {
    1000
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.command.max_attempts == 0 {
            anyhow::bail!("command.max_attempts must be at least 1");
        }
        if self.command.log_buffer == 0 {
            anyhow::bail!("command.log_buffer must be at least 1");
        }
        if self.engine.command.trim().is_empty() {
            anyhow::bail!("engine.command must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
