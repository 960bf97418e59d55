//! Home-based storage paths for the worker and the control surface.
//!
//! Everything lives under one directory, `~/.tunnel-session/` by default:
//! - `config.yaml` - Tunables (see [`crate::config`])
//! - `settings.json` - Persisted key-value settings
//! - `worker.port` / `worker.pid` / `worker.lock` - Worker discovery and spawn coordination
//! - `run/` - Files handed to the engine (rendered config)
//! - `logs/` - Worker log

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The name of the storage directory under the user's home.
const SESSION_HOME_DIR: &str = ".tunnel-session";

/// Environment variable overriding the storage home.
pub const HOME_ENV: &str = "TUNNEL_SESSION_HOME";

/// Resolved storage layout. Cloned into every component that touches disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    home: PathBuf,
}

impl SessionPaths {
    /// Uses `home` as the storage root, creating it if needed.
    pub fn new(home: impl Into<PathBuf>) -> Result<Self> {
        let home = home.into();
        fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create storage directory: {}", home.display()))?;
        Ok(Self { home })
    }

    /// Resolves the storage root from `TUNNEL_SESSION_HOME`, falling back to
    /// `~/.tunnel-session/`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(home));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Self::new(home.join(SESSION_HOME_DIR))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.yaml")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home.join("settings.json")
    }

    /// Port file written by a running worker: `worker.port`
    pub fn worker_port_path(&self) -> PathBuf {
        self.home.join("worker.port")
    }

    pub fn worker_pid_path(&self) -> PathBuf {
        self.home.join("worker.pid")
    }

    /// Lock held while a control process spawns a worker.
    pub fn worker_lock_path(&self) -> PathBuf {
        self.home.join("worker.lock")
    }

    /// Directory for files handed to the engine. Created on demand.
    pub fn run_dir(&self) -> Result<PathBuf> {
        let dir = self.home.join("run");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Worker log file: `logs/worker.log`
    pub fn worker_log_path(&self) -> Result<PathBuf> {
        let logs = self.home.join("logs");
        fs::create_dir_all(&logs)
            .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
        Ok(logs.join("worker.log"))
    }
}

#[cfg(test)]
#[path = "tests/paths_tests.rs"]
mod tests;
