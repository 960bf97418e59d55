//! Explicitly constructed application context shared by every component.

use crate::config::SessionConfig;
use crate::paths::SessionPaths;
use crate::settings::{FileSettingsStore, Settings};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub paths: SessionPaths,
    pub config: SessionConfig,
    pub settings: Settings,
}

impl AppContext {
    /// Resolves the storage home (`home` wins over `TUNNEL_SESSION_HOME`),
    /// loads `config.yaml` and opens the settings file.
    pub fn load(home: Option<PathBuf>) -> Result<Self> {
        let paths = match home {
            Some(home) => SessionPaths::new(home)?,
            None => SessionPaths::from_env()?,
        };
        Self::from_paths(paths)
    }

    pub fn from_paths(paths: SessionPaths) -> Result<Self> {
        let config = SessionConfig::load_or_default(&paths.config_path())?;
        let store = FileSettingsStore::open(paths.settings_path())?;
        Ok(Self {
            paths,
            config,
            settings: Settings::new(Arc::new(store)),
        })
    }
}
