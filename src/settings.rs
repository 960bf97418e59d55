//! Persisted key-value settings consumed by the control surface.
//!
//! Only the read/write contract matters to the session machinery; the file
//! store is the production backend and the memory store backs tests.

use crate::rpc::PerAppProxyMode;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CONFIG_KEY: &str = "config_json";
pub const AUTO_START_KEY: &str = "auto_start";
pub const PER_APP_MODE_KEY: &str = "per_app_proxy_mode";
pub const PER_APP_LIST_KEY: &str = "per_app_proxy_list";
pub const NOTIFICATION_TITLE_KEY: &str = "notification_title";
pub const NOTIFICATION_DESCRIPTION_KEY: &str = "notification_description";

pub const DEFAULT_CONFIG: &str = "{}";
pub const DEFAULT_NOTIFICATION_TITLE: &str = "VPN Service";
pub const DEFAULT_NOTIFICATION_DESCRIPTION: &str = "Connected";

/// String key-value storage.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// JSON object persisted to a single file, rewritten atomically on each set.
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings: {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(values)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write settings: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace settings: {}", self.path.display()))?;
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&values) {
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

#[cfg(test)]
impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Typed accessors over a [`SettingsStore`].
#[derive(Clone)]
pub struct Settings {
    store: std::sync::Arc<dyn SettingsStore>,
}

impl Settings {
    pub fn new(store: std::sync::Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .store
            .get(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn config(&self) -> Result<String> {
        self.get_or(CONFIG_KEY, DEFAULT_CONFIG)
    }

    pub fn set_config(&self, blob: &str) -> Result<()> {
        self.store.set(CONFIG_KEY, blob)
    }

    pub fn auto_start(&self) -> Result<bool> {
        Ok(self.store.get(AUTO_START_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_auto_start(&self, enabled: bool) -> Result<()> {
        self.store
            .set(AUTO_START_KEY, if enabled { "true" } else { "false" })
    }

    /// Unknown stored values read as `Off`.
    pub fn per_app_mode(&self) -> Result<PerAppProxyMode> {
        let raw = self.get_or(PER_APP_MODE_KEY, PerAppProxyMode::Off.as_str())?;
        Ok(PerAppProxyMode::parse(&raw).unwrap_or_default())
    }

    pub fn set_per_app_mode(&self, mode: PerAppProxyMode) -> Result<()> {
        self.store.set(PER_APP_MODE_KEY, mode.as_str())
    }

    pub fn per_app_list(&self) -> Result<Vec<String>> {
        match self.store.get(PER_APP_LIST_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(list) => Ok(list),
                Err(e) => {
                    tracing::warn!("Discarding unreadable per-app list: {}", e);
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    pub fn set_per_app_list(&self, list: &[String]) -> Result<()> {
        self.store
            .set(PER_APP_LIST_KEY, &serde_json::to_string(list)?)
    }

    pub fn notification_title(&self) -> Result<String> {
        self.get_or(NOTIFICATION_TITLE_KEY, DEFAULT_NOTIFICATION_TITLE)
    }

    pub fn set_notification_title(&self, title: &str) -> Result<()> {
        self.store.set(NOTIFICATION_TITLE_KEY, title)
    }

    pub fn notification_description(&self) -> Result<String> {
        self.get_or(NOTIFICATION_DESCRIPTION_KEY, DEFAULT_NOTIFICATION_DESCRIPTION)
    }

    pub fn set_notification_description(&self, description: &str) -> Result<()> {
        self.store.set(NOTIFICATION_DESCRIPTION_KEY, description)
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
