//! The worker's discovery file, rewritten whenever the command port changes.

use crate::rpc::PortFileContent;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;

pub struct PortFile {
    path: PathBuf,
    content: Mutex<PortFileContent>,
}

impl PortFile {
    /// Writes the initial content to `path`.
    pub fn create(path: PathBuf, content: PortFileContent) -> Result<Self> {
        let file = Self {
            path,
            content: Mutex::new(content),
        };
        file.write(&file.content.lock())?;
        Ok(file)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn content(&self) -> PortFileContent {
        self.content.lock().clone()
    }

    /// Publish the command server port, 0 when none is running.
    pub fn set_command_port(&self, port: u16) -> Result<()> {
        let mut content = self.content.lock();
        content.command_port = port;
        self.write(&content)
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    fn write(&self, content: &PortFileContent) -> Result<()> {
        let tmp = self.path.with_extension("port.tmp");
        std::fs::write(&tmp, serde_json::to_string(content)?)
            .with_context(|| format!("Failed to write port file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace port file: {}", self.path.display()))?;
        Ok(())
    }
}
