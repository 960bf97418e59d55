//! Installed-application catalog backed by XDG desktop entries.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Desktop id of this application, never listed.
pub const OWN_DESKTOP_ID: &str = "tunnel-session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub package_name: String,
    pub app_name: String,
    pub is_system_app: bool,
}

pub trait AppCatalog: Send + Sync {
    /// Installed applications sorted by name, excluding this application.
    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;
}

/// One directory of `.desktop` files.
#[derive(Debug, Clone)]
pub struct CatalogRoot {
    pub dir: PathBuf,
    pub system: bool,
}

/// Reads `applications/` under the XDG data directories. Earlier roots
/// shadow later ones with the same desktop id.
pub struct DesktopEntryCatalog {
    roots: Vec<CatalogRoot>,
    own_id: String,
}

impl DesktopEntryCatalog {
    pub fn new(roots: Vec<CatalogRoot>, own_id: impl Into<String>) -> Self {
        Self {
            roots,
            own_id: own_id.into(),
        }
    }

    /// `$XDG_DATA_HOME/applications` first, then `$XDG_DATA_DIRS`.
    pub fn from_env() -> Self {
        let mut roots = Vec::new();
        if let Some(data) = dirs::data_dir() {
            roots.push(CatalogRoot {
                dir: data.join("applications"),
                system: false,
            });
        }
        let system_dirs = std::env::var("XDG_DATA_DIRS")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
        for dir in system_dirs.split(':').filter(|d| !d.is_empty()) {
            roots.push(CatalogRoot {
                dir: Path::new(dir).join("applications"),
                system: true,
            });
        }
        Self::new(roots, OWN_DESKTOP_ID)
    }
}

impl AppCatalog for DesktopEntryCatalog {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let mut seen = HashSet::new();
        let mut apps = Vec::new();

        for root in &self.roots {
            if !root.dir.is_dir() {
                continue;
            }
            let mut files = Vec::new();
            collect_desktop_files(&root.dir, &mut files)
                .with_context(|| format!("Failed to scan {}", root.dir.display()))?;

            for path in files {
                let Some(id) = desktop_id(&root.dir, &path) else {
                    continue;
                };
                if !seen.insert(id.clone()) || id == self.own_id {
                    continue;
                }
                let Ok(content) = fs::read_to_string(&path) else {
                    tracing::debug!("Unreadable desktop entry: {}", path.display());
                    continue;
                };
                if let Some(name) = parse_desktop_entry(&content) {
                    apps.push(InstalledApp {
                        package_name: id,
                        app_name: name,
                        is_system_app: root.system,
                    });
                }
            }
        }

        apps.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        Ok(apps)
    }
}

fn collect_desktop_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_desktop_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "desktop") {
            out.push(path);
        }
    }
    Ok(())
}

/// Desktop file id: path below the root with `/` replaced by `-`, without
/// the `.desktop` suffix.
fn desktop_id(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("-"))
}

/// Name of a visible application entry, `None` for hidden or non-application
/// entries.
pub fn parse_desktop_entry(content: &str) -> Option<String> {
    let mut in_main = false;
    let mut name = None;
    let mut kind = None;
    let mut hidden = false;

    for line in content.lines().map(str::trim) {
        if line.starts_with('[') {
            in_main = line == "[Desktop Entry]";
            continue;
        }
        if !in_main || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match (key.trim(), value.trim()) {
            ("Name", v) => name = Some(v.to_string()),
            ("Type", v) => kind = Some(v.to_string()),
            ("NoDisplay" | "Hidden", "true") => hidden = true,
            _ => {}
        }
    }

    if hidden || kind.as_deref().is_some_and(|k| k != "Application") {
        return None;
    }
    name.filter(|n| !n.is_empty())
}

#[cfg(test)]
#[path = "tests/apps_tests.rs"]
mod tests;
