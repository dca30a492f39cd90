//! Builder settings.
//!
//! ```toml
//! workspace = "/var/tmp/debforge"
//! hoist_preflight = true
//! report = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_WORKSPACE: &str = "/var/tmp/debforge";
pub const WORKSPACE_ENV: &str = "DEBFORGE_WORKSPACE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuilderConfig {
    /// Base directory; each build gets `<workspace>/<manifest name>`.
    pub workspace: PathBuf,
    /// Run every stage's preflight before the first stage runs.
    pub hoist_preflight: bool,
    /// Write `build-report.json` into the build directory.
    pub report: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(DEFAULT_WORKSPACE),
            hoist_preflight: true,
            report: true,
        }
    }
}

impl BuilderConfig {
    /// Per-user settings file: `<config dir>/debforge/config.toml`.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("debforge").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing settings '{}'", path.display()))
    }

    /// Load settings: an explicit file if given, else the per-user file if it
    /// exists, else defaults. `DEBFORGE_WORKSPACE` overrides the workspace.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::user_config_path().filter(|p| p.is_file()) {
                Some(path) => {
                    tracing::debug!("Using settings from {}", path.display());
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_env(std::env::var_os(WORKSPACE_ENV).map(PathBuf::from));
        Ok(config)
    }

    fn apply_env(&mut self, workspace: Option<PathBuf>) {
        if let Some(ws) = workspace.filter(|p| !p.as_os_str().is_empty()) {
            self.workspace = ws;
        }
    }
}
