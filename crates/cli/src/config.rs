//! CLI configuration file (`~/.config/clusterops/config.json`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// clusterops server URL
    pub server_url: Option<String>,
    /// Namespace for `port-forward open` when `-n` is not given
    pub default_namespace: Option<String>,
}

impl Config {
    /// Load the user's config file, or defaults when there is none
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("clusterops").join("config.json"))
    }

    /// Flag or env value first, then the file, then the built-in default
    pub fn server_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.server_url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }

    pub fn namespace(&self, flag: Option<String>) -> Option<String> {
        flag.or_else(|| self.default_namespace.clone())
    }
}
