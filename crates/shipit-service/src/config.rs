use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shipit_installer::{default_state_dir_with, StateLayout, SwapOptions};

pub const CONFIG_FILE_NAME: &str = "shipit.toml";

/// Settings for the resident installer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Where transaction records, lock files and the default socket live.
    pub state_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub verify_digest: bool,
    pub request_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            socket_path: None,
            verify_digest: true,
            request_timeout_secs: 30,
            max_request_bytes: 64 * 1024,
            log_filter: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse shipit config")?;
        if config.max_request_bytes == 0 {
            anyhow::bail!("max_request_bytes must be greater than zero");
        }
        if config.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        Ok(config)
    }

    /// Reads `explicit`, else `<state_dir>/shipit.toml` when present, else
    /// defaults; then applies `SHIPIT_STATE_DIR` and `SHIPIT_SOCKET`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with_env(explicit, |key| std::env::var_os(key))
    }

    pub fn load_with_env<Lookup>(explicit: Option<&Path>, lookup: Lookup) -> Result<Self>
    where
        Lookup: Fn(&str) -> Option<OsString>,
    {
        let mut config = match explicit {
            Some(path) => Self::read(path)?,
            None => {
                let candidate = default_state_dir_with(&lookup)?.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::read(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(dir) = lookup("SHIPIT_STATE_DIR").filter(|value| !value.is_empty()) {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(socket) = lookup("SHIPIT_SOCKET").filter(|value| !value.is_empty()) {
            config.socket_path = Some(PathBuf::from(socket));
        }
        if config.state_dir.is_none() {
            config.state_dir = Some(default_state_dir_with(&lookup)?);
        }
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn layout(&self) -> Result<StateLayout> {
        let root = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir_with(|key| std::env::var_os(key))?,
        };
        Ok(StateLayout::new(root))
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.layout()?.default_socket_path()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn swap_options(&self) -> SwapOptions {
        SwapOptions {
            verify_digest: self.verify_digest,
        }
    }
}
