//! Package manager configuration

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Package manager configuration (`<config dir>/ppym/config.toml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Registry URL
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Root of the global install tree
    #[serde(default = "default_prefix")]
    pub prefix: PathBuf,

    /// Interpreter that bin proxies run package scripts with
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Python executable used to run pip for native dependencies
    #[serde(default = "default_python")]
    pub python: String,

    /// Lifecycle script timeout in seconds; unset means no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_timeout: Option<u64>,

    /// How long to wait for another process holding the install tree, in seconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,

    /// HTTP timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_registry() -> String {
    "https://ppym.org".to_string()
}

fn default_prefix() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ppym")
}

fn default_interpreter() -> String {
    "nodepy".to_string()
}

fn default_python() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            prefix: default_prefix(),
            interpreter: default_interpreter(),
            python: default_python(),
            script_timeout: None,
            lock_timeout: default_lock_timeout(),
            http_timeout: default_http_timeout(),
            username: None,
            password: None,
        }
    }
}

impl PackageConfig {
    /// Load configuration from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_toml(&std::fs::read_to_string(&path)?)?,
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        if !config.registry.starts_with("https://") {
            warn!("registry is not an HTTPS url ({})", config.registry);
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(config_path) = Self::config_path() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let content = toml::to_string_pretty(self)?;
            std::fs::write(&config_path, content)?;
        }

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ppym").join("config.toml"))
    }

    /// Override fields from `PPYM_*` variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(registry) = lookup("PPYM_REGISTRY") {
            self.registry = registry;
        }
        if let Some(prefix) = lookup("PPYM_PREFIX") {
            self.prefix = PathBuf::from(prefix);
        }
        if let Some(username) = lookup("PPYM_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("PPYM_PASSWORD") {
            self.password = Some(password);
        }
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        self.script_timeout.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}
