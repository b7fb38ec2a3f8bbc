//! Configuration
//!
//! Manages waiter and harness settings:
//! - default wait budget and poll quantum
//! - device setup and teardown limits

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WaiterError};

/// Bounded wait settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Total wait budget when a caller does not pass one, in milliseconds
    pub default_timeout_ms: u64,
    /// Upper bound for a single poll, in milliseconds
    pub poll_quantum_ms: u64,
    /// Log every expired sub-timeout at info level
    pub log_progress: bool,
}

impl WaitConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            poll_quantum_ms: 1_000,
            log_progress: true,
        }
    }
}

/// Multi-device harness settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Limit for one device setup phase, in milliseconds
    pub setup_timeout_ms: u64,
    /// Devices set up at the same time
    pub max_parallel_setup: usize,
    /// Limit for closing streams and tearing down devices, in milliseconds
    pub teardown_timeout_ms: u64,
}

impl HarnessConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 30_000,
            max_parallel_setup: num_cpus::get(),
            teardown_timeout_ms: 5_000,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    /// Configuration version for migrations
    pub version: u32,
    /// Wait settings
    pub wait: WaitConfig,
    /// Harness settings
    pub harness: HarnessConfig,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            version: 1,
            wait: WaitConfig::default(),
            harness: HarnessConfig::default(),
        }
    }
}

impl WaiterConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "droidwaiter", "droid-waiter")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: WaiterConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the waiter cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wait.default_timeout_ms == 0 {
            return Err(WaiterError::Config("wait.default_timeout_ms must be positive".into()));
        }
        if self.wait.poll_quantum_ms == 0 {
            return Err(WaiterError::Config("wait.poll_quantum_ms must be positive".into()));
        }
        if self.harness.setup_timeout_ms == 0 {
            return Err(WaiterError::Config("harness.setup_timeout_ms must be positive".into()));
        }
        if self.harness.teardown_timeout_ms == 0 {
            return Err(WaiterError::Config("harness.teardown_timeout_ms must be positive".into()));
        }
        if self.harness.max_parallel_setup == 0 {
            return Err(WaiterError::Config("harness.max_parallel_setup must be positive".into()));
        }
        Ok(())
    }

    /// Load configuration from the default location, writing defaults if missing
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| WaiterError::Config("Cannot determine config path".into()))?;

        if config_file.exists() {
            Self::load_from(&config_file).await
        } else {
            info!("Config file not found, using defaults");
            let config = WaiterConfig::default();
            config.save_to(&config_file).await?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub async fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    /// Save configuration to the default location
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| WaiterError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to an explicit file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(path, self.to_toml_string()?).await?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }
}
