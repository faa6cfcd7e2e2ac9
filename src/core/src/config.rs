use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Environment variable overriding the store root.
pub const ROOT_ENV_VAR: &str = "A3S_STORE_ROOT";

/// Name of the optional config file inside the store root.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store root directory (layers, index files, staging area)
    pub root: PathBuf,

    /// Maximum time to wait on another caller's in-flight layer creation
    pub inflight_wait_timeout_secs: u64,

    /// Deadline for a whole image pull
    pub pull_timeout_secs: u64,

    /// Number of blobs fetched concurrently during a pull
    pub max_concurrent_downloads: usize,

    /// Drop index entries whose storage directory is missing on open
    pub verify_on_load: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            inflight_wait_timeout_secs: 600,
            pull_timeout_secs: 1800,
            max_concurrent_downloads: 3,
            verify_on_load: true,
        }
    }
}

impl StoreConfig {
    /// Create a config rooted at `root` with default tunables.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load a config from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: StoreConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration.
    ///
    /// Precedence: explicit `path`, then `<root>/config.yaml` if it exists,
    /// then defaults. `A3S_STORE_ROOT` overrides the root in every case.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let env_root = std::env::var_os(ROOT_ENV_VAR).map(PathBuf::from);

        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => {
                let root = env_root.clone().unwrap_or_else(default_root);
                let candidate = root.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::load(&candidate)?
                } else {
                    Self::with_root(root)
                }
            }
        };

        if let Some(root) = env_root {
            tracing::debug!(root = %root.display(), "Store root overridden by environment");
            config.root = root;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make store operations unusable.
    pub fn validate(&self) -> Result<()> {
        if self.inflight_wait_timeout_secs == 0 {
            return Err(StoreError::Config(
                "inflight_wait_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.pull_timeout_secs == 0 {
            return Err(StoreError::Config(
                "pull_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(StoreError::Config(
                "max_concurrent_downloads must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn inflight_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.inflight_wait_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

/// Default store root (`~/.a3s/store`).
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("store")
}
