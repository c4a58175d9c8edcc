use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::limiter::{DEFAULT_WINDOW, INSPECT_MAX_REQUESTS, STRIP_MAX_REQUESTS};

/// Top-level configuration for meta-strip.
///
/// Controls where the remote metadata service lives, how hard each
/// operation class is throttled, and where the session and downloads go.
///
/// # Loading
///
/// ```rust,no_run
/// use meta_strip::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.service.base_url = "https://strip.example.com/api/images".into();
/// config.limits.strip.max_requests = 3;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote metadata service endpoint.
    pub service: ServiceConfig,
    /// Client-side admission limits per operation class.
    pub limits: LimitsConfig,
    /// Session file and download locations.
    pub storage: StorageConfig,
    /// Credentials handed to the cloud file pickers.
    #[serde(default)]
    pub cloud: CloudConfig,
}

/// Remote service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL; `/metadata`, `/strip` and `/health` are appended.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

/// Sliding-window parameters for both operation classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub inspect: WindowConfig,
    pub strip: WindowConfig,
}

/// One sliding window: at most `max_requests` within `window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Where durable state and downloaded files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Session file path. Empty means `session.json` next to the binary.
    pub session_file: String,
    /// Directory that receives stripped copies.
    pub download_dir: String,
}

/// Cloud picker credentials. Obtaining them is up to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    /// OAuth access token with `drive.readonly` scope.
    pub google_access_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                base_url: "http://localhost:8080/api/images".to_string(),
                timeout_secs: 30,
            },
            limits: LimitsConfig {
                inspect: WindowConfig {
                    max_requests: INSPECT_MAX_REQUESTS,
                    window_secs: DEFAULT_WINDOW.as_secs(),
                },
                strip: WindowConfig {
                    max_requests: STRIP_MAX_REQUESTS,
                    window_secs: DEFAULT_WINDOW.as_secs(),
                },
            },
            storage: StorageConfig {
                session_file: String::new(),
                download_dir: ".".to_string(),
            },
            cloud: CloudConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        Ok(exe_dir()?.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would disable or jam a rate window.
    pub fn validate(&self) -> Result<()> {
        for (name, window) in [("inspect", &self.limits.inspect), ("strip", &self.limits.strip)] {
            if window.max_requests == 0 {
                anyhow::bail!("limits.{name}.max_requests must be at least 1");
            }
            if window.window_secs == 0 {
                anyhow::bail!("limits.{name}.window_secs must be at least 1");
            }
        }
        Ok(())
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// The session file to use, falling back to `session.json` next to the binary.
    pub fn session_path(&self) -> Result<PathBuf> {
        if self.storage.session_file.is_empty() {
            Ok(exe_dir()?.join("session.json"))
        } else {
            Ok(PathBuf::from(&self.storage.session_file))
        }
    }
}

fn exe_dir() -> Result<PathBuf> {
    let exe_path = std::env::current_exe().context("Failed to get executable path")?;
    let exe_dir = exe_path
        .parent()
        .context("Failed to get executable directory")?;
    Ok(exe_dir.to_path_buf())
}
