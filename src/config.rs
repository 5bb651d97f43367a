//! Configuration Module
//!
//! Agent settings, read from a JSON file with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;

pub const DEFAULT_API_URL: &str = "http://localhost:9600/api/desktop";

const ENV_API_URL: &str = "OFFICE_PRESENCE_API_URL";
const ENV_TARGET_SSID: &str = "OFFICE_PRESENCE_TARGET_SSID";
const ENV_DATA_DIR: &str = "OFFICE_PRESENCE_DATA_DIR";

/// Renewal must wake at least once a minute.
const MAX_RENEWAL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_api_url")]
    pub api_base_url: String,
    /// Wireless network treated as office presence
    #[serde(default)]
    pub target_ssid: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Consecutive agreeing samples needed to change connectedness (1 = no debounce)
    #[serde(default = "default_debounce")]
    pub debounce_samples: u32,
    #[serde(default = "default_true")]
    pub logout_on_exit: bool,
    #[serde(default = "default_token_lifetime")]
    pub default_token_lifetime_secs: i64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("OfficePresence")
}

fn default_probe_interval() -> u64 {
    5
}

fn default_sync_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_renewal_interval() -> u64 {
    60
}

fn default_refresh_margin() -> i64 {
    300
}

fn default_request_timeout() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    2
}

fn default_debounce() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_token_lifetime() -> i64 {
    3600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_url(),
            target_ssid: String::new(),
            data_dir: default_data_dir(),
            probe_interval_secs: default_probe_interval(),
            sync_interval_secs: default_sync_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            renewal_interval_secs: default_renewal_interval(),
            refresh_margin_secs: default_refresh_margin(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            debounce_samples: default_debounce(),
            logout_on_exit: true,
            default_token_lifetime_secs: default_token_lifetime(),
        }
    }
}

impl AgentConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("OfficePresence")
            .join("config.json")
    }

    /// Load from `path` (defaults when the file is missing), apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            info!("Loaded configuration from {:?}", path);
            Self::from_json(&raw)?
        } else {
            debug!("No configuration file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply environment-style overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(ssid) = lookup(ENV_TARGET_SSID).filter(|v| !v.trim().is_empty()) {
            self.target_ssid = ssid;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&mut self) -> Result<(), Error> {
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        self.target_ssid = self.target_ssid.trim().to_string();

        if self.api_base_url.is_empty() {
            return Err(Error::Config("api_base_url must not be empty".into()));
        }
        if self.target_ssid.is_empty() {
            return Err(Error::Config(format!(
                "target_ssid must be set (config file or {ENV_TARGET_SSID})"
            )));
        }
        if self.probe_interval_secs == 0
            || self.sync_interval_secs == 0
            || self.heartbeat_interval_secs == 0
            || self.renewal_interval_secs == 0
        {
            return Err(Error::Config("intervals must be greater than zero".into()));
        }

        self.renewal_interval_secs = self.renewal_interval_secs.min(MAX_RENEWAL_INTERVAL_SECS);
        self.debounce_samples = self.debounce_samples.max(1);
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("presence.db")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
