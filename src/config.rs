use crate::names::NM_SERVICE;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PID_FILE: &str = "/var/run/NetworkManager.pid";
const DEFAULT_LOG_FILE: &str = "/var/log/netmand.log";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Written while running detached
    pub pid_file: PathBuf,
    /// Log destination once detached from the terminal
    pub log_file: PathBuf,
    /// Filter used when RUST_LOG is unset (e.g. "info", "netmand=debug")
    pub log_level: String,
    /// Allow clients to create synthetic devices over the bus
    pub enable_test_devices: bool,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Well-known name claimed on the system bus
    pub service_name: String,
    pub reconnect_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_level: "info".to_string(),
            enable_test_devices: false,
            bus: BusConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: NM_SERVICE.to_string(),
            reconnect_interval_secs: 3,
        }
    }
}

impl DaemonConfig {
    /// Load `path`, or the default location when none is given, then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(crate::clienv::config_path);
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            pid_file = %config.pid_file.display(),
            log_level = %config.log_level,
            enable_test_devices = config.enable_test_devices,
            "Daemon config loaded"
        );
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(pid_file) = crate::clienv::pid_file_override() {
            self.pid_file = pid_file;
        }
        if let Some(log_file) = crate::clienv::log_file_override() {
            self.log_file = log_file;
        }
        if let Some(enabled) = crate::clienv::test_devices_override() {
            self.enable_test_devices = enabled;
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.bus.reconnect_interval_secs.max(1))
    }
}
