use std::path::PathBuf;

const CONFIG_ENV: &str = "NETMAND_CONFIG";
const PID_FILE_ENV: &str = "NETMAND_PID_FILE";
const LOG_FILE_ENV: &str = "NETMAND_LOG_FILE";
const TEST_DEVICES_ENV: &str = "NETMAND_ENABLE_TEST_DEVICES";

const DEFAULT_CONFIG_PATH: &str = "/etc/netmand/netmand.toml";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Configuration file ($NETMAND_CONFIG or /etc/netmand/netmand.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::trace!(path = %path.display(), "Config path");
    path
}

/// PID file override ($NETMAND_PID_FILE)
pub fn pid_file_override() -> Option<PathBuf> {
    let val = env_opt(PID_FILE_ENV).map(PathBuf::from);
    tracing::trace!(value = ?val, "NETMAND_PID_FILE env var");
    val
}

/// Log file override ($NETMAND_LOG_FILE)
pub fn log_file_override() -> Option<PathBuf> {
    let val = env_opt(LOG_FILE_ENV).map(PathBuf::from);
    tracing::trace!(value = ?val, "NETMAND_LOG_FILE env var");
    val
}

/// Test device switch ($NETMAND_ENABLE_TEST_DEVICES=1|true|yes|on)
pub fn test_devices_override() -> Option<bool> {
    let val = env_opt(TEST_DEVICES_ENV).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "NETMAND_ENABLE_TEST_DEVICES env var");
    val
}
