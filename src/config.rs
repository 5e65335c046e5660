use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::auth;
use crate::budget::Credit;
use crate::platform::common::{atomic_write, ensure_directory_exists, set_file_permissions};

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Budget applied to a day that has no stored credit yet
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_minutes")]
    pub default_minutes: i64,

    #[serde(default = "default_five_extends")]
    pub default_five_extends: i64,

    #[serde(default = "default_one_extends")]
    pub default_one_extends: i64,

    /// Pause after an extension before re-verifying the blocked state
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Argon2 hash of the password that unlocks `screen-budget grant`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Coarse periodic check, independent of the screen state (seconds)
    #[serde(default = "default_fallback_interval")]
    pub fallback_interval: u64,

    /// How often the session idle/lock state is sampled (seconds)
    #[serde(default = "default_screen_poll_interval")]
    pub screen_poll_interval: u64,
}

/// LAN remote control
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,

    #[serde(default = "default_bind_backoff_ms")]
    pub bind_backoff_ms: u64,

    /// Delays (seconds) between restart attempts after the listener fails
    #[serde(default = "default_restart_delays")]
    pub restart_delays: Vec<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values
fn default_minutes() -> i64 {
    20
}

fn default_five_extends() -> i64 {
    1
}

fn default_one_extends() -> i64 {
    1
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_fallback_interval() -> u64 {
    900 // 15 minutes
}

fn default_screen_poll_interval() -> u64 {
    5
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8888
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

fn default_bind_attempts() -> u32 {
    3
}

fn default_bind_backoff_ms() -> u64 {
    500
}

fn default_restart_delays() -> Vec<u64> {
    vec![2, 15, 60]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_minutes(),
            default_five_extends: default_five_extends(),
            default_one_extends: default_one_extends(),
            settle_delay_ms: default_settle_delay_ms(),
            admin_password_hash: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fallback_interval: default_fallback_interval(),
            screen_poll_interval: default_screen_poll_interval(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_bind_address(),
            port: default_port(),
            recv_timeout_ms: default_recv_timeout_ms(),
            bind_attempts: default_bind_attempts(),
            bind_backoff_ms: default_bind_backoff_ms(),
            restart_delays: default_restart_delays(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl BudgetConfig {
    pub fn default_credit(&self) -> Credit {
        Credit::new(
            self.default_minutes,
            self.default_five_extends,
            self.default_one_extends,
        )
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl SchedulerConfig {
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_interval)
    }

    pub fn screen_poll_interval(&self) -> Duration {
        Duration::from_secs(self.screen_poll_interval)
    }
}

impl DiscoveryConfig {
    pub fn restart_delays(&self) -> Vec<Duration> {
        self.restart_delays
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}

impl AppConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// Comments from a hand-edited file are not preserved.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent)?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        atomic_write(path, toml.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        set_file_permissions(path, 0o644)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if budget.default_minutes <= 0 || budget.default_minutes > 1440 {
            anyhow::bail!(
                "Default minutes must be between 1 and 1440 (got: {})",
                budget.default_minutes
            );
        }

        if budget.default_five_extends < 0 || budget.default_one_extends < 0 {
            anyhow::bail!("Extension pool sizes cannot be negative");
        }

        if let Some(hash) = &budget.admin_password_hash {
            auth::check_hash(hash).context("Invalid admin_password_hash")?;
        }

        if self.scheduler.fallback_interval < 60 {
            anyhow::bail!(
                "Fallback interval must be at least 60 seconds (got: {})",
                self.scheduler.fallback_interval
            );
        }

        if self.scheduler.screen_poll_interval == 0 {
            anyhow::bail!("Screen poll interval must be at least 1 second");
        }

        let discovery = &self.discovery;
        if discovery.recv_timeout_ms == 0 {
            anyhow::bail!("Receive timeout must be greater than zero");
        }

        if discovery.bind_attempts == 0 {
            anyhow::bail!("Bind attempts must be at least 1");
        }

        if discovery.enabled && discovery.port == 0 {
            anyhow::bail!("Discovery port must be set when discovery is enabled");
        }

        Ok(())
    }
}

/// Commented configuration written by `config init`
pub const CONFIG_TEMPLATE: &str = r#"# screen-budget configuration

[budget]
# Minutes of screen time for a day with no stored credit
default_minutes = 20
# Pool extensions available per day (each grants up to 5 or 1 minutes)
default_five_extends = 1
default_one_extends = 1
settle_delay_ms = 500
# Set with `screen-budget config set-password` to enable `screen-budget grant`
# admin_password_hash = "$argon2id$..."

[scheduler]
# Seconds between coarse checks
fallback_interval = 900
# Seconds between session idle/lock samples
screen_poll_interval = 5

[discovery]
# Answer parent devices on the local network
enabled = false
bind_address = "0.0.0.0"
port = 8888
recv_timeout_ms = 1000
bind_attempts = 3
bind_backoff_ms = 500
restart_delays = [2, 15, 60]

[logging]
level = "info"
# file = "/var/log/screen-budget.log"
"#;

/// Get the platform-specific config file path
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/screen-budget/screen-budget.toml"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from(
            "/Library/Application Support/screen-budget/screen-budget.toml",
        ))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("screen-budget");
        path.push("screen-budget.toml");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}

/// Get the platform-specific directory for credits, identity and the event log
pub fn get_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // Try system location first, fall back to user location
        let system_dir = PathBuf::from("/var/lib/screen-budget");
        if system_dir.exists() {
            return Ok(system_dir);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "screen-budget") {
            return Ok(dirs.data_local_dir().to_path_buf());
        }

        anyhow::bail!("Could not determine data directory");
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support/screen-budget"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("screen-budget");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget.default_credit(), Credit::new(20, 1, 1));
        assert_eq!(config.discovery.port, 8888);
        assert!(!config.discovery.enabled);
        assert_eq!(
            config.discovery.restart_delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(15),
                Duration::from_secs(60)
            ]
        );
    }

    #[test]
    fn template_matches_defaults() {
        let config = AppConfig::from_toml_str(CONFIG_TEMPLATE).unwrap();
        let defaults = AppConfig::default();

        assert_eq!(config.budget.default_credit(), defaults.budget.default_credit());
        assert_eq!(config.budget.settle_delay_ms, defaults.budget.settle_delay_ms);
        assert_eq!(config.scheduler.fallback_interval, defaults.scheduler.fallback_interval);
        assert_eq!(config.discovery.bind_address, defaults.discovery.bind_address);
        assert_eq!(config.discovery.restart_delays, defaults.discovery.restart_delays);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = AppConfig::from_toml_str("[discovery]\nenabled = true\n").unwrap();
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.port, 8888);
        assert_eq!(config.budget.default_minutes, 20);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = AppConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.budget.default_minutes, 20);
    }

    #[test]
    fn save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("screen-budget.toml");

        let mut config = AppConfig::default();
        config.budget.default_minutes = 90;
        config.discovery.enabled = true;
        config.logging.file = Some(PathBuf::from("/tmp/screen-budget.log"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.budget.default_minutes, 90);
        assert!(loaded.budget.admin_password_hash.is_none());
        assert!(loaded.discovery.enabled);
        assert_eq!(loaded.logging.file, Some(PathBuf::from("/tmp/screen-budget.log")));
    }

    #[test]
    fn validates_default_minutes() {
        let mut config = AppConfig::default();
        config.budget.default_minutes = 0;
        assert!(config.validate().is_err());

        config.budget.default_minutes = 1441;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validates_admin_password_hash() {
        let mut config = AppConfig::default();
        config.budget.admin_password_hash = Some("plaintext".to_string());
        assert!(config.validate().is_err());

        config.budget.admin_password_hash = Some(auth::hash_password("hunter2").unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validates_pools() {
        let mut config = AppConfig::default();
        config.budget.default_five_extends = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validates_fallback_interval() {
        let config = AppConfig {
            scheduler: SchedulerConfig {
                fallback_interval: 30, // Too short
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validates_discovery_settings() {
        let mut config = AppConfig::default();
        config.discovery.recv_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.discovery.bind_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.discovery.port = 0;
        assert!(config.validate().is_ok());
        config.discovery.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_bind_address() {
        assert!(AppConfig::from_toml_str("[discovery]\nbind_address = \"nope\"\n").is_err());
    }
}
