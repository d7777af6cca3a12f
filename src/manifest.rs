//! Configuration file parsing for vpcctl
//!
//! Parses the optional `vpcctl.toml` configuration file using serde

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `config.state_dir`
pub const STATE_DIR_ENV: &str = "VPCCTL_STATE_DIR";

/// Load configuration from a file
///
/// A missing file yields the defaults unless `required` is set, which is
/// the case when the operator passed `--config` explicitly.
pub fn load(path: &Path, required: bool) -> Result<VpcctlConfig> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            VpcctlConfig::default()
        }
        Err(e) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
        config.config.state_dir = PathBuf::from(dir);
    }

    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct VpcctlConfig {
    /// Global configuration settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Network backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Backoff used while waiting for resource locks
    #[serde(default)]
    pub retry: RetryConfig,
}

impl VpcctlConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.config.state_dir.as_os_str().is_empty() {
            return Err(Error::ConfigValidation("state_dir must not be empty".into()));
        }

        if self.config.lock_timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "lock_timeout_secs must be greater than zero".into(),
            ));
        }

        if self.backend.timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "backend.timeout_secs must be greater than zero".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(Error::ConfigValidation(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::ConfigValidation(format!(
                "retry.jitter_factor must be between 0.0 and 1.0, got {}",
                self.retry.jitter_factor
            )));
        }

        Ok(())
    }
}

/// Global configuration settings
#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Directory holding one JSON record per VPC
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How long a mutating command waits for its VPC locks
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl GlobalConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/etc/vpcctl")
}

fn default_lock_timeout_secs() -> u64 {
    30
}

/// Linux backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Upper bound for a single backend command
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Path to the iproute2 `ip` binary
    #[serde(default = "default_ip")]
    pub ip: PathBuf,

    /// Path to the `iptables` binary
    #[serde(default = "default_iptables")]
    pub iptables: PathBuf,

    /// Path to the `sysctl` binary
    #[serde(default = "default_sysctl")]
    pub sysctl: PathBuf,

    /// Interpreter used for deployed workloads
    #[serde(default = "default_python3")]
    pub python3: PathBuf,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            ip: default_ip(),
            iptables: default_iptables(),
            sysctl: default_sysctl(),
            python3: default_python3(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_ip() -> PathBuf {
    PathBuf::from("ip")
}

fn default_iptables() -> PathBuf {
    PathBuf::from("iptables")
}

fn default_sysctl() -> PathBuf {
    PathBuf::from("sysctl")
}

fn default_python3() -> PathBuf {
    PathBuf::from("python3")
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    10
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for lock acquisition
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempts after which the delay stops growing
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: VpcctlConfig = toml::from_str("").unwrap();
        assert_eq!(config.config.state_dir, PathBuf::from("/etc/vpcctl"));
        assert_eq!(config.config.lock_timeout_secs, 30);
        assert_eq!(config.backend.timeout_secs, 15);
        assert_eq!(config.backend.iptables, PathBuf::from("iptables"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[config]
state_dir = "/var/lib/vpcctl"
lock_timeout_secs = 5

[backend]
timeout_secs = 3
ip = "/usr/sbin/ip"
iptables = "/usr/sbin/iptables-legacy"

[retry]
base_delay_ms = 10
max_delay_ms = 200
"#;

        let config: VpcctlConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.config.state_dir, PathBuf::from("/var/lib/vpcctl"));
        assert_eq!(config.config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.backend.timeout(), Duration::from_secs(3));
        assert_eq!(config.backend.ip, PathBuf::from("/usr/sbin/ip"));
        assert_eq!(config.backend.sysctl, PathBuf::from("sysctl"));
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.retry.max_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml = r#"
[backend]
timeout_secs = 0
"#;

        let config: VpcctlConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_bad_jitter_rejected() {
        let toml = r#"
[retry]
jitter_factor = 1.5
"#;

        let config: VpcctlConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpcctl.toml");

        assert!(matches!(load(&path, true), Err(Error::ConfigRead { .. })));
    }
}
