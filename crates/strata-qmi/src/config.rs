use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_DEVICE_DIR: &str = "/dev";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortConfigInput {
    pub device_dir: Option<String>,
    pub timeouts: TimeoutsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub open_version_info_ms: Option<u64>,
    pub open_with_format_ms: Option<u64>,
    pub close_ms: Option<u64>,
    pub allocate_client_ms: Option<u64>,
    pub release_client_ms: Option<u64>,
    pub wda_request_ms: Option<u64>,
    pub ctl_query_ms: Option<u64>,
}

/// Per-request deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTimeouts {
    /// First open, including the CTL version-info handshake.
    pub open_version_info: Duration,
    /// Reopen forcing a kernel data format through CTL.
    pub open_with_format: Duration,
    pub close: Duration,
    pub allocate_client: Duration,
    pub release_client: Duration,
    /// WDA get/set data format.
    pub wda_request: Duration,
    /// Kernel expected-format queries and updates.
    pub ctl_query: Duration,
}

impl Default for PortTimeouts {
    fn default() -> Self {
        Self {
            open_version_info: Duration::from_secs(25),
            open_with_format: Duration::from_secs(10),
            close: Duration::from_secs(5),
            allocate_client: Duration::from_secs(10),
            release_client: Duration::from_secs(3),
            wda_request: Duration::from_secs(10),
            ctl_query: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Directory holding the control device nodes.
    pub device_dir: PathBuf,
    pub timeouts: PortTimeouts,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
            timeouts: PortTimeouts::default(),
        }
    }
}

fn resolve_ms(name: &str, value: Option<u64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => Err(Error::Config(format!("{name} must be greater than zero"))),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

impl TimeoutsInput {
    pub fn resolve(self) -> Result<PortTimeouts> {
        let d = PortTimeouts::default();
        Ok(PortTimeouts {
            open_version_info: resolve_ms(
                "open_version_info_ms",
                self.open_version_info_ms,
                d.open_version_info,
            )?,
            open_with_format: resolve_ms(
                "open_with_format_ms",
                self.open_with_format_ms,
                d.open_with_format,
            )?,
            close: resolve_ms("close_ms", self.close_ms, d.close)?,
            allocate_client: resolve_ms(
                "allocate_client_ms",
                self.allocate_client_ms,
                d.allocate_client,
            )?,
            release_client: resolve_ms(
                "release_client_ms",
                self.release_client_ms,
                d.release_client,
            )?,
            wda_request: resolve_ms("wda_request_ms", self.wda_request_ms, d.wda_request)?,
            ctl_query: resolve_ms("ctl_query_ms", self.ctl_query_ms, d.ctl_query)?,
        })
    }
}

impl PortConfigInput {
    pub fn resolve(self) -> Result<PortConfig> {
        let device_dir = self
            .device_dir
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_DIR));

        Ok(PortConfig {
            device_dir,
            timeouts: self.timeouts.resolve()?,
        })
    }
}

impl PortConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(PortConfig::default());
        }
        let parsed: PortConfigInput = toml::from_str(input)
            .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;
        parsed.resolve()
    }

    /// Full path of the control node for a port name (`cdc-wdm0` → `/dev/cdc-wdm0`).
    pub fn device_path(&self, port_name: &str) -> PathBuf {
        let name = Path::new(port_name);
        if name.is_absolute() {
            return name.to_path_buf();
        }
        self.device_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = PortConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, PortConfig::default());
        assert_eq!(cfg.timeouts.open_version_info, Duration::from_secs(25));
        assert_eq!(cfg.timeouts.release_client, Duration::from_secs(3));
    }

    #[test]
    fn parse_toml_config_overrides() {
        let toml = r#"
            device_dir = "/run/qmi"

            [timeouts]
            open_version_info_ms = 30000
            wda_request_ms = 2500
        "#;

        let cfg = PortConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.device_dir, PathBuf::from("/run/qmi"));
        assert_eq!(cfg.timeouts.open_version_info, Duration::from_secs(30));
        assert_eq!(cfg.timeouts.wda_request, Duration::from_millis(2500));
        // untouched keys keep their defaults
        assert_eq!(cfg.timeouts.close, Duration::from_secs(5));
        assert_eq!(cfg.device_path("cdc-wdm1"), PathBuf::from("/run/qmi/cdc-wdm1"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = PortConfig::from_toml_str("[timeouts]\nclose_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("close_ms"));
    }

    #[test]
    fn invalid_toml_rejected() {
        let err = PortConfig::from_toml_str("device_dir = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn blank_device_dir_falls_back() {
        let cfg = PortConfig::from_toml_str("device_dir = \"  \"").unwrap();
        assert_eq!(cfg.device_dir, PathBuf::from(DEFAULT_DEVICE_DIR));
        assert_eq!(cfg.device_path("/dev/wwan0qmi0"), PathBuf::from("/dev/wwan0qmi0"));
    }
}
