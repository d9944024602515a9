//! Controller configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "wwan_interface": "wwan0",
//!   "ipver": 4,
//!   "apn": "internet",
//!   "pin": "1234",
//!   "usbid": "0bdb:1900"
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_BUSY_RETRIES;
use crate::types::{IpVersion, RequestedMode};

/// Sysfs interface label of the data port on the Ericsson F3507g minicard.
pub const DEFAULT_PORT_LABEL: &str = "Ericsson F3507g Mobile Broadband Minicard Data Modem";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── USB id ──────────────────────────────────────────────────────────

/// USB vendor/product pair, written `vvvv:pppp` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl FromStr for UsbId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("usbid must be vvvv:pppp in hex, got {s:?}"));
        let (vendor, product) = s.split_once(':').ok_or_else(invalid)?;
        if vendor.len() != 4 || product.len() != 4 {
            return Err(invalid());
        }
        Ok(UsbId {
            vendor: u16::from_str_radix(vendor, 16).map_err(|_| invalid())?,
            product: u16::from_str_radix(product, 16).map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl Serialize for UsbId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsbId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Timings ─────────────────────────────────────────────────────────

/// Poll and supervision intervals, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Sleep between polls of the bring-up `Await*` phases.
    pub poll_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub max_busy_retries: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            poll_interval_ms: 500,
            watchdog_interval_ms: 1000,
            monitor_interval_ms: 4000,
            command_timeout_ms: 5000,
            max_busy_retries: DEFAULT_MAX_BUSY_RETRIES,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ── Top level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WwanConfig {
    pub wwan_interface: String,
    pub ipver: IpVersion,
    pub apn: String,
    #[serde(default)]
    pub pin: Option<String>,
    pub usbid: UsbId,

    /// Fixed data port; discovered through sysfs when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PathBuf>,
    #[serde(default = "default_port_label")]
    pub port_label: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// DHCP client argv; the interface name is appended.
    #[serde(default = "default_dhcp_command")]
    pub dhcp_command: Vec<String>,
    /// Radio mode requested on `enable`; `off` is not allowed.
    #[serde(default = "default_mode")]
    pub mode: RequestedMode,
    #[serde(default)]
    pub timings: Timings,
}

fn default_port_label() -> String {
    DEFAULT_PORT_LABEL.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_dhcp_command() -> Vec<String> {
    ["dhcpcd", "-qB", "--noipv4ll"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_mode() -> RequestedMode {
    RequestedMode::PreferUmts
}

impl WwanConfig {
    /// Minimal config with defaults for every optional key.
    pub fn new(wwan_interface: &str, ipver: IpVersion, apn: &str, usbid: UsbId) -> Self {
        WwanConfig {
            wwan_interface: wwan_interface.to_string(),
            ipver,
            apn: apn.to_string(),
            pin: None,
            usbid,
            port: None,
            port_label: default_port_label(),
            baud_rate: default_baud_rate(),
            dhcp_command: default_dhcp_command(),
            mode: default_mode(),
            timings: Timings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: WwanConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wwan_interface.is_empty() {
            return Err(ConfigError::Invalid("wwan_interface is empty".into()));
        }
        if self.dhcp_command.is_empty() {
            return Err(ConfigError::Invalid("dhcp_command is empty".into()));
        }
        if let Some(pin) = &self.pin {
            if !(4..=8).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::Invalid("pin must be 4-8 digits".into()));
            }
        }
        if matches!(self.mode, RequestedMode::Error | RequestedMode::Off) {
            return Err(ConfigError::Invalid(format!(
                "mode {} cannot be used to bring the connection up",
                self.mode
            )));
        }
        if self.timings.poll_interval_ms == 0
            || self.timings.watchdog_interval_ms == 0
            || self.timings.monitor_interval_ms == 0
        {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usbid_parsing() {
        let id: UsbId = "0bdb:1900".parse().unwrap();
        assert_eq!(id.vendor, 0x0bdb);
        assert_eq!(id.product, 0x1900);
        assert_eq!(id.to_string(), "0bdb:1900");

        assert!("0bdb".parse::<UsbId>().is_err());
        assert!("0bdb:19000".parse::<UsbId>().is_err());
        assert!("zzzz:1900".parse::<UsbId>().is_err());
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: WwanConfig = serde_json::from_str(
            r#"{"wwan_interface":"wwan0","ipver":4,"apn":"internet","pin":"1234","usbid":"0bdb:1900"}"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.ipver, IpVersion::V4);
        assert_eq!(cfg.pin.as_deref(), Some("1234"));
        assert_eq!(cfg.port, None);
        assert_eq!(cfg.port_label, DEFAULT_PORT_LABEL);
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.dhcp_command, ["dhcpcd", "-qB", "--noipv4ll"]);
        assert_eq!(cfg.mode, RequestedMode::PreferUmts);
        assert_eq!(cfg.timings, Timings::default());
    }

    #[test]
    fn null_pin_and_overrides() {
        let cfg: WwanConfig = serde_json::from_str(
            r#"{
                "wwan_interface": "wwan0", "ipver": 6, "apn": "web", "pin": null,
                "usbid": "0bdb:1900", "port": "/dev/ttyACM1", "baud_rate": 19200,
                "mode": "force_gprs", "timings": {"monitor_interval_ms": 2000}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.pin, None);
        assert_eq!(cfg.ipver, IpVersion::V6);
        assert_eq!(cfg.port.as_deref(), Some(Path::new("/dev/ttyACM1")));
        assert_eq!(cfg.mode, RequestedMode::ForceGprs);
        assert_eq!(cfg.timings.monitor_interval(), Duration::from_secs(2));
        assert_eq!(cfg.timings.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn bad_ipver_is_rejected() {
        let res: Result<WwanConfig, _> = serde_json::from_str(
            r#"{"wwan_interface":"wwan0","ipver":5,"apn":"x","usbid":"0bdb:1900"}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn validation() {
        let usb = UsbId {
            vendor: 0x0bdb,
            product: 0x1900,
        };
        let mut cfg = WwanConfig::new("wwan0", IpVersion::V4, "internet", usb);
        cfg.validate().unwrap();

        cfg.pin = Some("12a4".into());
        assert!(cfg.validate().is_err());
        cfg.pin = Some("1234".into());

        cfg.mode = RequestedMode::Error;
        assert!(cfg.validate().is_err());
        cfg.mode = RequestedMode::Off;
        assert!(cfg.validate().is_err());
        cfg.mode = RequestedMode::ForceUmts;

        cfg.timings.watchdog_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reports_path() {
        let err = WwanConfig::load(Path::new("/nonexistent/wwan.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/wwan.json"));
    }
}
