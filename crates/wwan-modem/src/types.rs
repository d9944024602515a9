//! Radio, registration and session types shared by the protocol, the state
//! model and the notification sink.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Radio technology ────────────────────────────────────────────────

/// Access technology the modem has currently acquired (`AT*ERINFO?`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioTechnology {
    #[default]
    None,
    Gprs,
    Edge,
    Umts,
    Hspa,
}

impl RadioTechnology {
    /// Map the `*ERINFO` status triple (`<gsm>,<edge-or-gprs>,<umts>`).
    ///
    /// ```
    /// use wwan_modem::RadioTechnology;
    ///
    /// assert_eq!(RadioTechnology::from_erinfo("0,0,2"), RadioTechnology::Hspa);
    /// assert_eq!(RadioTechnology::from_erinfo("1,1,1"), RadioTechnology::None);
    /// ```
    pub fn from_erinfo(triple: &str) -> Self {
        match triple {
            "0,1,0" => RadioTechnology::Gprs,
            "0,2,0" => RadioTechnology::Edge,
            "0,0,1" => RadioTechnology::Umts,
            "0,0,2" => RadioTechnology::Hspa,
            _ => RadioTechnology::None,
        }
    }

    /// Short label as shown next to the signal bars.
    pub fn label(&self) -> &'static str {
        match self {
            RadioTechnology::None => "NONE",
            RadioTechnology::Gprs => "GPRS",
            RadioTechnology::Edge => "EDGE",
            RadioTechnology::Umts => "3G",
            RadioTechnology::Hspa => "3G+",
        }
    }
}

impl fmt::Display for RadioTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Requested mode ──────────────────────────────────────────────────

/// Radio functionality level (`AT+CFUN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedMode {
    /// Reported when the modem answers with an unknown or minimal level.
    Error,
    PreferUmts,
    Off,
    ForceGprs,
    ForceUmts,
}

impl RequestedMode {
    /// Numeric `+CFUN` level for this mode. `Error` cannot be requested.
    pub fn cfun_code(&self) -> Option<u8> {
        match self {
            RequestedMode::Error => None,
            RequestedMode::PreferUmts => Some(1),
            RequestedMode::Off => Some(4),
            RequestedMode::ForceGprs => Some(5),
            RequestedMode::ForceUmts => Some(6),
        }
    }

    pub fn from_cfun_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RequestedMode::Error),
            1 => Some(RequestedMode::PreferUmts),
            4 => Some(RequestedMode::Off),
            5 => Some(RequestedMode::ForceGprs),
            6 => Some(RequestedMode::ForceUmts),
            _ => None,
        }
    }
}

impl fmt::Display for RequestedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedMode::Error => write!(f, "error"),
            RequestedMode::PreferUmts => write!(f, "prefer_umts"),
            RequestedMode::Off => write!(f, "off"),
            RequestedMode::ForceGprs => write!(f, "force_gprs"),
            RequestedMode::ForceUmts => write!(f, "force_umts"),
        }
    }
}

impl std::str::FromStr for RequestedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer_umts" | "prefer" | "normal" => Ok(RequestedMode::PreferUmts),
            "off" => Ok(RequestedMode::Off),
            "force_gprs" | "gprs" => Ok(RequestedMode::ForceGprs),
            "force_umts" | "umts" => Ok(RequestedMode::ForceUmts),
            other => Err(format!("unknown radio mode: {other}")),
        }
    }
}

// ── Registration ────────────────────────────────────────────────────

/// Network registration state (`AT+CREG?`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    #[default]
    NotSearching,
    Searching,
    RegHome,
    RegRoaming,
    RegDenied,
}

impl RegistrationStatus {
    pub fn from_creg_stat(stat: u8) -> Option<Self> {
        match stat {
            0 => Some(RegistrationStatus::NotSearching),
            1 => Some(RegistrationStatus::RegHome),
            2 => Some(RegistrationStatus::Searching),
            3 => Some(RegistrationStatus::RegDenied),
            // Out of range: the modem keeps looking.
            4 => Some(RegistrationStatus::Searching),
            5 => Some(RegistrationStatus::RegRoaming),
            _ => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegHome | RegistrationStatus::RegRoaming
        )
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::NotSearching => write!(f, "not_searching"),
            RegistrationStatus::Searching => write!(f, "searching"),
            RegistrationStatus::RegHome => write!(f, "home"),
            RegistrationStatus::RegRoaming => write!(f, "roaming"),
            RegistrationStatus::RegDenied => write!(f, "denied"),
        }
    }
}

// ── Signal ──────────────────────────────────────────────────────────

/// Coarse signal indicator, 0–5 bars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalLevel(u8);

impl SignalLevel {
    pub const MAX: u8 = 5;

    /// Clamps out-of-range readings to the top bar.
    pub fn new(bars: u8) -> Self {
        SignalLevel(bars.min(Self::MAX))
    }

    pub fn bars(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for SignalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, Self::MAX)
    }
}

// ── IP version / PDP context ────────────────────────────────────────

/// IP version of the packet-data context. Serialized as `4` or `6`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    /// PDP type string used by `AT+CGDCONT`.
    pub fn pdp_type(&self) -> &'static str {
        match self {
            IpVersion::V4 => "IP",
            IpVersion::V6 => "IPV6",
        }
    }

    pub fn from_pdp_type(pdp_type: &str) -> Option<Self> {
        match pdp_type {
            "IP" => Some(IpVersion::V4),
            "IPV6" => Some(IpVersion::V6),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(format!("ipver must be 4 or 6, got {other}")),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(v: IpVersion) -> u8 {
        v.number()
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// Primary packet-data context as reported by `AT+CGDCONT?`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpContext {
    pub ip_version: IpVersion,
    pub apn: String,
}

/// Static modem identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemIdentity {
    pub manufacturer: String,
    pub model: String,
    pub revision: Option<String>,
    pub imei: String,
    /// Only readable once the SIM is unlocked.
    pub imsi: Option<String>,
}

// ── Status snapshot ─────────────────────────────────────────────────

/// What the notification sink receives on every poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub radio: RequestedMode,
    /// `None` while searching.
    pub network: Option<String>,
    pub technology: RadioTechnology,
    pub signal: SignalLevel,
}

impl StatusSnapshot {
    /// Human-readable one-liner: `"Operator (3G)"`, `"Searching"` or `"Disabled"`.
    pub fn summary(&self) -> String {
        if matches!(self.radio, RequestedMode::Off | RequestedMode::Error) {
            return "Disabled".into();
        }
        match (&self.network, self.technology) {
            (_, RadioTechnology::None) | (None, _) => "Searching".into(),
            (Some(name), tech) => format!("{name} ({tech})"),
        }
    }
}
