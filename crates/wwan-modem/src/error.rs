//! Error taxonomy for modem I/O and controller operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::RequestedMode;

/// Category of a structured modem error (`+CME ERROR` / `+CMS ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Mobile equipment error.
    Cme,
    /// Message service error.
    Cms,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Cme => write!(f, "CME"),
            ErrorCategory::Cms => write!(f, "CMS"),
        }
    }
}

/// CME code: incorrect password.
pub const CME_INCORRECT_PASSWORD: u16 = 16;
/// CME code: SIM PIN required.
pub const CME_SIM_PIN_REQUIRED: u16 = 11;
/// CME code: SIM PUK required.
pub const CME_SIM_PUK_REQUIRED: u16 = 12;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("serial port {path} unavailable: {reason}")]
    PortUnavailable { path: String, reason: String },

    #[error("no final response to {command} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} failed with +{category} ERROR: {code}")]
    Device {
        command: String,
        category: ErrorCategory,
        code: u16,
    },

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("SIM is locked and no PIN is configured")]
    PinRequired,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("radio mode {0} cannot be requested")]
    InvalidMode(RequestedMode),
}

impl ModemError {
    /// Errors worth retrying while the modem is still settling.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModemError::Timeout { .. } | ModemError::Device { .. } | ModemError::Command { .. }
        )
    }

    /// The serial device went away (unplugged, rfkill'd, or the node vanished).
    pub fn is_device_lost(&self) -> bool {
        matches!(self, ModemError::PortUnavailable { .. } | ModemError::Io(_))
    }

    /// Structured CME code, if this is a `+CME ERROR`.
    pub fn cme_code(&self) -> Option<u16> {
        match self {
            ModemError::Device {
                category: ErrorCategory::Cme,
                code,
                ..
            } => Some(*code),
            _ => None,
        }
    }
}

/// Failure of a controller operation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("{action} failed: {source}")]
    System {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("SIM rejected the configured PIN ({0})")]
    PinRejected(ModemError),

    #[error("modem is not open")]
    NotOpen,
}

impl ControlError {
    pub(crate) fn system(action: &'static str, source: std::io::Error) -> Self {
        ControlError::System { action, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let timeout = ModemError::Timeout {
            command: "AT".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_device_lost());

        let lost = ModemError::PortUnavailable {
            path: "/dev/ttyACM1".into(),
            reason: "no such file".into(),
        };
        assert!(lost.is_device_lost());
        assert!(!lost.is_transient());

        assert!(!ModemError::PinRequired.is_transient());
    }

    #[test]
    fn device_error_display() {
        let err = ModemError::Device {
            command: "AT+CPIN=\"0000\"".into(),
            category: ErrorCategory::Cme,
            code: 16,
        };
        assert_eq!(err.to_string(), "AT+CPIN=\"0000\" failed with +CME ERROR: 16");
        assert_eq!(err.cme_code(), Some(CME_INCORRECT_PASSWORD));
    }
}
