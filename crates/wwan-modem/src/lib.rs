//! WWAN modem control and connectivity supervision.
//!
//! This crate contains:
//! - **Transport**: half-duplex CR/LF line exchange over a serial port
//! - **Command protocol**: AT command execution, error classification,
//!   busy-retry backoff and typed accessors
//! - **State model**: edge-triggered cache of signal, network and technology
//! - **Controller**: bring-up state machine, DHCP ownership, monitor loop
//! - **Watchdog**: carrier/IP supervision that requests restarts
//! - **Sink**: boundary for status consumers (tray, CLI printer, logger)
//! - **System**: the narrow interface to rfkill, sysfs, getifaddrs and dhcpcd
//! - **Sim**: simulated modem and OS used by `--simulate` and by tests

pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod sim;
pub mod sink;
pub mod state;
pub mod system;
pub mod transport;
pub mod types;
pub mod watchdog;

pub use config::WwanConfig;
pub use control::{ConnectivityController, ControlCommand, Phase};
pub use error::{ControlError, ModemError};
pub use protocol::Modem;
pub use sink::NotificationSink;
pub use types::{
    IpVersion, RadioTechnology, RegistrationStatus, RequestedMode, SignalLevel, StatusSnapshot,
};
