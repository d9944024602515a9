//! Simulated modem and host.
//!
//! [`SimModem`] answers the AT command subset the controller uses from an
//! in-memory model of SIM, radio and packet session. [`SimSystem`] stands in
//! for rfkill, sysfs and the DHCP client: starting DHCP assigns a lease,
//! terminating it removes the lease. Both are cheap handles over shared state
//! so a test can keep one clone for inspection and fault injection while the
//! controller owns the other.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::UsbId;
use crate::error::ModemError;
use crate::system::{DhcpProcess, System};
use crate::transport::{PortOpener, Transport};
use crate::types::IpVersion;

pub const SIM_PORT: &str = "/dev/ttyACM1";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Modem ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ModemModel {
    pin: Option<String>,
    unlocked: bool,
    cfun: u8,
    /// `+CREG` stat reported once registered.
    creg: u8,
    /// `+CREG?` polls answered with "searching" before registering.
    registration_delay: u32,
    erinfo: String,
    operator: String,
    signal: u8,
    csq: u8,
    pdp_type: String,
    apn: String,
    enap: bool,
    gps: bool,
    busy: VecDeque<u16>,
    failing: Vec<String>,
    unplugged: bool,
    /// Commands with this prefix get no reply, this many more times.
    muted: Option<(String, usize)>,
    commands: Vec<String>,
}

impl Default for ModemModel {
    fn default() -> Self {
        ModemModel {
            pin: None,
            unlocked: true,
            cfun: 4,
            creg: 1,
            registration_delay: 0,
            erinfo: "0,0,1".into(),
            operator: "SimNet".into(),
            signal: 4,
            csq: 20,
            pdp_type: "IP".into(),
            apn: String::new(),
            enap: false,
            gps: false,
            busy: VecDeque::new(),
            failing: Vec::new(),
            unplugged: false,
            muted: None,
            commands: Vec::new(),
        }
    }
}

impl ModemModel {
    fn radio_on(&self) -> bool {
        matches!(self.cfun, 1 | 5 | 6)
    }

    fn respond(&mut self, command: &str) -> Vec<String> {
        if let Some(code) = self.busy.pop_front() {
            return vec![format!("+CME ERROR: {code}")];
        }
        if self.failing.iter().any(|prefix| command.starts_with(prefix.as_str())) {
            return vec!["ERROR".into()];
        }

        let mut lines: Vec<String> = Vec::new();
        match command {
            "ATE0" | "ATE1" => {}
            "AT+CPIN?" => lines.push(if self.unlocked {
                "+CPIN: READY".into()
            } else {
                "+CPIN: SIM PIN".into()
            }),
            "AT+CFUN?" => lines.push(format!("+CFUN: {}", self.cfun)),
            "AT+CREG?" => {
                let stat = if !self.unlocked || !self.radio_on() {
                    0
                } else if self.registration_delay > 0 {
                    self.registration_delay -= 1;
                    2
                } else {
                    self.creg
                };
                lines.push(format!("+CREG: 0,{stat}"));
            }
            "AT*ERINFO?" => {
                let triple = if self.registered() { self.erinfo.as_str() } else { "0,0,0" };
                lines.push(format!("*ERINFO: {triple}"));
            }
            "AT+CIND?" => lines.push(format!("+CIND: 5,{},1,0,0,0,0,0", self.signal)),
            "AT+CSQ" => lines.push(format!("+CSQ: {},99", self.csq)),
            "AT+COPS?" => lines.push(if self.registered() {
                format!("+COPS: 0,0,\"{}\",2", self.operator)
            } else {
                "+COPS: 0".into()
            }),
            "AT+CGDCONT?" => lines.push(format!(
                "+CGDCONT: 1,\"{}\",\"{}\",\"\",0,0",
                self.pdp_type, self.apn
            )),
            "AT*ENAP?" => lines.push(format!("*ENAP: {}", u8::from(self.enap))),
            "AT*ENAP=1,1" => {
                if !self.registered() {
                    return vec!["+CME ERROR: 30".into()];
                }
                self.enap = true;
            }
            "AT*ENAP=0" => self.enap = false,
            "AT*E2GPSCTL?" => lines.push(if self.gps {
                "*E2GPSCTL: 1,1,1".into()
            } else {
                "*E2GPSCTL: 0,1,0".into()
            }),
            "AT+CGMI" => lines.push("Ericsson".into()),
            "AT+CGMM" => lines.push("F3507g".into()),
            "AT+CGMR" => lines.push("R1A029".into()),
            "AT+CGSN" => lines.push("004401234567890".into()),
            "AT+CIMI" => {
                if !self.unlocked {
                    return vec!["+CME ERROR: 11".into()];
                }
                lines.push("262011234567890".into());
            }
            other => return self.respond_write(other),
        }
        lines.push("OK".into());
        lines
    }

    fn respond_write(&mut self, command: &str) -> Vec<String> {
        if let Some(pin) = command
            .strip_prefix("AT+CPIN=\"")
            .and_then(|s| s.strip_suffix('"'))
        {
            if self.unlocked {
                return vec!["+CME ERROR: 3".into()];
            }
            if self.pin.as_deref() != Some(pin) {
                return vec!["+CME ERROR: 16".into()];
            }
            self.unlocked = true;
        } else if let Some(code) = command.strip_prefix("AT+CFUN=") {
            match code.parse::<u8>() {
                Ok(code @ (1 | 4 | 5 | 6)) => {
                    self.cfun = code;
                    if !self.radio_on() {
                        self.enap = false;
                    }
                }
                _ => return vec!["ERROR".into()],
            }
        } else if let Some(args) = command.strip_prefix("AT+CGDCONT=1,") {
            let fields: Vec<&str> = args.split(',').map(|f| f.trim_matches('"')).collect();
            match fields.as_slice() {
                [pdp @ ("IP" | "IPV6"), apn] => {
                    self.pdp_type = pdp.to_string();
                    self.apn = apn.to_string();
                }
                _ => return vec!["ERROR".into()],
            }
        } else if let Some(args) = command.strip_prefix("AT*E2GPSCTL=") {
            if !self.radio_on() {
                return vec!["ERROR".into()];
            }
            self.gps = args == "1,1,1";
        } else {
            return vec!["ERROR".into()];
        }
        vec!["OK".into()]
    }

    fn take_mute(&mut self, command: &str) -> bool {
        match &mut self.muted {
            Some((prefix, remaining)) if *remaining > 0 && command.starts_with(prefix.as_str()) => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn registered(&self) -> bool {
        self.unlocked && self.radio_on() && self.registration_delay == 0 && matches!(self.creg, 1 | 5)
    }
}

/// Simulated modem. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimModem {
    model: Arc<Mutex<ModemModel>>,
}

impl SimModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// SIM locked behind `pin`.
    pub fn with_pin(self, pin: &str) -> Self {
        {
            let mut m = lock(&self.model);
            m.pin = Some(pin.to_string());
            m.unlocked = false;
        }
        self
    }

    /// Answer "searching" to the first `polls` registration queries.
    pub fn with_registration_delay(self, polls: u32) -> Self {
        lock(&self.model).registration_delay = polls;
        self
    }

    /// Queue `count` busy replies with `code` ahead of the next commands.
    pub fn inject_busy(&self, code: u16, count: usize) {
        lock(&self.model).busy.extend(std::iter::repeat_n(code, count));
    }

    /// Answer `ERROR` to every command starting with `prefix`.
    pub fn fail_commands(&self, prefix: &str) {
        lock(&self.model).failing.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.model).failing.clear();
    }

    /// Device node gone: I/O fails, opening fails.
    pub fn set_unplugged(&self, unplugged: bool) {
        lock(&self.model).unplugged = unplugged;
    }

    /// Leave the next `count` commands starting with `prefix` unanswered.
    pub fn mute(&self, prefix: &str, count: usize) {
        lock(&self.model).muted = Some((prefix.to_string(), count));
    }

    pub fn set_registration(&self, creg: u8) {
        lock(&self.model).creg = creg;
    }

    pub fn set_erinfo(&self, triple: &str) {
        lock(&self.model).erinfo = triple.to_string();
    }

    pub fn set_operator(&self, name: &str) {
        lock(&self.model).operator = name.to_string();
    }

    pub fn set_signal(&self, bars: u8) {
        lock(&self.model).signal = bars;
    }

    pub fn set_session(&self, active: bool) {
        lock(&self.model).enap = active;
    }

    pub fn sim_unlocked(&self) -> bool {
        lock(&self.model).unlocked
    }

    pub fn cfun(&self) -> u8 {
        lock(&self.model).cfun
    }

    pub fn session(&self) -> bool {
        lock(&self.model).enap
    }

    pub fn pdp(&self) -> (String, String) {
        let m = lock(&self.model);
        (m.pdp_type.clone(), m.apn.clone())
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.model).commands.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.model)
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn lost() -> ModemError {
        ModemError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "simulated device removed"))
    }
}

impl Transport for SimModem {
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>, ModemError> {
        let reply = {
            let mut m = lock(&self.model);
            if m.unplugged {
                return Err(Self::lost());
            }
            m.commands.push(command.to_string());
            if m.take_mute(command) {
                None
            } else {
                Some(m.respond(command))
            }
        };
        match reply {
            Some(lines) => Ok(lines),
            None => {
                tokio::time::sleep(timeout).await;
                Err(ModemError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn write_line(&mut self, command: &str) -> Result<(), ModemError> {
        let mut m = lock(&self.model);
        if m.unplugged {
            return Err(Self::lost());
        }
        m.commands.push(command.to_string());
        if !m.take_mute(command) {
            m.respond(command);
        }
        Ok(())
    }
}

/// Opens the shared [`SimModem`] unless it is unplugged.
#[derive(Debug, Clone)]
pub struct SimOpener {
    modem: SimModem,
}

impl SimOpener {
    pub fn new(modem: SimModem) -> Self {
        SimOpener { modem }
    }
}

impl PortOpener for SimOpener {
    type Transport = SimModem;

    async fn open(&self, path: &Path) -> Result<SimModem, ModemError> {
        if lock(&self.modem.model).unplugged {
            return Err(ModemError::PortUnavailable {
                path: path.display().to_string(),
                reason: "no such device".into(),
            });
        }
        Ok(self.modem.clone())
    }
}

// ─── Host ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Host {
    rfkill_blocked: bool,
    usb_present: bool,
    port: Option<PathBuf>,
    carrier: bool,
    address: Option<IpAddr>,
    /// Assigned when DHCP starts.
    lease: Option<IpAddr>,
    dhcp_spawns: u32,
    dhcp_running: u32,
    rfkill_fails: bool,
}

impl Default for Host {
    fn default() -> Self {
        Host {
            rfkill_blocked: true,
            usb_present: true,
            port: Some(PathBuf::from(SIM_PORT)),
            carrier: true,
            address: None,
            lease: Some(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))),
            dhcp_spawns: 0,
            dhcp_running: 0,
            rfkill_fails: false,
        }
    }
}

/// Simulated host. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimSystem {
    host: Arc<Mutex<Host>>,
}

impl SimSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_carrier(&self, carrier: bool) {
        lock(&self.host).carrier = carrier;
    }

    pub fn set_address(&self, address: Option<IpAddr>) {
        lock(&self.host).address = address;
    }

    /// Address handed out by the next DHCP client; `None` never assigns one.
    pub fn set_lease(&self, lease: Option<IpAddr>) {
        lock(&self.host).lease = lease;
    }

    pub fn set_usb_present(&self, present: bool) {
        lock(&self.host).usb_present = present;
    }

    pub fn set_rfkill_fails(&self, fails: bool) {
        lock(&self.host).rfkill_fails = fails;
    }

    pub fn rfkill_blocked(&self) -> bool {
        lock(&self.host).rfkill_blocked
    }

    pub fn dhcp_spawns(&self) -> u32 {
        lock(&self.host).dhcp_spawns
    }

    pub fn dhcp_running(&self) -> u32 {
        lock(&self.host).dhcp_running
    }
}

impl System for SimSystem {
    type Dhcp = SimDhcp;

    fn rfkill(&self, block: bool) -> io::Result<()> {
        let mut h = lock(&self.host);
        if h.rfkill_fails {
            return Err(io::Error::other("rfkill: simulated failure"));
        }
        h.rfkill_blocked = block;
        Ok(())
    }

    fn usb_present(&self, _id: &UsbId) -> bool {
        let h = lock(&self.host);
        h.usb_present && !h.rfkill_blocked
    }

    fn modem_port(&self) -> Option<PathBuf> {
        let h = lock(&self.host);
        if h.usb_present && !h.rfkill_blocked {
            h.port.clone()
        } else {
            None
        }
    }

    fn carrier(&self, _iface: &str) -> bool {
        lock(&self.host).carrier
    }

    fn ip_address(&self, _iface: &str, version: IpVersion) -> Option<IpAddr> {
        lock(&self.host).address.filter(|ip| match version {
            IpVersion::V4 => ip.is_ipv4(),
            IpVersion::V6 => ip.is_ipv6(),
        })
    }

    fn spawn_dhcp(&self, iface: &str) -> io::Result<SimDhcp> {
        let mut h = lock(&self.host);
        h.dhcp_spawns += 1;
        h.dhcp_running += 1;
        if h.lease.is_some() {
            h.address = h.lease;
        }
        tracing::debug!(iface, "simulated DHCP client started");
        Ok(SimDhcp {
            host: Some(self.host.clone()),
        })
    }
}

pub struct SimDhcp {
    host: Option<Arc<Mutex<Host>>>,
}

impl DhcpProcess for SimDhcp {
    fn terminate(&mut self) {
        if let Some(host) = self.host.take() {
            let mut h = lock(&host);
            h.dhcp_running = h.dhcp_running.saturating_sub(1);
            h.address = None;
        }
    }
}

impl Drop for SimDhcp {
    fn drop(&mut self) {
        self.terminate();
    }
}
