//! AT command protocol.
//!
//! [`Modem`] owns the transport behind a single execution lock, classifies
//! final status lines into typed errors and absorbs the "busy" replies that
//! modems emit while booting:
//!
//! | Reply             | Meaning                       | Handling                              |
//! |-------------------|-------------------------------|---------------------------------------|
//! | `+CME ERROR: 515` | init/command in progress      | back off, re-issue, settle at 100 ms  |
//! | `+CME ERROR: 14`  | SIM busy                      | back off, re-issue, settle at 0       |
//! | `+CME ERROR: n`   | structured failure            | [`ModemError::Device`]                |
//! | `ERROR`           | unstructured failure          | [`ModemError::Command`]               |
//!
//! Typed accessors sit on top of [`Modem::execute`]; each parses one
//! fixed-format response line and returns `None` when the modem does not
//! expose the value yet.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tokio::sync::Mutex;

use crate::error::{ErrorCategory, ModemError};
use crate::transport::{DEFAULT_TIMEOUT, Transport};
use crate::types::{
    IpVersion, ModemIdentity, PdpContext, RadioTechnology, RegistrationStatus, RequestedMode,
    SignalLevel,
};

/// "Please wait, init or command processing in progress."
pub const CME_PROCESSING: u16 = 515;
/// "SIM busy."
pub const CME_SIM_BUSY: u16 = 14;

/// Added to the inter-command delay on every busy reply.
pub const BUSY_BACKOFF_STEP: Duration = Duration::from_millis(200);
/// Inter-command delay kept after recovering from a 515.
pub const SLOW_MODEM_DELAY: Duration = Duration::from_millis(100);
/// Busy replies tolerated for a single command before giving up.
pub const DEFAULT_MAX_BUSY_RETRIES: u32 = 25;

static CM_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+(CM[ES]) ERROR: (\d+)$").expect("static regex"));
static ERINFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\*ERINFO: (\d,\d,\d)$").expect("static regex"));
static COPS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\+COPS: (\d),(\d),"(.+)",\d\s?$"#).expect("static regex"));
static CREG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CREG:\s*(\d),(\d)$").expect("static regex"));
static CGDCONT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\+CGDCONT:\s*(\d),"(IP|IPV6)","([^"]*)".*$"#).expect("static regex")
});

/// Per-call execution options.
#[derive(Debug, Clone, Copy)]
pub struct CommandOptions {
    /// Wait for and return the response lines.
    pub expect_response: bool,
    pub timeout: Duration,
    /// Turn error status lines into [`ModemError`]s (and absorb busy replies).
    pub parse_error: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        CommandOptions {
            expect_response: true,
            timeout: DEFAULT_TIMEOUT,
            parse_error: true,
        }
    }
}

/// How a response ended.
#[derive(Debug)]
enum Outcome {
    Success,
    Busy(ErrorCategory, u16),
    Failed(ModemError),
}

fn classify(command: &str, lines: &[String]) -> Outcome {
    let Some(status) = lines.last() else {
        return Outcome::Success;
    };

    if status.contains("ERROR") {
        let Some(caps) = CM_ERROR.captures(status) else {
            return Outcome::Failed(ModemError::Command {
                command: command.to_string(),
                detail: status.clone(),
            });
        };
        let category = match &caps[1] {
            "CME" => ErrorCategory::Cme,
            _ => ErrorCategory::Cms,
        };
        let code: u16 = caps[2].parse().unwrap_or(u16::MAX);
        if code == CME_PROCESSING || code == CME_SIM_BUSY {
            return Outcome::Busy(category, code);
        }
        return Outcome::Failed(ModemError::Device {
            command: command.to_string(),
            category,
            code,
        });
    }

    // Some firmwares answer unknown commands with this instead of ERROR.
    if status == "COMMAND NOT SUPPORT" {
        return Outcome::Failed(ModemError::Command {
            command: command.to_string(),
            detail: status.clone(),
        });
    }

    Outcome::Success
}

/// The transport plus the delay state that must change atomically with it.
struct Channel<T> {
    transport: T,
    /// Pause after every write; grows while the modem reports busy.
    write_wait: Duration,
}

/// An open modem. At most one per physical device.
pub struct Modem<T> {
    channel: Mutex<Channel<T>>,
    timeout: Duration,
    max_busy_retries: u32,
}

impl<T: Transport> Modem<T> {
    pub fn new(transport: T) -> Self {
        Modem {
            channel: Mutex::new(Channel {
                transport,
                write_wait: Duration::ZERO,
            }),
            timeout: DEFAULT_TIMEOUT,
            max_busy_retries: DEFAULT_MAX_BUSY_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_busy_retries(mut self, retries: u32) -> Self {
        self.max_busy_retries = retries;
        self
    }

    /// Wrap `transport` and switch local echo off.
    pub async fn open(transport: T) -> Result<Self, ModemError> {
        let modem = Self::new(transport);
        modem.disable_echo().await?;
        Ok(modem)
    }

    /// Current pause inserted after each command.
    pub async fn inter_command_delay(&self) -> Duration {
        self.channel.lock().await.write_wait
    }

    /// Execute with default options.
    pub async fn execute(&self, command: &str) -> Result<Vec<String>, ModemError> {
        self.execute_with(
            command,
            CommandOptions {
                timeout: self.timeout,
                ..CommandOptions::default()
            },
        )
        .await
    }

    pub async fn execute_with(
        &self,
        command: &str,
        opts: CommandOptions,
    ) -> Result<Vec<String>, ModemError> {
        let mut ch = self.channel.lock().await;

        if !opts.expect_response {
            ch.transport.write_line(command).await?;
            pause(ch.write_wait).await;
            return Ok(Vec::new());
        }

        let mut first_busy: Option<u16> = None;
        let mut busy_replies = 0u32;

        loop {
            let lines = ch.transport.send(command, opts.timeout).await?;
            pause(ch.write_wait).await;

            if !opts.parse_error {
                return Ok(lines);
            }

            match classify(command, &lines) {
                Outcome::Success => {
                    if let Some(code) = first_busy {
                        ch.write_wait = if code == CME_PROCESSING {
                            SLOW_MODEM_DELAY
                        } else {
                            Duration::ZERO
                        };
                        tracing::debug!(
                            command,
                            busy_replies,
                            write_wait_ms = ch.write_wait.as_millis() as u64,
                            "recovered from busy modem"
                        );
                    }
                    return Ok(lines);
                }
                Outcome::Busy(category, code) => {
                    busy_replies += 1;
                    if busy_replies > self.max_busy_retries {
                        tracing::warn!(command, code, busy_replies, "modem stayed busy, giving up");
                        return Err(ModemError::Device {
                            command: command.to_string(),
                            category,
                            code,
                        });
                    }
                    first_busy.get_or_insert(code);
                    ch.write_wait += BUSY_BACKOFF_STEP;
                    tracing::debug!(
                        command,
                        code,
                        write_wait_ms = ch.write_wait.as_millis() as u64,
                        "device/SIM busy, retrying"
                    );
                    pause(ch.write_wait).await;
                }
                Outcome::Failed(err) => return Err(err),
            }
        }
    }

    // ─── SIM ────────────────────────────────────────────────────────────

    pub async fn disable_echo(&self) -> Result<(), ModemError> {
        self.execute("ATE0").await.map(drop)
    }

    pub async fn sim_unlocked(&self) -> Result<bool, ModemError> {
        let lines = self.execute("AT+CPIN?").await?;
        Ok(lines.first().is_some_and(|l| l == "+CPIN: READY"))
    }

    /// Enter `pin` if the SIM is locked. Returns whether a PIN was sent.
    pub async fn unlock_sim(&self, pin: Option<&str>) -> Result<bool, ModemError> {
        if self.sim_unlocked().await? {
            return Ok(false);
        }
        let Some(pin) = pin else {
            return Err(ModemError::PinRequired);
        };
        self.execute(&format!("AT+CPIN=\"{pin}\"")).await?;
        Ok(true)
    }

    // ─── Radio ──────────────────────────────────────────────────────────

    /// Technology in use; `None` when not attached or not reported.
    pub async fn acquired_technology(&self) -> Result<RadioTechnology, ModemError> {
        match self.execute("AT*ERINFO?").await {
            Ok(lines) => Ok(line_matching(&ERINFO, &lines)
                .map(|caps| RadioTechnology::from_erinfo(&caps[1]))
                .unwrap_or_default()),
            Err(e) if is_command_failure(&e) => Ok(RadioTechnology::None),
            Err(e) => Err(e),
        }
    }

    pub async fn requested_mode(&self) -> Result<Option<RequestedMode>, ModemError> {
        let lines = self.execute("AT+CFUN?").await?;
        Ok(value_after("+CFUN:", &lines)
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(RequestedMode::from_cfun_code))
    }

    /// Issue `AT+CFUN`. Does not read the level back.
    pub async fn set_requested_mode(&self, mode: RequestedMode) -> Result<(), ModemError> {
        let code = mode.cfun_code().ok_or(ModemError::InvalidMode(mode))?;
        self.execute(&format!("AT+CFUN={code}")).await.map(drop)
    }

    pub async fn signal_level(&self) -> Result<Option<SignalLevel>, ModemError> {
        let lines = self.execute("AT+CIND?").await?;
        Ok(value_after("+CIND:", &lines).and_then(parse_cind_signal))
    }

    /// RSSI in dBm from `AT+CSQ`. Only meaningful on GSM/GPRS.
    pub async fn signal_quality(&self) -> Result<Option<i32>, ModemError> {
        let lines = self.execute("AT+CSQ").await?;
        Ok(value_after("+CSQ:", &lines).and_then(parse_csq_rssi))
    }

    pub async fn network_name(&self) -> Result<Option<String>, ModemError> {
        let lines = self.execute("AT+COPS?").await?;
        Ok(line_matching(&COPS, &lines).map(|caps| caps[3].to_string()))
    }

    pub async fn registration(&self) -> Result<Option<RegistrationStatus>, ModemError> {
        match self.execute("AT+CREG?").await {
            Ok(lines) => Ok(line_matching(&CREG, &lines)
                .and_then(|caps| caps[2].parse::<u8>().ok())
                .and_then(RegistrationStatus::from_creg_stat)),
            Err(e) if is_command_failure(&e) => Ok(Some(RegistrationStatus::NotSearching)),
            Err(e) => Err(e),
        }
    }

    // ─── Packet data ────────────────────────────────────────────────────

    pub async fn pdp_context(&self) -> Result<Option<PdpContext>, ModemError> {
        let lines = self.execute("AT+CGDCONT?").await?;
        Ok(line_matching(&CGDCONT, &lines).and_then(|caps| {
            Some(PdpContext {
                ip_version: IpVersion::from_pdp_type(&caps[2])?,
                apn: caps[3].to_string(),
            })
        }))
    }

    pub async fn apn(&self) -> Result<Option<String>, ModemError> {
        Ok(self.pdp_context().await?.map(|ctx| ctx.apn))
    }

    pub async fn ip_version(&self) -> Result<Option<IpVersion>, ModemError> {
        Ok(self.pdp_context().await?.map(|ctx| ctx.ip_version))
    }

    /// `AT+CGDCONT` writes APN and PDP type together, so the current IP
    /// version is read back and written unchanged.
    pub async fn set_apn(&self, apn: &str) -> Result<(), ModemError> {
        let ip_version = self.ip_version().await?.unwrap_or_default();
        self.write_pdp_context(ip_version, apn).await
    }

    /// Counterpart of [`Modem::set_apn`]: keeps the current APN.
    pub async fn set_ip_version(&self, ip_version: IpVersion) -> Result<(), ModemError> {
        let apn = self.apn().await?.unwrap_or_default();
        self.write_pdp_context(ip_version, &apn).await
    }

    async fn write_pdp_context(&self, ip_version: IpVersion, apn: &str) -> Result<(), ModemError> {
        self.execute(&format!(
            "AT+CGDCONT=1,\"{}\",\"{}\"",
            ip_version.pdp_type(),
            apn
        ))
        .await
        .map(drop)
    }

    pub async fn session_active(&self) -> Result<bool, ModemError> {
        match self.execute("AT*ENAP?").await {
            Ok(lines) => Ok(value_after("*ENAP:", &lines) == Some("1")),
            Err(e) if is_command_failure(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_session_active(&self, active: bool) -> Result<(), ModemError> {
        let cmd = if active { "AT*ENAP=1,1" } else { "AT*ENAP=0" };
        self.execute(cmd).await.map(drop)
    }

    // ─── GPS / identity ─────────────────────────────────────────────────

    pub async fn gps_enabled(&self) -> Result<bool, ModemError> {
        let lines = self.execute("AT*E2GPSCTL?").await?;
        Ok(value_after("*E2GPSCTL:", &lines) == Some("1,1,1"))
    }

    /// Requires the radio to be on (mode other than `Off`).
    pub async fn set_gps(&self, enabled: bool) -> Result<(), ModemError> {
        let args = if enabled { "1,1,1" } else { "0,1,0" };
        self.execute(&format!("AT*E2GPSCTL={args}")).await.map(drop)
    }

    pub async fn identity(&self) -> Result<ModemIdentity, ModemError> {
        let manufacturer = self.info_line("AT+CGMI").await?;
        let model = self.info_line("AT+CGMM").await?;
        let revision = self.optional_info_line("AT+CGMR").await?;
        let imei = self.info_line("AT+CGSN").await?;
        let imsi = self.optional_info_line("AT+CIMI").await?;
        Ok(ModemIdentity {
            manufacturer,
            model,
            revision,
            imei,
            imsi,
        })
    }

    async fn info_line(&self, command: &str) -> Result<String, ModemError> {
        let lines = self.execute(command).await?;
        lines
            .iter()
            .find(|l| !crate::transport::is_final_line(l))
            .cloned()
            .ok_or_else(|| ModemError::Command {
                command: command.to_string(),
                detail: "empty response".into(),
            })
    }

    async fn optional_info_line(&self, command: &str) -> Result<Option<String>, ModemError> {
        match self.info_line(command).await {
            Ok(line) => Ok(Some(line)),
            Err(e) if is_command_failure(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn pause(wait: Duration) {
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

fn is_command_failure(err: &ModemError) -> bool {
    matches!(err, ModemError::Command { .. } | ModemError::Device { .. })
}

fn line_matching<'a>(re: &Regex, lines: &'a [String]) -> Option<Captures<'a>> {
    lines.iter().find_map(|l| re.captures(l))
}

/// Trimmed text after `prefix` on the first line that starts with it.
fn value_after<'a>(prefix: &str, lines: &'a [String]) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|l| l.strip_prefix(prefix))
        .map(str::trim)
}

/// Second `+CIND` field is the signal indicator.
fn parse_cind_signal(fields: &str) -> Option<SignalLevel> {
    fields
        .split(',')
        .nth(1)
        .and_then(|f| f.trim().trim_matches('"').parse::<u8>().ok())
        .map(SignalLevel::new)
}

fn parse_csq_rssi(fields: &str) -> Option<i32> {
    let csq: i32 = fields.split(',').next()?.trim().parse().ok()?;
    if !(0..=31).contains(&csq) {
        return None;
    }
    Some(-113 + csq * 2)
}
