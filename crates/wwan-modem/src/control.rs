//! Connectivity controller.
//!
//! Owns the modem handle, the DHCP client and the watchdog. [`enable`]
//! walks the bring-up sequence:
//!
//! ```text
//! RfUnblock → AwaitDevicePresent → OpenModem → UnlockSim → ConfigureApn
//!   → RequestTechnology → AwaitRegistration → AwaitTechnologyAcquired
//!   → EstablishSession → StartDhcp → StartWatchdog → AwaitIpAssigned → Enabled
//! ```
//!
//! [`run`] then multiplexes the monitor tick, watchdog restart requests,
//! operator commands and shutdown until told to stop.
//!
//! [`enable`]: ConnectivityController::enable
//! [`run`]: ConnectivityController::run

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::WwanConfig;
use crate::error::{
    CME_INCORRECT_PASSWORD, CME_SIM_PIN_REQUIRED, CME_SIM_PUK_REQUIRED, ControlError, ModemError,
};
use crate::protocol::Modem;
use crate::sink::NotificationSink;
use crate::state::ModemState;
use crate::system::{DhcpProcess, System};
use crate::transport::PortOpener;
use crate::types::{
    ModemIdentity, RadioTechnology, RegistrationStatus, RequestedMode, StatusSnapshot,
};
use crate::watchdog::{RestartReason, RestartRequest, Watchdog, WatchdogHandle};

/// Bring-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disabled,
    RfUnblock,
    AwaitDevicePresent,
    OpenModem,
    UnlockSim,
    ConfigureApn,
    RequestTechnology,
    AwaitRegistration,
    AwaitTechnologyAcquired,
    EstablishSession,
    StartDhcp,
    StartWatchdog,
    AwaitIpAssigned,
    Enabled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disabled => "disabled",
            Phase::RfUnblock => "rf_unblock",
            Phase::AwaitDevicePresent => "await_device_present",
            Phase::OpenModem => "open_modem",
            Phase::UnlockSim => "unlock_sim",
            Phase::ConfigureApn => "configure_apn",
            Phase::RequestTechnology => "request_technology",
            Phase::AwaitRegistration => "await_registration",
            Phase::AwaitTechnologyAcquired => "await_technology_acquired",
            Phase::EstablishSession => "establish_session",
            Phase::StartDhcp => "start_dhcp",
            Phase::StartWatchdog => "start_watchdog",
            Phase::AwaitIpAssigned => "await_ip_assigned",
            Phase::Enabled => "enabled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator requests accepted by [`ConnectivityController::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetRadio(RequestedMode),
    Restart,
}

/// Everything `status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: Phase,
    pub requested: RequestedMode,
    pub snapshot: StatusSnapshot,
    pub summary: String,
    pub registration: RegistrationStatus,
    pub session_active: bool,
    pub signal_dbm: Option<i32>,
    pub carrier: bool,
    pub address: Option<IpAddr>,
    pub identity: Option<ModemIdentity>,
}

pub struct ConnectivityController<S: System, O: PortOpener> {
    config: WwanConfig,
    system: Arc<S>,
    opener: O,
    modem: Option<Modem<O::Transport>>,
    dhcp: Option<S::Dhcp>,
    watchdog: Option<WatchdogHandle>,
    restart_tx: mpsc::Sender<RestartRequest>,
    restart_rx: mpsc::Receiver<RestartRequest>,
    /// Incremented on every DHCP client start; the watchdog listens.
    dhcp_starts: watch::Sender<u64>,
    /// Last mode asked of the radio; `Off` while disabled.
    requested: RequestedMode,
    /// Mode `enable` brings the radio up in.
    preferred: RequestedMode,
    phase: Phase,
    state: ModemState,
    sink: Arc<dyn NotificationSink>,
}

impl<S: System, O: PortOpener> ConnectivityController<S, O> {
    pub fn new(config: WwanConfig, system: S, opener: O, sink: Arc<dyn NotificationSink>) -> Self {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (dhcp_starts, _) = watch::channel(0);
        let preferred = config.mode;
        ConnectivityController {
            config,
            system: Arc::new(system),
            opener,
            modem: None,
            dhcp: None,
            watchdog: None,
            restart_tx,
            restart_rx,
            dhcp_starts,
            requested: RequestedMode::Off,
            preferred,
            phase: Phase::Disabled,
            state: ModemState::new(),
            sink,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_enabled(&self) -> bool {
        self.phase == Phase::Enabled
    }

    pub fn requested_mode(&self) -> RequestedMode {
        self.requested
    }

    pub fn config(&self) -> &WwanConfig {
        &self.config
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.snapshot(self.requested)
    }

    /// Whether the modem reports an active packet session.
    pub async fn session_active(&self) -> Result<bool, ControlError> {
        Ok(self.modem()?.session_active().await?)
    }

    fn modem(&self) -> Result<&Modem<O::Transport>, ControlError> {
        self.modem.as_ref().ok_or(ControlError::NotOpen)
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
        self.sink.on_phase(phase);
    }

    // ─── Bring-up ───────────────────────────────────────────────────────

    /// Run the full bring-up. Returns once an address is assigned.
    pub async fn enable(&mut self) -> Result<(), ControlError> {
        if self.is_enabled() {
            return Ok(());
        }
        let poll = self.config.timings.poll_interval();
        self.requested = self.preferred;
        tracing::info!(iface = %self.config.wwan_interface, mode = %self.requested, "enabling WWAN");

        self.enter(Phase::RfUnblock);
        self.system
            .rfkill(false)
            .map_err(|e| ControlError::system("rfkill unblock", e))?;

        self.enter(Phase::AwaitDevicePresent);
        let port = loop {
            if self.system.usb_present(&self.config.usbid) {
                if let Some(port) = self.system.modem_port() {
                    break port;
                }
            }
            tokio::time::sleep(poll).await;
        };
        tracing::info!(port = %port.display(), usbid = %self.config.usbid, "modem present");

        self.enter(Phase::OpenModem);
        self.open_modem(port).await?;

        self.enter(Phase::UnlockSim);
        self.unlock_sim().await?;

        self.enter(Phase::ConfigureApn);
        let modem = self.modem()?;
        modem.set_apn(&self.config.apn).await?;
        modem.set_ip_version(self.config.ipver).await?;

        self.enter(Phase::RequestTechnology);
        self.modem()?.set_requested_mode(self.requested).await?;

        self.enter(Phase::AwaitRegistration);
        loop {
            let polled = self.modem()?.registration().await;
            match polled {
                Ok(Some(status)) if status.is_registered() => {
                    self.state.set_registration(status);
                    tracing::info!(%status, "registered");
                    break;
                }
                Ok(status) => tracing::debug!(?status, "waiting for registration"),
                Err(e) if e.is_transient() => tracing::debug!(error = %e, "registration poll failed"),
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(poll).await;
        }

        self.enter(Phase::AwaitTechnologyAcquired);
        loop {
            let polled = self.modem()?.acquired_technology().await;
            match polled {
                Ok(tech) if tech != RadioTechnology::None => {
                    self.state.set_technology(tech);
                    tracing::info!(technology = %tech, "radio technology acquired");
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => tracing::debug!(error = %e, "technology poll failed"),
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(poll).await;
        }

        self.enter(Phase::EstablishSession);
        self.modem()?.set_session_active(true).await?;

        self.enter(Phase::StartDhcp);
        self.start_dhcp()?;

        self.enter(Phase::StartWatchdog);
        self.start_watchdog().await;

        self.enter(Phase::AwaitIpAssigned);
        loop {
            if let Some(ip) = self
                .system
                .ip_address(&self.config.wwan_interface, self.config.ipver)
            {
                tracing::info!(iface = %self.config.wwan_interface, %ip, "address assigned");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                Some(req) = self.restart_rx.recv() => self.service_restart(req).await,
            }
        }

        self.enter(Phase::Enabled);
        Ok(())
    }

    async fn open_modem(&mut self, port: PathBuf) -> Result<(), ControlError> {
        self.modem = None;
        let transport = self.opener.open(&port).await?;
        let modem = Modem::new(transport)
            .with_timeout(self.config.timings.command_timeout())
            .with_max_busy_retries(self.config.timings.max_busy_retries);
        modem.disable_echo().await?;
        self.modem = Some(modem);
        Ok(())
    }

    /// Reopen the data port outside bring-up (monitor, status).
    async fn reopen(&mut self) -> Result<(), ControlError> {
        let port = self.system.modem_port().ok_or_else(|| {
            ControlError::Modem(ModemError::PortUnavailable {
                path: self
                    .config
                    .port
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| self.config.port_label.clone()),
                reason: "data port not found".into(),
            })
        })?;
        self.open_modem(port).await
    }

    async fn unlock_sim(&mut self) -> Result<(), ControlError> {
        let poll = self.config.timings.poll_interval();
        loop {
            match self.modem()?.unlock_sim(self.config.pin.as_deref()).await {
                Ok(true) => {
                    tracing::info!("SIM unlocked");
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(e) if is_pin_rejection(&e) => {
                    tracing::error!(error = %e, "SIM rejected the PIN, not retrying");
                    return Err(ControlError::PinRejected(e));
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "SIM unlock failed, retrying");
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn start_dhcp(&mut self) -> Result<(), ControlError> {
        if let Some(mut old) = self.dhcp.take() {
            old.terminate();
        }
        let dhcp = self
            .system
            .spawn_dhcp(&self.config.wwan_interface)
            .map_err(|e| ControlError::system("start DHCP client", e))?;
        self.dhcp = Some(dhcp);
        self.dhcp_starts.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn stop_dhcp(&mut self) {
        if let Some(mut dhcp) = self.dhcp.take() {
            // Terminating waits for the process to exit.
            if let Err(e) = tokio::task::spawn_blocking(move || dhcp.terminate()).await {
                tracing::warn!(error = %e, "DHCP client shutdown task failed");
            }
        }
    }

    async fn start_watchdog(&mut self) {
        self.stop_watchdog().await;
        let handle = Watchdog::new(
            self.system.clone(),
            &self.config.wwan_interface,
            self.config.ipver,
            self.config.timings.watchdog_interval(),
            self.restart_tx.clone(),
            self.dhcp_starts.subscribe(),
        )
        .spawn();
        self.watchdog = Some(handle);
    }

    async fn stop_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.stop().await;
        }
        // Requests from the stopped instance are stale.
        while self.restart_rx.try_recv().is_ok() {}
    }

    // ─── Teardown / restart ─────────────────────────────────────────────

    /// Tear everything down. Every step runs; the first failure is returned.
    pub async fn disable(&mut self) -> Result<(), ControlError> {
        tracing::info!(iface = %self.config.wwan_interface, "disabling WWAN");
        self.requested = RequestedMode::Off;
        let mut first_err: Option<ControlError> = None;

        self.stop_watchdog().await;
        self.stop_dhcp().await;

        if let Some(modem) = self.modem.take() {
            if let Err(e) = modem.set_session_active(false).await {
                tracing::warn!(error = %e, "failed to deactivate packet session");
                first_err.get_or_insert(e.into());
            }
            if let Err(e) = modem.set_requested_mode(RequestedMode::Off).await {
                tracing::warn!(error = %e, "failed to switch radio off");
                first_err.get_or_insert(e.into());
            }
        }
        self.state.reset();

        if let Err(e) = self.system.rfkill(true) {
            tracing::warn!(error = %e, "rfkill block failed");
            first_err.get_or_insert(ControlError::system("rfkill block", e));
        }

        self.enter(Phase::Disabled);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cycle the packet session and DHCP without redoing SIM or radio setup.
    ///
    /// Without an open modem nothing is touched. If the session cannot be
    /// reactivated DHCP stays stopped; the watchdog keeps the address it saw
    /// and asks again on its next tick.
    pub async fn restart(&mut self, reason: RestartReason) -> Result<(), ControlError> {
        tracing::warn!(%reason, "restarting connection");
        self.sink.on_restart(&reason.to_string());

        self.modem()?;
        self.stop_dhcp().await;
        let modem = self.modem()?;
        if let Err(e) = modem.set_session_active(false).await {
            tracing::debug!(error = %e, "session deactivation failed, continuing");
        }
        modem.set_session_active(true).await?;
        self.start_dhcp()
    }

    async fn service_restart(&mut self, req: RestartRequest) {
        if self.requested == RequestedMode::Off {
            tracing::debug!(reason = %req.reason, "ignoring restart request while disabled");
        } else if let Err(e) = self.restart(req.reason).await {
            tracing::warn!(error = %e, "restart failed");
        }
        let _ = req.done.send(());
    }

    /// Operator radio request: `Off` disables, leaving `Off` enables,
    /// anything else changes `+CFUN` on the live modem.
    pub async fn set_radio(&mut self, mode: RequestedMode) -> Result<(), ControlError> {
        match mode {
            RequestedMode::Error => Err(ModemError::InvalidMode(mode).into()),
            RequestedMode::Off => self.disable().await,
            mode => {
                self.preferred = mode;
                if self.requested == RequestedMode::Off {
                    return self.enable().await;
                }
                self.requested = mode;
                self.modem()?.set_requested_mode(mode).await?;
                tracing::info!(%mode, "radio mode changed");
                Ok(())
            }
        }
    }

    /// Write `+CFUN` directly, opening the port if needed. No bring-up.
    pub async fn apply_radio(&mut self, mode: RequestedMode) -> Result<(), ControlError> {
        if self.modem.is_none() {
            self.reopen().await?;
        }
        self.modem()?.set_requested_mode(mode).await?;
        Ok(())
    }

    // ─── Monitor ────────────────────────────────────────────────────────

    /// Supervise until `shutdown` flips, then disable.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<ControlCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControlError> {
        let mut tick = tokio::time::interval(self.config.timings.monitor_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.monitor_cycle().await,
                Some(req) = self.restart_rx.recv() => self.service_restart(req).await,
                Some(cmd) = commands.recv() => self.handle_command(cmd).await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("controller shutting down");
        self.disable().await
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        tracing::info!(?cmd, "operator command");
        let result = match cmd {
            ControlCommand::SetRadio(mode) => self.set_radio(mode).await,
            ControlCommand::Restart => self.restart(RestartReason::Requested).await,
        };
        if let Err(e) = result {
            tracing::warn!(?cmd, error = %e, "operator command failed");
        }
    }

    /// One monitor cycle: poll, notify, and drop the handle on failure.
    pub async fn monitor_cycle(&mut self) {
        if self.requested == RequestedMode::Off {
            self.sink.on_poll(&self.state.snapshot(RequestedMode::Off));
            return;
        }

        if self.modem.is_none() {
            if let Err(e) = self.reopen().await {
                tracing::debug!(error = %e, "modem not available");
                self.state.reset();
                self.sink.on_poll(&self.state.snapshot(RequestedMode::Error));
                return;
            }
            tracing::info!("modem port reopened");
        }

        match self.poll().await {
            Ok((snapshot, changed)) => {
                self.sink.on_poll(&snapshot);
                if changed {
                    self.sink.on_status_changed(&snapshot);
                }
            }
            Err(e) if is_link_failure(&e) => {
                tracing::warn!(error = %e, "lost contact with modem, will reopen");
                self.modem = None;
                self.state.reset();
                self.sink.on_poll(&self.state.snapshot(RequestedMode::Error));
            }
            Err(e) => {
                tracing::warn!(error = %e, "modem poll failed");
                self.sink.on_poll(&self.state.snapshot(RequestedMode::Error));
            }
        }
    }

    async fn poll(&mut self) -> Result<(StatusSnapshot, bool), ControlError> {
        let modem = self.modem.as_ref().ok_or(ControlError::NotOpen)?;
        self.state.update_signal(modem).await?;
        let changed = self.state.update_network(modem).await? | self.state.update_type(modem).await?;
        self.state.update_registration(modem).await?;
        let radio = modem
            .requested_mode()
            .await?
            .unwrap_or(RequestedMode::Error);
        Ok((self.state.snapshot(radio), changed))
    }

    /// Query everything the modem and host report, opening the port if
    /// needed.
    pub async fn status(&mut self) -> Result<StatusReport, ControlError> {
        if self.modem.is_none() {
            self.reopen().await?;
        }
        let result = self.collect_status().await;
        if let Err(ControlError::Modem(e)) = &result {
            if e.is_device_lost() {
                self.modem = None;
                self.state.reset();
            }
        }
        result
    }

    async fn collect_status(&mut self) -> Result<StatusReport, ControlError> {
        let (snapshot, _) = self.poll().await?;
        let modem = self.modem()?;
        let session_active = modem.session_active().await?;
        let signal_dbm = modem.signal_quality().await.ok().flatten();
        let identity = match modem.identity().await {
            Ok(id) => Some(id),
            Err(e) if e.is_transient() => None,
            Err(e) => return Err(e.into()),
        };
        let iface = &self.config.wwan_interface;
        Ok(StatusReport {
            phase: self.phase,
            requested: self.requested,
            summary: snapshot.summary(),
            snapshot,
            registration: self.state.registration(),
            session_active,
            signal_dbm,
            carrier: self.system.carrier(iface),
            address: self.system.ip_address(iface, self.config.ipver),
            identity,
        })
    }
}

/// Serial-level failures: the handle is unusable and must be reopened.
fn is_link_failure(err: &ControlError) -> bool {
    match err {
        ControlError::Modem(e) => e.is_device_lost() || matches!(e, ModemError::Timeout { .. }),
        ControlError::NotOpen => true,
        _ => false,
    }
}

fn is_pin_rejection(err: &ModemError) -> bool {
    matches!(
        err.cme_code(),
        Some(CME_INCORRECT_PASSWORD | CME_SIM_PIN_REQUIRED | CME_SIM_PUK_REQUIRED)
    )
}
