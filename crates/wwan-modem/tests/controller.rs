//! End-to-end controller behaviour against the simulated modem and host.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use wwan_modem::control::StatusReport;
use wwan_modem::sim::{SimModem, SimOpener, SimSystem};
use wwan_modem::sink::{ChannelSink, SinkEvent};
use wwan_modem::state::ModemState;
use wwan_modem::system::System;
use wwan_modem::watchdog::RestartReason;
use wwan_modem::{
    ConnectivityController, ControlCommand, ControlError, IpVersion, Modem, ModemError, Phase,
    RadioTechnology, RequestedMode, WwanConfig,
};

type Controller = ConnectivityController<SimSystem, SimOpener>;

fn config(pin: Option<&str>) -> WwanConfig {
    let mut cfg = WwanConfig::new("wwan0", IpVersion::V4, "internet", "0bdb:1900".parse().unwrap());
    cfg.pin = pin.map(String::from);
    cfg
}

fn setup(
    cfg: WwanConfig,
    modem: &SimModem,
) -> (Controller, SimSystem, mpsc::UnboundedReceiver<SinkEvent>) {
    let sys = SimSystem::new();
    let (sink, rx) = ChannelSink::new();
    let ctl = ConnectivityController::new(cfg, sys.clone(), SimOpener::new(modem.clone()), Arc::new(sink));
    (ctl, sys, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn restarts(events: &[SinkEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            SinkEvent::Restart(reason) => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

// ─── Bring-up ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enable_brings_connection_up() {
    let modem = SimModem::new().with_pin("1234").with_registration_delay(3);
    let (mut ctl, sys, _rx) = setup(config(Some("1234")), &modem);

    ctl.enable().await.expect("bring-up should succeed");

    assert!(ctl.is_enabled());
    assert_eq!(ctl.phase(), Phase::Enabled);
    assert!(modem.sim_unlocked());
    assert!(modem.session(), "packet session should be active");
    assert!(ctl.session_active().await.unwrap());
    assert_eq!(sys.dhcp_spawns(), 1, "DHCP client started once");
    assert_eq!(sys.dhcp_running(), 1);
    assert!(!sys.rfkill_blocked());
    assert_eq!(modem.pdp(), ("IP".to_string(), "internet".to_string()));
    assert_eq!(modem.cfun(), 1, "prefer UMTS by default");
    assert_eq!(ctl.snapshot().technology, RadioTechnology::Umts);

    ctl.disable().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn locked_sim_without_pin_fails() {
    let modem = SimModem::new().with_pin("1234");
    let (mut ctl, _sys, _rx) = setup(config(None), &modem);

    let err = ctl.enable().await.unwrap_err();
    assert!(
        matches!(err, ControlError::Modem(ModemError::PinRequired)),
        "got {err:?}"
    );
    assert_eq!(modem.count("AT+CPIN=\""), 0, "no PIN must be sent");
}

#[tokio::test(start_paused = true)]
async fn wrong_pin_is_not_retried() {
    let modem = SimModem::new().with_pin("9999");
    let (mut ctl, _sys, _rx) = setup(config(Some("1234")), &modem);

    let err = ctl.enable().await.unwrap_err();
    match err {
        ControlError::PinRejected(inner) => assert_eq!(inner.cme_code(), Some(16)),
        other => panic!("expected PinRejected, got {other:?}"),
    }
    assert_eq!(modem.count("AT+CPIN=\""), 1, "exactly one PIN attempt");
    assert!(!modem.sim_unlocked());
}

#[tokio::test(start_paused = true)]
async fn busy_modem_is_transparent_to_bring_up() {
    let modem = SimModem::new();
    modem.inject_busy(515, 2);
    let (mut ctl, _sys, _rx) = setup(config(None), &modem);

    ctl.enable().await.unwrap();
    assert!(ctl.is_enabled());
    // ATE0 answered busy twice before succeeding.
    assert_eq!(modem.count("ATE0"), 3);
    ctl.disable().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unlock_retries_on_timeout() {
    let modem = SimModem::new().with_pin("1234");
    let (mut ctl, _sys, _rx) = setup(config(Some("1234")), &modem);

    modem.mute("AT+CPIN?", 2);

    ctl.enable().await.unwrap();
    assert_eq!(modem.count("AT+CPIN?"), 3, "CPIN query retried after timeouts");
    assert!(modem.sim_unlocked());
    ctl.disable().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn apn_and_ip_version_are_written_together() {
    let modem = SimModem::new();
    let mut cfg = config(None);
    cfg.ipver = IpVersion::V6;
    cfg.apn = "web.apn".into();
    let (mut ctl, sys, _rx) = setup(cfg, &modem);
    sys.set_lease(Some("2001:db8::10".parse().unwrap()));

    ctl.enable().await.unwrap();
    assert_eq!(modem.pdp(), ("IPV6".to_string(), "web.apn".to_string()));
    assert_eq!(modem.count("AT+CGDCONT="), 2, "APN write then IP version write");
    ctl.disable().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn forced_mode_is_requested() {
    let modem = SimModem::new();
    let mut cfg = config(None);
    cfg.mode = RequestedMode::ForceGprs;
    let (mut ctl, _sys, _rx) = setup(cfg, &modem);
    modem.set_erinfo("0,2,0");

    ctl.enable().await.unwrap();
    assert_eq!(modem.cfun(), 5);
    assert_eq!(ctl.snapshot().technology, RadioTechnology::Edge);
    ctl.disable().await.unwrap();
}

// ─── Teardown / restart ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disable_runs_every_step_even_when_modem_fails() {
    let modem = SimModem::new();
    let (mut ctl, sys, _rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();

    modem.set_unplugged(true);
    let err = ctl.disable().await.unwrap_err();
    assert!(matches!(err, ControlError::Modem(ref e) if e.is_device_lost()), "got {err:?}");

    assert_eq!(ctl.phase(), Phase::Disabled);
    assert_eq!(sys.dhcp_running(), 0, "DHCP client stopped");
    assert!(sys.rfkill_blocked(), "radio-kill engaged");
    assert_eq!(ctl.requested_mode(), RequestedMode::Off);
}

#[tokio::test(start_paused = true)]
async fn disable_switches_radio_off() {
    let modem = SimModem::new();
    let (mut ctl, sys, _rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    ctl.disable().await.unwrap();

    assert_eq!(modem.cfun(), 4);
    assert!(!modem.session());
    assert!(sys.rfkill_blocked());
}

#[tokio::test(start_paused = true)]
async fn restart_cycles_session_and_dhcp_only() {
    let modem = SimModem::new().with_pin("1234");
    let (mut ctl, sys, mut rx) = setup(config(Some("1234")), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let pin_writes = modem.count("AT+CPIN=");
    let cfun_writes = modem.count("AT+CFUN=");

    ctl.restart(RestartReason::Requested).await.unwrap();

    assert_eq!(modem.count("AT+CPIN="), pin_writes, "SIM not unlocked again");
    assert_eq!(modem.count("AT+CFUN="), cfun_writes, "radio not renegotiated");
    assert_eq!(modem.count("AT*ENAP=0"), 1);
    assert_eq!(modem.count("AT*ENAP=1,1"), 2);
    assert!(modem.session());
    assert_eq!(sys.dhcp_spawns(), 2);
    assert_eq!(sys.dhcp_running(), 1, "old client terminated");
    assert_eq!(restarts(&drain(&mut rx)), ["requested"]);
    ctl.disable().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_controller_stops_dhcp() {
    let modem = SimModem::new();
    let (mut ctl, sys, _rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    assert_eq!(sys.dhcp_running(), 1);
    drop(ctl);
    assert_eq!(sys.dhcp_running(), 0);
}

// ─── Supervision ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn carrier_loss_triggers_exactly_one_restart_per_tick() {
    let modem = SimModem::new();
    let (mut ctl, sys, mut rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let (_cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        sys.set_carrier(false);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let first = restarts(&drain(&mut rx));
        sys.set_carrier(true);
        stop_tx.send(true).unwrap();
        first
    };

    let (result, first) = tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();
    assert_eq!(first, ["no carrier"]);
    assert_eq!(ctl.phase(), Phase::Disabled);
}

#[tokio::test(start_paused = true)]
async fn address_loss_after_assignment_triggers_restart() {
    let modem = SimModem::new();
    let (mut ctl, sys, mut rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let (_cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        // Let the watchdog see the address first.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(restarts(&drain(&mut rx)).is_empty());

        sys.set_address(None);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let seen = restarts(&drain(&mut rx));
        stop_tx.send(true).unwrap();
        seen
    };

    let (result, seen) = tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();
    assert_eq!(seen, ["IP address lost"]);
    assert_eq!(sys.dhcp_spawns(), 2, "restart relaunched DHCP");
}

#[tokio::test(start_paused = true)]
async fn failed_restart_is_retried_until_dhcp_runs_again() {
    let modem = SimModem::new();
    let (mut ctl, sys, mut rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let (_cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        modem.fail_commands("AT*ENAP=1");
        sys.set_address(None);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let failed = restarts(&drain(&mut rx));
        let running_while_failing = sys.dhcp_running();

        modem.clear_failures();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let recovered = restarts(&drain(&mut rx));
        let running_after = sys.dhcp_running();
        let address = sys.ip_address("wwan0", IpVersion::V4);

        // Address is back: the watchdog goes quiet.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let later = restarts(&drain(&mut rx));
        stop_tx.send(true).unwrap();
        (failed, running_while_failing, recovered, running_after, address, later)
    };

    let (result, (failed, running_while_failing, recovered, running_after, address, later)) =
        tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();
    assert!(failed.len() >= 2, "failed restart asked for again: {failed:?}");
    assert!(failed.iter().all(|r| r == "IP address lost"));
    assert_eq!(running_while_failing, 0);
    assert_eq!(recovered, ["IP address lost"]);
    assert_eq!(running_after, 1);
    assert!(address.is_some());
    assert!(later.is_empty(), "{later:?}");
}

#[tokio::test(start_paused = true)]
async fn operator_restart_clears_seen_address() {
    let modem = SimModem::new();
    let (mut ctl, sys, mut rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        // The new client will not get a lease for a while.
        sys.set_lease(None);
        cmd_tx.send(ControlCommand::Restart).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let seen = restarts(&drain(&mut rx));
        stop_tx.send(true).unwrap();
        seen
    };

    let (result, seen) = tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();
    assert_eq!(seen, ["requested"]);
    assert_eq!(sys.dhcp_spawns(), 2);
}

#[tokio::test(start_paused = true)]
async fn monitor_reopens_port_after_loss() {
    let modem = SimModem::new();
    let (mut ctl, _sys, mut rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();
    drain(&mut rx);

    let (_cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        // First tick is immediate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let polls = drain(&mut rx);
        assert!(matches!(polls.as_slice(), [SinkEvent::Poll(_), SinkEvent::StatusChanged(_)]));

        modem.set_unplugged(true);
        tokio::time::sleep(Duration::from_secs(8)).await;
        let during = drain(&mut rx);
        assert!(!during.is_empty(), "every cycle reports, even unplugged");
        for ev in &during {
            match ev {
                SinkEvent::Poll(snap) => {
                    assert_eq!(snap.radio, RequestedMode::Error);
                    assert_eq!(snap.network, None);
                }
                other => panic!("unexpected event while unplugged: {other:?}"),
            }
        }

        modem.set_unplugged(false);
        tokio::time::sleep(Duration::from_secs(4)).await;
        let after = drain(&mut rx);
        stop_tx.send(true).unwrap();
        after
    };

    let (result, after) = tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();

    let snap = after
        .iter()
        .find_map(|ev| match ev {
            SinkEvent::StatusChanged(s) => Some(s.clone()),
            _ => None,
        })
        .expect("status re-announced after reopen");
    assert_eq!(snap.summary(), "SimNet (3G)");
    assert_eq!(modem.count("ATE0"), 2, "port reopened once");
}

#[tokio::test(start_paused = true)]
async fn operator_can_switch_radio_off_through_run_loop() {
    let modem = SimModem::new();
    let (mut ctl, sys, _rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();

    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        cmd_tx.send(ControlCommand::SetRadio(RequestedMode::Off)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let blocked = sys.rfkill_blocked();
        stop_tx.send(true).unwrap();
        blocked
    };

    let (result, blocked) = tokio::join!(ctl.run(cmd_rx, stop_rx), driver);
    result.unwrap();
    assert!(blocked);
    assert_eq!(modem.cfun(), 4);
}

#[tokio::test(start_paused = true)]
async fn status_report_after_bring_up() {
    let modem = SimModem::new();
    let (mut ctl, _sys, _rx) = setup(config(None), &modem);
    ctl.enable().await.unwrap();

    let report: StatusReport = ctl.status().await.unwrap();
    assert_eq!(report.phase, Phase::Enabled);
    assert_eq!(report.summary, "SimNet (3G)");
    assert!(report.session_active);
    assert!(report.carrier);
    assert!(report.address.is_some());
    assert_eq!(report.signal_dbm, Some(-73));
    assert_eq!(report.identity.unwrap().model, "F3507g");
    ctl.disable().await.unwrap();
}

// ─── Protocol over the simulated modem ──────────────────────────────────

#[tokio::test]
async fn requested_mode_round_trip() {
    let modem = Modem::new(SimModem::new());
    for mode in [
        RequestedMode::PreferUmts,
        RequestedMode::ForceGprs,
        RequestedMode::ForceUmts,
        RequestedMode::Off,
    ] {
        modem.set_requested_mode(mode).await.unwrap();
        assert_eq!(modem.requested_mode().await.unwrap(), Some(mode));
    }
}

#[tokio::test]
async fn signal_updates_are_edge_triggered() {
    let sim = SimModem::new();
    let modem = Modem::new(sim.clone());
    let mut state = ModemState::new();

    sim.set_signal(3);
    assert!(state.update_signal(&modem).await.unwrap());
    assert!(!state.update_signal(&modem).await.unwrap());
    sim.set_signal(1);
    assert!(state.update_signal(&modem).await.unwrap());
    assert_eq!(state.signal().bars(), 1);
}

#[tokio::test]
async fn network_and_type_follow_registration() {
    let sim = SimModem::new();
    let modem = Modem::new(sim.clone());
    let mut state = ModemState::new();

    assert!(!state.update_network(&modem).await.unwrap(), "searching while radio off");
    modem.set_requested_mode(RequestedMode::PreferUmts).await.unwrap();
    assert!(state.update_network(&modem).await.unwrap());
    assert_eq!(state.network(), Some("SimNet"));
    assert!(state.update_type(&modem).await.unwrap());
    assert_eq!(state.technology(), RadioTechnology::Umts);

    sim.set_erinfo("0,0,2");
    assert!(state.update_type(&modem).await.unwrap());
    assert!(!state.update_network(&modem).await.unwrap());
}
