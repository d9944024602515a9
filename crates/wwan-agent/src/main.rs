//! WWAN Agent
//!
//! Brings a cellular modem up and keeps the connection alive.
//!
//! - `up`: unlock the SIM, register, start the packet session and DHCP,
//!   then supervise carrier/IP and report status as JSON lines until
//!   SIGINT/SIGTERM
//! - `down`: tear the connection down and engage radio-kill
//! - `status`: print what the modem and the interface report
//! - `radio <mode>`: change the radio functionality level
//! - In `--simulate` mode, drives a simulated modem and host for local dev

mod printer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use wwan_modem::config::UsbId;
use wwan_modem::sim::{SimModem, SimOpener, SimSystem};
use wwan_modem::sink::LogSink;
use wwan_modem::system::{LinuxSystem, System};
use wwan_modem::transport::{PortOpener, SerialOpener};
use wwan_modem::{
    ConnectivityController, ControlCommand, IpVersion, NotificationSink, RequestedMode, WwanConfig,
};

/// WWAN connection agent.
#[derive(Parser, Debug)]
#[command(name = "wwan-agent", about = "WWAN modem connection agent")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, default_value = "/etc/wwan.json")]
    config: PathBuf,

    /// Run against a simulated modem and host.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Bring the connection up and supervise it.
    Up {
        /// Radio mode to request instead of the configured one.
        #[arg(long)]
        mode: Option<RequestedMode>,
    },
    /// Tear the connection down.
    Down,
    /// Print modem and interface status as JSON.
    Status,
    /// Set the radio mode (prefer_umts, force_gprs, force_umts, off).
    Radio { mode: RequestedMode },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    if let Command::Up { mode: Some(mode) } = &cli.command {
        config.mode = *mode;
        config.validate()?;
    }

    tracing::info!(
        iface = %config.wwan_interface,
        usbid = %config.usbid,
        simulate = cli.simulate,
        "wwan-agent starting"
    );

    let sink: Arc<dyn NotificationSink> = match cli.command {
        Command::Up { .. } => Arc::new(printer::JsonPrinter),
        _ => Arc::new(LogSink),
    };

    if cli.simulate {
        let mut modem = SimModem::new().with_registration_delay(4);
        if let Some(pin) = &config.pin {
            modem = modem.with_pin(pin);
        }
        let ctl = ConnectivityController::new(config, SimSystem::new(), SimOpener::new(modem), sink);
        execute(cli.command, ctl).await
    } else {
        let system = LinuxSystem::new(&config);
        let opener = SerialOpener::new(config.baud_rate);
        let ctl = ConnectivityController::new(config, system, opener, sink);
        execute(cli.command, ctl).await
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<WwanConfig> {
    if cli.simulate && !cli.config.exists() {
        tracing::info!(path = %cli.config.display(), "no config file, using simulation defaults");
        let usbid: UsbId = "0bdb:1900".parse()?;
        return Ok(WwanConfig::new("wwan0", IpVersion::V4, "internet", usbid));
    }
    WwanConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))
}

async fn execute<S: System, O: PortOpener>(
    command: Command,
    mut ctl: ConnectivityController<S, O>,
) -> anyhow::Result<()> {
    match command {
        Command::Up { .. } => up(ctl).await,
        Command::Down => {
            ctl.disable().await.context("disable")?;
            tracing::info!("WWAN down");
            Ok(())
        }
        Command::Status => {
            let report = ctl.status().await.context("querying modem")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Radio { mode } => {
            match mode {
                RequestedMode::Off => ctl.disable().await.context("disable")?,
                mode => ctl.apply_radio(mode).await.context("setting radio mode")?,
            }
            tracing::info!(%mode, "radio mode set");
            Ok(())
        }
    }
}

async fn up<S: System, O: PortOpener>(mut ctl: ConnectivityController<S, O>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    tokio::spawn(read_operator_commands(cmd_tx));

    let mut interrupted = shutdown_rx.clone();
    tokio::select! {
        result = ctl.enable() => {
            if let Err(e) = result {
                tracing::error!(error = %e, phase = %ctl.phase(), "bring-up failed");
                if let Err(e) = ctl.disable().await {
                    tracing::warn!(error = %e, "cleanup after failed bring-up incomplete");
                }
                return Err(e).context("bringing WWAN up");
            }
        }
        _ = interrupted.changed() => {
            tracing::info!(phase = %ctl.phase(), "interrupted during bring-up");
            ctl.disable().await.context("disable")?;
            return Ok(());
        }
    }

    tracing::info!("WWAN up, supervising");
    ctl.run(cmd_rx, shutdown_rx).await.context("shutdown")?;
    tracing::info!("wwan-agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                    _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received SIGINT, shutting down");
}

/// Operator commands on stdin, one per line: `restart` or `radio <mode>`.
async fn read_operator_commands(tx: mpsc::Sender<ControlCommand>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_operator_command(&line) {
            Ok(Some(cmd)) => {
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(input = %line.trim(), "{e}"),
        }
    }
}

fn parse_operator_command(line: &str) -> Result<Option<ControlCommand>, String> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (None, _, _) => Ok(None),
        (Some("restart"), None, _) => Ok(Some(ControlCommand::Restart)),
        (Some("radio"), Some(mode), None) => Ok(Some(ControlCommand::SetRadio(mode.parse()?))),
        _ => Err("expected `restart` or `radio <mode>`".into()),
    }
}
