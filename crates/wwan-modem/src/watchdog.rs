//! Carrier/IP watchdog.
//!
//! Runs as its own task while the connection is enabled. Once per interval
//! it checks the interface: no carrier, or an address that was seen and is
//! now gone, produces a [`RestartRequest`] for the controller. The watchdog
//! waits for the controller to acknowledge each request before it looks
//! again, so restarts never stack.
//!
//! The "address seen" flag clears whenever the controller starts a DHCP
//! client, however that start came about. A restart that fails before DHCP
//! is started again leaves the flag set, so the next tick asks again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::system::System;
use crate::types::IpVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    NoCarrier,
    AddressLost,
    /// Operator asked for it.
    Requested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::NoCarrier => write!(f, "no carrier"),
            RestartReason::AddressLost => write!(f, "IP address lost"),
            RestartReason::Requested => write!(f, "requested"),
        }
    }
}

/// Sent to the controller; `done` is fired (or dropped) once the restart
/// has run.
#[derive(Debug)]
pub struct RestartRequest {
    pub reason: RestartReason,
    pub done: oneshot::Sender<()>,
}

pub struct Watchdog<S> {
    system: Arc<S>,
    iface: String,
    ip_version: IpVersion,
    interval: Duration,
    requests: mpsc::Sender<RestartRequest>,
    /// Bumped by the controller on every DHCP client start.
    dhcp_starts: watch::Receiver<u64>,
    ip_seen: bool,
}

impl<S: System> Watchdog<S> {
    pub fn new(
        system: Arc<S>,
        iface: &str,
        ip_version: IpVersion,
        interval: Duration,
        requests: mpsc::Sender<RestartRequest>,
        dhcp_starts: watch::Receiver<u64>,
    ) -> Self {
        Watchdog {
            system,
            iface: iface.to_string(),
            ip_version,
            interval,
            requests,
            dhcp_starts,
            ip_seen: false,
        }
    }

    pub fn spawn(self) -> WatchdogHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        WatchdogHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }

    /// One inspection. Updates the "address seen" flag.
    fn check(&mut self) -> Option<RestartReason> {
        if self.dhcp_starts.has_changed().unwrap_or(false) {
            self.dhcp_starts.borrow_and_update();
            self.ip_seen = false;
        }
        if !self.system.carrier(&self.iface) {
            return Some(RestartReason::NoCarrier);
        }
        if self.system.ip_address(&self.iface, self.ip_version).is_some() {
            self.ip_seen = true;
            None
        } else if self.ip_seen {
            Some(RestartReason::AddressLost)
        } else {
            None
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        tracing::debug!(iface = %self.iface, "watchdog started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            let Some(reason) = self.check() else {
                continue;
            };

            tracing::warn!(iface = %self.iface, %reason, "watchdog requesting restart");
            let (done_tx, done_rx) = oneshot::channel();
            let request = RestartRequest {
                reason,
                done: done_tx,
            };
            if self.requests.send(request).await.is_err() {
                break;
            }
            tokio::select! {
                _ = done_rx => {}
                _ = stop.changed() => break,
            }
        }
        tracing::debug!(iface = %self.iface, "watchdog stopped");
    }
}

/// Owner of a running watchdog task. Dropping the handle aborts the task.
pub struct WatchdogHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Signal the task and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
