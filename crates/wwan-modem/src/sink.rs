//! Notification boundary between the controller and status consumers.

use tokio::sync::mpsc;

use crate::control::Phase;
use crate::types::StatusSnapshot;

/// Receives status from the controller. Calls are made from the controller
/// task and must not block.
pub trait NotificationSink: Send + Sync {
    /// Every monitor cycle.
    fn on_poll(&self, snapshot: &StatusSnapshot);

    /// Network name or radio technology changed.
    fn on_status_changed(&self, snapshot: &StatusSnapshot);

    fn on_phase(&self, _phase: Phase) {}

    fn on_restart(&self, _reason: &str) {}
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn on_poll(&self, snapshot: &StatusSnapshot) {
        tracing::debug!(
            radio = %snapshot.radio,
            network = snapshot.network.as_deref().unwrap_or("-"),
            technology = %snapshot.technology,
            signal = snapshot.signal.bars(),
            "poll"
        );
    }

    fn on_status_changed(&self, snapshot: &StatusSnapshot) {
        tracing::info!(status = %snapshot.summary(), signal = %snapshot.signal, "status changed");
    }

    fn on_phase(&self, phase: Phase) {
        tracing::info!(%phase, "bring-up");
    }

    fn on_restart(&self, reason: &str) {
        tracing::warn!(reason, "restarting connection");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Poll(StatusSnapshot),
    StatusChanged(StatusSnapshot),
    Phase(Phase),
    Restart(String),
}

/// Forwards events into an unbounded channel. Events are dropped once the
/// receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        let _ = self.tx.send(event);
    }
}

impl NotificationSink for ChannelSink {
    fn on_poll(&self, snapshot: &StatusSnapshot) {
        self.forward(SinkEvent::Poll(snapshot.clone()));
    }

    fn on_status_changed(&self, snapshot: &StatusSnapshot) {
        self.forward(SinkEvent::StatusChanged(snapshot.clone()));
    }

    fn on_phase(&self, phase: Phase) {
        self.forward(SinkEvent::Phase(phase));
    }

    fn on_restart(&self, reason: &str) {
        self.forward(SinkEvent::Restart(reason.to_string()));
    }
}
