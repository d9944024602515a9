//! JSON-lines status printer.

use std::io::Write;

use serde::Serialize;
use wwan_modem::{NotificationSink, Phase, StatusSnapshot};

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Poll {
        #[serde(flatten)]
        snapshot: &'a StatusSnapshot,
        summary: String,
    },
    StatusChanged {
        #[serde(flatten)]
        snapshot: &'a StatusSnapshot,
        summary: String,
    },
    Phase {
        phase: Phase,
    },
    Restart {
        reason: &'a str,
    },
}

/// Writes one JSON object per event to stdout, for the tray or any other
/// consumer reading the agent's output.
#[derive(Debug, Default)]
pub struct JsonPrinter;

impl JsonPrinter {
    fn emit(&self, line: &Line<'_>) {
        let mut out = std::io::stdout().lock();
        let written = serde_json::to_writer(&mut out, line)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            tracing::debug!(error = %e, "status line dropped");
        }
    }
}

impl NotificationSink for JsonPrinter {
    fn on_poll(&self, snapshot: &StatusSnapshot) {
        self.emit(&Line::Poll {
            snapshot,
            summary: snapshot.summary(),
        });
    }

    fn on_status_changed(&self, snapshot: &StatusSnapshot) {
        self.emit(&Line::StatusChanged {
            snapshot,
            summary: snapshot.summary(),
        });
    }

    fn on_phase(&self, phase: Phase) {
        self.emit(&Line::Phase { phase });
    }

    fn on_restart(&self, reason: &str) {
        self.emit(&Line::Restart { reason });
    }
}
