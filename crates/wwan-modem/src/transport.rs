//! Half-duplex line transport for AT commands.
//!
//! One command line goes out (CR/LF terminated), then response lines are
//! collected until a final status line (`OK`, `ERROR`, `+CME ERROR: n`, …)
//! arrives or the deadline passes. Command echo, blank lines and unsolicited
//! notifications (`^…`, `_…`) never reach the caller.
//!
//! [`LineChannel`] works over any async byte stream: a `tokio-serial`
//! [`SerialStream`] in production, a `tokio::io::duplex` pipe in tests.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::ModemError;

/// Prefixes of unsolicited result codes that are dropped from responses.
pub const UNSOLICITED_PREFIXES: &[char] = &['^', '_'];

/// Default per-command response window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A request/response exchange with the modem.
///
/// Implementations must never pipeline: one outstanding command at a time.
pub trait Transport: Send {
    /// Write `command` and collect the response lines, final status line
    /// included.
    fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<String>, ModemError>> + Send;

    /// Write `command` without waiting for a response.
    fn write_line(&mut self, command: &str) -> impl Future<Output = Result<(), ModemError>> + Send;
}

/// Opens a [`Transport`] for a device path. The controller calls this
/// whenever the port (re)appears.
pub trait PortOpener: Send + Sync {
    type Transport: Transport;

    fn open(&self, path: &Path)
    -> impl Future<Output = Result<Self::Transport, ModemError>> + Send;
}

/// Whether `line` terminates a response.
pub fn is_final_line(line: &str) -> bool {
    matches!(line, "OK" | "ERROR" | "COMMAND NOT SUPPORT" | "NO CARRIER")
        || line.starts_with("+CME ERROR:")
        || line.starts_with("+CMS ERROR:")
}

/// Whether `line` is an unsolicited notification rather than part of a response.
pub fn is_unsolicited(line: &str) -> bool {
    line.starts_with(UNSOLICITED_PREFIXES)
}

// ── Line framing ────────────────────────────────────────────────────

/// Splits a byte stream into CR/LF-delimited lines.
///
/// Lines may arrive split across reads; an incomplete tail stays buffered
/// until its terminator shows up.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(512),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete line, trimmed. Empty lines are returned as `""`.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
        let raw = self.buf.split_to(pos);
        let terminator = self.buf[0];
        self.buf.advance(1);
        if terminator == b'\r' && self.buf.first() == Some(&b'\n') {
            self.buf.advance(1);
        }
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ── Stream transport ────────────────────────────────────────────────

/// [`Transport`] over any async byte stream.
pub struct LineChannel<S> {
    stream: S,
    framer: LineFramer,
    label: String,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            framer: LineFramer::new(),
            label: label.into(),
        }
    }

    /// Drop anything the modem sent since the previous exchange.
    async fn discard_stale_input(&mut self) -> Result<(), ModemError> {
        self.framer.clear();
        let mut scratch = [0u8; 256];
        loop {
            // A zero timeout still polls the read once, so this only drains
            // bytes that are already waiting.
            match tokio::time::timeout(Duration::ZERO, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) => return Err(eof()),
                Ok(Ok(n)) => tracing::trace!(port = %self.label, bytes = n, "discarded stale input"),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    async fn write_command(&mut self, command: &str) -> Result<(), ModemError> {
        tracing::debug!(port = %self.label, command, "write");
        let mut line = String::with_capacity(command.len() + 2);
        line.push_str(command);
        line.push_str("\r\n");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl<S> Transport for LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>, ModemError> {
        self.discard_stale_input().await?;
        self.write_command(command).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            while let Some(line) = self.framer.next_line() {
                if line.is_empty() || line == command {
                    continue;
                }
                if is_unsolicited(&line) {
                    tracing::trace!(port = %self.label, line = %line, "unsolicited");
                    continue;
                }
                let done = is_final_line(&line);
                lines.push(line);
                if done {
                    tracing::trace!(port = %self.label, command, ?lines, "response");
                    return Ok(lines);
                }
            }

            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    tracing::debug!(port = %self.label, command, partial = lines.len(), "response timeout");
                    return Err(ModemError::Timeout {
                        command: command.to_string(),
                        timeout,
                    });
                }
            };
            if n == 0 {
                return Err(eof());
            }
            self.framer.push(&buf[..n]);
        }
    }

    async fn write_line(&mut self, command: &str) -> Result<(), ModemError> {
        self.discard_stale_input().await?;
        self.write_command(command).await
    }
}

fn eof() -> ModemError {
    ModemError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "serial stream closed",
    ))
}

// ── Serial port ─────────────────────────────────────────────────────

/// Serial transport as opened by [`SerialOpener`].
pub type SerialTransport = LineChannel<SerialStream>;

/// Opens the modem's data port with `tokio-serial` (8N1).
#[derive(Debug, Clone)]
pub struct SerialOpener {
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl PortOpener for SerialOpener {
    type Transport = SerialTransport;

    async fn open(&self, path: &Path) -> Result<SerialTransport, ModemError> {
        let name = path.to_string_lossy().into_owned();
        if !path.exists() {
            return Err(ModemError::PortUnavailable {
                path: name,
                reason: "device node does not exist".into(),
            });
        }

        let stream = tokio_serial::new(name.clone(), self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| ModemError::PortUnavailable {
                path: name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(port = %name, baud = self.baud_rate, "serial port opened");
        Ok(LineChannel::new(stream, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    // ─── Framing ────────────────────────────────────────────────────────

    #[test]
    fn framer_handles_split_lines() {
        let mut framer = LineFramer::new();
        framer.push(b"\r\n+CPIN: RE");
        assert_eq!(framer.next_line().as_deref(), Some(""));
        assert_eq!(framer.next_line(), None);
        assert_eq!(framer.pending(), 9);

        framer.push(b"ADY\r\n\r\nOK\r\n");
        assert_eq!(framer.next_line().as_deref(), Some("+CPIN: READY"));
        assert_eq!(framer.next_line().as_deref(), Some(""));
        assert_eq!(framer.next_line().as_deref(), Some("OK"));
        assert_eq!(framer.next_line(), None);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_accepts_bare_lf_and_cr() {
        let mut framer = LineFramer::new();
        framer.push(b"one\ntwo\rthree\r\n");
        assert_eq!(framer.next_line().as_deref(), Some("one"));
        assert_eq!(framer.next_line().as_deref(), Some("two"));
        assert_eq!(framer.next_line().as_deref(), Some("three"));
    }

    #[test]
    fn final_lines() {
        for line in ["OK", "ERROR", "+CME ERROR: 515", "+CMS ERROR: 302", "COMMAND NOT SUPPORT"] {
            assert!(is_final_line(line), "{line}");
        }
        for line in ["+CPIN: READY", "*ERINFO: 0,0,2", "OKAY", ""] {
            assert!(!is_final_line(line), "{line}");
        }
        assert!(is_unsolicited("^RSSI:12"));
        assert!(is_unsolicited("_OWANCALL: 1,1"));
        assert!(!is_unsolicited("+CREG: 0,1"));
    }

    // ─── Exchange over a pipe ───────────────────────────────────────────

    /// Answer each command line with a canned reply.
    fn spawn_responder(far: DuplexStream, reply: impl Fn(&str) -> Option<String> + Send + 'static) {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let cmd = line.trim_end_matches('\r').to_string();
                if let Some(out) = reply(&cmd) {
                    if write.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn strips_echo_blank_and_unsolicited_lines() {
        let (near, far) = tokio::io::duplex(1024);
        spawn_responder(far, |cmd| {
            Some(format!("{cmd}\r\n\r\n^RSSI:17\r\n+CPIN: READY\r\n_OSIGQ: 3\r\n\r\nOK\r\n"))
        });

        let mut channel = LineChannel::new(near, "pipe");
        let lines = channel.send("AT+CPIN?", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(lines, vec!["+CPIN: READY".to_string(), "OK".to_string()]);
    }

    #[tokio::test]
    async fn error_status_terminates_response() {
        let (near, far) = tokio::io::duplex(1024);
        spawn_responder(far, |_| Some("\r\n+CME ERROR: 10\r\n".into()));

        let mut channel = LineChannel::new(near, "pipe");
        let lines = channel.send("AT+CIMI", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(lines, vec!["+CME ERROR: 10".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_modem_times_out() {
        let (near, far) = tokio::io::duplex(1024);
        spawn_responder(far, |_| Some("+CSQ: 12,99\r\n".into()));

        let mut channel = LineChannel::new(near, "pipe");
        let err = channel
            .send("AT+CSQ", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ModemError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn closed_stream_is_device_loss() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);

        let mut channel = LineChannel::new(near, "pipe");
        let err = channel.send("AT", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(err.is_device_lost(), "{err:?}");
    }

    #[tokio::test]
    async fn missing_device_node_is_unavailable() {
        let opener = SerialOpener::new(115_200);
        let err = opener
            .open(Path::new("/dev/does-not-exist-ttyACM9"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ModemError::PortUnavailable { .. }));
    }
}
