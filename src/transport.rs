//! Scoped serial transport.
//!
//! The transport owns the serial connection to the stepper driver and
//! enforces the two disciplines every caller relies on:
//!
//! - **Scoped acquisition**: [`Transport::acquire`] returns a
//!   [`ScopedConnection`] guard. Only the outermost acquisition physically
//!   opens the port and only the last release closes it, so nested scopes are
//!   cheap and the port is closed on every exit path, panics included.
//!   `query` lives on the guard, so sending a command without holding a scope
//!   is not expressible.
//! - **Single-flight commands**: the protocol is half-duplex, so one
//!   request/response exchange is on the wire at a time. The internal mutex
//!   is held per exchange only; poll loops that sleep between status fetches
//!   therefore cannot starve a stop command issued from another thread.
//!
//! Wire failures mark the transport as faulted. A faulted transport refuses
//! further exchanges without touching the port until
//! `StageControl::reset_connection` clears the fault. Timeouts do not fault
//! the transport; the front-end surfaces them as a retryable condition.

use log::{debug, trace, warn};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{StageError, StageResult};
use crate::protocol;

/// Line terminator of the command protocol.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Raw serial line under the transport.
///
/// The production implementation is [`SerialPortLink`]; tests substitute a
/// scripted mock. The trait deliberately stays byte-level so the transport
/// owns terminator handling and timeout classification.
pub trait SerialLink: Send {
    /// Open the underlying device. A no-op when already open.
    fn open(&mut self) -> StageResult<()>;

    /// Close the underlying device. A no-op when already closed.
    fn close(&mut self);

    /// Whether the device is currently open.
    fn is_open(&self) -> bool;

    /// Write the full buffer to the device.
    fn write_all(&mut self, data: &[u8]) -> StageResult<()>;

    /// Read until `terminator` arrives or `timeout` elapses.
    ///
    /// Returns the bytes read including the terminator. No terminator within
    /// the timeout is a [`StageError::Timeout`], whether or not partial data
    /// arrived.
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> StageResult<String>;
}

/// [`SerialLink`] backed by the `serialport` crate.
pub struct SerialPortLink {
    port_name: Option<String>,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    /// Create a link for the given port path. `None` means no port could be
    /// configured (e.g. discovery failed); opening will fail until a path is
    /// known.
    pub fn new(port_name: Option<String>, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            port: None,
        }
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self) -> StageResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let name = self.port_name.as_deref().ok_or_else(|| {
            StageError::Connection("no serial port configured".to_string())
        })?;
        let port = serialport::new(name, self.baud_rate)
            // Short device-level timeout; the overall deadline is enforced
            // by the read loop below.
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| {
                StageError::Connection(format!("failed to open serial port '{name}': {e}"))
            })?;
        debug!("serial port '{}' opened at {} baud", name, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(
                "serial port '{}' closed",
                self.port_name.as_deref().unwrap_or("<unset>")
            );
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_all(&mut self, data: &[u8]) -> StageResult<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| StageError::Connection("serial port not open".to_string()))?;
        port.write_all(data)
            .map_err(|e| StageError::Connection(format!("serial write failed: {e}")))?;
        port.flush()
            .map_err(|e| StageError::Connection(format!("serial flush failed: {e}")))
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> StageResult<String> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| StageError::Connection("serial port not open".to_string()))?;

        let mut response = String::new();
        let mut buffer = [0u8; 1];
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(StageError::Timeout);
            }

            match port.read(&mut buffer) {
                Ok(1) => {
                    response.push(char::from(buffer[0]));
                    if buffer[0] == terminator {
                        return Ok(response);
                    }
                }
                Ok(_) => {
                    // EOF - shouldn't happen with serial ports
                    return Err(StageError::Connection(
                        "unexpected EOF from serial port".to_string(),
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Device-level timeout is shorter than the overall one
                    continue;
                }
                Err(e) => {
                    return Err(StageError::Connection(format!("serial read error: {e}")));
                }
            }
        }
    }
}

struct TransportInner {
    link: Box<dyn SerialLink>,
    depth: u32,
    faulted: bool,
}

/// Serial transport with scoped acquisition and single-flight commands.
pub struct Transport {
    inner: Mutex<TransportInner>,
    timeout: Duration,
}

impl Transport {
    /// Create a transport over `link` with the given per-exchange timeout.
    pub fn new(link: Box<dyn SerialLink>, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(TransportInner {
                link,
                depth: 0,
                faulted: false,
            }),
            timeout,
        }
    }

    // Keep working if a previous holder panicked; the inner state stays
    // consistent because every mutation is completed before unlocking.
    fn lock(&self) -> MutexGuard<'_, TransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a connection scope.
    ///
    /// Opens the physical port on the transition from zero to one nested
    /// acquisitions. Fails with [`StageError::Connection`] when the transport
    /// is faulted, the port path is unset, or the open call fails; an open
    /// failure marks the transport as faulted.
    pub fn acquire(&self) -> StageResult<ScopedConnection<'_>> {
        let mut inner = self.lock();
        if inner.faulted {
            return Err(StageError::Connection(
                "connection is faulted; reset it first".to_string(),
            ));
        }
        if inner.depth == 0 && !inner.link.is_open() {
            if let Err(err) = inner.link.open() {
                inner.faulted = true;
                warn!("transport: {err}");
                return Err(err);
            }
        }
        inner.depth += 1;
        trace!("transport: entered scope at depth {}", inner.depth);
        Ok(ScopedConnection { transport: self })
    }

    /// Whether a wire or open failure has faulted the connection.
    pub fn has_connection_error(&self) -> bool {
        self.lock().faulted
    }

    pub(crate) fn depth(&self) -> u32 {
        self.lock().depth
    }

    pub(crate) fn mark_faulted(&self) {
        self.lock().faulted = true;
    }

    pub(crate) fn clear_fault(&self) {
        self.lock().faulted = false;
    }
}

/// Handle to an acquired connection scope.
///
/// Dropping the handle leaves the scope; the last scope out closes the port.
pub struct ScopedConnection<'a> {
    transport: &'a Transport,
}

impl ScopedConnection<'_> {
    /// Send one command line and read the terminated reply.
    ///
    /// Appends the carriage-return terminator, writes, then reads until the
    /// terminator or the configured timeout. The reply is returned with
    /// surrounding whitespace and the terminator stripped. On a faulted
    /// transport this fails immediately without touching the wire.
    pub fn query(&self, command: &str) -> StageResult<String> {
        let mut inner = self.transport.lock();
        if inner.faulted {
            return Err(StageError::Connection(
                "connection is faulted; reset it first".to_string(),
            ));
        }

        let msg = format!("{command}\r");
        trace!("sending command: '{}'", msg.escape_default());

        if let Err(err) = inner.link.write_all(msg.as_bytes()) {
            return Err(Self::classify(&mut inner, err));
        }
        match inner.link.read_until(COMMAND_TERMINATOR, self.transport.timeout) {
            Ok(raw) => {
                let reply = raw.trim().to_string();
                trace!("received response: '{reply}'");
                Ok(reply)
            }
            Err(err) => Err(Self::classify(&mut inner, err)),
        }
    }

    /// Send a command and report whether the controller accepted it.
    ///
    /// A reply ending in `?` is a rejection and yields `false`; rejections
    /// never raise, only transport failures do.
    pub fn command(&self, command: &str) -> StageResult<bool> {
        let reply = self.query(command)?;
        Ok(!protocol::is_rejected(&reply))
    }

    fn classify(inner: &mut TransportInner, err: StageError) -> StageError {
        if matches!(err, StageError::Connection(_)) {
            inner.faulted = true;
            warn!("transport: faulted: {err}");
        }
        err
    }
}

impl Drop for ScopedConnection<'_> {
    fn drop(&mut self) {
        let mut inner = self.transport.lock();
        inner.depth = inner.depth.saturating_sub(1);
        trace!("transport: left scope, depth now {}", inner.depth);
        if inner.depth == 0 {
            inner.link.close();
        }
    }
}
