//! Custom error types for the stage-control core.
//!
//! This module defines the primary error type, `StageError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of a serial
//! device-control session, from connection and timeout problems to motion
//! preconditions that are violated before anything is written to the wire.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the serial port is missing, could not be opened, or the
//!   transport has been marked faulted by an earlier wire failure. Once set,
//!   the fault must be cleared via `StageControl::reset_connection`.
//! - **`Timeout`**: no carriage-return terminator arrived within the
//!   configured serial timeout. The command may or may not have reached the
//!   controller; the front-end is expected to offer a retry.
//! - **`DeadlineExceeded`**: `wait_movement` ran past its configured overall
//!   deadline without the controller reporting a terminal status.
//! - **`Usage`**: the scoped-acquisition discipline was violated (e.g.
//!   `reset_connection` called while a scope is still held).
//! - **`NotReferenced`**: absolute motion was requested without a valid
//!   reference calibration.
//! - **`OutOfRange`**: a step count or speed violates the motion limits.
//!   Checked before any command is sent.
//! - **`DeviceNotFound`**: port auto-discovery matched no (or more than one)
//!   stepper driver.
//! - **`StatusUnavailable`**: the controller rejected the status query, so the
//!   status word cannot be decoded.
//! - **`Response`**: a reply was received but could not be parsed.
//!
//! A rejected command (reply ending in `?`) is *not* an error: it is the
//! `false` return of `ScopedConnection::command`, since rejections are
//! expected while probing invalid states.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serial port timed out waiting for response")]
    Timeout,

    #[error("Movement did not finish within the configured deadline")]
    DeadlineExceeded,

    #[error("Transport misuse: {0}")]
    Usage(String),

    #[error("Motor not referenced! Please call do_referencing()")]
    NotReferenced,

    #[error("{what} out of range: {value} (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: i64,
        limit: i64,
    },

    #[error("Stepper driver not found: {0}")]
    DeviceNotFound(String),

    #[error("Controller rejected the status query")]
    StatusUnavailable,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed controller response: {0}")]
    Response(String),

    #[error("Serial enumeration error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
