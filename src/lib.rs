//! # Linear Stage Control Core
//!
//! This crate is the device-control core for a single-axis motorized linear
//! stage driven by a Nanotec SMCI33-1 stepper driver over a line-oriented,
//! half-duplex serial protocol. It owns the connection lifecycle, the
//! request/response codec, the status/error state machine and the unit
//! conversions; a graphical front-end consumes it through a narrow,
//! pull-based interface and contributes nothing but buttons and lamps.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML settings (port, reference side, timeouts) loaded via
//!   the `config` crate. See [`config::Settings`].
//! - **`error`**: the [`error::StageError`] taxonomy for centralized error
//!   handling across the crate.
//! - **`units`**: stateless step/millimeter conversion for a given
//!   microstep resolution.
//! - **`protocol`**: the `#1…` command codec — command constructors,
//!   response parsing, status-word decoding, motion limits.
//! - **`transport`**: the scoped serial transport. Nested acquisitions share
//!   one physical open; queries exist only on the acquired handle and are
//!   serialized one-at-a-time on the wire.
//! - **`discovery`**: serial port auto-discovery by USB vendor descriptor.
//! - **`stage`**: the [`stage::StageControl`] state machine — referencing,
//!   absolute/relative/continuous motion, status polling, positioning-error
//!   recovery.
//! - **`capabilities`**: an async `Movable` facade over the blocking core
//!   for tokio-based front-ends.
//! - **`mock`**: a scripted serial link for tests and hardware-free
//!   development.

pub mod capabilities;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod stage;
pub mod transport;
pub mod units;
