//! Linear stage device state machine.
//!
//! [`StageControl`] drives a single-axis linear stage behind an SMCI33-1
//! stepper driver: referencing against a limit switch, absolute and relative
//! positioning, continuous jogging, status polling and positioning-error
//! recovery. It is the one canonical implementation the front-end talks to.
//!
//! ## Coordinates
//!
//! Logical positions run from 0 at the reference limit switch to 50 000
//! steps at the opposite end, positive away from the reference. The
//! controller's raw coordinate depends on which switch is the reference
//! (`near` or `far`); translation happens here, callers only ever see
//! logical steps or millimeters.
//!
//! ## Blocking behaviour
//!
//! Motion commands return as soon as the controller has accepted the start
//! command; [`StageControl::wait_movement`] blocks until the status word
//! reports ready or a positioning error. [`StageControl::do_referencing`]
//! is the synchronous exception and waits internally;
//! [`StageControl::start_referencing`] is its fire-and-return variant.
//! A front-end typically runs `wait_movement` on a worker thread while the
//! UI thread stays free to issue `stop`; the transport releases its command
//! guard between poll iterations, so a stop interleaves within one poll
//! period.
//!
//! All methods take `&self`; interior state lives behind a mutex, so one
//! `StageControl` can be shared across a polling thread and the UI.

use log::{debug, error, info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StageSettings;
use crate::discovery;
use crate::error::{StageError, StageResult};
use crate::protocol::{
    self, DeviceStatus, MotionMode, RampProfile, ReferencePoint, BAUD_RATE, DEFAULT_SUBSTEPS,
    MAX_SPEED, MAX_TRAVEL_STEPS, REFERENCE_SEEK_SPEED,
};
use crate::transport::{ScopedConnection, SerialLink, SerialPortLink, Transport};
use crate::units;

/// Coarse last-known lifecycle state, for front-end lamps.
///
/// The authoritative source is always the controller's status word; this
/// enum only tracks what the last operations implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Nothing is known yet about the axis.
    Unknown,
    /// The axis has no valid reference; absolute moves are refused.
    Unreferenced,
    /// A reference seek is in progress.
    Referencing,
    /// Referenced and idle.
    Idle,
    /// A motion command has been started.
    Moving,
    /// A positioning error is latched.
    PositioningError,
}

/// How a waited-on movement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementOutcome {
    /// The controller reported ready.
    Completed,
    /// A positioning error ended the movement early; the error has been
    /// cleared but the reference is no longer trusted.
    EndedPrematurely,
}

/// Direction of a continuous jog, in logical coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Toward the reference limit switch (logical zero).
    TowardReference,
    /// Away from the reference limit switch.
    AwayFromReference,
}

struct StageShared {
    reference_point: ReferencePoint,
    reference_changed: bool,
    substeps: u32,
    last_status: Option<DeviceStatus>,
    state: StageState,
}

/// Device-control core for the linear stage.
pub struct StageControl {
    transport: Transport,
    shared: Mutex<StageShared>,
    poll_interval: Duration,
    wait_deadline: Option<Duration>,
    default_speed: u32,
}

impl StageControl {
    /// Build a stage control from settings, resolving `"auto"` ports via
    /// descriptor discovery.
    ///
    /// Discovery failure does not fail construction; it leaves the transport
    /// faulted so the front-end can show the condition and offer
    /// [`StageControl::reset_connection`] once the cable is plugged in.
    pub fn from_settings(settings: &StageSettings) -> Self {
        let (port, discovery_failed) = if settings.port == "auto" {
            match discovery::find_port() {
                Ok(port) => (Some(port), false),
                Err(err) => {
                    error!("stage control: stepper driver not found: {err}");
                    (None, true)
                }
            }
        } else {
            (Some(settings.port.clone()), false)
        };

        let link = SerialPortLink::new(port, BAUD_RATE);
        let stage = Self::with_link(Box::new(link), settings);
        if discovery_failed {
            stage.transport.mark_faulted();
        }
        stage
    }

    /// Build a stage control over an explicit serial link.
    pub fn with_link(link: Box<dyn SerialLink>, settings: &StageSettings) -> Self {
        Self {
            transport: Transport::new(link, settings.com_timeout),
            shared: Mutex::new(StageShared {
                reference_point: settings.reference,
                reference_changed: false,
                substeps: DEFAULT_SUBSTEPS,
                last_status: None,
                state: StageState::Unknown,
            }),
            poll_interval: settings.poll_interval,
            wait_deadline: settings.wait_deadline,
            default_speed: settings.default_speed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a connection scope, keeping the port open across several
    /// operations. Operations acquire their own nested scope internally, so
    /// holding one of these is an optimization, never a requirement.
    pub fn acquire(&self) -> StageResult<ScopedConnection<'_>> {
        self.transport.acquire()
    }

    /// Whether the transport is faulted.
    pub fn has_connection_error(&self) -> bool {
        self.transport.has_connection_error()
    }

    /// Which limit switch currently defines position zero.
    pub fn reference_point(&self) -> ReferencePoint {
        self.lock().reference_point
    }

    /// Last-known coarse state.
    pub fn state(&self) -> StageState {
        self.lock().state
    }

    /// Status word of the most recent fetch, if any.
    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.lock().last_status
    }

    /// Microstep resolution used for unit conversion. Updated by
    /// [`StageControl::read_substeps`].
    pub fn substeps(&self) -> u32 {
        self.lock().substeps
    }

    /// Speed in steps/s used by the mm-denominated fallbacks and the jog
    /// buttons of the front-end.
    pub fn default_speed(&self) -> u32 {
        self.default_speed
    }

    // A rejection means the command hit an invalid state; log it and carry
    // on, matching how the controller treats the sequence.
    fn checked(&self, conn: &ScopedConnection<'_>, command: &str) -> StageResult<()> {
        if !conn.command(command)? {
            warn!("stage control: controller rejected '{command}'");
        }
        Ok(())
    }

    fn fetch_status_on(&self, conn: &ScopedConnection<'_>) -> StageResult<DeviceStatus> {
        let reply = conn.query(&protocol::query_status())?;
        let status = protocol::parse_status(&reply)?;
        let mut shared = self.lock();
        shared.last_status = Some(status);
        if status.has_positioning_error() {
            shared.state = StageState::PositioningError;
        }
        Ok(status)
    }

    fn is_referenced_on(&self, conn: &ScopedConnection<'_>) -> StageResult<bool> {
        let reply = conn.query(&protocol::query_is_referenced())?;
        Ok(protocol::parse_is_referenced(&reply) && !self.lock().reference_changed)
    }

    fn clear_positioning_error_on(
        &self,
        conn: &ScopedConnection<'_>,
        reset_position: bool,
    ) -> StageResult<()> {
        if reset_position {
            // Redefine the current position as the origin.
            let _ = conn.query(&protocol::clear_error_set_position(0))?;
        } else {
            // Re-seed the position register with the controller's reported
            // position so the physical coordinate is preserved.
            let reply = conn.query(&protocol::read_position())?;
            let raw = protocol::parse_position(&reply)?;
            let _ = conn.query(&protocol::clear_error_set_position(raw))?;
        }
        let mut shared = self.lock();
        shared.last_status = shared
            .last_status
            .map(|s| DeviceStatus::from_raw(s.raw() & !0b0100));
        Ok(())
    }

    fn check_travel(what: &'static str, steps: i32) -> StageResult<()> {
        if steps.unsigned_abs() > MAX_TRAVEL_STEPS as u32 {
            return Err(StageError::OutOfRange {
                what,
                value: i64::from(steps),
                limit: i64::from(MAX_TRAVEL_STEPS),
            });
        }
        Ok(())
    }

    fn check_speed(speed: u32) -> StageResult<()> {
        if speed == 0 || speed > MAX_SPEED {
            return Err(StageError::OutOfRange {
                what: "speed",
                value: i64::from(speed),
                limit: i64::from(MAX_SPEED),
            });
        }
        Ok(())
    }

    /// Check whether the axis is referenced.
    ///
    /// Combines the controller's answer with the local invalidation flag:
    /// after [`StageControl::set_reference_point`] or a premature movement
    /// end, the axis counts as unreferenced even while the controller still
    /// reports a reference from before.
    pub fn is_referenced(&self) -> StageResult<bool> {
        let conn = self.transport.acquire()?;
        self.is_referenced_on(&conn)
    }

    /// Fetch and decode the status word.
    ///
    /// Fails with [`StageError::StatusUnavailable`] when the controller
    /// rejects the query, rather than decoding garbage.
    pub fn fetch_status(&self) -> StageResult<DeviceStatus> {
        let conn = self.transport.acquire()?;
        self.fetch_status_on(&conn)
    }

    /// Whether the controller is ready for the next motion command.
    pub fn is_control_ready(&self) -> StageResult<bool> {
        Ok(self.fetch_status()?.is_ready())
    }

    /// Whether a positioning error is latched.
    pub fn has_positioning_error(&self) -> StageResult<bool> {
        Ok(self.fetch_status()?.has_positioning_error())
    }

    /// Clear a latched positioning error to re-enable movement.
    ///
    /// With `reset_position` the position register is zeroed, redefining the
    /// origin; without it the register is re-seeded with the current raw
    /// position so the physical coordinate survives the clear.
    pub fn clear_positioning_error(&self, reset_position: bool) -> StageResult<()> {
        let conn = self.transport.acquire()?;
        self.clear_positioning_error_on(&conn, reset_position)
    }

    fn send_reference_sequence(&self, conn: &ScopedConnection<'_>) -> StageResult<()> {
        let reference = self.reference_point();
        self.checked(conn, &protocol::set_motion_mode(MotionMode::Reference))?;
        // Back off the limit switch slowly once it triggers.
        self.checked(conn, &protocol::limit_switch_backoff())?;
        self.checked(conn, &protocol::set_direction(reference.seek_direction()))?;
        self.checked(conn, &protocol::set_speed(REFERENCE_SEEK_SPEED))?;
        self.checked(conn, &protocol::start_motion())?;
        let mut shared = self.lock();
        shared.reference_changed = false;
        shared.state = StageState::Referencing;
        info!("stage control: referencing against '{reference}' limit switch");
        Ok(())
    }

    /// Reference the axis against the configured limit switch and wait for
    /// the seek to finish.
    pub fn do_referencing(&self) -> StageResult<MovementOutcome> {
        {
            let conn = self.transport.acquire()?;
            self.send_reference_sequence(&conn)?;
        }
        let outcome = self.wait_movement()?;
        if outcome == MovementOutcome::Completed {
            info!("stage control: referencing complete");
        }
        Ok(outcome)
    }

    /// Start a reference seek without waiting.
    ///
    /// The caller must run [`StageControl::wait_movement`] before relying on
    /// the reference.
    pub fn start_referencing(&self) -> StageResult<()> {
        let conn = self.transport.acquire()?;
        self.send_reference_sequence(&conn)
    }

    /// Move to an absolute logical position in steps.
    ///
    /// Requires a valid reference. Limits are checked before anything is
    /// written to the wire.
    pub fn move_absolute(&self, target_steps: i32, speed: u32) -> StageResult<()> {
        Self::check_travel("absolute target", target_steps)?;
        Self::check_speed(speed)?;

        let conn = self.transport.acquire()?;
        if !self.is_referenced_on(&conn)? {
            return Err(StageError::NotReferenced);
        }

        // The controller's raw coordinate is offset by the travel range when
        // the near switch is the reference.
        let raw_target = match self.reference_point() {
            ReferencePoint::Near => target_steps - MAX_TRAVEL_STEPS,
            ReferencePoint::Far => target_steps,
        };

        self.checked(&conn, &protocol::set_motion_mode(MotionMode::Absolute))?;
        self.checked(&conn, &protocol::set_speed(speed))?;
        self.checked(&conn, &protocol::set_step_count(raw_target))?;
        self.checked(&conn, &protocol::start_motion())?;
        self.lock().state = StageState::Moving;
        info!("stage control: absolute move to {target_steps} steps at {speed} steps/s");
        Ok(())
    }

    /// Move relative to the current position.
    ///
    /// Positive deltas travel away from the reference. The direction command
    /// is derived from the delta sign and the reference convention; the
    /// controller receives the magnitude.
    pub fn move_relative(&self, delta_steps: i32, speed: u32) -> StageResult<()> {
        Self::check_travel("relative step count", delta_steps)?;
        Self::check_speed(speed)?;

        let reference = self.reference_point();
        let direction = if delta_steps < 0 {
            reference.seek_direction()
        } else {
            reference.away_direction()
        };

        let conn = self.transport.acquire()?;
        self.checked(&conn, &protocol::set_direction(direction))?;
        self.checked(&conn, &protocol::set_motion_mode(MotionMode::Relative))?;
        self.checked(&conn, &protocol::set_speed(speed))?;
        self.checked(&conn, &protocol::set_step_count(delta_steps.abs()))?;
        self.checked(&conn, &protocol::start_motion())?;
        self.lock().state = StageState::Moving;
        info!("stage control: relative move of {delta_steps} steps at {speed} steps/s");
        Ok(())
    }

    /// Start a continuous jog. Runs until [`StageControl::stop`] or
    /// [`StageControl::stop_soft`].
    pub fn move_inf_start(&self, direction: JogDirection, speed: u32) -> StageResult<()> {
        Self::check_speed(speed)?;

        let reference = self.reference_point();
        let code = match direction {
            JogDirection::TowardReference => reference.seek_direction(),
            JogDirection::AwayFromReference => reference.away_direction(),
        };

        let conn = self.transport.acquire()?;
        self.checked(&conn, &protocol::set_direction(code))?;
        self.checked(&conn, &protocol::set_motion_mode(MotionMode::Continuous))?;
        self.checked(&conn, &protocol::set_speed(speed))?;
        self.checked(&conn, &protocol::start_motion())?;
        self.lock().state = StageState::Moving;
        debug!("stage control: continuous jog {direction:?} at {speed} steps/s");
        Ok(())
    }

    /// Stop the motor immediately, without a brake ramp.
    ///
    /// Permitted in every state.
    pub fn stop(&self) -> StageResult<()> {
        let conn = self.transport.acquire()?;
        self.checked(&conn, &protocol::stop_immediate())
    }

    /// Stop the motor with the configured brake ramp.
    pub fn stop_soft(&self) -> StageResult<()> {
        let conn = self.transport.acquire()?;
        self.checked(&conn, &protocol::stop_ramped())
    }

    /// Block until the current movement finishes.
    ///
    /// Polls the status word at the configured interval until the ready bit
    /// or the positioning-error bit is set, releasing the command guard
    /// between polls so a `stop` from another thread gets through. On a
    /// positioning error the latch is cleared (position preserved), the
    /// reference is invalidated and [`MovementOutcome::EndedPrematurely`]
    /// is returned; the move is not retried.
    pub fn wait_movement(&self) -> StageResult<MovementOutcome> {
        let started = Instant::now();
        loop {
            let status = {
                let conn = self.transport.acquire()?;
                self.fetch_status_on(&conn)?
            };

            if status.has_positioning_error() {
                {
                    let conn = self.transport.acquire()?;
                    self.clear_positioning_error_on(&conn, false)?;
                }
                let mut shared = self.lock();
                shared.reference_changed = true;
                shared.state = StageState::Unreferenced;
                drop(shared);
                warn!("stage control: movement ended prematurely, reference the stage again");
                return Ok(MovementOutcome::EndedPrematurely);
            }
            if status.is_ready() {
                self.lock().state = StageState::Idle;
                return Ok(MovementOutcome::Completed);
            }
            if let Some(deadline) = self.wait_deadline {
                if started.elapsed() >= deadline {
                    return Err(StageError::DeadlineExceeded);
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Logical position in steps: 0 at the reference switch, positive away
    /// from it.
    pub fn get_position(&self) -> StageResult<i32> {
        let conn = self.transport.acquire()?;
        let reply = conn.query(&protocol::read_position())?;
        let raw = protocol::parse_position(&reply)?;
        Ok(match self.reference_point() {
            ReferencePoint::Far => raw,
            ReferencePoint::Near => raw + MAX_TRAVEL_STEPS,
        })
    }

    /// Logical position in millimeters.
    pub fn get_position_mm(&self) -> StageResult<f64> {
        let steps = self.get_position()?;
        units::steps_to_mm(steps, self.substeps())
    }

    /// Move to an absolute position given in millimeters.
    pub fn move_absolute_mm(&self, position_mm: f64, speed_mm_s: f64) -> StageResult<()> {
        let substeps = self.substeps();
        let steps = units::mm_to_steps(position_mm, substeps)?;
        let speed = Self::speed_steps(speed_mm_s, substeps)?;
        self.move_absolute(steps, speed)
    }

    /// Move relative to the current position, distance given in millimeters.
    pub fn move_relative_mm(&self, distance_mm: f64, speed_mm_s: f64) -> StageResult<()> {
        let substeps = self.substeps();
        let steps = units::mm_to_steps(distance_mm, substeps)?;
        let speed = Self::speed_steps(speed_mm_s, substeps)?;
        self.move_relative(steps, speed)
    }

    fn speed_steps(speed_mm_s: f64, substeps: u32) -> StageResult<u32> {
        let steps = units::mm_to_steps(speed_mm_s, substeps)?;
        u32::try_from(steps).map_err(|_| {
            StageError::InvalidArgument(format!("speed must be positive, got {speed_mm_s} mm/s"))
        })
    }

    /// Redefine which limit switch is the reference point.
    ///
    /// Invalidates the current reference; the stage must be referenced again
    /// before absolute motion.
    pub fn set_reference_point(&self, reference: ReferencePoint) {
        let mut shared = self.lock();
        shared.reference_point = reference;
        shared.reference_changed = true;
        shared.state = StageState::Unreferenced;
        drop(shared);
        warn!("stage control: reference point set to '{reference}', reference the stage again");
    }

    /// Query the microstep resolution from the controller and adopt it for
    /// unit conversion.
    pub fn read_substeps(&self) -> StageResult<u32> {
        let conn = self.transport.acquire()?;
        let reply = conn.query(&protocol::query_microstep())?;
        let substeps = protocol::parse_substeps(&reply)?;
        self.lock().substeps = substeps;
        debug!("stage control: controller reports {substeps} substeps per step");
        Ok(substeps)
    }

    /// Set the microstep resolution.
    ///
    /// Changing the resolution rescales the position register, so an actual
    /// change invalidates the reference.
    pub fn set_microstep_resolution(&self, substeps: u32) -> StageResult<()> {
        if !matches!(substeps, 1 | 2 | 4 | 8 | 16 | 32 | 64) {
            return Err(StageError::InvalidArgument(format!(
                "unsupported microstep resolution {substeps}"
            )));
        }
        let conn = self.transport.acquire()?;
        self.checked(&conn, &protocol::set_microstep(substeps))?;
        let mut shared = self.lock();
        if shared.substeps != substeps {
            shared.reference_changed = true;
        }
        shared.substeps = substeps;
        Ok(())
    }

    /// Select the gentle acceleration profile.
    pub fn set_soft_ramp(&self) -> StageResult<()> {
        self.apply_ramp(RampProfile::Soft)
    }

    /// Select the firm acceleration profile.
    pub fn set_quick_ramp(&self) -> StageResult<()> {
        self.apply_ramp(RampProfile::Quick)
    }

    fn apply_ramp(&self, profile: RampProfile) -> StageResult<()> {
        let conn = self.transport.acquire()?;
        for command in protocol::ramp_commands(profile) {
            self.checked(&conn, &command)?;
        }
        info!("stage control: {profile:?} ramp profile applied");
        Ok(())
    }

    /// Try to clear a faulted connection.
    ///
    /// Reopens the port and probes with a status fetch; on failure the fault
    /// flag is restored and `false` is returned. Must not be called while a
    /// connection scope is held.
    pub fn reset_connection(&self) -> StageResult<bool> {
        if self.transport.depth() > 0 {
            return Err(StageError::Usage(
                "reset_connection cannot run inside a scoped acquisition".to_string(),
            ));
        }
        self.transport.clear_fault();
        let probe = self
            .transport
            .acquire()
            .and_then(|conn| self.fetch_status_on(&conn).map(|_| ()));
        match probe {
            Ok(()) => {
                info!("stage control: connection reset");
                Ok(true)
            }
            Err(err) => {
                debug!("stage control: connection reset probe failed: {err}");
                self.transport.mark_faulted();
                Ok(false)
            }
        }
    }
}
