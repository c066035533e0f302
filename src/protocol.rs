//! Command codec for the SMCI33-1 stepper driver.
//!
//! ## Protocol Reference
//!
//! The controller speaks an ASCII request/response protocol, half-duplex,
//! one exchange in flight at a time. Every line is terminated with `\r` and
//! addressed to axis 1 via the `#1` prefix:
//!
//! Format: `#1<Command>[Data]\r`
//! Response: echo of the command with data, terminated with `\r`
//!
//! A reply whose last character is `?` means the controller rejected the
//! command (malformed or out of range); any other terminal character means
//! it was accepted.
//!
//! ### Queries
//! - `:is_referenced`: `1` trailing character when the axis is referenced
//! - `$`: status word; the trailing 3 hex digits carry the state bits
//! - `C`: current position (2-character echo prefix before the integer)
//! - `Zg`: current microstep resolution
//!
//! ### Motion setup
//! - `p<mode>`: motion mode (1 relative, 2 absolute, 4 reference seek,
//!   5 continuous)
//! - `d<0|1>`: direction; physical meaning depends on which limit switch is
//!   the reference point
//! - `o<speed>`: speed in steps/s
//! - `s<steps>`: step count / target register
//! - `A`: start motion
//! - `S` / `S1`: stop abruptly / with brake ramp
//! - `D<pos>`: set the position register, clearing a latched positioning
//!   error
//! - `g<substeps>`: microstep resolution
//! - `l5154`: limit switch behaviour for referencing (back off the switch
//!   slowly)
//! - `:ramp_mode=` / `:accel=` / `:decel=` / `:decelquick=`: ramp profile

use serde::Deserialize;
use std::fmt;

use crate::error::{StageError, StageResult};

/// Axis address prefix; the driver is always axis 1.
pub const AXIS_PREFIX: &str = "#1";

/// Fixed baud rate of the SMCI33-1 serial interface.
pub const BAUD_RATE: u32 = 115_200;

/// Travel range of the stage in steps; absolute targets live in
/// `[0, MAX_TRAVEL_STEPS]` and relative moves may not exceed it in magnitude.
pub const MAX_TRAVEL_STEPS: i32 = 50_000;

/// Maximum commandable speed in steps/s.
pub const MAX_SPEED: u32 = 16_000;

/// Speed used while seeking the reference limit switch.
pub const REFERENCE_SEEK_SPEED: u32 = 4_000;

/// Factory microstep resolution; the live value is queried from the device.
pub const DEFAULT_SUBSTEPS: u32 = 8;

/// Which limit switch defines position zero.
///
/// `Near` is the switch next to the motor, `Far` the opposite end. Logical
/// coordinates are positive away from the reference, so the choice inverts
/// the sign convention of every motion command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferencePoint {
    /// Limit switch next to the motor defines zero.
    Near,
    /// Limit switch opposite the motor defines zero.
    Far,
}

impl ReferencePoint {
    /// Direction code that moves toward the reference limit switch.
    pub fn seek_direction(self) -> u8 {
        match self {
            ReferencePoint::Near => 1,
            ReferencePoint::Far => 0,
        }
    }

    /// Direction code that moves away from the reference limit switch.
    pub fn away_direction(self) -> u8 {
        1 - self.seek_direction()
    }
}

impl fmt::Display for ReferencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferencePoint::Near => write!(f, "near"),
            ReferencePoint::Far => write!(f, "far"),
        }
    }
}

/// Controller motion mode, the argument of the `p` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    /// Manual jog mode. Jogging normally goes through
    /// [`MotionMode::Continuous`] with an explicit stop; this mode is part
    /// of the controller's command set nonetheless.
    Jog,
    /// Relative positioning by a signed step count.
    Relative,
    /// Absolute positioning against the position register.
    Absolute,
    /// Reference seek toward a limit switch.
    Reference,
    /// Continuous rotation until stopped.
    Continuous,
}

impl MotionMode {
    fn code(self) -> u8 {
        match self {
            MotionMode::Jog => 0,
            MotionMode::Relative => 1,
            MotionMode::Absolute => 2,
            MotionMode::Reference => 4,
            MotionMode::Continuous => 5,
        }
    }
}

/// Acceleration/deceleration profile presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampProfile {
    /// Sine ramp with gentle acceleration, for vibration-sensitive samples.
    Soft,
    /// Trapezoidal ramp with firm acceleration.
    Quick,
}

/// Status word of the controller, masked to its low 4 bits.
///
/// Bit 0 is "ready for command", bit 2 is "positioning error latched". The
/// projections below are the only supported views; the raw value is kept so
/// the front-end can display it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(u8);

impl DeviceStatus {
    /// Mask applied to the decoded status word.
    const MASK: u8 = 0xF;

    /// Wrap a raw status word, masking to the meaningful low 4 bits.
    pub fn from_raw(raw: u8) -> Self {
        DeviceStatus(raw & Self::MASK)
    }

    /// The masked status word.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Controller is idle and ready for the next motion command.
    pub fn is_ready(self) -> bool {
        self.0 & 0b0001 != 0
    }

    /// A positioning error (limit switch hit or stall) is latched.
    pub fn has_positioning_error(self) -> bool {
        self.0 & 0b0100 != 0
    }
}

fn cmd(body: impl fmt::Display) -> String {
    format!("{AXIS_PREFIX}{body}")
}

/// `#1:is_referenced` — query whether the axis has a reference position.
pub fn query_is_referenced() -> String {
    cmd(":is_referenced")
}

/// `#1$` — query the status word.
pub fn query_status() -> String {
    cmd("$")
}

/// `#1C` — read the raw position register.
pub fn read_position() -> String {
    cmd("C")
}

/// `#1D<pos>` — set the position register, clearing a latched error.
pub fn clear_error_set_position(position: i32) -> String {
    cmd(format_args!("D{position}"))
}

/// `#1p<mode>` — select the motion mode.
pub fn set_motion_mode(mode: MotionMode) -> String {
    cmd(format_args!("p{}", mode.code()))
}

/// `#1d<dir>` — select the travel direction.
pub fn set_direction(direction: u8) -> String {
    cmd(format_args!("d{direction}"))
}

/// `#1o<speed>` — set the travel speed in steps/s.
pub fn set_speed(speed: u32) -> String {
    cmd(format_args!("o{speed}"))
}

/// `#1s<steps>` — set the step count / target register.
pub fn set_step_count(steps: i32) -> String {
    cmd(format_args!("s{steps}"))
}

/// `#1A` — start the configured motion.
pub fn start_motion() -> String {
    cmd("A")
}

/// `#1S` — stop immediately, without a brake ramp.
pub fn stop_immediate() -> String {
    cmd("S")
}

/// `#1S1` — stop with the configured brake ramp.
pub fn stop_ramped() -> String {
    cmd("S1")
}

/// `#1g<substeps>` — set the microstep resolution.
pub fn set_microstep(substeps: u32) -> String {
    cmd(format_args!("g{substeps}"))
}

/// `#1Zg` — query the microstep resolution.
pub fn query_microstep() -> String {
    cmd("Zg")
}

/// `#1l5154` — limit switch behaviour for referencing: back off slowly.
pub fn limit_switch_backoff() -> String {
    cmd("l5154")
}

/// Command sequence selecting an acceleration/deceleration profile.
pub fn ramp_commands(profile: RampProfile) -> [String; 4] {
    match profile {
        RampProfile::Soft => [
            cmd(":ramp_mode=+1"),       // sine ramp type
            cmd(":decelquick=+3000000"), // quick stop Hz/s
            cmd(":accel=+10000"),       // accel Hz/s
            cmd(":decel=+10000"),       // brake Hz/s
        ],
        RampProfile::Quick => [
            cmd(":ramp_mode=+0"), // trapezoidal ramp type
            cmd(":decelquick=+3000000"),
            cmd(":accel=+50000"),
            cmd(":decel=+50000"),
        ],
    }
}

/// Whether a reply signals command rejection (trailing `?`).
pub fn is_rejected(reply: &str) -> bool {
    reply.ends_with('?')
}

/// Decode the status word from a `#1$` reply.
///
/// The trailing 3 characters after the echoed `$` are hex digits carrying
/// the state bits. A rejected reply means the status is unavailable and must
/// not be decoded.
pub fn parse_status(reply: &str) -> StageResult<DeviceStatus> {
    if is_rejected(reply) {
        return Err(StageError::StatusUnavailable);
    }
    let payload = reply.rsplit('$').next().unwrap_or(reply);
    let digits = payload
        .get(payload.len().saturating_sub(3)..)
        .unwrap_or(payload);
    let word = u16::from_str_radix(digits.trim(), 16)
        .map_err(|_| StageError::Response(format!("unparseable status reply: {reply:?}")))?;
    #[allow(clippy::cast_possible_truncation)]
    Ok(DeviceStatus::from_raw((word & 0xFF) as u8))
}

/// Decode the raw position from a `#1C` reply.
///
/// The reply carries a 2-character echo prefix before the signed integer.
pub fn parse_position(reply: &str) -> StageResult<i32> {
    if is_rejected(reply) {
        return Err(StageError::Response(format!(
            "position query rejected: {reply:?}"
        )));
    }
    let digits = reply
        .get(2..)
        .ok_or_else(|| StageError::Response(format!("position reply too short: {reply:?}")))?;
    digits
        .trim()
        .parse::<i32>()
        .map_err(|_| StageError::Response(format!("unparseable position reply: {reply:?}")))
}

/// Decode the microstep resolution from a `#1Zg` reply.
pub fn parse_substeps(reply: &str) -> StageResult<u32> {
    if is_rejected(reply) {
        return Err(StageError::Response(format!(
            "microstep query rejected: {reply:?}"
        )));
    }
    let digits = reply.rsplit('g').next().unwrap_or(reply);
    digits
        .trim()
        .parse::<u32>()
        .map_err(|_| StageError::Response(format!("unparseable microstep reply: {reply:?}")))
}

/// Whether a `#1:is_referenced` reply reports the axis as referenced.
pub fn parse_is_referenced(reply: &str) -> bool {
    reply.ends_with('1')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_strings() {
        assert_eq!(query_is_referenced(), "#1:is_referenced");
        assert_eq!(query_status(), "#1$");
        assert_eq!(read_position(), "#1C");
        assert_eq!(clear_error_set_position(-1234), "#1D-1234");
        assert_eq!(set_motion_mode(MotionMode::Jog), "#1p0");
        assert_eq!(set_motion_mode(MotionMode::Absolute), "#1p2");
        assert_eq!(set_motion_mode(MotionMode::Reference), "#1p4");
        assert_eq!(set_direction(1), "#1d1");
        assert_eq!(set_speed(4000), "#1o4000");
        assert_eq!(set_step_count(-500), "#1s-500");
        assert_eq!(start_motion(), "#1A");
        assert_eq!(stop_immediate(), "#1S");
        assert_eq!(stop_ramped(), "#1S1");
        assert_eq!(set_microstep(8), "#1g8");
        assert_eq!(query_microstep(), "#1Zg");
        assert_eq!(limit_switch_backoff(), "#1l5154");
    }

    #[test]
    fn ramp_command_sets() {
        let soft = ramp_commands(RampProfile::Soft);
        assert_eq!(soft[0], "#1:ramp_mode=+1");
        assert_eq!(soft[2], "#1:accel=+10000");
        let quick = ramp_commands(RampProfile::Quick);
        assert_eq!(quick[0], "#1:ramp_mode=+0");
        assert_eq!(quick[3], "#1:decel=+50000");
    }

    #[test]
    fn rejection_detection() {
        assert!(is_rejected("?"));
        assert!(is_rejected("1p9?"));
        assert!(!is_rejected("1p2"));
        assert!(!is_rejected(""));
    }

    #[test]
    fn status_parsing() {
        // Trailing 3 hex digits, masked to the low 4 bits.
        let status = parse_status("1$001").unwrap();
        assert!(status.is_ready());
        assert!(!status.has_positioning_error());

        let status = parse_status("1$004").unwrap();
        assert!(!status.is_ready());
        assert!(status.has_positioning_error());

        // Upper bits outside the mask are ignored.
        let status = parse_status("1$0A1").unwrap();
        assert_eq!(status.raw(), 0x1);
    }

    #[test]
    fn rejected_status_is_unavailable() {
        assert!(matches!(
            parse_status("1$?"),
            Err(StageError::StatusUnavailable)
        ));
    }

    #[test]
    fn garbage_status_is_a_response_error() {
        assert!(matches!(
            parse_status("1$xyz"),
            Err(StageError::Response(_))
        ));
    }

    #[test]
    fn position_parsing() {
        assert_eq!(parse_position("1C-49200").unwrap(), -49_200);
        assert_eq!(parse_position("1C800").unwrap(), 800);
        assert!(matches!(parse_position("1C"), Err(StageError::Response(_))));
        assert!(matches!(parse_position("1C?"), Err(StageError::Response(_))));
    }

    #[test]
    fn substep_parsing() {
        assert_eq!(parse_substeps("1Zg8").unwrap(), 8);
        assert_eq!(parse_substeps("1Zg16").unwrap(), 16);
        assert!(matches!(
            parse_substeps("1Zg?"),
            Err(StageError::Response(_))
        ));
    }

    #[test]
    fn referenced_parsing() {
        assert!(parse_is_referenced("1:is_referenced1"));
        assert!(!parse_is_referenced("1:is_referenced0"));
    }

    #[test]
    fn directions_follow_the_reference_point() {
        assert_eq!(ReferencePoint::Near.seek_direction(), 1);
        assert_eq!(ReferencePoint::Near.away_direction(), 0);
        assert_eq!(ReferencePoint::Far.seek_direction(), 0);
        assert_eq!(ReferencePoint::Far.away_direction(), 1);
    }
}
