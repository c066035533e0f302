//! Step/millimeter unit conversion.
//!
//! The stage advances 1.25 mm per full motor revolution and the motor has
//! 200 full steps per revolution, so with microstepping the scale is
//! `substeps * 200 / 1.25 = substeps * 160` steps per millimeter. The factor
//! is integral for every supported microstep setting, which keeps the
//! conversion exact: `1.25 / 200` itself has no finite binary representation,
//! so the inverse form is never computed.

use crate::error::{StageError, StageResult};

/// Lead screw travel per full motor revolution in millimeters.
pub const MM_PER_TURN: f64 = 1.25;

/// Full motor steps per revolution.
pub const FULL_STEPS_PER_TURN: u32 = 200;

fn steps_per_mm(substeps: u32) -> StageResult<f64> {
    if substeps == 0 {
        return Err(StageError::InvalidArgument(
            "microstep resolution must be non-zero".to_string(),
        ));
    }
    // substeps * 200 / 1.25 == substeps * 160, an integer for every
    // resolution, so the division is exact.
    Ok(f64::from(substeps * FULL_STEPS_PER_TURN) / MM_PER_TURN)
}

/// Convert a step count to a distance in millimeters.
pub fn steps_to_mm(steps: i32, substeps: u32) -> StageResult<f64> {
    Ok(f64::from(steps) / steps_per_mm(substeps)?)
}

/// Convert a distance in millimeters to the nearest whole step count.
///
/// Ties round to even, matching the controller calibration tooling, so the
/// round trip `mm_to_steps(steps_to_mm(s))` recovers `s` for every step count
/// within the travel range.
pub fn mm_to_steps(mm: f64, substeps: u32) -> StageResult<i32> {
    if !mm.is_finite() {
        return Err(StageError::InvalidArgument(format!(
            "distance must be finite, got {mm}"
        )));
    }
    let rounded = (mm * steps_per_mm(substeps)?).round_ties_even();
    if rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
        return Err(StageError::InvalidArgument(format!(
            "distance {mm} mm does not fit the step range"
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(rounded as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_steps_is_zero_mm() {
        assert_eq!(steps_to_mm(0, 8).unwrap(), 0.0);
    }

    #[test]
    fn one_turn_at_eight_substeps() {
        // One full turn at 8 microsteps = 1600 steps = 1.25 mm.
        assert_eq!(steps_to_mm(1600, 8).unwrap(), 1.25);
        assert_eq!(mm_to_steps(1.25, 8).unwrap(), 1600);
    }

    #[test]
    fn round_trip_over_full_travel() {
        for substeps in [1u32, 2, 4, 8, 16] {
            for steps in (0..=50_000).step_by(7) {
                let mm = steps_to_mm(steps, substeps).unwrap();
                assert_eq!(
                    mm_to_steps(mm, substeps).unwrap(),
                    steps,
                    "round trip failed for {steps} steps at {substeps} substeps"
                );
            }
            // The exact travel limit as well.
            let mm = steps_to_mm(50_000, substeps).unwrap();
            assert_eq!(mm_to_steps(mm, substeps).unwrap(), 50_000);
        }
    }

    #[test]
    fn negative_distances() {
        assert_eq!(mm_to_steps(-1.25, 8).unwrap(), -1600);
        assert_eq!(steps_to_mm(-1600, 8).unwrap(), -1.25);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        assert!(matches!(
            mm_to_steps(f64::NAN, 8),
            Err(StageError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm_to_steps(f64::INFINITY, 8),
            Err(StageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_substeps_is_rejected() {
        assert!(matches!(
            steps_to_mm(100, 0),
            Err(StageError::InvalidArgument(_))
        ));
        assert!(matches!(
            mm_to_steps(1.0, 0),
            Err(StageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn ties_round_to_even() {
        // 0.5 steps at 1 substep (160 steps/mm): 0.003125 mm * 160 = 0.5.
        assert_eq!(mm_to_steps(0.003125, 1).unwrap(), 0);
        // 1.5 steps rounds to 2, not 1.
        assert_eq!(mm_to_steps(0.009375, 1).unwrap(), 2);
    }
}
