//! Hardware tests for the linear stage.
//!
//! These require the SMCI33-1 stepper driver connected over USB serial.
//! They are read-only (no motion commands), so they are safe to run with a
//! sample mounted.
//!
//! Run with: cargo test --test stage_hardware_test -- --ignored --nocapture

use serial_test::serial;
use stage_control::config::StageSettings;
use stage_control::discovery;
use stage_control::stage::StageControl;

#[test]
#[ignore] // Hardware-only test
#[serial]
fn discovers_the_stepper_driver() {
    let port = discovery::find_port().expect("no stepper driver connected");
    println!("stepper driver on {port}");
}

#[test]
#[ignore] // Hardware-only test
#[serial]
fn reads_status_and_substeps() {
    let stage = StageControl::from_settings(&StageSettings::default());
    assert!(!stage.has_connection_error(), "driver not reachable");

    let _session = stage.acquire().expect("failed to open the port");
    let substeps = stage.read_substeps().expect("microstep query failed");
    println!("microstep resolution: {substeps}");

    let status = stage.fetch_status().expect("status fetch failed");
    println!(
        "status: {:#06b} (ready: {}, positioning error: {})",
        status.raw(),
        status.is_ready(),
        status.has_positioning_error()
    );

    let referenced = stage.is_referenced().expect("reference query failed");
    println!("referenced: {referenced}");
    if referenced {
        let mm = stage.get_position_mm().expect("position query failed");
        println!("position: {mm:.3} mm");
    }
}
