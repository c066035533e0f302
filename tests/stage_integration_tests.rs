//! Integration tests for the stage-control core over a scripted serial link.
//!
//! These drive the public API end to end — referencing, moving, waiting,
//! error recovery — and assert on the exact wire traffic, without touching
//! hardware. Run with: cargo test --test stage_integration_tests

use std::sync::Arc;
use std::time::Duration;

use stage_control::capabilities::{Movable, StageHandle};
use stage_control::config::StageSettings;
use stage_control::error::StageError;
use stage_control::mock::MockLink;
use stage_control::protocol::ReferencePoint;
use stage_control::stage::{JogDirection, MovementOutcome, StageControl};

fn fast_settings(reference: ReferencePoint) -> StageSettings {
    StageSettings {
        reference,
        poll_interval: Duration::from_millis(1),
        ..StageSettings::default()
    }
}

fn stage_over(link: &MockLink, reference: ReferencePoint) -> StageControl {
    StageControl::with_link(Box::new(link.clone()), &fast_settings(reference))
}

#[test]
fn reference_then_move_then_read_position() {
    let link = MockLink::new();
    let stage = stage_over(&link, ReferencePoint::Near);

    // Referencing: seek sequence, then two polls until ready.
    for echo in ["1p4", "1l5154", "1d1", "1o4000", "1A", "1$000", "1$001"] {
        link.enqueue_reply(echo);
    }
    assert_eq!(stage.do_referencing().unwrap(), MovementOutcome::Completed);

    // Absolute move to 10 mm at 8 substeps: 12800 steps, raw -37200.
    link.enqueue_reply("1:is_referenced1");
    for echo in ["1p2", "1o3840", "1s-37200", "1A"] {
        link.enqueue_reply(echo);
    }
    stage.move_absolute_mm(10.0, 3.0).unwrap();

    link.enqueue_reply("1$001");
    assert_eq!(stage.wait_movement().unwrap(), MovementOutcome::Completed);

    link.enqueue_reply("1C-37200");
    assert_eq!(stage.get_position().unwrap(), 12_800);
    link.enqueue_reply("1C-37200");
    let mm = stage.get_position_mm().unwrap();
    assert!((mm - 10.0).abs() < 1e-9);

    // Every poll cycle opened and closed its own scope.
    assert!(!link.is_open());
    assert_eq!(link.remaining_replies(), 0);
}

#[test]
fn premature_movement_end_requires_rereferencing() {
    let link = MockLink::new();
    let stage = stage_over(&link, ReferencePoint::Near);

    // Relative move away from the reference.
    for echo in ["1d0", "1p1", "1o4000", "1s2000", "1A"] {
        link.enqueue_reply(echo);
    }
    stage.move_relative(2000, 4000).unwrap();

    // The stage runs into a limit switch: positioning error, then recovery.
    link.enqueue_reply("1$004");
    link.enqueue_reply("1C-50000");
    link.enqueue_reply("1D-50000");
    assert_eq!(
        stage.wait_movement().unwrap(),
        MovementOutcome::EndedPrematurely
    );

    // Absolute motion is refused until the stage is referenced again.
    link.enqueue_reply("1:is_referenced1");
    assert!(matches!(
        stage.move_absolute(1000, 4000),
        Err(StageError::NotReferenced)
    ));

    // Referencing clears the invalidation.
    for echo in ["1p4", "1l5154", "1d1", "1o4000", "1A", "1$001"] {
        link.enqueue_reply(echo);
    }
    assert_eq!(stage.do_referencing().unwrap(), MovementOutcome::Completed);
    link.enqueue_reply("1:is_referenced1");
    assert!(stage.is_referenced().unwrap());
}

#[test]
fn jog_then_stop_soft() {
    let link = MockLink::new();
    let stage = stage_over(&link, ReferencePoint::Near);

    for echo in ["1d0", "1p5", "1o2000", "1A", "1S1"] {
        link.enqueue_reply(echo);
    }
    stage
        .move_inf_start(JogDirection::AwayFromReference, 2000)
        .unwrap();
    stage.stop_soft().unwrap();
    assert_eq!(
        link.sent_commands(),
        vec!["#1d0", "#1p5", "#1o2000", "#1A", "#1S1"]
    );
}

#[test]
fn batched_session_keeps_the_port_open() {
    let link = MockLink::new();
    let stage = stage_over(&link, ReferencePoint::Near);

    link.enqueue_reply("1Zg8");
    link.enqueue_reply("1$001");
    {
        let _session = stage.acquire().unwrap();
        stage.read_substeps().unwrap();
        stage.fetch_status().unwrap();
        assert_eq!(link.open_count(), 1);
        assert!(link.is_open());
    }
    assert!(!link.is_open());
    assert_eq!(link.close_count(), 1);
}

#[test]
fn connection_fault_surfaces_and_recovers() {
    let link = MockLink::new();
    let stage = stage_over(&link, ReferencePoint::Near);

    link.enqueue_wire_error("cable pulled");
    assert!(matches!(
        stage.fetch_status(),
        Err(StageError::Connection(_))
    ));
    assert!(stage.has_connection_error());

    // While faulted, nothing touches the wire.
    let sent_before = link.sent_commands().len();
    assert!(stage.fetch_status().is_err());
    assert_eq!(link.sent_commands().len(), sent_before);

    // A successful probe restores the connection.
    link.enqueue_reply("1$001");
    assert!(stage.reset_connection().unwrap());
    assert!(!stage.has_connection_error());
}

#[tokio::test]
async fn async_facade_full_cycle() {
    let link = MockLink::new();
    let stage = Arc::new(stage_over(&link, ReferencePoint::Far));
    let handle = StageHandle::new(stage);

    // home
    for echo in ["1p4", "1l5154", "1d0", "1o4000", "1A", "1$001"] {
        link.enqueue_reply(echo);
    }
    handle.home().await.unwrap();

    // move_rel(-1.25mm): toward the far reference is direction 0.
    for echo in ["1d0", "1p1", "1o3840", "1s1600", "1A"] {
        link.enqueue_reply(echo);
    }
    handle.move_rel(-1.25).await.unwrap();

    // settle + position (far reference keeps raw coordinates)
    link.enqueue_reply("1$001");
    handle.wait_settled().await.unwrap();
    link.enqueue_reply("1C1600");
    let mm = handle.position().await.unwrap();
    assert!((mm - 1.25).abs() < 1e-9);
}

#[tokio::test]
async fn stop_interleaves_with_a_waiting_poller() {
    let link = MockLink::new();
    let settings = StageSettings {
        poll_interval: Duration::from_millis(250),
        ..StageSettings::default()
    };
    let stage = Arc::new(StageControl::with_link(Box::new(link.clone()), &settings));

    // One busy fetch, then the stop from the foreground, then the ready
    // fetch: the command guard is released between polls, so the stop slots
    // into the poll window instead of starving behind the loop.
    for echo in ["1$000", "1S", "1$001"] {
        link.enqueue_reply(echo);
    }

    let waiter = {
        let stage = stage.clone();
        tokio::task::spawn_blocking(move || stage.wait_movement())
    };
    // Let the poller issue its first fetch, then stop inside its sleep.
    while link.sent_commands().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    {
        let stage = stage.clone();
        tokio::task::spawn_blocking(move || stage.stop())
            .await
            .unwrap()
            .unwrap();
    }
    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome, MovementOutcome::Completed);
    assert_eq!(link.sent_commands(), vec!["#1$", "#1S", "#1$"]);
}
