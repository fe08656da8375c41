mod common;

use common::{spawn_device, wait_until_drained, wait_until_received};
use forge_rs::command_queue::{CommandEntry, QueueError};
use forge_rs::device::Placement;
use forge_shared::DeviceState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn handshake_resets_line_numbers() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    assert_eq!(sim.received(), vec!["M110 N0".to_string()]);
    assert!(sim.raw()[0].starts_with("N0 M110 N0*"));

    handle.execute("G28").await.unwrap();
    wait_until_drained(&handle).await;
    assert!(sim.raw()[1].starts_with("N1 G28*"));
}

#[tokio::test]
async fn never_more_than_one_instruction_in_flight() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    for i in 0..50 {
        handle.execute(&format!("G1 X{}", i)).await.unwrap();
    }
    let snapshot = wait_until_drained(&handle).await;
    assert_eq!(snapshot.state, DeviceState::Idle);

    let sent: Vec<String> = sim.received().into_iter().skip(1).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("G1 X{}", i)).collect();
    assert_eq!(sent, expected);
    assert_eq!(sim.max_outstanding(), 1);
}

#[tokio::test]
async fn prepend_from_callback_runs_before_earlier_and_later_appends() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    sim.hold_at("M117 first");

    let first = CommandEntry::new("M117 first").after(|device| {
        device.prepend_commands([CommandEntry::new("M117 p1"), CommandEntry::new("M117 p2")]);
        Ok(())
    });
    handle
        .enqueue(vec![first, CommandEntry::new("M117 queued")], Placement::Back)
        .await
        .unwrap();
    wait_until_received(&sim, "M117 first").await;
    // Appended by an unrelated caller while the first entry is in flight.
    handle
        .enqueue(vec![CommandEntry::new("M117 late")], Placement::Back)
        .await
        .unwrap();
    sim.release();
    wait_until_drained(&handle).await;

    let sent: Vec<String> = sim.received().into_iter().skip(1).collect();
    assert_eq!(
        sent,
        vec!["M117 first", "M117 p1", "M117 p2", "M117 queued", "M117 late"]
    );
}

#[tokio::test]
async fn front_placement_jumps_the_queue() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    sim.hold_at("G4");
    handle.execute("G4 P0").await.unwrap();
    handle.execute("G1 X1").await.unwrap();
    wait_until_received(&sim, "G4 P0").await;
    handle
        .enqueue(vec![CommandEntry::new("M112")], Placement::Front)
        .await
        .unwrap();
    sim.release();
    wait_until_drained(&handle).await;

    let sent: Vec<String> = sim.received().into_iter().skip(1).collect();
    assert_eq!(sent, vec!["G4 P0", "M112", "G1 X1"]);
}

#[tokio::test]
async fn transport_failure_skips_entry_and_continues() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    sim.fail_next_sends(1);
    let failing = CommandEntry::new("G1 X1").after(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    handle
        .enqueue(vec![failing, CommandEntry::new("G1 X2")], Placement::Back)
        .await
        .unwrap();
    wait_until_received(&sim, "G1 X2").await;
    wait_until_drained(&handle).await;

    assert!(!sim.received().contains(&"G1 X1".to_string()));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unanswered_instruction_times_out() {
    let (handle, sim) = spawn_device(Duration::from_millis(100)).await;
    sim.silence("M400");
    handle.execute("M400").await.unwrap();
    handle.execute("G1 X5").await.unwrap();

    assert_eq!(handle.snapshot().await.unwrap().queue_depth, 2);
    wait_until_received(&sim, "G1 X5").await;
    let snapshot = wait_until_drained(&handle).await;
    assert_eq!(snapshot.state, DeviceState::Idle);
}

#[tokio::test]
async fn ack_before_expected_report_fails_entry() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    // The simulator answers M105 with a bare "ok", never a position report.
    let entry = CommandEntry::new("M105")
        .processing(|line, _| Ok(!line.starts_with("X:")))
        .after(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
    handle
        .enqueue(vec![entry, CommandEntry::new("M117 next")], Placement::Back)
        .await
        .unwrap();
    wait_until_received(&sim, "M117 next").await;
    wait_until_drained(&handle).await;
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn markers_complete_without_touching_the_wire() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let marker = CommandEntry::marker("checkpoint").after(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    handle.enqueue(vec![marker], Placement::Back).await.unwrap();
    wait_until_drained(&handle).await;
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(sim.received(), vec!["M110 N0".to_string()]);
}

#[tokio::test]
async fn unsolicited_lines_are_ignored() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    sim.inject("echo:busy: processing");
    sim.inject("Error:Printer halted. kill() called!");
    handle.execute("M105").await.unwrap();
    let snapshot = wait_until_drained(&handle).await;
    assert_eq!(snapshot.state, DeviceState::Idle);
    assert_eq!(sim.received().last().map(String::as_str), Some("M105"));
}

#[tokio::test]
async fn blocking_sequence_holds_the_device() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    sim.hold_at("G28");
    let snapshot = handle
        .run_blocking(vec!["G28".to_string(), "G29".to_string()])
        .await
        .unwrap();
    assert_eq!(snapshot.state, DeviceState::Blocking);
    wait_until_received(&sim, "G28").await;
    assert_eq!(handle.snapshot().await.unwrap().state, DeviceState::Blocking);

    sim.release();
    let snapshot = wait_until_drained(&handle).await;
    assert_eq!(snapshot.state, DeviceState::Idle);
    assert_eq!(sim.received()[1..], ["G28".to_string(), "G29".to_string()]);
}

#[tokio::test]
async fn rejected_response_waits_for_its_own_ack() {
    let (handle, sim) = spawn_device(TIMEOUT).await;
    let ran = Arc::new(AtomicBool::new(false));
    let next_ran = Arc::new(AtomicBool::new(false));
    let (flag, next_flag) = (ran.clone(), next_ran.clone());
    let query = CommandEntry::new("M114")
        .processing(|line, _| Err(QueueError::Generation(format!("rejected '{}'", line))))
        .after(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
    let next = CommandEntry::new("M117 next").after(move |_| {
        next_flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    handle.enqueue(vec![query, next], Placement::Back).await.unwrap();
    wait_until_received(&sim, "M117 next").await;
    wait_until_drained(&handle).await;

    assert!(!ran.load(Ordering::SeqCst));
    assert!(next_ran.load(Ordering::SeqCst));
    // M117 was only sent once the query's ok had arrived.
    assert_eq!(sim.max_outstanding(), 1);
}
