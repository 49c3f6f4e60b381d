mod common;

use std::time::Duration;

use common::{
    CountingRestart, IMAGE_LEN, PanickingRestart, RecordingStorage, Script, ScriptedTransport,
    Step, agent, config, image,
};
use ota_agent::{FailureReason, Phase, Requested, UpdateAgent, UpdateEvent, UpdateGuard};
use ota_agent_core::Slot;
use test_log::test;

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for_phase(rx: &flume::Receiver<UpdateEvent>, phase: Phase) {
    loop {
        match rx.recv_timeout(TIMEOUT).unwrap() {
            UpdateEvent::Phase(p) if p == phase => return,
            _ => {}
        }
    }
}

#[test]
fn test_request_while_writing_is_refused_without_second_worker() {
    let image = image("1.5.1");
    let (gate_tx, gate_rx) = flume::bounded(1);
    let script = Script::new(Some(IMAGE_LEN as u64))
        .then(Step::Data(image[..2048].to_vec()))
        .then(Step::Gate(gate_rx))
        .then(Step::Data(image[2048..].to_vec()))
        .complete();
    let transport = ScriptedTransport::new([script]);
    let storage = RecordingStorage::new("1.4.2", None);
    let restart = CountingRestart::default();
    let (tx, rx) = flume::unbounded();
    let guard = UpdateGuard::new(agent(&transport, &storage, &restart, config()).with_events(tx));

    assert_eq!(guard.request_update(None).unwrap(), Requested::Accepted);
    wait_for_phase(&rx, Phase::Writing);
    assert!(guard.is_running());

    assert_eq!(
        guard.request_update(Some("https://other.example.com/x.bin")).unwrap(),
        Requested::AlreadyRunning
    );
    assert_eq!(transport.opened(), 1);

    gate_tx.send(()).unwrap();
    guard.wait().unwrap().unwrap().unwrap();

    let state = storage.state();
    assert_eq!(state.opened, vec![Slot::B]);
    assert_eq!(state.written, image);
    assert_eq!(
        transport.urls(),
        vec!["https://updates.example.com/default.bin".to_string()]
    );
    assert_eq!(restart.count(), 1);
}

#[test]
fn test_flag_stays_set_after_restart_was_requested() {
    let transport = ScriptedTransport::new([Script::image(&image("1.5.1"), 1024)]);
    let storage = RecordingStorage::new("1.4.2", None);
    let restart = CountingRestart::default();
    let guard = UpdateGuard::new(agent(&transport, &storage, &restart, config()));

    assert_eq!(guard.request_update(None).unwrap(), Requested::Accepted);
    guard.wait().unwrap().unwrap().unwrap();

    assert!(guard.is_running());
    assert_eq!(
        guard.request_update(None).unwrap(),
        Requested::AlreadyRunning
    );
    assert!(guard.wait().is_none());
}

#[test]
fn test_flag_is_cleared_after_failure() {
    let transport = ScriptedTransport::new([
        Script::image(&image("1.5.0"), 1024),
        Script::image(&image("1.5.1"), 1024),
    ]);
    let storage = RecordingStorage::new("1.4.2", Some("1.5.0"));
    let restart = CountingRestart::default();
    let guard = UpdateGuard::new(agent(&transport, &storage, &restart, config()));

    assert_eq!(guard.request_update(None).unwrap(), Requested::Accepted);
    let err = guard.wait().unwrap().unwrap().unwrap_err();
    assert_eq!(err.reason(), FailureReason::SameAsLastInvalid);
    assert!(!guard.is_running());

    assert_eq!(guard.request_update(None).unwrap(), Requested::Accepted);
    guard.wait().unwrap().unwrap().unwrap();
    assert_eq!(storage.state().boot_slot, Slot::B);
}

#[test]
fn test_flag_is_cleared_when_worker_panics() {
    let transport = ScriptedTransport::new([Script::image(&image("1.5.1"), 1024)]);
    let storage = RecordingStorage::new("1.4.2", None);
    let guard = UpdateGuard::new(UpdateAgent::new(
        transport,
        storage,
        PanickingRestart,
        config(),
    ));

    assert_eq!(guard.request_update(None).unwrap(), Requested::Accepted);
    assert!(guard.wait().unwrap().is_err());
    assert!(!guard.is_running());
}

#[test]
fn test_wait_without_request_returns_none() {
    let transport = ScriptedTransport::default();
    let storage = RecordingStorage::new("1.4.2", None);
    let restart = CountingRestart::default();
    let guard = UpdateGuard::new(agent(&transport, &storage, &restart, config()));

    assert!(guard.wait().is_none());
    assert!(!guard.is_running());
}
