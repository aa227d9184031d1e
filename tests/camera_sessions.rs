//! Camera sessions, frame pump and watchdog against the simulated camera SDK.

mod common;

use common::{camera_rig, wait_for_event, wait_for_frame, CameraRig};
use iopanel::bus::{Component, Event};
use iopanel::camera::{CameraEvent, CameraState};
use iopanel::device::mock::MockOp;
use iopanel::device::{CameraParameter, DeviceId};
use iopanel::error::{CameraError, DeviceErrorKind};
use iopanel::executor::TaskOutcome;

async fn wait_for_state(rig: &mut CameraRig, state: CameraState) {
    let camera = rig.id.clone();
    wait_for_event(&mut rig.events, |event| match event {
        Event::Camera(CameraEvent::StateChanged { camera: c, to, .. }) if *c == camera && *to == state => Some(()),
        _ => None,
    })
    .await;
}

async fn open_live(rig: &mut CameraRig) {
    let id = rig.id.clone();
    rig.cameras.open(&id).unwrap();
    wait_for_state(rig, CameraState::Live).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_goes_live_and_streams_frames() {
    let mut rig = camera_rig(false);
    let id = rig.id.clone();
    assert_eq!(rig.cameras.session(&id).unwrap().state, CameraState::Disconnected);

    rig.cameras.open(&id).unwrap();
    assert!(matches!(rig.cameras.open(&id), Err(CameraError::AlreadyOpen(_))));
    wait_for_state(&mut rig, CameraState::Live).await;

    let first = wait_for_frame(&mut rig.events).await;
    let second = wait_for_frame(&mut rig.events).await;
    assert_eq!(first.camera, id);
    assert!(second.sequence > first.sequence);
    assert_eq!(first.pixels.len(), (first.width * first.height) as usize);
    assert_eq!(first.pixels[0], (first.sequence % 256) as u8);
    assert_eq!(rig.control.calls().first().map(String::as_str), Some("open"));

    let session = rig.cameras.session(&id).unwrap();
    assert_eq!(session.state, CameraState::Live);
    assert!(session.last_frame.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_are_mirrored_when_configured() {
    let mut rig = camera_rig(true);
    open_live(&mut rig).await;

    let frame = wait_for_frame(&mut rig.events).await;
    let last_column = u64::from(frame.width - 1);
    assert_eq!(frame.pixels[0], ((last_column + frame.sequence) % 256) as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_camera_is_rejected() {
    let mut rig = camera_rig(false);
    let ghost = DeviceId::from("ghost");
    assert!(matches!(rig.cameras.open(&ghost), Err(CameraError::UnknownCamera(_))));
    assert!(matches!(rig.cameras.close(&ghost), Err(CameraError::UnknownCamera(_))));
    assert!(rig.cameras.session(&ghost).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parameters_need_a_live_camera() {
    let mut rig = camera_rig(false);
    let id = rig.id.clone();
    assert!(matches!(
        rig.cameras.set_parameter(&id, CameraParameter::Gamma(1.2)),
        Err(CameraError::NotLive(_))
    ));

    open_live(&mut rig).await;
    let task = rig.cameras.set_parameter(&id, CameraParameter::GainDb(3.0)).unwrap();
    assert_eq!(task.wait().await, TaskOutcome::Completed(()));

    let settings = wait_for_event(&mut rig.events, |event| match event {
        Event::Camera(CameraEvent::SettingsChanged { settings, .. }) => Some(*settings),
        _ => None,
    })
    .await;
    assert_eq!(settings.gain_db, Some(3.0));
    assert_eq!(rig.cameras.session(&id).unwrap().settings.gain_db, Some(3.0));
    assert!(rig.control.calls().iter().any(|c| c == "configure GainDb(3.0)"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unplugged_camera_reconnects_with_its_settings() {
    let mut rig = camera_rig(false);
    let id = rig.id.clone();
    open_live(&mut rig).await;
    let task = rig
        .cameras
        .set_parameter(&id, CameraParameter::ExposureUs(500.0))
        .unwrap();
    assert_eq!(task.wait().await, TaskOutcome::Completed(()));

    rig.control.set_present(false);
    wait_for_state(&mut rig, CameraState::Reconnecting).await;
    let attempt = wait_for_event(&mut rig.events, |event| match event {
        Event::Camera(CameraEvent::ReconnectScheduled { attempt, .. }) => Some(*attempt),
        _ => None,
    })
    .await;
    assert_eq!(attempt, 1);

    rig.control.clear_calls();
    rig.control.set_present(true);
    wait_for_state(&mut rig, CameraState::Live).await;

    let calls = rig.control.calls();
    let open = calls.iter().rposition(|c| c == "open").unwrap();
    assert_eq!(calls.get(open + 1).map(String::as_str), Some("configure ExposureUs(500.0)"));
    wait_for_frame(&mut rig.events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_first_open_gives_up_after_bounded_attempts() {
    let mut rig = camera_rig(false);
    let id = rig.id.clone();
    rig.control.set_present(false);
    rig.cameras.open(&id).unwrap();

    let mut scheduled = 0;
    let report = wait_for_event(&mut rig.events, |event| match event {
        Event::Camera(CameraEvent::ReconnectScheduled { .. }) => {
            scheduled += 1;
            None
        }
        Event::Error(report) if report.kind.is_none() => Some(report.clone()),
        _ => None,
    })
    .await;
    assert_eq!(scheduled, 2);
    assert_eq!(report.component, Component::Camera);
    assert_eq!(report.device, Some(id.clone()));
    assert!(report.message.contains("3 attempts"));
    assert_eq!(rig.cameras.session(&id).unwrap().state, CameraState::Disconnected);
    assert_eq!(rig.control.calls().iter().filter(|c| *c == "open").count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_reads_are_reported_once_and_reconnect() {
    let mut rig = camera_rig(false);
    open_live(&mut rig).await;
    rig.control.clear_calls();
    rig.control.fail_until_cleared(MockOp::Read, DeviceErrorKind::Transient);

    let mut reports = 0;
    wait_for_event(&mut rig.events, |event| match event {
        Event::Error(report) if report.kind == Some(DeviceErrorKind::Transient) => {
            assert_eq!(report.component, Component::Camera);
            reports += 1;
            None
        }
        Event::Camera(CameraEvent::StateChanged {
            to: CameraState::Reconnecting,
            ..
        }) => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(reports, 1);
    // Three failures reach the threshold; at most one read was already in flight.
    let reads = rig
        .control
        .calls()
        .iter()
        .take_while(|c| *c != "close" && *c != "open")
        .filter(|c| *c == "read")
        .count();
    assert!(reads <= 4, "{} reads before reconnecting", reads);

    rig.control.clear_failures();
    wait_for_state(&mut rig, CameraState::Live).await;
    wait_for_frame(&mut rig.events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_read_moves_camera_to_error() {
    let mut rig = camera_rig(false);
    open_live(&mut rig).await;
    rig.control.fail_next(MockOp::Read, DeviceErrorKind::Fatal);

    wait_for_state(&mut rig, CameraState::Error).await;
    let id = rig.id.clone();
    assert_eq!(rig.cameras.session(&id).unwrap().state, CameraState::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_disconnects_and_releases_the_device() {
    let mut rig = camera_rig(false);
    let id = rig.id.clone();
    open_live(&mut rig).await;

    rig.cameras.close(&id).unwrap();
    wait_for_state(&mut rig, CameraState::Disconnected).await;
    // Closing twice is harmless.
    rig.cameras.close(&id).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(rig.control.calls().last().map(String::as_str), Some("close"));
    assert_eq!(rig.cameras.session(&id).unwrap().state, CameraState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discovery_lists_attached_cameras() {
    let mut rig = camera_rig(false);
    let found = match rig.cameras.discover().wait().await {
        TaskOutcome::Completed(found) => found,
        other => panic!("discovery did not complete: {:?}", other),
    };
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier, rig.id);
    assert_eq!(found[0].name, "Top view");

    let published = wait_for_event(&mut rig.events, |event| match event {
        Event::Camera(CameraEvent::Discovered(cameras)) => Some(cameras.len()),
        _ => None,
    })
    .await;
    assert_eq!(published, 1);

    rig.control.set_present(false);
    assert_eq!(rig.cameras.discover().wait().await, TaskOutcome::Completed(Vec::new()));
}
