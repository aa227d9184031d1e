//! The lab actor driven through its command channel.

mod common;

use common::{fast_config, scan_config, wait_for_event, FAST_CONFIG};
use iopanel::alignment::{AlignmentEvent, AlignmentSettings};
use iopanel::camera::{CameraEvent, CameraState};
use iopanel::config::AppConfig;
use iopanel::device::{CameraParameter, DeviceId};
use iopanel::error::{AlignmentError, CameraError, LabError};
use iopanel::messages::ExportRequest;
use iopanel::scan::{ScanEvent, ScanStatus};
use iopanel::{Event, EventBus, EventReceiver, Instruments, Lab, LabClient};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

fn start_lab(config: AppConfig) -> (LabClient, JoinHandle<()>, EventReceiver) {
    let (bus, events) = EventBus::new();
    let instruments = Instruments::simulated(&config);
    let lab = Lab::new(Handle::current(), bus, config, instruments).unwrap();
    let (client, task) = lab.spawn();
    (client, task, events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_then_export() {
    let (client, task, mut events) = start_lab(fast_config());
    let run = client.start_scan(Some(scan_config(1550.0, 1550.1, 0.01))).await.unwrap();

    let status = wait_for_event(&mut events, |event| match event {
        Event::Scan(ScanEvent::Finished { run: id, status, .. }) if *id == run => Some(*status),
        _ => None,
    })
    .await;
    assert_eq!(status, ScanStatus::Completed);
    let finished = client.scan_run(None).await.unwrap().unwrap();
    assert_eq!(finished.id, run);
    assert_eq!(finished.samples.len(), 11);
    assert_eq!(client.scan_history().await.unwrap().len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let request = ExportRequest {
        run: None,
        directory: Some(dir.path().to_path_buf()),
        base_name: Some("lab".to_string()),
    };
    assert_eq!(client.export(request).await.unwrap(), run);
    let export = wait_for_event(&mut events, |event| match event {
        Event::Export(export) => Some(export.clone()),
        _ => None,
    })
    .await;
    assert_eq!(export.run, run);
    assert!(export.failed.is_empty());
    assert!(dir.path().join("lab.csv").exists());
    assert!(dir.path().join("lab.json").exists());

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_export_needs_a_finished_run() {
    let (client, task, _events) = start_lab(fast_config());
    assert!(matches!(
        client.export(ExportRequest::default()).await,
        Err(LabError::NoFinishedRun)
    ));
    let missing = uuid::Uuid::new_v4();
    let request = ExportRequest {
        run: Some(missing),
        ..ExportRequest::default()
    };
    assert!(matches!(client.export(request).await, Err(LabError::RunNotFound(id)) if id == missing));
    assert!(client.scan_run(None).await.unwrap().is_none());

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_scan_is_rejected_before_any_device_call() {
    let (client, task, _events) = start_lab(fast_config());
    let inverted = scan_config(1560.0, 1550.0, 0.01);
    match client.start_scan(Some(inverted)).await {
        Err(LabError::Configuration(message)) => assert!(message.contains("must be below")),
        other => panic!("expected a configuration error, got {:?}", other),
    }
    assert!(client.scan_history().await.unwrap().is_empty());
    assert!(matches!(client.abort_scan().await, Err(LabError::Scan(_))));

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_start_and_stop_are_idempotent() {
    let (client, task, mut events) = start_lab(fast_config());
    assert!(client.start_monitor().await.unwrap());
    assert!(!client.start_monitor().await.unwrap());

    wait_for_event(&mut events, |event| match event {
        Event::Power(_) => Some(()),
        _ => None,
    })
    .await;
    assert!(!client.monitor_samples().await.unwrap().is_empty());

    assert!(client.stop_monitor().await.unwrap());
    assert!(!client.stop_monitor().await.unwrap());

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_camera_commands() {
    let (client, task, mut events) = start_lab(fast_config());
    assert!(matches!(
        client.open_camera("ghost").await,
        Err(LabError::Camera(CameraError::UnknownCamera(_)))
    ));
    assert!(matches!(
        client.set_camera_parameter("cam0", CameraParameter::Gamma(0.8)).await,
        Err(LabError::Camera(CameraError::NotLive(_)))
    ));

    client.open_camera("cam0").await.unwrap();
    wait_for_event(&mut events, |event| match event {
        Event::Camera(CameraEvent::StateChanged { to: CameraState::Live, .. }) => Some(()),
        _ => None,
    })
    .await;
    client.set_camera_parameter("cam0", CameraParameter::Gamma(0.8)).await.unwrap();
    let settings = wait_for_event(&mut events, |event| match event {
        Event::Camera(CameraEvent::SettingsChanged { settings, .. }) => Some(*settings),
        _ => None,
    })
    .await;
    assert_eq!(settings.gamma, Some(0.8));

    client.discover_cameras().await.unwrap();
    let found = wait_for_event(&mut events, |event| match event {
        Event::Camera(CameraEvent::Discovered(cameras)) => Some(cameras.clone()),
        _ => None,
    })
    .await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier, DeviceId::from("cam0"));

    client.close_camera("cam0").await.unwrap();
    wait_for_event(&mut events, |event| match event {
        Event::Camera(CameraEvent::StateChanged { to: CameraState::Disconnected, .. }) => Some(()),
        _ => None,
    })
    .await;
    let sessions = client.camera_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, CameraState::Disconnected);

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_instruments_are_reported() {
    let toml = FAST_CONFIG
        .replace("[instruments.scan_unit]", "[instruments.scan_unit]\nenabled = false")
        .replace("[instruments.power_monitor]", "[instruments.power_monitor]\nenabled = false");
    let (client, task, _events) = start_lab(AppConfig::from_toml_str(&toml).unwrap());

    assert!(matches!(
        client.start_scan(None).await,
        Err(LabError::Disabled("scan unit"))
    ));
    assert!(matches!(
        client.start_monitor().await,
        Err(LabError::Disabled("power monitor"))
    ));
    assert!(client.scan_history().await.unwrap().is_empty());
    assert!(client.monitor_samples().await.unwrap().is_empty());

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_aborts_a_running_scan() {
    let (client, task, mut events) = start_lab(fast_config());
    let run = client.start_scan(Some(scan_config(1550.0, 1560.0, 0.001))).await.unwrap();
    client.shutdown().await.unwrap();
    task.await.unwrap();

    let status = wait_for_event(&mut events, |event| match event {
        Event::Scan(ScanEvent::Finished { run: id, status, .. }) if *id == run => Some(*status),
        _ => None,
    })
    .await;
    assert_eq!(status, ScanStatus::Aborted);
    assert!(matches!(client.scan_history().await, Err(LabError::ShuttingDown)));
}

const PIEZOS: &str = r#"
[instruments.piezo_left]
enabled = true
address = "COM3"

[instruments.piezo_right]
enabled = true
address = "COM4"

[alignment]
settle_time = "1ms"
sample_interval = "0s"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alignment_commands() {
    let config = AppConfig::from_toml_str(&format!("{}{}", FAST_CONFIG, PIEZOS)).unwrap();
    let (client, task, mut events) = start_lab(config);

    let coarse = AlignmentSettings {
        step_nm: 5.0,
        ..AlignmentSettings::default()
    };
    assert!(matches!(
        client.start_alignment(Some(coarse)).await,
        Err(LabError::Configuration(message)) if message.contains("step_nm")
    ));
    assert!(!client.stop_alignment().await.unwrap());

    client.start_alignment(None).await.unwrap();
    assert!(matches!(
        client.start_mapping(None).await,
        Err(LabError::Alignment(AlignmentError::Busy("alignment")))
    ));
    assert!(matches!(
        client.start_scan(None).await,
        Err(LabError::Alignment(AlignmentError::Busy("alignment")))
    ));
    let power = wait_for_event(&mut events, |event| match event {
        Event::Alignment(AlignmentEvent::Aligned { power_dbm }) => Some(*power_dbm),
        Event::Alignment(AlignmentEvent::Failed { message, .. }) => panic!("alignment failed: {}", message),
        _ => None,
    })
    .await;
    assert!(power > -12.1, "aligned at {} dBm", power);
    // The worker exits just after publishing its result.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let run = client.start_scan(Some(scan_config(1550.0, 1560.0, 0.001))).await.unwrap();
    assert!(matches!(
        client.start_alignment(None).await,
        Err(LabError::Alignment(AlignmentError::ScanActive))
    ));
    client.abort_scan().await.unwrap();
    wait_for_event(&mut events, |event| match event {
        Event::Scan(ScanEvent::Finished { run: id, .. }) if *id == run => Some(()),
        _ => None,
    })
    .await;

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_alignment_needs_piezo_stages() {
    let (client, task, _events) = start_lab(fast_config());
    assert!(matches!(
        client.start_alignment(None).await,
        Err(LabError::Disabled("piezo aligner"))
    ));
    assert!(matches!(
        client.start_mapping(None).await,
        Err(LabError::Disabled("piezo aligner"))
    ));

    client.shutdown().await.unwrap();
    task.await.unwrap();
}
