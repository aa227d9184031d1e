//! Scan runs end to end against the simulated CT400.

mod common;

use common::{scan_config, scan_rig, wait_for_event, MONITOR, UNIT};
use iopanel::bus::{Component, Event};
use iopanel::device::mock::MockOp;
use iopanel::device::DeviceId;
use iopanel::error::{DeviceErrorKind, ScanError};
use iopanel::scan::{ScanEvent, ScanStatus};
use chrono::Utc;
use std::time::Duration;

fn assert_strictly_increasing(wavelengths: &[f64]) {
    for pair in wavelengths.windows(2) {
        assert!(pair[0] < pair[1], "{} is not below {}", pair[0], pair[1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_sweep_collects_every_point() {
    let mut rig = scan_rig(250, false);
    let id = rig.scans.start_scan(scan_config(1550.0, 1552.0, 0.001)).unwrap();

    let mut transitions = Vec::new();
    let finished = wait_for_event(&mut rig.events, |event| match event {
        Event::Scan(ScanEvent::StatusChanged { from, to, .. }) => {
            transitions.push((*from, *to));
            None
        }
        Event::Scan(ScanEvent::Finished { run, status, sample_count, .. }) if *run == id => {
            Some((*status, *sample_count))
        }
        _ => None,
    })
    .await;
    assert_eq!(finished, (ScanStatus::Completed, 2001));
    assert_eq!(
        transitions,
        vec![
            (ScanStatus::Idle, ScanStatus::Armed),
            (ScanStatus::Armed, ScanStatus::Running),
            (ScanStatus::Running, ScanStatus::Completed),
        ]
    );

    let run = rig.scans.wait_finished(id).await.unwrap();
    let wavelengths: Vec<_> = run.samples.iter().map(|s| s.wavelength_nm).collect();
    assert_eq!(wavelengths.len(), 2001);
    assert_eq!(wavelengths[0], 1550.0);
    assert_eq!(wavelengths[2000], 1552.0);
    assert_strictly_increasing(&wavelengths);
    assert!(run.started_at.is_some() && run.ended_at.is_some());
    assert_eq!(rig.scans.status(), ScanStatus::Idle);

    let calls = rig.unit.calls();
    assert_eq!(
        &calls[..7],
        &[
            "open",
            "configure ParkLaser",
            "configure SetLaser",
            "configure SetScan",
            "configure SetSamplingResolution",
            "configure SetDetectorArray",
            "trigger",
        ]
    );
    assert_eq!(&calls[calls.len() - 2..], &["configure StopScan", "configure ParkLaser"]);
    assert_eq!(calls.iter().filter(|c| *c == "read").count(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_c_band_sweep_at_ten_picometres() {
    let rig = scan_rig(250, false);
    let id = rig.scans.start_scan(scan_config(1540.0, 1560.0, 0.01)).unwrap();

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Completed);
    assert_eq!(run.samples.len(), 2001);
    let wavelengths: Vec<_> = run.samples.iter().map(|s| s.wavelength_nm).collect();
    assert_eq!(wavelengths[0], 1540.0);
    assert_eq!(wavelengths[1000], 1550.0);
    assert_eq!(wavelengths[2000], 1560.0);
    assert_strictly_increasing(&wavelengths);
    assert!(rig.unit.calls().iter().any(|c| c == "configure SetScan"));
    assert_eq!(rig.scans.history().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_scan_rejects_new_runs_then_aborts() {
    let rig = scan_rig(10, false);
    rig.unit.set_read_delay(Duration::from_millis(5));
    let id = rig.scans.start_scan(scan_config(1550.0, 1552.0, 0.001)).unwrap();

    // Let a few polls land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.scans.status(), ScanStatus::Running);
    let busy = ScanError::Busy {
        unit: DeviceId::from(UNIT),
        run: id,
    };
    assert_eq!(rig.scans.configure(scan_config(1540.0, 1541.0, 0.01)), Err(busy.clone()));
    assert_eq!(rig.scans.start(), Err(busy));

    let before_abort = rig.scans.current().unwrap().samples.len();
    rig.scans.abort().unwrap();
    let aborted_at = Utc::now();
    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Aborted);
    assert!(run.samples.len() >= before_abort);
    assert!(run.samples.len() < 2001);
    assert!(
        run.samples.iter().all(|s| s.timestamp <= aborted_at),
        "a sample was appended after the abort"
    );
    // Only a prefix of the grid, with nothing skipped.
    for (i, sample) in run.samples.iter().enumerate() {
        assert!((sample.wavelength_nm - (1550.0 + 0.001 * i as f64)).abs() < 1e-6);
    }

    let calls = rig.unit.calls();
    assert_eq!(&calls[calls.len() - 2..], &["configure StopScan", "configure ParkLaser"]);
    assert_eq!(rig.scans.last_finished().map(|r| r.id), Some(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_read_fails_the_run() {
    let mut rig = scan_rig(250, false);
    rig.unit.fail_next(MockOp::Read, DeviceErrorKind::Fatal);
    let id = rig.scans.start_scan(scan_config(1550.0, 1551.0, 0.001)).unwrap();

    let report = wait_for_event(&mut rig.events, |event| match event {
        Event::Error(report) if report.component == Component::Scan => Some(report.clone()),
        _ => None,
    })
    .await;
    assert_eq!(report.kind, Some(DeviceErrorKind::Fatal));
    assert_eq!(report.device, Some(DeviceId::from(UNIT)));

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Failed);
    assert!(run.failure.is_some());
    assert!(run.samples.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_error_mid_run_keeps_partial_samples() {
    let rig = scan_rig(100, false);
    // Three polls succeed, the fourth loses the unit.
    rig.unit.fail_after(MockOp::Read, 3, DeviceErrorKind::Fatal);
    let id = rig.scans.start_scan(scan_config(1550.0, 1551.0, 0.001)).unwrap();

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Failed);
    assert_eq!(run.samples.len(), 300);
    assert_eq!(run.samples.last().map(|s| s.wavelength_nm), Some(1550.299));
    assert!(run.failure.as_deref().is_some_and(|f| f.contains("injected Read failure")));
    assert!(run.ended_at.is_some());

    // Failed runs keep their data but are not offered for export.
    assert!(!run.status.is_exportable());
    assert_eq!(rig.scans.last_finished().map(|r| r.samples.len()), Some(300));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_read_is_retried() {
    let rig = scan_rig(250, false);
    rig.unit.fail_next(MockOp::Read, DeviceErrorKind::Transient);
    let id = rig.scans.start_scan(scan_config(1550.0, 1551.0, 0.001)).unwrap();

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Completed);
    assert_eq!(run.samples.len(), 1001);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_readings_are_attached_to_samples() {
    let rig = scan_rig(100, true);
    let config = iopanel::scan::ScanConfig {
        monitor_power: true,
        ..scan_config(1550.0, 1551.0, 0.001)
    };
    let id = rig.scans.start_scan(config).unwrap();

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Completed);
    assert!(!run.monitor_readings.is_empty());
    assert!(run.samples.iter().all(|s| s.monitor.is_some()));
    assert!(rig.monitor.calls().iter().any(|c| c == "read"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_monitor_does_not_fail_the_scan() {
    let mut rig = scan_rig(100, true);
    rig.monitor.fail_next(MockOp::Read, DeviceErrorKind::Fatal);
    let config = iopanel::scan::ScanConfig {
        monitor_power: true,
        ..scan_config(1550.0, 1551.0, 0.001)
    };
    let id = rig.scans.start_scan(config).unwrap();

    let report = wait_for_event(&mut rig.events, |event| match event {
        Event::Error(report) if report.device == Some(DeviceId::from(MONITOR)) => Some(report.clone()),
        _ => None,
    })
    .await;
    assert_eq!(report.kind, Some(DeviceErrorKind::Fatal));

    let run = rig.scans.wait_finished(id).await.unwrap();
    assert_eq!(run.status, ScanStatus::Completed);
    assert_eq!(run.samples.len(), 1001);
}
