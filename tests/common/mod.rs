//! Common test utilities for iopanel integration tests
//!
//! - Fast runtime settings so scans, heartbeats and backoffs finish in milliseconds
//! - Event helpers that drain the bus until a matching event arrives
//! - Builders for orchestrators, camera managers and aligners on simulated instruments

#![allow(dead_code)] // Not every test binary uses every helper

use iopanel::alignment::{Aligner, AlignerOptions};
use iopanel::bus::{Delivery, Event, EventBus, EventReceiver, EventSender, Producer};
use iopanel::camera::{CameraManager, CameraSpec, WatchdogConfig};
use iopanel::config::AppConfig;
use iopanel::device::mock::{
    MockCameraBackend, MockControl, MockCoupling, MockPiezo, MockPowerMonitor, MockScanUnit,
};
use iopanel::device::{Connection, DeviceId, LaserInput, PiezoStage, PowerMonitor, ScanUnit};
use iopanel::executor::{ExecutorOptions, TaskExecutor};
use iopanel::retry::RetryPolicy;
use iopanel::scan::{ScanConfig, ScanOrchestrator, ScanSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Upper bound for any single wait in these tests.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub const UNIT: &str = "ct400";
pub const MONITOR: &str = "ct400-detectors";
pub const LEFT: &str = "COM3";
pub const RIGHT: &str = "COM4";

/// Peak coupled power of the alignment rig, dBm.
pub const PEAK_DBM: f64 = -12.0;

/// Configuration with millisecond timings and one disabled camera.
pub const FAST_CONFIG: &str = r#"
[instruments.scan_unit]
library_path = "CT400_lib.dll"
address = "ct400"

[instruments.power_monitor]
address = "ct400-detectors"

[[cameras]]
identifier = "cam0"
name = "Top view"

[monitor]
poll_interval = "10ms"
capacity = 64

[runtime]
call_timeout = "1s"
scan_poll_interval = "5ms"
retry_delay = "5ms"
heartbeat_interval = "30ms"
reconnect_initial_backoff = "20ms"
reconnect_max_backoff = "80ms"
"#;

pub fn fast_config() -> AppConfig {
    AppConfig::from_toml_str(FAST_CONFIG).unwrap()
}

pub fn scan_config(start_nm: f64, end_nm: f64, resolution_nm: f64) -> ScanConfig {
    ScanConfig {
        start_nm,
        end_nm,
        resolution_nm,
        laser_power_mw: 1.0,
        speed_nm_s: 10.0,
        input: LaserInput::Port1,
        monitor_power: false,
    }
}

pub fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        heartbeat_interval: Duration::from_millis(30),
        missed_threshold: 3,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(80),
        max_open_attempts: 3,
    }
}

pub fn executor(bus: &EventSender) -> TaskExecutor {
    TaskExecutor::new(
        Handle::current(),
        bus.clone(),
        ExecutorOptions {
            pool_size: 4,
            call_timeout: Duration::from_secs(1),
        },
    )
}

/// A scan orchestrator over a mock unit (and optionally a mock monitor).
pub struct ScanRig {
    pub scans: ScanOrchestrator,
    pub events: EventReceiver,
    pub unit: MockControl,
    pub monitor: MockControl,
}

pub fn scan_rig(batch: usize, with_monitor: bool) -> ScanRig {
    let (bus, events) = EventBus::new();
    let exec = executor(&bus);
    let unit_control = MockControl::new();
    let monitor_control = MockControl::new();

    let unit: Box<dyn ScanUnit> = Box::new(MockScanUnit::with_control(UNIT, unit_control.clone()).with_batch_size(batch));
    let lane = exec
        .register(DeviceId::from(UNIT), Connection::new(unit, UNIT))
        .unwrap();
    let monitor_lane = with_monitor.then(|| {
        let monitor: Box<dyn PowerMonitor> = Box::new(MockPowerMonitor::with_control(MONITOR, monitor_control.clone()));
        exec.register(DeviceId::from(MONITOR), Connection::new(monitor, MONITOR))
            .unwrap()
    });
    let settings = ScanSettings {
        poll_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(2),
        },
        ..ScanSettings::default()
    };
    ScanRig {
        scans: ScanOrchestrator::new(Handle::current(), bus, lane, monitor_lane, settings),
        events,
        unit: unit_control,
        monitor: monitor_control,
    }
}

/// A camera manager over a mock backend with one camera, `cam0`.
pub struct CameraRig {
    pub cameras: CameraManager,
    pub events: EventReceiver,
    pub control: MockControl,
    pub id: DeviceId,
}

pub fn camera_rig(flip: bool) -> CameraRig {
    let (bus, events) = EventBus::new();
    let mut backend = MockCameraBackend::new().with_frame_interval(Duration::from_millis(5));
    let control = backend.add_camera("cam0", "Top view");
    let id = DeviceId::from("cam0");
    let spec = CameraSpec {
        identifier: id.clone(),
        name: "Top view".to_string(),
        flip_horizontal: flip,
    };
    let cameras = CameraManager::new(executor(&bus), Arc::new(backend), fast_watchdog(), vec![spec]).unwrap();
    CameraRig {
        cameras,
        events,
        control,
        id,
    }
}

/// An aligner over mock stages whose positions drive detector 1 of a mock monitor.
pub struct AlignmentRig {
    pub aligner: Aligner,
    pub events: EventReceiver,
    pub coupling: MockCoupling,
    pub left: MockControl,
    pub right: MockControl,
}

pub fn alignment_rig(with_right: bool) -> AlignmentRig {
    let (bus, events) = EventBus::new();
    let exec = executor(&bus);
    let coupling = MockCoupling::new(PEAK_DBM, 2.0);
    let left_control = MockControl::new();
    let right_control = MockControl::new();

    let stage = |address: &str, control: &MockControl| {
        let piezo: Box<dyn PiezoStage> =
            Box::new(MockPiezo::new(address, control.clone()).with_coupling(coupling.clone()));
        exec.register(DeviceId::from(address), Connection::new(piezo, address))
            .unwrap()
    };
    let left = stage(LEFT, &left_control);
    let right = with_right.then(|| stage(RIGHT, &right_control));

    let monitor: Box<dyn PowerMonitor> = Box::new(MockPowerMonitor::new(MONITOR).with_coupling(coupling.clone()));
    let monitor_lane = exec
        .register(DeviceId::from(MONITOR), Connection::new(monitor, MONITOR))
        .unwrap();
    let options = AlignerOptions {
        settle_time: Duration::from_millis(1),
        sample_interval: Duration::ZERO,
        ..AlignerOptions::default()
    };
    AlignmentRig {
        aligner: Aligner::new(
            Handle::current(),
            Some(left),
            right,
            monitor_lane,
            bus.publisher(Producer::Alignment),
            options,
        ),
        events,
        coupling,
        left: left_control,
        right: right_control,
    }
}

/// Drains deliveries until `pick` matches an event, or panics after [`EVENT_TIMEOUT`].
pub async fn wait_for_event<T>(events: &mut EventReceiver, mut pick: impl FnMut(&Event) -> Option<T>) -> T {
    let found = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.next().await {
                Some(Delivery::Event(envelope)) => {
                    if let Some(value) = pick(&envelope.event) {
                        return Some(value);
                    }
                }
                Some(Delivery::Frame(_)) => {}
                None => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(value)) => value,
        Ok(None) => panic!("event bus closed before the expected event"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// Drains deliveries until a frame arrives.
pub async fn wait_for_frame(events: &mut EventReceiver) -> iopanel::device::Frame {
    let found = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.next().await {
                Some(Delivery::Frame(frame)) => return Some(frame),
                Some(Delivery::Event(_)) => {}
                None => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(frame)) => frame,
        _ => panic!("no frame delivered"),
    }
}

/// Every event currently queued or arriving within `window`.
pub async fn collect_events(events: &mut EventReceiver, window: Duration) -> Vec<Event> {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Some(delivery) = events.next().await {
            if let Delivery::Event(envelope) = delivery {
                collected.push(envelope.event);
            }
        }
    })
    .await;
    collected
}
