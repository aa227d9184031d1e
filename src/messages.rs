//! Commands accepted by the [`Lab`](crate::lab::Lab) actor.
//!
//! Each command carries a oneshot sender for its reply. Replies only
//! acknowledge that the command was accepted (or say why it was refused);
//! progress and results of the work it starts arrive on the event bus.

use crate::alignment::{AlignmentSettings, MappingSettings};
use crate::camera::CameraSession;
use crate::device::{CameraParameter, DeviceId, PowerSample};
use crate::error::LabResult;
use crate::scan::{ScanConfig, ScanRun};
use std::path::PathBuf;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Where and under which name to export a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportRequest {
    /// Run to export; the most recent finished run when `None`.
    pub run: Option<Uuid>,
    /// Output directory; the configured one when `None`.
    pub directory: Option<PathBuf>,
    /// File base name; `scan_<start>nm_<end>nm` when `None`.
    pub base_name: Option<String>,
}

/// Commands that can be sent to the Lab actor
#[derive(Debug)]
pub enum LabCommand {
    /// Configure and start a scan; configured defaults when `config` is `None`.
    StartScan {
        config: Option<ScanConfig>,
        response: oneshot::Sender<LabResult<Uuid>>,
    },

    /// Aborts the armed or running scan.
    AbortScan {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Active run, else the run with the given id from history.
    GetScanRun {
        run: Option<Uuid>,
        response: oneshot::Sender<Option<ScanRun>>,
    },

    /// Archived runs, oldest first.
    GetScanHistory {
        response: oneshot::Sender<Vec<ScanRun>>,
    },

    /// Starts a session; the camera goes Live asynchronously.
    OpenCamera {
        camera: DeviceId,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Ends a session without waiting on the device.
    CloseCamera {
        camera: DeviceId,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Applies one parameter to a Live camera.
    SetCameraParameter {
        camera: DeviceId,
        parameter: CameraParameter,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Lists attached cameras on the bus.
    DiscoverCameras {
        response: oneshot::Sender<()>,
    },

    /// Snapshot of every configured camera session.
    GetCameraSessions {
        response: oneshot::Sender<Vec<CameraSession>>,
    },

    /// Replies whether the monitor was started by this command.
    StartMonitor {
        response: oneshot::Sender<LabResult<bool>>,
    },

    /// Replies whether the monitor was running.
    StopMonitor {
        response: oneshot::Sender<LabResult<bool>>,
    },

    /// Buffered monitor samples, oldest first.
    GetMonitorSamples {
        response: oneshot::Sender<Vec<PowerSample>>,
    },

    /// Aligns both piezo stages; configured settings when `settings` is `None`.
    StartAlignment {
        settings: Option<AlignmentSettings>,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Maps coupled power over one stage; configured settings when `settings` is `None`.
    StartMapping {
        settings: Option<MappingSettings>,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Replies whether an alignment or mapping task was running.
    StopAlignment {
        response: oneshot::Sender<LabResult<bool>>,
    },

    /// Replies with the id of the run being exported.
    Export {
        request: ExportRequest,
        response: oneshot::Sender<LabResult<Uuid>>,
    },

    /// Aborts any scan, stops the monitor, closes cameras and ends the actor.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl LabCommand {
    /// Command and reply receiver for [`LabCommand::StartScan`].
    pub fn start_scan(config: Option<ScanConfig>) -> (Self, oneshot::Receiver<LabResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartScan { config, response: tx }, rx)
    }

    /// See [`LabCommand::AbortScan`].
    pub fn abort_scan() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::AbortScan { response: tx }, rx)
    }

    /// See [`LabCommand::GetScanRun`].
    pub fn get_scan_run(run: Option<Uuid>) -> (Self, oneshot::Receiver<Option<ScanRun>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetScanRun { run, response: tx }, rx)
    }

    /// See [`LabCommand::GetScanHistory`].
    pub fn get_scan_history() -> (Self, oneshot::Receiver<Vec<ScanRun>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetScanHistory { response: tx }, rx)
    }

    /// See [`LabCommand::OpenCamera`].
    pub fn open_camera(camera: DeviceId) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::OpenCamera { camera, response: tx }, rx)
    }

    /// See [`LabCommand::CloseCamera`].
    pub fn close_camera(camera: DeviceId) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CloseCamera { camera, response: tx }, rx)
    }

    /// See [`LabCommand::SetCameraParameter`].
    pub fn set_camera_parameter(
        camera: DeviceId,
        parameter: CameraParameter,
    ) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetCameraParameter {
                camera,
                parameter,
                response: tx,
            },
            rx,
        )
    }

    /// See [`LabCommand::DiscoverCameras`].
    pub fn discover_cameras() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::DiscoverCameras { response: tx }, rx)
    }

    /// See [`LabCommand::GetCameraSessions`].
    pub fn get_camera_sessions() -> (Self, oneshot::Receiver<Vec<CameraSession>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCameraSessions { response: tx }, rx)
    }

    /// See [`LabCommand::StartMonitor`].
    pub fn start_monitor() -> (Self, oneshot::Receiver<LabResult<bool>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartMonitor { response: tx }, rx)
    }

    /// See [`LabCommand::StopMonitor`].
    pub fn stop_monitor() -> (Self, oneshot::Receiver<LabResult<bool>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopMonitor { response: tx }, rx)
    }

    /// See [`LabCommand::GetMonitorSamples`].
    pub fn get_monitor_samples() -> (Self, oneshot::Receiver<Vec<PowerSample>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetMonitorSamples { response: tx }, rx)
    }

    /// See [`LabCommand::StartAlignment`].
    pub fn start_alignment(settings: Option<AlignmentSettings>) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartAlignment { settings, response: tx }, rx)
    }

    /// See [`LabCommand::StartMapping`].
    pub fn start_mapping(settings: Option<MappingSettings>) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartMapping { settings, response: tx }, rx)
    }

    /// See [`LabCommand::StopAlignment`].
    pub fn stop_alignment() -> (Self, oneshot::Receiver<LabResult<bool>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopAlignment { response: tx }, rx)
    }

    /// See [`LabCommand::Export`].
    pub fn export(request: ExportRequest) -> (Self, oneshot::Receiver<LabResult<Uuid>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Export { request, response: tx }, rx)
    }

    /// See [`LabCommand::Shutdown`].
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
