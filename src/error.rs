//! Error types for the orchestration core.
//!
//! Using `thiserror`, this module gathers every failure the core can report
//! into a small number of enums, each matching one layer of the system:
//!
//! - **`DeviceError`**: raised by an instrument call. Its [`DeviceErrorKind`]
//!   separates *transient* failures (timeout, busy, a momentary communication
//!   glitch) that the owning component may retry from *fatal* ones (device
//!   removed, invalid handle, driver fault) that force a terminal or
//!   disconnected state.
//! - **`ScanConfigError`**: an invalid scan parameter. Scan configurations are
//!   rejected before any device call and never clamped.
//! - **`ScanError`**: misuse of the scan state machine (`Busy`, `NotArmed`).
//! - **`CameraError`**: misuse of the camera session manager.
//! - **`AlignmentError`**: an alignment or mapping request that cannot start.
//! - **`ExportError`**: one export format failed. Sibling formats are unaffected.
//! - **`LabError`**: the aggregate returned to command issuers.
//!
//! Cancellation is not an error. A cancelled task finishes with
//! [`TaskOutcome::Cancelled`](crate::executor::TaskOutcome::Cancelled).

use crate::config::ConfigError;
use crate::device::DeviceId;
use crate::scan::ScanStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for results using the command-layer error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Whether a device failure may be retried by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceErrorKind {
    /// Timeout, busy, momentary communication glitch.
    Transient,
    /// Device removed, invalid handle, unrecoverable driver fault.
    Fatal,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// A failed call on an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error on device '{device}': {message}")]
pub struct DeviceError {
    /// Retry classification.
    pub kind: DeviceErrorKind,
    /// Device the call was addressed to.
    pub device: DeviceId,
    /// Human readable description.
    pub message: String,
}

impl DeviceError {
    /// A retryable failure.
    pub fn transient(device: &DeviceId, message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Transient,
            device: device.clone(),
            message: message.into(),
        }
    }

    /// A failure that requires reconnecting or reconfiguring.
    pub fn fatal(device: &DeviceId, message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Fatal,
            device: device.clone(),
            message: message.into(),
        }
    }

    /// The call exceeded its maximum wait.
    pub fn timeout(device: &DeviceId, after: Duration) -> Self {
        Self::transient(device, format!("call timed out after {:?}", after))
    }

    /// A momentary communication glitch.
    pub fn comm(device: &DeviceId, message: impl Into<String>) -> Self {
        Self::transient(device, format!("communication error: {}", message.into()))
    }

    /// The driver reported an unrecoverable fault.
    pub fn fault(device: &DeviceId, code: i32, message: impl Into<String>) -> Self {
        Self::fatal(device, format!("driver fault {}: {}", code, message.into()))
    }

    /// The device refused the call because it is occupied.
    pub fn busy(device: &DeviceId) -> Self {
        Self::transient(device, "device busy")
    }

    /// The device is no longer attached.
    pub fn removed(device: &DeviceId) -> Self {
        Self::fatal(device, "device removed")
    }

    /// The call used a handle that is closed or was never opened.
    pub fn invalid_handle(device: &DeviceId) -> Self {
        Self::fatal(device, "invalid or closed device handle")
    }

    /// Returns true for retryable failures.
    pub fn is_transient(&self) -> bool {
        self.kind == DeviceErrorKind::Transient
    }

    /// Returns true for failures that invalidate the handle.
    pub fn is_fatal(&self) -> bool {
        self.kind == DeviceErrorKind::Fatal
    }
}

/// A scan configuration that cannot be executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanConfigError {
    /// A parameter is NaN or infinite.
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),

    /// Start is not below end.
    #[error("start wavelength {start} nm must be below end wavelength {end} nm")]
    InvalidRange {
        /// Requested start, nm.
        start: f64,
        /// Requested end, nm.
        end: f64,
    },

    /// The range leaves the laser's tuning limits.
    #[error("wavelength range {start}-{end} nm exceeds laser limits {min}-{max} nm")]
    OutOfLaserRange {
        /// Requested start, nm.
        start: f64,
        /// Requested end, nm.
        end: f64,
        /// Laser minimum, nm.
        min: f64,
        /// Laser maximum, nm.
        max: f64,
    },

    /// Resolution is not a positive whole number of picometres within the span.
    #[error("resolution {0} nm must be a positive whole number of picometres no larger than the scan span")]
    InvalidResolution(f64),

    /// Laser power outside 0.1-50 mW.
    #[error("laser power {0} mW is outside 0.1-50 mW")]
    InvalidPower(f64),

    /// Sweep speed is zero or negative.
    #[error("sweep speed must be positive")]
    InvalidSpeed,
}

/// Misuse of the scan state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    /// A run is armed or running on the unit.
    #[error("scan unit '{unit}' is busy with run {run}")]
    Busy {
        /// The scan unit.
        unit: DeviceId,
        /// Run holding it.
        run: Uuid,
    },

    /// `start` without a configured run.
    #[error("no scan is armed on '{0}'")]
    NotArmed(DeviceId),

    /// Nothing to abort.
    #[error("no active scan on '{0}'")]
    NoActiveRun(DeviceId),

    /// The configuration failed validation.
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(#[from] ScanConfigError),
}

/// Misuse of the camera session manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// No camera with this identifier is configured.
    #[error("camera '{0}' is not known")]
    UnknownCamera(DeviceId),

    /// A session for the camera is already running.
    #[error("camera '{0}' is already open")]
    AlreadyOpen(DeviceId),

    /// The camera must be Live for this request.
    #[error("camera '{0}' is not live")]
    NotLive(DeviceId),
}

/// An alignment or mapping request that cannot start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentError {
    /// Another alignment or mapping task is running.
    #[error("an alignment task is already running ({0})")]
    Busy(&'static str),

    /// The stage the task needs is not configured.
    #[error("the {0} piezo stage is not available")]
    StageUnavailable(&'static str),

    /// A scan owns the laser and the detectors.
    #[error("a scan is running")]
    ScanActive,

    /// Settings outside the accepted ranges. Never clamped.
    #[error("{0}")]
    InvalidSettings(String),
}

/// A single export format failed.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Only completed, aborted or failed runs with samples are exported.
    #[error("cannot export a run in state {0:?}")]
    NotExportable(ScanStatus),

    /// Creating or writing the file failed.
    #[error("{format}: failed to write {}: {source}", path.display())]
    Io {
        /// Format that failed.
        format: &'static str,
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The CSV writer failed.
    #[cfg(feature = "storage_csv")]
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other writer failure.
    #[error("{format}: {message}")]
    Writer {
        /// Format that failed.
        format: &'static str,
        /// What went wrong.
        message: String,
    },
}

impl ExportError {
    /// Name of the format that failed, if the error belongs to one.
    pub fn format(&self) -> Option<&'static str> {
        match self {
            Self::NotExportable(_) => None,
            #[cfg(feature = "storage_csv")]
            Self::Csv(_) => Some("csv"),
            Self::Json(_) => Some("json"),
            Self::Io { format, .. } | Self::Writer { format, .. } => Some(format),
        }
    }
}

/// Aggregate error returned to command issuers.
#[derive(Debug, Error)]
pub enum LabError {
    /// Invalid application settings or scan parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A device call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Scan state machine misuse. Invalid parameters map to `Configuration`.
    #[error(transparent)]
    Scan(ScanError),

    /// Camera session misuse.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The export request failed as a whole.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Alignment request refused. Invalid settings map to `Configuration`.
    #[error(transparent)]
    Alignment(AlignmentError),

    /// The requested run is neither active nor in the history.
    #[error("No scan run {0} is available for export")]
    RunNotFound(Uuid),

    /// Export without a run id, but no run has finished yet.
    #[error("No finished scan run is available for export")]
    NoFinishedRun,

    /// The instrument the command needs is not configured.
    #[error("The {0} is disabled in the configuration")]
    Disabled(&'static str),

    /// The actor has stopped accepting commands.
    #[error("Lab is shutting down")]
    ShuttingDown,
}

impl From<ScanConfigError> for LabError {
    fn from(err: ScanConfigError) -> Self {
        LabError::Configuration(err.to_string())
    }
}

impl From<ConfigError> for LabError {
    fn from(err: ConfigError) -> Self {
        LabError::Configuration(err.to_string())
    }
}

impl From<ScanError> for LabError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::InvalidConfig(invalid) => invalid.into(),
            other => LabError::Scan(other),
        }
    }
}

impl From<AlignmentError> for LabError {
    fn from(err: AlignmentError) -> Self {
        match err {
            AlignmentError::InvalidSettings(message) => LabError::Configuration(message),
            other => LabError::Alignment(other),
        }
    }
}
