//! Typed configuration loaded with Figment.
//!
//! Configuration is read from a TOML file (default `config/iopanel.toml`)
//! and may be overridden by environment variables prefixed with `IOPANEL_`,
//! nested keys separated by `__`:
//!
//! ```text
//! IOPANEL_LOGGING__LEVEL=debug
//! IOPANEL_RUNTIME__WORKER_POOL_SIZE=8
//! IOPANEL_INSTRUMENTS__SCAN_UNIT__GPIB_ADDRESS=12
//! ```
//!
//! Every section is optional and falls back to defaults, except the fields
//! the hardware cannot do without: the scan unit's `library_path` when the
//! scan unit is enabled, and each camera's `identifier`. Those are reported
//! by [`AppConfig::validate`], never defaulted.

use crate::alignment::{AlignerOptions, AlignmentSettings, MappingSettings};
use crate::camera::{CameraSpec, WatchdogConfig};
use crate::device::scan_unit::DetectorArray;
use crate::device::{Detector, DeviceId, LaserInput, LaserSource, MonitorSettings};
use crate::executor::ExecutorOptions;
use crate::monitor::MonitorOptions;
use crate::retry::RetryPolicy;
use crate::scan::{LaserLimits, ScanConfig, ScanSettings, MAX_POWER_MW, MIN_POWER_MW};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/iopanel.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are unusable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application identity.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Log level and destination.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Scan unit, power monitor and piezo stages.
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    /// Cameras opened at startup.
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    /// Scan used when a command gives none.
    #[serde(default)]
    pub scan_defaults: ScanDefaults,
    /// Live power monitor.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Where scan results are written.
    #[serde(default)]
    pub export: ExportConfig,
    /// Piezo alignment and mapping.
    #[serde(default)]
    pub alignment: AlignmentConfig,
    /// Executor, polling and watchdog tuning.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Application identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name shown in logs.
    pub name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "IOPanel".to_string(),
        }
    }
}

/// Logging setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Instruments driven through the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// Swept-laser scan unit.
    #[serde(default)]
    pub scan_unit: ScanUnitConfig,
    /// Detector block used by the live monitor.
    #[serde(default)]
    pub power_monitor: PowerMonitorConfig,
    /// Input-side piezo stage.
    #[serde(default = "PiezoConfig::left")]
    pub piezo_left: PiezoConfig,
    /// Output-side piezo stage.
    #[serde(default = "PiezoConfig::right")]
    pub piezo_right: PiezoConfig,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            scan_unit: ScanUnitConfig::default(),
            power_monitor: PowerMonitorConfig::default(),
            piezo_left: PiezoConfig::left(),
            piezo_right: PiezoConfig::right(),
        }
    }
}

/// CT400 scan unit and the laser attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanUnitConfig {
    /// Open the scan unit at startup.
    pub enabled: bool,
    /// Vendor library or device path. Required when enabled.
    pub library_path: Option<PathBuf>,
    /// Address used in logs and error reports.
    pub address: String,
    /// GPIB address of the laser, 0-30.
    pub gpib_address: u8,
    /// Laser model attached to the unit.
    pub laser_type: LaserSource,
    /// Shortest wavelength the laser reaches.
    pub min_wavelength_nm: f64,
    /// Longest wavelength the laser reaches.
    pub max_wavelength_nm: f64,
    /// Detector ports wired on the unit.
    pub detectors: DetectorArray,
}

impl Default for ScanUnitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            library_path: None,
            address: "ct400".to_string(),
            gpib_address: 10,
            laser_type: LaserSource::default(),
            min_wavelength_nm: 1440.0,
            max_wavelength_nm: 1640.0,
            detectors: DetectorArray::default(),
        }
    }
}

impl ScanUnitConfig {
    /// Wavelength limits for scan validation.
    pub fn limits(&self) -> LaserLimits {
        LaserLimits {
            min_wavelength_nm: self.min_wavelength_nm,
            max_wavelength_nm: self.max_wavelength_nm,
        }
    }
}

/// Detector block read by the live monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerMonitorConfig {
    /// Open the detector block at startup.
    pub enabled: bool,
    /// Address used in logs and error reports.
    pub address: String,
    /// Detector ports (1-4) kept by the live monitor.
    pub channels: Vec<u8>,
}

impl Default for PowerMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "ct400-detectors".to_string(),
            channels: vec![1, 2, 3, 4],
        }
    }
}

impl PowerMonitorConfig {
    /// Enabled detectors; unknown ports are skipped (validation reports them).
    pub fn detectors(&self) -> Vec<Detector> {
        self.channels
            .iter()
            .filter_map(|&port| Detector::PORTS.get(usize::from(port).checked_sub(1)?).copied())
            .collect()
    }
}

/// Piezo controller on a serial port. Disabled unless configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiezoConfig {
    /// Open the stage at startup.
    #[serde(default)]
    pub enabled: bool,
    /// Serial port, e.g. `COM3`.
    #[serde(default)]
    pub address: String,
}

impl PiezoConfig {
    fn left() -> Self {
        Self {
            enabled: false,
            address: "COM3".to_string(),
        }
    }

    fn right() -> Self {
        Self {
            enabled: false,
            address: "COM4".to_string(),
        }
    }
}

/// One camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Vendor camera id used to open the device.
    pub identifier: String,
    /// Display name; the identifier when empty.
    #[serde(default)]
    pub name: String,
    /// Open the camera at startup.
    #[serde(default)]
    pub enabled: bool,
    /// Mirror frames left to right.
    #[serde(default)]
    pub flip_horizontal: bool,
}

impl CameraConfig {
    /// Session description for the camera manager.
    pub fn spec(&self) -> CameraSpec {
        CameraSpec {
            identifier: DeviceId::new(self.identifier.clone()),
            name: if self.name.is_empty() {
                self.identifier.clone()
            } else {
                self.name.clone()
            },
            flip_horizontal: self.flip_horizontal,
        }
    }
}

/// Unit of a configured laser power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerUnit {
    /// Milliwatts.
    #[default]
    #[serde(rename = "mW")]
    MilliWatt,
    /// Decibels relative to 1 mW.
    #[serde(rename = "dBm")]
    Dbm,
}

impl PowerUnit {
    /// `value` in this unit converted to mW.
    pub fn to_mw(self, value: f64) -> f64 {
        match self {
            Self::MilliWatt => value,
            Self::Dbm => 10f64.powf(value / 10.0),
        }
    }
}

/// Scan used when a command gives none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanDefaults {
    /// First wavelength of the sweep.
    pub start_wavelength_nm: f64,
    /// Last wavelength of the sweep.
    pub end_wavelength_nm: f64,
    /// Sample spacing in picometres.
    pub resolution_pm: u32,
    /// Sweep speed.
    pub speed_nm_s: f64,
    /// Laser power in `power_unit`.
    pub laser_power: f64,
    /// Unit of `laser_power`.
    pub power_unit: PowerUnit,
    /// Laser input the sweep uses.
    pub input_port: LaserInput,
    /// Wavelength the laser is parked at after a scan.
    pub safe_parking_wavelength_nm: f64,
    /// Read the power monitor during scans.
    pub monitor_power: bool,
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            start_wavelength_nm: 1550.0,
            end_wavelength_nm: 1560.0,
            resolution_pm: 1,
            speed_nm_s: 10.0,
            laser_power: 1.0,
            power_unit: PowerUnit::MilliWatt,
            input_port: LaserInput::Port1,
            safe_parking_wavelength_nm: 1550.0,
            monitor_power: false,
        }
    }
}

impl ScanDefaults {
    /// Defaults as a scan request.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            start_nm: self.start_wavelength_nm,
            end_nm: self.end_wavelength_nm,
            resolution_nm: f64::from(self.resolution_pm) / 1000.0,
            laser_power_mw: self.power_unit.to_mw(self.laser_power),
            speed_nm_s: self.speed_nm_s,
            input: self.input_port,
            monitor_power: self.monitor_power,
        }
    }
}

/// Live power monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Fixed laser wavelength while monitoring.
    pub wavelength_nm: f64,
    /// Laser power in `power_unit`.
    pub laser_power: f64,
    /// Unit of `laser_power`.
    pub power_unit: PowerUnit,
    /// Laser input used while monitoring.
    pub input_port: LaserInput,
    /// Time between detector reads.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Ring buffer capacity in samples.
    pub capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            wavelength_nm: 1550.0,
            laser_power: 1.0,
            power_unit: PowerUnit::MilliWatt,
            input_port: LaserInput::Port1,
            poll_interval: Duration::from_millis(250),
            capacity: crate::monitor::DEFAULT_CAPACITY,
        }
    }
}

/// Scan result export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory exported files are written to.
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Piezo alignment timing and the settings used when a command gives none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Wait after each stage move before reading power.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Time between power reads while settled.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Detector port (1-4) whose power is maximised.
    pub detector: u8,
    /// Smallest gain that counts as an improvement.
    pub min_gain_db: f64,
    /// Step limit per axis during a climb.
    pub max_climb_steps: usize,
    /// Alignment settings used when a command gives none.
    pub climb: AlignmentSettings,
    /// Mapping settings used when a command gives none.
    pub mapping: MappingSettings,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        let options = AlignerOptions::default();
        Self {
            settle_time: options.settle_time,
            sample_interval: options.sample_interval,
            detector: 1,
            min_gain_db: options.min_gain_db,
            max_climb_steps: options.max_climb_steps,
            climb: AlignmentSettings::default(),
            mapping: MappingSettings::default(),
        }
    }
}

impl AlignmentConfig {
    /// Aligner tuning; unknown detector ports fall back to port 1.
    pub fn options(&self) -> AlignerOptions {
        AlignerOptions {
            settle_time: self.settle_time,
            sample_interval: self.sample_interval,
            detector: Detector::PORTS
                .get(usize::from(self.detector).saturating_sub(1))
                .copied()
                .unwrap_or(Detector::De1),
            min_gain_db: self.min_gain_db,
            max_climb_steps: self.max_climb_steps,
        }
    }
}

/// Executor, polling and watchdog tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads shared by device lanes.
    pub worker_pool_size: usize,
    /// Limit on one blocking device call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Time between scan status polls.
    #[serde(with = "humantime_serde")]
    pub scan_poll_interval: Duration,
    /// Attempts before a retried call gives up.
    pub scan_poll_attempts: u32,
    /// Pause between retried calls.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Time between camera heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a camera is reopened.
    pub missed_heartbeat_threshold: u32,
    /// First delay before reopening a camera.
    #[serde(with = "humantime_serde")]
    pub reconnect_initial_backoff: Duration,
    /// Longest delay between reopen attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_max_backoff: Duration,
    /// Reopen attempts before a camera is given up.
    pub camera_open_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let watchdog = WatchdogConfig::default();
        let executor = ExecutorOptions::default();
        let retry = RetryPolicy::default();
        Self {
            worker_pool_size: executor.pool_size,
            call_timeout: executor.call_timeout,
            scan_poll_interval: Duration::from_millis(100),
            scan_poll_attempts: retry.max_attempts,
            retry_delay: retry.backoff_delay,
            heartbeat_interval: watchdog.heartbeat_interval,
            missed_heartbeat_threshold: watchdog.missed_threshold,
            reconnect_initial_backoff: watchdog.initial_backoff,
            reconnect_max_backoff: watchdog.max_backoff,
            camera_open_attempts: watchdog.max_open_attempts,
        }
    }
}

impl RuntimeConfig {
    /// Executor pool settings.
    pub fn executor(&self) -> ExecutorOptions {
        ExecutorOptions {
            pool_size: self.worker_pool_size,
            call_timeout: self.call_timeout,
        }
    }

    /// Camera watchdog settings.
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            heartbeat_interval: self.heartbeat_interval,
            missed_threshold: self.missed_heartbeat_threshold,
            initial_backoff: self.reconnect_initial_backoff,
            max_backoff: self.reconnect_max_backoff,
            max_open_attempts: self.camera_open_attempts,
        }
    }

    /// Retry policy for scan polling.
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.scan_poll_attempts,
            backoff_delay: self.retry_delay,
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

impl AppConfig {
    /// Loads the file at `path`, applies `IOPANEL_` environment overrides and validates.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IOPANEL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates TOML text, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints and required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let unit = &self.instruments.scan_unit;
        if unit.enabled && unit.library_path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
            return Err(invalid(
                "instruments.scan_unit.library_path is required when the scan unit is enabled",
            ));
        }
        if unit.address.is_empty() {
            return Err(invalid("instruments.scan_unit.address cannot be empty"));
        }
        if unit.gpib_address > 30 {
            return Err(invalid(format!(
                "instruments.scan_unit.gpib_address {} must be 0-30",
                unit.gpib_address
            )));
        }
        if !(unit.min_wavelength_nm < unit.max_wavelength_nm) {
            return Err(invalid(format!(
                "instruments.scan_unit wavelength limits {}-{} nm are inverted",
                unit.min_wavelength_nm, unit.max_wavelength_nm
            )));
        }

        let monitor = &self.instruments.power_monitor;
        let mut ports = HashSet::new();
        for &port in &monitor.channels {
            if !(1..=4).contains(&port) || !ports.insert(port) {
                return Err(invalid(format!(
                    "instruments.power_monitor.channels: invalid or duplicate detector {}",
                    port
                )));
            }
        }

        if unit.enabled && monitor.enabled && unit.address == monitor.address {
            return Err(invalid(format!(
                "instruments.scan_unit and instruments.power_monitor share address '{}'",
                unit.address
            )));
        }

        let left = &self.instruments.piezo_left;
        let right = &self.instruments.piezo_right;
        for (name, piezo) in [("piezo_left", left), ("piezo_right", right)] {
            if piezo.enabled && piezo.address.trim().is_empty() {
                return Err(invalid(format!("instruments.{}.address cannot be empty", name)));
            }
        }
        if left.enabled && right.enabled && left.address == right.address {
            return Err(invalid(format!(
                "instruments.piezo_left and instruments.piezo_right share address '{}'",
                left.address
            )));
        }

        let align = &self.alignment;
        if !(1..=4).contains(&align.detector) {
            return Err(invalid(format!("alignment.detector {} must be 1-4", align.detector)));
        }
        if !(align.min_gain_db >= 0.0) || align.max_climb_steps == 0 {
            return Err(invalid(
                "alignment.min_gain_db must not be negative and alignment.max_climb_steps must be at least 1",
            ));
        }
        align
            .climb
            .validate()
            .map_err(|err| invalid(format!("alignment.climb: {}", err)))?;
        align
            .mapping
            .validate()
            .map_err(|err| invalid(format!("alignment.mapping: {}", err)))?;

        let mut identifiers = HashSet::new();
        for (i, camera) in self.cameras.iter().enumerate() {
            if camera.identifier.trim().is_empty() {
                return Err(invalid(format!("cameras[{}].identifier cannot be empty", i)));
            }
            if !identifiers.insert(camera.identifier.as_str()) {
                return Err(invalid(format!("Duplicate camera identifier: '{}'", camera.identifier)));
            }
        }

        let limits = unit.limits();
        self.scan_defaults
            .scan_config()
            .validate(&limits)
            .map_err(|err| invalid(format!("scan_defaults: {}", err)))?;
        let park = self.scan_defaults.safe_parking_wavelength_nm;
        if !(limits.min_wavelength_nm..=limits.max_wavelength_nm).contains(&park) {
            return Err(invalid(format!(
                "scan_defaults.safe_parking_wavelength_nm {} is outside the laser range",
                park
            )));
        }

        let live = &self.monitor;
        if !(limits.min_wavelength_nm..=limits.max_wavelength_nm).contains(&live.wavelength_nm) {
            return Err(invalid(format!(
                "monitor.wavelength_nm {} is outside the laser range",
                live.wavelength_nm
            )));
        }
        if !(MIN_POWER_MW..=MAX_POWER_MW).contains(&live.power_unit.to_mw(live.laser_power)) {
            return Err(invalid(format!("monitor.laser_power {} is out of range", live.laser_power)));
        }
        if live.capacity == 0 || live.poll_interval.is_zero() {
            return Err(invalid("monitor.capacity and monitor.poll_interval must be positive"));
        }

        let rt = &self.runtime;
        if rt.worker_pool_size == 0 {
            return Err(invalid("runtime.worker_pool_size must be at least 1"));
        }
        if rt.call_timeout.is_zero() || rt.scan_poll_interval.is_zero() || rt.heartbeat_interval.is_zero() {
            return Err(invalid("runtime timeouts and intervals must be positive"));
        }
        if rt.scan_poll_attempts == 0 || rt.missed_heartbeat_threshold == 0 || rt.camera_open_attempts == 0 {
            return Err(invalid("runtime attempt counts and thresholds must be at least 1"));
        }
        if rt.reconnect_max_backoff < rt.reconnect_initial_backoff {
            return Err(invalid("runtime.reconnect_max_backoff must not be below the initial backoff"));
        }
        Ok(())
    }

    /// Cameras opened at startup.
    pub fn enabled_cameras(&self) -> Vec<&CameraConfig> {
        self.cameras.iter().filter(|camera| camera.enabled).collect()
    }

    /// Scan orchestrator settings.
    pub fn scan_settings(&self) -> ScanSettings {
        let unit = &self.instruments.scan_unit;
        ScanSettings {
            limits: unit.limits(),
            gpib_address: unit.gpib_address,
            source: unit.laser_type,
            detectors: unit.detectors,
            park_wavelength_nm: self.scan_defaults.safe_parking_wavelength_nm,
            poll_interval: self.runtime.scan_poll_interval,
            retry: self.runtime.retry(),
        }
    }

    /// Live monitor settings.
    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            settings: MonitorSettings {
                input: self.monitor.input_port,
                wavelength_nm: self.monitor.wavelength_nm,
                power_mw: self.monitor.power_unit.to_mw(self.monitor.laser_power),
            },
            poll_interval: self.monitor.poll_interval,
            capacity: self.monitor.capacity,
            channels: self.instruments.power_monitor.detectors(),
            retry: self.runtime.retry(),
        }
    }
}
