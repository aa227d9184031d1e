//! Wavelength scans: configuration, run data and the orchestrator.

pub mod config;
pub mod orchestrator;
pub mod run;

pub use config::{LaserLimits, ScanConfig, MAX_POWER_MW, MIN_POWER_MW};
pub use orchestrator::{ScanOrchestrator, ScanSettings, ScanUnitLane, HISTORY_LIMIT};
pub use run::{ScanEvent, ScanRun, ScanSample, ScanStatus, ScanTrigger};
