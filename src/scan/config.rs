//! Scan parameters and their validation.

use crate::device::scan_unit::{sweep_points, LaserInput};
use crate::error::ScanConfigError;
use serde::{Deserialize, Serialize};

/// Lowest laser power the scan unit accepts, mW.
pub const MIN_POWER_MW: f64 = 0.1;
/// Highest laser power the scan unit accepts, mW.
pub const MAX_POWER_MW: f64 = 50.0;

/// Wavelength range supported by the installed laser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaserLimits {
    /// Shortest reachable wavelength.
    pub min_wavelength_nm: f64,
    /// Longest reachable wavelength.
    pub max_wavelength_nm: f64,
}

impl Default for LaserLimits {
    fn default() -> Self {
        Self {
            min_wavelength_nm: 1440.0,
            max_wavelength_nm: 1640.0,
        }
    }
}

/// An immutable scan request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First wavelength of the sweep.
    pub start_nm: f64,
    /// Last wavelength of the sweep.
    pub end_nm: f64,
    /// Sample spacing.
    pub resolution_nm: f64,
    /// Laser output power.
    pub laser_power_mw: f64,
    /// Sweep speed.
    pub speed_nm_s: f64,
    /// Laser input the sweep uses.
    pub input: LaserInput,
    /// Sample the power monitor while sweeping.
    pub monitor_power: bool,
}

impl ScanConfig {
    /// Rejects anything the scan unit cannot execute exactly as requested.
    ///
    /// Values are never clamped: a range outside the laser limits is an
    /// error, not a shorter scan.
    pub fn validate(&self, limits: &LaserLimits) -> Result<(), ScanConfigError> {
        for (name, value) in [
            ("start wavelength", self.start_nm),
            ("end wavelength", self.end_nm),
            ("resolution", self.resolution_nm),
            ("laser power", self.laser_power_mw),
            ("sweep speed", self.speed_nm_s),
        ] {
            if !value.is_finite() {
                return Err(ScanConfigError::NotFinite(name));
            }
        }
        if self.start_nm >= self.end_nm {
            return Err(ScanConfigError::InvalidRange {
                start: self.start_nm,
                end: self.end_nm,
            });
        }
        if self.start_nm < limits.min_wavelength_nm || self.end_nm > limits.max_wavelength_nm {
            return Err(ScanConfigError::OutOfLaserRange {
                start: self.start_nm,
                end: self.end_nm,
                min: limits.min_wavelength_nm,
                max: limits.max_wavelength_nm,
            });
        }
        let picometres = self.resolution_nm * 1000.0;
        if self.resolution_nm <= 0.0
            || (picometres - picometres.round()).abs() > 1e-6
            || picometres.round() < 1.0
            || self.resolution_nm > self.end_nm - self.start_nm
        {
            return Err(ScanConfigError::InvalidResolution(self.resolution_nm));
        }
        if !(MIN_POWER_MW..=MAX_POWER_MW).contains(&self.laser_power_mw) {
            return Err(ScanConfigError::InvalidPower(self.laser_power_mw));
        }
        if self.speed_nm_s <= 0.0 {
            return Err(ScanConfigError::InvalidSpeed);
        }
        Ok(())
    }

    /// Sweep step in picometres.
    pub fn resolution_pm(&self) -> u32 {
        (self.resolution_nm * 1000.0).round().max(0.0) as u32
    }

    /// Points the sweep produces, both ends included.
    pub fn sample_count(&self) -> usize {
        sweep_points(self.start_nm, self.end_nm, self.resolution_nm)
    }
}
