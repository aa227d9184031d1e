//! Multi-channel optical power monitor types.

use super::scan_unit::{Detector, LaserInput};
use super::Instrument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Laser settings applied before live monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Laser input port.
    pub input: LaserInput,
    /// Fixed laser wavelength.
    pub wavelength_nm: f64,
    /// Laser output power.
    pub power_mw: f64,
}

/// One instantaneous reading of every channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerData {
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
    /// Laser output reference, dBm.
    pub pout: f64,
    /// Detectors 1-4, dBm.
    pub detectors: [f64; 4],
}

impl PowerData {
    /// Power on one channel.
    pub fn channel(&self, detector: Detector) -> f64 {
        match detector {
            Detector::Pout => self.pout,
            Detector::De1 => self.detectors[0],
            Detector::De2 => self.detectors[1],
            Detector::De3 => self.detectors[2],
            Detector::De4 => self.detectors[3],
        }
    }

    /// Flattens the reading into one sample per channel.
    pub fn samples(&self) -> Vec<PowerSample> {
        std::iter::once(Detector::Pout)
            .chain(Detector::PORTS)
            .map(|channel| PowerSample {
                channel,
                power: self.channel(channel),
                timestamp: self.timestamp,
            })
            .collect()
    }
}

/// Channel id + power reading + timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// Channel the power was read on.
    pub channel: Detector,
    /// Power, dBm.
    pub power: f64,
    /// Time of the reading it came from.
    pub timestamp: DateTime<Utc>,
}

/// A power monitor is any instrument that reads [`PowerData`].
pub trait PowerMonitor: Instrument<Params = MonitorSettings, Data = PowerData> {}

impl<T> PowerMonitor for T where T: Instrument<Params = MonitorSettings, Data = PowerData> {}
