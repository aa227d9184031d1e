//! Wavelength-scanning unit (CT400 family) types.
//!
//! The scan unit is configured with a sequence of [`ScanUnitCommand`]s,
//! `trigger` starts the sweep and each `read` drains the samples acquired
//! since the previous read together with the device scan state.

use super::Instrument;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunable laser models supported by the scan unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LaserSource {
    /// Tunics Plus.
    TunicsPlus,
    /// Tunics Purity.
    TunicsPurity,
    /// Tunics Reference.
    TunicsReference,
    /// Tunics T100S-HP.
    #[default]
    TunicsT100sHp,
    /// Tunics T100R.
    TunicsT100r,
    /// JDSU SWS.
    JdsuSws,
    /// Agilent 816x.
    Agilent,
}

/// Laser input port on the scan unit front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LaserInput {
    /// Input 1.
    #[default]
    Port1,
    /// Input 2.
    Port2,
    /// Input 3.
    Port3,
    /// Input 4.
    Port4,
}

impl TryFrom<u8> for LaserInput {
    type Error = String;

    fn try_from(port: u8) -> Result<Self, Self::Error> {
        match port {
            1 => Ok(Self::Port1),
            2 => Ok(Self::Port2),
            3 => Ok(Self::Port3),
            4 => Ok(Self::Port4),
            other => Err(format!("laser input must be 1-4, got {}", other)),
        }
    }
}

impl From<LaserInput> for u8 {
    fn from(input: LaserInput) -> Self {
        match input {
            LaserInput::Port1 => 1,
            LaserInput::Port2 => 2,
            LaserInput::Port3 => 3,
            LaserInput::Port4 => 4,
        }
    }
}

impl fmt::Display for LaserInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input {}", u8::from(*self))
    }
}

/// Optical detector channels. `Pout` is the laser output reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Detector {
    /// Laser output reference.
    Pout,
    /// Detector 1.
    De1,
    /// Detector 2.
    De2,
    /// Detector 3.
    De3,
    /// Detector 4.
    De4,
}

impl Detector {
    /// Per-port detectors in channel order.
    pub const PORTS: [Detector; 4] = [Detector::De1, Detector::De2, Detector::De3, Detector::De4];
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pout => "pout",
            Self::De1 => "det1",
            Self::De2 => "det2",
            Self::De3 => "det3",
            Self::De4 => "det4",
        };
        f.write_str(name)
    }
}

/// Detectors 2-4 and the external input may be switched off; detector 1 is always on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorArray {
    /// Detector 2 enabled.
    pub de2: bool,
    /// Detector 3 enabled.
    pub de3: bool,
    /// Detector 4 enabled.
    pub de4: bool,
    /// External trigger input enabled.
    pub external: bool,
}

impl Default for DetectorArray {
    fn default() -> Self {
        Self {
            de2: true,
            de3: true,
            de4: true,
            external: false,
        }
    }
}

/// Configuration vocabulary accepted by a scan unit's `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanUnitCommand {
    /// Declares the laser attached to an input.
    SetLaser {
        input: LaserInput,
        enable: bool,
        gpib_address: u8,
        source: LaserSource,
        min_wavelength_nm: f64,
        max_wavelength_nm: f64,
        speed_nm_s: f64,
    },
    /// Drives the laser to a fixed wavelength and power.
    CommandLaser {
        input: LaserInput,
        enable: bool,
        wavelength_nm: f64,
        power_mw: f64,
    },
    /// Sweep range and output power.
    SetScan {
        power_mw: f64,
        min_wavelength_nm: f64,
        max_wavelength_nm: f64,
    },
    /// Sweep step in picometres.
    SetSamplingResolution { picometres: u32 },
    /// Switches detectors 2-4 and the external input.
    SetDetectorArray(DetectorArray),
    /// Stops a running sweep.
    StopScan,
}

impl ScanUnitCommand {
    /// Laser disabled at the safe parking wavelength.
    pub fn park(input: LaserInput, wavelength_nm: f64) -> Self {
        Self::CommandLaser {
            input,
            enable: false,
            wavelength_nm,
            power_mw: 1.0,
        }
    }
}

/// Device-reported state of the current sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Sweep in progress.
    Running,
    /// Sweep finished; the last samples may come with this read.
    Complete,
    /// The device reported an error code.
    Fault { code: i32, message: String },
}

/// One wavelength/power pair as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Wavelength, nm.
    pub wavelength_nm: f64,
    /// Power on detector 1, dBm.
    pub power_dbm: f64,
}

/// Result of one `read` on a scan unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReading {
    /// State of the sweep at this read.
    pub state: ScanState,
    /// Samples acquired since the previous read, ascending in wavelength.
    pub samples: Vec<RawSample>,
}

/// A scan unit is any instrument speaking the scan-unit vocabulary.
pub trait ScanUnit: Instrument<Params = ScanUnitCommand, Data = ScanReading> {}

impl<T> ScanUnit for T where T: Instrument<Params = ScanUnitCommand, Data = ScanReading> {}

/// Number of points in a sweep from `start` to `end` inclusive at `resolution`.
///
/// Steps that land within floating point noise of a whole number are not
/// rounded up, so 1540-1560 nm at 0.01 nm yields 2001 points.
pub fn sweep_points(start_nm: f64, end_nm: f64, resolution_nm: f64) -> usize {
    if resolution_nm.is_nan() || resolution_nm <= 0.0 || end_nm < start_nm {
        return 0;
    }
    let steps = (end_nm - start_nm) / resolution_nm;
    let nearest = steps.round();
    let whole = if (steps - nearest).abs() < 1e-6 {
        nearest
    } else {
        steps.ceil()
    };
    whole as usize + 1
}

/// Wavelength of point `index` in a sweep, clamped to `end`.
pub fn sweep_wavelength(start_nm: f64, end_nm: f64, resolution_nm: f64, index: usize) -> f64 {
    let wavelength = start_nm + resolution_nm * index as f64;
    // Round to the femtometre so accumulated float error never reorders points.
    let rounded = (wavelength * 1e6).round() / 1e6;
    rounded.min(end_nm)
}
