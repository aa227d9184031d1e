//! Three-axis piezo stage types.
//!
//! A stage is driven in volts per axis. `configure` applies a
//! [`PiezoCommand`]; `read` reports every axis voltage together with the
//! range the controller accepts. Out-of-range targets are clamped by the
//! controller, never rejected.

use super::Instrument;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage displacement per volt of drive, expressed as volts per nanometre.
pub const VOLTS_PER_NM: f64 = 0.0037;

/// Piezo axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Lateral, across the chip facet.
    X,
    /// Vertical.
    Y,
    /// Along the fibre, towards the facet.
    Z,
}

impl Axis {
    /// All axes in index order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Position of the axis in [`PiezoPosition`] arrays.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        f.write_str(name)
    }
}

/// Drive range of one axis, volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    /// Lowest accepted drive.
    pub min: f64,
    /// Highest accepted drive.
    pub max: f64,
}

impl VoltageRange {
    /// `volts` limited to the range.
    pub fn clamp(&self, volts: f64) -> f64 {
        volts.max(self.min).min(self.max)
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self { min: 0.0, max: 75.0 }
    }
}

/// Commands accepted by a stage's `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PiezoCommand {
    /// Drives an axis to an absolute voltage, clamped to its range.
    SetVoltage { axis: Axis, volts: f64 },
}

/// Result of one `read`: drive voltage and range of every axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PiezoPosition {
    /// Drive voltage per axis, in [`Axis::index`] order.
    pub voltages: [f64; 3],
    /// Accepted range per axis.
    pub ranges: [VoltageRange; 3],
}

impl PiezoPosition {
    /// Drive voltage of `axis`.
    pub fn voltage(&self, axis: Axis) -> f64 {
        self.voltages[axis.index()]
    }

    /// Accepted range of `axis`.
    pub fn range(&self, axis: Axis) -> VoltageRange {
        self.ranges[axis.index()]
    }

    /// Voltage that moves `axis` by `distance_nm` from its current position.
    pub fn offset(&self, axis: Axis, distance_nm: f64) -> f64 {
        self.voltage(axis) + distance_nm * VOLTS_PER_NM
    }
}

/// A piezo stage is any instrument speaking the stage vocabulary.
pub trait PiezoStage: Instrument<Params = PiezoCommand, Data = PiezoPosition> {}

impl<T> PiezoStage for T where T: Instrument<Params = PiezoCommand, Data = PiezoPosition> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_converts_nanometres_to_volts() {
        let mut position = PiezoPosition::default();
        position.voltages[1] = 10.0;
        assert!((position.offset(Axis::Y, 100.0) - 10.37).abs() < 1e-9);
        assert!((position.offset(Axis::Y, -100.0) - 9.63).abs() < 1e-9);
        assert_eq!(position.voltage(Axis::X), 0.0);
    }

    #[test]
    fn test_range_clamps() {
        let range = VoltageRange::default();
        assert_eq!(range.clamp(-1.0), 0.0);
        assert_eq!(range.clamp(80.0), 75.0);
        assert_eq!(range.clamp(30.0), 30.0);
    }
}
