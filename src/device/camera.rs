//! Camera types: parameters, frames, discovery and frame-rate tracking.

use super::{DeviceId, Instrument};
use crate::error::DeviceError;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use ringbuf::{HeapRb, Rb};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Frames used for the sliding frame-rate estimate.
pub const FPS_WINDOW: usize = 30;

/// One camera setting change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CameraParameter {
    /// Exposure time in microseconds.
    ExposureUs(f64),
    /// Analog gain in dB.
    GainDb(f64),
    /// Gamma correction, 1.0 is linear.
    Gamma(f64),
    /// Let the camera pick an exposure once, then hold it.
    AutoExposureOnce,
    /// Let the camera pick a gain once, then hold it.
    AutoGainOnce,
}

/// Last applied camera settings, re-applied after a reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure, µs.
    pub exposure_us: Option<f64>,
    /// Gain, dB.
    pub gain_db: Option<f64>,
    /// Gamma.
    pub gamma: Option<f64>,
}

impl CameraSettings {
    /// Records a successfully applied parameter.
    ///
    /// One-shot auto modes leave the device value unknown, so the cached
    /// value is dropped and the device keeps whatever it settled on.
    pub fn apply(&mut self, param: CameraParameter) {
        match param {
            CameraParameter::ExposureUs(v) => self.exposure_us = Some(v),
            CameraParameter::GainDb(v) => self.gain_db = Some(v),
            CameraParameter::Gamma(v) => self.gamma = Some(v),
            CameraParameter::AutoExposureOnce => self.exposure_us = None,
            CameraParameter::AutoGainOnce => self.gain_db = None,
        }
    }

    /// Parameters that restore these settings on a fresh handle.
    pub fn as_parameters(&self) -> Vec<CameraParameter> {
        let mut params = Vec::with_capacity(3);
        if let Some(v) = self.exposure_us {
            params.push(CameraParameter::ExposureUs(v));
        }
        if let Some(v) = self.gain_db {
            params.push(CameraParameter::GainDb(v));
        }
        if let Some(v) = self.gamma {
            params.push(CameraParameter::Gamma(v));
        }
        params
    }
}

/// A single 8-bit monochrome frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Camera that produced the frame.
    pub camera: DeviceId,
    /// Per-session frame counter.
    pub sequence: u64,
    /// Pixels per row.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Row-major 8-bit pixels.
    pub pixels: Bytes,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Frame-rate estimate at the time this frame was read.
    pub fps: f64,
}

impl Frame {
    /// Mirrors every row left to right.
    pub fn flipped_horizontal(self) -> Self {
        let width = self.width as usize;
        if width < 2 || self.pixels.len() % width != 0 {
            return self;
        }
        let mut out = BytesMut::with_capacity(self.pixels.len());
        for row in self.pixels.chunks_exact(width) {
            out.extend(row.iter().rev());
        }
        Self {
            pixels: out.freeze(),
            ..self
        }
    }
}

/// An attached camera found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Id to open the camera with.
    pub identifier: DeviceId,
    /// Serial number.
    pub serial: String,
    /// Model name.
    pub model: String,
    /// User-assigned name.
    pub name: String,
}

/// Sliding-window frame-rate estimate.
pub struct FrameRateMonitor {
    arrivals: HeapRb<Instant>,
}

impl Default for FrameRateMonitor {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}

impl FrameRateMonitor {
    /// Estimate over the last `window` arrivals.
    pub fn new(window: usize) -> Self {
        Self {
            arrivals: HeapRb::new(window.max(2)),
        }
    }

    /// Records a frame arrival and returns the current estimate.
    pub fn record(&mut self, at: Instant) -> f64 {
        self.arrivals.push_overwrite(at);
        self.fps()
    }

    /// Frames per second over the window, 0 until two frames arrived.
    pub fn fps(&self) -> f64 {
        let count = self.arrivals.len();
        let (Some(first), Some(last)) = (self.arrivals.iter().next(), self.arrivals.iter().last()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if count < 2 || span <= 0.0 {
            0.0
        } else {
            (count - 1) as f64 / span
        }
    }

    /// Forgets every arrival.
    pub fn reset(&mut self) {
        self.arrivals.clear();
    }
}

/// A camera is any instrument that accepts [`CameraParameter`]s and reads [`Frame`]s.
pub trait CameraDevice: Instrument<Params = CameraParameter, Data = Frame> {}

impl<T> CameraDevice for T where T: Instrument<Params = CameraParameter, Data = Frame> {}

/// Entry point of a camera SDK.
pub trait CameraBackend: Send + Sync + 'static {
    /// Lists attached cameras. May block.
    fn discover(&self) -> Result<Vec<CameraInfo>, DeviceError>;

    /// Creates an unopened driver for one camera.
    fn camera(&self, identifier: &DeviceId) -> Box<dyn CameraDevice>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(pixels: &[u8], width: u32) -> Frame {
        Frame {
            camera: DeviceId::from("cam0"),
            sequence: 0,
            width,
            height: (pixels.len() as u32) / width,
            pixels: Bytes::copy_from_slice(pixels),
            timestamp: Utc::now(),
            fps: 0.0,
        }
    }

    #[test]
    fn test_flip_mirrors_rows() {
        let flipped = frame(&[1, 2, 3, 4, 5, 6], 3).flipped_horizontal();
        assert_eq!(&flipped.pixels[..], &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_settings_cache_restores_parameters() {
        let mut settings = CameraSettings::default();
        settings.apply(CameraParameter::ExposureUs(1500.0));
        settings.apply(CameraParameter::Gamma(0.8));
        assert_eq!(
            settings.as_parameters(),
            vec![CameraParameter::ExposureUs(1500.0), CameraParameter::Gamma(0.8)]
        );
        settings.apply(CameraParameter::AutoExposureOnce);
        assert_eq!(settings.as_parameters(), vec![CameraParameter::Gamma(0.8)]);
    }

    #[test]
    fn test_frame_rate_window() {
        let mut monitor = FrameRateMonitor::new(5);
        let start = Instant::now();
        assert_eq!(monitor.record(start), 0.0);
        for i in 1..10u64 {
            monitor.record(start + Duration::from_millis(100 * i));
        }
        // Only the last five arrivals count: 4 intervals over 400ms.
        assert!((monitor.fps() - 10.0).abs() < 1e-6);
    }
}
