//! Simulated instruments.
//!
//! Every mock satisfies the same [`Instrument`] contract as a hardware
//! adapter, so the whole core runs without a scan unit, power meter or
//! camera attached. A shared [`MockControl`] lets tests unplug a device,
//! inject one-off failures, slow down calls and inspect the order in which
//! calls reached the device.
//!
//! # Simulated behaviour
//!
//! - `MockScanUnit`: sweeps the configured grid, returning a batch of samples
//!   per `read` along a Gaussian dip, then reports `Complete`.
//! - `MockPowerMonitor`: pout around -20 dBm, detectors around -35/-45/-40 dBm
//!   with detector 3 dead at -80 dBm.
//! - `MockCamera`: a moving gradient at roughly 100 fps.
//! - `MockPiezo`: three axes at mid-range, clamped to 0-75 V.
//! - `MockCoupling`: links piezo positions to detector 1 of a power
//!   monitor. Power falls off quadratically (in dB) with the distance of
//!   each stage from its optimum, without noise.

use super::camera::{CameraBackend, CameraDevice, CameraInfo, CameraParameter, Frame};
use super::piezo::{PiezoCommand, PiezoPosition, VoltageRange};
use super::power_monitor::{MonitorSettings, PowerData};
use super::scan_unit::{sweep_points, sweep_wavelength, RawSample, ScanReading, ScanState, ScanUnitCommand};
use super::{Connectivity, DeviceHandle, DeviceId, Instrument};
use crate::error::{DeviceError, DeviceErrorKind};
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Samples returned per scan-unit read unless overridden.
pub const DEFAULT_BATCH: usize = 250;

/// Device operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `open`.
    Open,
    /// `configure`.
    Configure,
    /// `trigger`.
    Trigger,
    /// `read`.
    Read,
}

#[derive(Debug)]
struct ControlState {
    present: bool,
    /// Pending one-off failures: op, kind, and how many calls of op pass first.
    failures: VecDeque<(MockOp, DeviceErrorKind, usize)>,
    /// Failures that repeat until cleared.
    broken: Vec<(MockOp, DeviceErrorKind)>,
    read_delay: Duration,
    calls: Vec<String>,
}

/// Shared handle for steering a simulated device from a test.
#[derive(Debug, Clone)]
pub struct MockControl {
    state: Arc<Mutex<ControlState>>,
}

impl Default for MockControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControl {
    /// Present device, no failures, no delay.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                present: true,
                failures: VecDeque::new(),
                broken: Vec::new(),
                read_delay: Duration::ZERO,
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugs or unplugs the simulated device.
    pub fn set_present(&self, present: bool) {
        self.lock().present = present;
    }

    /// False after `set_present(false)`.
    pub fn is_present(&self) -> bool {
        self.lock().present
    }

    /// The next call of `op` fails with `kind`. Queued failures apply in order.
    pub fn fail_next(&self, op: MockOp, kind: DeviceErrorKind) {
        self.fail_after(op, 0, kind);
    }

    /// Lets `passing` calls of `op` succeed, then fails the next one with `kind`.
    pub fn fail_after(&self, op: MockOp, passing: usize, kind: DeviceErrorKind) {
        self.lock().failures.push_back((op, kind, passing));
    }

    /// Every call of `op` fails with `kind`, immediately, until [`clear_failures`](Self::clear_failures).
    pub fn fail_until_cleared(&self, op: MockOp, kind: DeviceErrorKind) {
        self.lock().broken.push((op, kind));
    }

    /// Drops queued and repeating failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.broken.clear();
    }

    /// Extra blocking time added to every `read`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    /// Calls that reached the device, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn record(&self, call: impl Into<String>) {
        self.lock().calls.push(call.into());
    }

    fn read_delay(&self) -> Duration {
        self.lock().read_delay
    }

    fn take_failure(&self, op: MockOp, device: &DeviceId) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let repeating = state.broken.iter().find(|(o, _)| *o == op).map(|(_, kind)| *kind);
        let kind = match repeating {
            Some(kind) => Some(kind),
            None => {
                let Some(pending) = state.failures.iter_mut().find(|(o, _, _)| *o == op) else {
                    return Ok(());
                };
                if pending.2 > 0 {
                    pending.2 -= 1;
                    return Ok(());
                }
                let kind = pending.1;
                if let Some(pos) = state.failures.iter().position(|(o, _, _)| *o == op) {
                    state.failures.remove(pos);
                }
                Some(kind)
            }
        };
        match kind {
            Some(DeviceErrorKind::Transient) => Err(DeviceError::transient(device, format!("injected {:?} failure", op))),
            Some(DeviceErrorKind::Fatal) => Err(DeviceError::fatal(device, format!("injected {:?} failure", op))),
            None => Ok(()),
        }
    }
}

/// Session bookkeeping shared by all mocks.
#[derive(Debug)]
struct MockSession {
    id: DeviceId,
    control: MockControl,
    counter: u64,
    current: Option<u64>,
}

impl MockSession {
    fn new(id: DeviceId, control: MockControl) -> Self {
        Self {
            id,
            control,
            counter: 0,
            current: None,
        }
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        self.control.record("open");
        if !self.control.is_present() {
            return Err(DeviceError::removed(&self.id));
        }
        self.control.take_failure(MockOp::Open, &self.id)?;
        self.counter += 1;
        self.current = Some(self.counter);
        debug!(device = %self.id, address, session = self.counter, "mock device opened");
        Ok(DeviceHandle::new(self.id.clone(), self.counter))
    }

    /// Validates the handle and the device presence before a call.
    fn check(&self, handle: &DeviceHandle, op: MockOp) -> Result<(), DeviceError> {
        if self.current != Some(handle.session()) || handle.device() != &self.id {
            return Err(DeviceError::invalid_handle(&self.id));
        }
        self.control.take_failure(op, &self.id)
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.control.record("close");
        if self.current == Some(handle.session()) {
            self.current = None;
        }
    }

    fn probe(&self, handle: &DeviceHandle) -> Connectivity {
        if self.control.is_present() && self.current == Some(handle.session()) {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SweepPlan {
    start_nm: f64,
    end_nm: f64,
    power_mw: f64,
}

/// Simulated CT400 scan unit.
#[derive(Debug)]
pub struct MockScanUnit {
    session: MockSession,
    batch: usize,
    plan: Option<SweepPlan>,
    resolution_nm: f64,
    running: bool,
    next_index: usize,
    total: usize,
}

impl MockScanUnit {
    /// Scan unit with its own control.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self::with_control(id, MockControl::new())
    }

    /// Scan unit steered by `control`.
    pub fn with_control(id: impl Into<DeviceId>, control: MockControl) -> Self {
        Self {
            session: MockSession::new(id.into(), control),
            batch: DEFAULT_BATCH,
            plan: None,
            resolution_nm: 0.001,
            running: false,
            next_index: 0,
            total: 0,
        }
    }

    /// Samples returned per read.
    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    fn power_at(plan: &SweepPlan, wavelength_nm: f64, noise: f64) -> f64 {
        let centre = (plan.start_nm + plan.end_nm) / 2.0;
        let width = ((plan.end_nm - plan.start_nm) / 10.0).max(0.01);
        let dip = -10.0 * (-(wavelength_nm - centre).powi(2) / (2.0 * width * width)).exp();
        dip - 30.0 + 10.0 * plan.power_mw.log10() + noise
    }
}

impl Instrument for MockScanUnit {
    type Params = ScanUnitCommand;
    type Data = ScanReading;

    fn id(&self) -> &DeviceId {
        &self.session.id
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        self.session.open(address)
    }

    fn configure(&mut self, handle: &DeviceHandle, params: &ScanUnitCommand) -> Result<(), DeviceError> {
        self.session.control.record(format!("configure {}", command_name(params)));
        self.session.check(handle, MockOp::Configure)?;
        match params {
            ScanUnitCommand::SetScan {
                power_mw,
                min_wavelength_nm,
                max_wavelength_nm,
            } => {
                self.plan = Some(SweepPlan {
                    start_nm: *min_wavelength_nm,
                    end_nm: *max_wavelength_nm,
                    power_mw: *power_mw,
                });
            }
            ScanUnitCommand::SetSamplingResolution { picometres } => {
                self.resolution_nm = f64::from(*picometres) / 1000.0;
            }
            ScanUnitCommand::StopScan => {
                self.running = false;
            }
            ScanUnitCommand::SetLaser { .. }
            | ScanUnitCommand::CommandLaser { .. }
            | ScanUnitCommand::SetDetectorArray(_) => {}
        }
        Ok(())
    }

    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        self.session.control.record("trigger");
        self.session.check(handle, MockOp::Trigger)?;
        let Some(plan) = self.plan else {
            return Err(DeviceError::fatal(&self.session.id, "scan range not configured"));
        };
        self.total = sweep_points(plan.start_nm, plan.end_nm, self.resolution_nm);
        self.next_index = 0;
        self.running = true;
        info!(device = %self.session.id, points = self.total, "mock sweep started");
        Ok(())
    }

    fn read(&mut self, handle: &DeviceHandle) -> Result<ScanReading, DeviceError> {
        self.session.control.record("read");
        let delay = self.session.control.read_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.session.check(handle, MockOp::Read)?;
        let plan = match (self.running, self.plan) {
            (true, Some(plan)) => plan,
            _ => {
                return Ok(ScanReading {
                    state: ScanState::Complete,
                    samples: Vec::new(),
                })
            }
        };

        let mut rng = rand::thread_rng();
        let end = (self.next_index + self.batch).min(self.total);
        let samples = (self.next_index..end)
            .map(|i| {
                let wavelength_nm = sweep_wavelength(plan.start_nm, plan.end_nm, self.resolution_nm, i);
                RawSample {
                    wavelength_nm,
                    power_dbm: Self::power_at(&plan, wavelength_nm, rng.gen_range(-0.1..0.1)),
                }
            })
            .collect();
        self.next_index = end;

        let state = if self.next_index >= self.total {
            self.running = false;
            ScanState::Complete
        } else {
            ScanState::Running
        };
        Ok(ScanReading { state, samples })
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.running = false;
        self.session.close(handle);
    }

    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity {
        self.session.probe(handle)
    }
}

fn command_name(command: &ScanUnitCommand) -> &'static str {
    match command {
        ScanUnitCommand::SetLaser { .. } => "SetLaser",
        ScanUnitCommand::CommandLaser { enable: true, .. } => "CommandLaser",
        ScanUnitCommand::CommandLaser { enable: false, .. } => "ParkLaser",
        ScanUnitCommand::SetScan { .. } => "SetScan",
        ScanUnitCommand::SetSamplingResolution { .. } => "SetSamplingResolution",
        ScanUnitCommand::SetDetectorArray(_) => "SetDetectorArray",
        ScanUnitCommand::StopScan => "StopScan",
    }
}

/// Simulated multi-channel power monitor.
#[derive(Debug)]
pub struct MockPowerMonitor {
    session: MockSession,
    coupling: Option<MockCoupling>,
}

impl MockPowerMonitor {
    /// Monitor with its own control.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self::with_control(id, MockControl::new())
    }

    /// Monitor steered by `control`.
    pub fn with_control(id: impl Into<DeviceId>, control: MockControl) -> Self {
        Self {
            session: MockSession::new(id.into(), control),
            coupling: None,
        }
    }

    /// Detector 1 reports the coupled power instead of noise.
    pub fn with_coupling(mut self, coupling: MockCoupling) -> Self {
        self.coupling = Some(coupling);
        self
    }
}

impl Instrument for MockPowerMonitor {
    type Params = MonitorSettings;
    type Data = PowerData;

    fn id(&self) -> &DeviceId {
        &self.session.id
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        self.session.open(address)
    }

    fn configure(&mut self, handle: &DeviceHandle, params: &MonitorSettings) -> Result<(), DeviceError> {
        self.session
            .control
            .record(format!("configure {:.3}nm {}mW", params.wavelength_nm, params.power_mw));
        self.session.check(handle, MockOp::Configure)
    }

    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        self.session.control.record("trigger");
        self.session.check(handle, MockOp::Trigger)
    }

    fn read(&mut self, handle: &DeviceHandle) -> Result<PowerData, DeviceError> {
        self.session.control.record("read");
        let delay = self.session.control.read_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.session.check(handle, MockOp::Read)?;
        let mut rng = rand::thread_rng();
        let de1 = match &self.coupling {
            Some(coupling) => coupling.power_dbm(),
            None => -35.0 + rng.gen_range(-2.0..2.0),
        };
        Ok(PowerData {
            timestamp: Utc::now(),
            pout: -20.0 + rng.gen_range(-1.0..1.0),
            detectors: [
                de1,
                -45.0 + rng.gen_range(-2.0..2.0),
                -80.0,
                -40.0 + rng.gen_range(-2.0..2.0),
            ],
        })
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.session.close(handle);
    }

    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity {
        self.session.probe(handle)
    }
}

/// Fibre-to-chip coupling shared by mock stages and a mock power monitor.
#[derive(Debug, Clone)]
pub struct MockCoupling {
    state: Arc<Mutex<CouplingState>>,
}

#[derive(Debug)]
struct CouplingState {
    peak_dbm: f64,
    /// Distance from the optimum, in volts, that costs 10/ln(10)/2 dB.
    width_v: f64,
    stages: HashMap<DeviceId, StageModel>,
}

#[derive(Debug, Clone, Copy)]
struct StageModel {
    voltages: [f64; 3],
    optimum: [f64; 3],
}

impl MockCoupling {
    /// Coupling peaking at `peak_dbm`; `width_v` sets how fast power falls off.
    pub fn new(peak_dbm: f64, width_v: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CouplingState {
                peak_dbm,
                width_v,
                stages: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CouplingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Axis voltages at which `stage` couples best.
    pub fn set_optimum(&self, stage: &DeviceId, optimum: [f64; 3]) {
        self.lock()
            .stages
            .entry(stage.clone())
            .or_insert(StageModel {
                voltages: optimum,
                optimum,
            })
            .optimum = optimum;
    }

    /// Current voltages of `stage`, as last driven.
    pub fn voltages(&self, stage: &DeviceId) -> Option<[f64; 3]> {
        self.lock().stages.get(stage).map(|model| model.voltages)
    }

    fn moved(&self, stage: &DeviceId, voltages: [f64; 3]) {
        self.lock()
            .stages
            .entry(stage.clone())
            .or_insert(StageModel {
                voltages,
                optimum: voltages,
            })
            .voltages = voltages;
    }

    /// Coupled power for the current stage positions.
    pub fn power_dbm(&self) -> f64 {
        let state = self.lock();
        let distance: f64 = state
            .stages
            .values()
            .flat_map(|model| model.voltages.iter().zip(model.optimum).map(|(v, o)| (v - o).powi(2)))
            .sum();
        state.peak_dbm - 10.0 / std::f64::consts::LN_10 * distance / (2.0 * state.width_v.powi(2))
    }
}

/// Simulated three-axis piezo controller.
#[derive(Debug)]
pub struct MockPiezo {
    session: MockSession,
    position: PiezoPosition,
    coupling: Option<MockCoupling>,
}

impl MockPiezo {
    /// Stage at mid-range on every axis.
    pub fn new(id: impl Into<DeviceId>, control: MockControl) -> Self {
        let range = VoltageRange::default();
        let centre = (range.min + range.max) / 2.0;
        Self {
            session: MockSession::new(id.into(), control),
            position: PiezoPosition {
                voltages: [centre; 3],
                ranges: [range; 3],
            },
            coupling: None,
        }
    }

    /// Reports every move to `coupling`.
    pub fn with_coupling(mut self, coupling: MockCoupling) -> Self {
        coupling.moved(&self.session.id, self.position.voltages);
        self.coupling = Some(coupling);
        self
    }
}

impl Instrument for MockPiezo {
    type Params = PiezoCommand;
    type Data = PiezoPosition;

    fn id(&self) -> &DeviceId {
        &self.session.id
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        self.session.open(address)
    }

    fn configure(&mut self, handle: &DeviceHandle, params: &PiezoCommand) -> Result<(), DeviceError> {
        let PiezoCommand::SetVoltage { axis, volts } = *params;
        self.session.control.record(format!("set {} {:.3}V", axis, volts));
        self.session.check(handle, MockOp::Configure)?;
        let index = axis.index();
        self.position.voltages[index] = self.position.ranges[index].clamp(volts);
        if let Some(coupling) = &self.coupling {
            coupling.moved(&self.session.id, self.position.voltages);
        }
        Ok(())
    }

    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        self.session.control.record("trigger");
        self.session.check(handle, MockOp::Trigger)
    }

    fn read(&mut self, handle: &DeviceHandle) -> Result<PiezoPosition, DeviceError> {
        self.session.control.record("read");
        self.session.check(handle, MockOp::Read)?;
        Ok(self.position)
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.session.close(handle);
    }

    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity {
        self.session.probe(handle)
    }
}

/// Simulated camera producing a moving gradient.
#[derive(Debug)]
pub struct MockCamera {
    session: MockSession,
    width: u32,
    height: u32,
    frame_interval: Duration,
    sequence: u64,
}

impl MockCamera {
    /// Camera producing 64x48 frames.
    pub fn new(id: impl Into<DeviceId>, control: MockControl) -> Self {
        Self {
            session: MockSession::new(id.into(), control),
            width: 64,
            height: 48,
            frame_interval: Duration::from_millis(10),
            sequence: 0,
        }
    }

    /// Time `read` blocks waiting for the next frame.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl Instrument for MockCamera {
    type Params = CameraParameter;
    type Data = Frame;

    fn id(&self) -> &DeviceId {
        &self.session.id
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        self.session.open(address)
    }

    fn configure(&mut self, handle: &DeviceHandle, params: &CameraParameter) -> Result<(), DeviceError> {
        self.session.control.record(format!("configure {:?}", params));
        self.session.check(handle, MockOp::Configure)
    }

    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        self.session.control.record("trigger");
        self.session.check(handle, MockOp::Trigger)
    }

    fn read(&mut self, handle: &DeviceHandle) -> Result<Frame, DeviceError> {
        self.session.control.record("read");
        self.session.check(handle, MockOp::Read)?;
        std::thread::sleep(self.frame_interval);
        if !self.session.control.is_present() {
            return Err(DeviceError::timeout(&self.session.id, self.frame_interval));
        }
        self.sequence += 1;
        let shift = self.sequence as usize;
        let width = self.width as usize;
        let pixels: Vec<u8> = (0..width * self.height as usize)
            .map(|i| ((i % width + shift) % 256) as u8)
            .collect();
        Ok(Frame {
            camera: self.session.id.clone(),
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            pixels: Bytes::from(pixels),
            timestamp: Utc::now(),
            fps: 0.0,
        })
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.session.close(handle);
    }

    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity {
        self.session.probe(handle)
    }
}

/// Simulated camera SDK with a fixed set of cameras.
#[derive(Debug, Default)]
pub struct MockCameraBackend {
    cameras: Vec<(CameraInfo, MockControl)>,
    frame_interval: Option<Duration>,
}

impl MockCameraBackend {
    /// Backend without cameras.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a camera and returns its control handle.
    pub fn add_camera(&mut self, identifier: impl Into<DeviceId>, name: impl Into<String>) -> MockControl {
        let identifier = identifier.into();
        let control = MockControl::new();
        let info = CameraInfo {
            serial: format!("SIM-{:04}", self.cameras.len() + 1),
            model: "Simulated Mono8".to_string(),
            name: name.into(),
            identifier,
        };
        self.cameras.push((info, control.clone()));
        control
    }

    /// Frame interval of every camera this backend creates.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Control handle of a configured camera.
    pub fn control(&self, identifier: &DeviceId) -> Option<MockControl> {
        self.cameras
            .iter()
            .find(|(info, _)| &info.identifier == identifier)
            .map(|(_, control)| control.clone())
    }
}

impl CameraBackend for MockCameraBackend {
    fn discover(&self) -> Result<Vec<CameraInfo>, DeviceError> {
        Ok(self
            .cameras
            .iter()
            .filter(|(_, control)| control.is_present())
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn camera(&self, identifier: &DeviceId) -> Box<dyn CameraDevice> {
        let control = self.control(identifier).unwrap_or_else(|| {
            let absent = MockControl::new();
            absent.set_present(false);
            absent
        });
        let camera = MockCamera::new(identifier.clone(), control);
        match self.frame_interval {
            Some(interval) => Box::new(camera.with_frame_interval(interval)),
            None => Box::new(camera),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::piezo::Axis;
    use crate::device::scan_unit::ScanUnitCommand;

    fn configured_unit(batch: usize) -> (MockScanUnit, DeviceHandle) {
        let mut unit = MockScanUnit::new("ct400").with_batch_size(batch);
        let handle = unit.open("GPIB0::10").unwrap();
        unit.configure(
            &handle,
            &ScanUnitCommand::SetScan {
                power_mw: 1.0,
                min_wavelength_nm: 1550.0,
                max_wavelength_nm: 1551.0,
            },
        )
        .unwrap();
        unit.configure(&handle, &ScanUnitCommand::SetSamplingResolution { picometres: 100 })
            .unwrap();
        (unit, handle)
    }

    #[test]
    fn test_mock_scan_unit_sweeps_grid() {
        let (mut unit, handle) = configured_unit(4);
        unit.trigger(&handle).unwrap();

        let mut samples = Vec::new();
        loop {
            let reading = unit.read(&handle).unwrap();
            samples.extend(reading.samples);
            if reading.state == ScanState::Complete {
                break;
            }
        }
        assert_eq!(samples.len(), 11);
        assert_eq!(samples[0].wavelength_nm, 1550.0);
        assert_eq!(samples[10].wavelength_nm, 1551.0);
    }

    #[test]
    fn test_stop_scan_ends_sweep() {
        let (mut unit, handle) = configured_unit(2);
        unit.trigger(&handle).unwrap();
        assert_eq!(unit.read(&handle).unwrap().state, ScanState::Running);
        unit.configure(&handle, &ScanUnitCommand::StopScan).unwrap();
        let reading = unit.read(&handle).unwrap();
        assert_eq!(reading.state, ScanState::Complete);
        assert!(reading.samples.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut monitor = MockPowerMonitor::new("pm");
        let first = monitor.open("ASRL1").unwrap();
        monitor.close(first);
        let second = monitor.open("ASRL1").unwrap();
        let stale = DeviceHandle::new(DeviceId::from("pm"), second.session() - 1);
        assert!(monitor.read(&stale).unwrap_err().is_fatal());
        assert!(monitor.read(&second).is_ok());
    }

    #[test]
    fn test_unplugged_camera() {
        let mut backend = MockCameraBackend::new().with_frame_interval(Duration::from_millis(1));
        let control = backend.add_camera("cam0", "Alignment");
        let mut camera = backend.camera(&DeviceId::from("cam0"));
        let handle = camera.open("cam0").unwrap();
        assert_eq!(camera.read(&handle).unwrap().sequence, 1);

        control.set_present(false);
        assert!(camera.read(&handle).unwrap_err().is_transient());
        assert_eq!(camera.probe(&handle), Connectivity::Disconnected);
        assert!(camera.open("cam0").unwrap_err().is_fatal());
        assert!(backend.discover().unwrap().is_empty());
    }

    #[test]
    fn test_failure_after_passing_calls() {
        let control = MockControl::new();
        let mut monitor = MockPowerMonitor::with_control("pm", control.clone());
        let handle = monitor.open("ASRL1").unwrap();
        control.fail_after(MockOp::Read, 2, DeviceErrorKind::Transient);
        assert!(monitor.read(&handle).is_ok());
        assert!(monitor.read(&handle).is_ok());
        assert!(monitor.read(&handle).unwrap_err().is_transient());
        assert!(monitor.read(&handle).is_ok());
    }

    #[test]
    fn test_repeating_failure_until_cleared() {
        let control = MockControl::new();
        let mut monitor = MockPowerMonitor::with_control("pm", control.clone());
        let handle = monitor.open("ASRL1").unwrap();
        control.fail_until_cleared(MockOp::Read, DeviceErrorKind::Transient);
        assert!(monitor.read(&handle).is_err());
        assert!(monitor.read(&handle).is_err());
        control.clear_failures();
        assert!(monitor.read(&handle).is_ok());
    }

    #[test]
    fn test_piezo_clamps_and_drives_coupling() {
        let coupling = MockCoupling::new(-10.0, 2.0);
        let stage = DeviceId::from("left");
        let mut piezo = MockPiezo::new("left", MockControl::new()).with_coupling(coupling.clone());
        coupling.set_optimum(&stage, [37.5, 37.5, 37.5]);
        assert!((coupling.power_dbm() + 10.0).abs() < 1e-9);

        let handle = piezo.open("COM3").unwrap();
        piezo
            .configure(&handle, &PiezoCommand::SetVoltage { axis: Axis::Z, volts: 90.0 })
            .unwrap();
        let position = piezo.read(&handle).unwrap();
        assert_eq!(position.voltage(Axis::Z), 75.0);
        assert_eq!(coupling.voltages(&stage), Some([37.5, 37.5, 75.0]));
        assert!(coupling.power_dbm() < -10.0);

        let mut monitor = MockPowerMonitor::new("pm").with_coupling(coupling.clone());
        let pm = monitor.open("ASRL1").unwrap();
        assert_eq!(monitor.read(&pm).unwrap().detectors[0], coupling.power_dbm());
    }

    #[test]
    fn test_call_log_records_order() {
        let control = MockControl::new();
        let mut monitor = MockPowerMonitor::with_control("pm", control.clone());
        let handle = monitor.open("ASRL1").unwrap();
        monitor.read(&handle).unwrap();
        monitor.close(handle);
        assert_eq!(control.calls(), vec!["open", "read", "close"]);
    }
}
