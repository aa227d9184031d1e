//! Uniform device contract for the lab instruments.
//!
//! Every instrument family (scan unit, power monitor, camera, piezo stage)
//! implements [`Instrument`]: `open`, `configure`, `trigger`, `read`,
//! `close` and a connectivity `probe`. All of these may block. They are only
//! ever invoked on an executor worker through a
//! [`DeviceLane`](crate::executor::DeviceLane), never on the interactive
//! thread.
//!
//! A [`Connection`] pairs an instrument with the [`DeviceHandle`] it issued.
//! The handle never leaves the connection, so exactly one owner can talk to
//! the device at a time.

pub mod camera;
pub mod mock;
pub mod piezo;
pub mod power_monitor;
pub mod scan_unit;

use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub use camera::{CameraBackend, CameraDevice, CameraInfo, CameraParameter, CameraSettings, Frame};
pub use piezo::{Axis, PiezoCommand, PiezoPosition, PiezoStage, VoltageRange};
pub use power_monitor::{MonitorSettings, PowerData, PowerMonitor, PowerSample};
pub use scan_unit::{Detector, LaserInput, LaserSource, RawSample, ScanReading, ScanState, ScanUnit, ScanUnitCommand};

/// Stable identifier of a physical instrument (address or camera id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque reference to an open instrument session.
///
/// Handles are neither `Clone` nor `Copy`: the instrument that issued one
/// keeps it inside its [`Connection`] until `close` consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    device: DeviceId,
    session: u64,
}

impl DeviceHandle {
    /// Issued by an instrument's `open`.
    pub fn new(device: DeviceId, session: u64) -> Self {
        Self { device, session }
    }

    /// Device this handle belongs to.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Driver-assigned session number.
    pub fn session(&self) -> u64 {
        self.session
    }
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// The handle still reaches the device.
    Connected,
    /// The device is gone or the handle is stale.
    Disconnected,
}

/// Blocking instrument contract.
///
/// Implementations wrap a vendor transport (DLL, camera SDK, GPIB). The core
/// depends only on this contract, never on vendor call signatures.
pub trait Instrument: Send + 'static {
    /// Settings accepted by `configure`.
    type Params: Send + Sync + fmt::Debug + 'static;
    /// Payload returned by `read`.
    type Data: Send + 'static;

    /// Identifier of the physical device.
    fn id(&self) -> &DeviceId;

    /// Opens a session at `address`.
    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError>;

    /// Applies settings.
    fn configure(&mut self, handle: &DeviceHandle, params: &Self::Params) -> Result<(), DeviceError>;

    /// Starts an acquisition.
    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError>;

    /// Reads the next available data.
    fn read(&mut self, handle: &DeviceHandle) -> Result<Self::Data, DeviceError>;

    /// Releases the session. Never fails; errors are logged by the driver.
    fn close(&mut self, handle: DeviceHandle);

    /// Reports whether the device still answers.
    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity;
}

impl<I: Instrument + ?Sized> Instrument for Box<I> {
    type Params = I::Params;
    type Data = I::Data;

    fn id(&self) -> &DeviceId {
        (**self).id()
    }

    fn open(&mut self, address: &str) -> Result<DeviceHandle, DeviceError> {
        (**self).open(address)
    }

    fn configure(&mut self, handle: &DeviceHandle, params: &Self::Params) -> Result<(), DeviceError> {
        (**self).configure(handle, params)
    }

    fn trigger(&mut self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        (**self).trigger(handle)
    }

    fn read(&mut self, handle: &DeviceHandle) -> Result<Self::Data, DeviceError> {
        (**self).read(handle)
    }

    fn close(&mut self, handle: DeviceHandle) {
        (**self).close(handle)
    }

    fn probe(&mut self, handle: &DeviceHandle) -> Connectivity {
        (**self).probe(handle)
    }
}

/// An instrument together with the handle it issued.
///
/// A fatal error from any call invalidates the handle: the connection closes
/// it and the next call must reopen.
pub struct Connection<I: Instrument> {
    instrument: I,
    address: String,
    handle: Option<DeviceHandle>,
}

impl<I: Instrument> Connection<I> {
    /// Wraps an instrument that will be opened at `address`.
    pub fn new(instrument: I, address: impl Into<String>) -> Self {
        Self {
            instrument,
            address: address.into(),
            handle: None,
        }
    }

    /// Identifier of the wrapped device.
    pub fn id(&self) -> &DeviceId {
        self.instrument.id()
    }

    /// Address used by `open`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True while a handle is held.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Opens the device unless a handle is already held.
    pub fn ensure_open(&mut self) -> Result<(), DeviceError> {
        if self.handle.is_none() {
            let handle = self.instrument.open(&self.address)?;
            debug!(device = %self.instrument.id(), session = handle.session(), "device opened");
            self.handle = Some(handle);
        }
        Ok(())
    }

    /// Applies settings on the open handle.
    pub fn configure(&mut self, params: &I::Params) -> Result<(), DeviceError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| DeviceError::invalid_handle(self.instrument.id()))?;
        let result = self.instrument.configure(handle, params);
        self.track(result)
    }

    /// Starts an acquisition on the open handle.
    pub fn trigger(&mut self) -> Result<(), DeviceError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| DeviceError::invalid_handle(self.instrument.id()))?;
        let result = self.instrument.trigger(handle);
        self.track(result)
    }

    /// Reads from the open handle.
    pub fn read(&mut self) -> Result<I::Data, DeviceError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| DeviceError::invalid_handle(self.instrument.id()))?;
        let result = self.instrument.read(handle);
        self.track(result)
    }

    /// Closes the handle if one is held.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(device = %self.instrument.id(), session = handle.session(), "device closed");
            self.instrument.close(handle);
        }
    }

    /// Probes the device; a closed connection is disconnected.
    pub fn probe(&mut self) -> Connectivity {
        match self.handle.as_ref() {
            Some(handle) => self.instrument.probe(handle),
            None => Connectivity::Disconnected,
        }
    }

    /// Access to the wrapped instrument.
    pub fn instrument(&self) -> &I {
        &self.instrument
    }

    fn track<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(device = %self.instrument.id(), error = %err, "fatal device error, invalidating handle");
                self.close();
            }
        }
        result
    }
}

impl<I: Instrument> Drop for Connection<I> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockControl, MockOp, MockPowerMonitor};
    use super::*;

    #[test]
    fn test_calls_on_closed_connection_fail_fatally() {
        let mut conn = Connection::new(MockPowerMonitor::new("pm"), "ASRL1::INSTR");
        let err = conn.read().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(conn.probe(), Connectivity::Disconnected);
    }

    #[test]
    fn test_fatal_error_invalidates_handle() {
        let control = MockControl::new();
        let mut conn = Connection::new(
            MockPowerMonitor::with_control("pm", control.clone()),
            "ASRL1::INSTR",
        );
        conn.ensure_open().unwrap();
        assert!(conn.is_open());

        control.fail_next(MockOp::Read, crate::error::DeviceErrorKind::Fatal);
        assert!(conn.read().is_err());
        assert!(!conn.is_open());

        conn.ensure_open().unwrap();
        assert!(conn.read().is_ok());
    }

    #[test]
    fn test_transient_error_keeps_handle() {
        let control = MockControl::new();
        let mut conn = Connection::new(
            MockPowerMonitor::with_control("pm", control.clone()),
            "ASRL1::INSTR",
        );
        conn.ensure_open().unwrap();
        control.fail_next(MockOp::Read, crate::error::DeviceErrorKind::Transient);
        assert!(conn.read().unwrap_err().is_transient());
        assert!(conn.is_open());
    }
}
