//! Camera session management: one live session per configured camera.

pub mod manager;
pub mod state;

use crate::device::{CameraInfo, CameraSettings, DeviceId};
use std::time::Duration;

pub use manager::{CameraManager, CameraSession, CameraSpec, DISCOVERY_LANE};
pub use state::{CameraState, SessionMachine, Transition, WatchdogConfig};

/// Camera notifications published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    /// The session moved between states.
    StateChanged {
        camera: DeviceId,
        from: CameraState,
        to: CameraState,
    },
    /// A reopen attempt follows after `delay`.
    ReconnectScheduled {
        camera: DeviceId,
        attempt: u32,
        delay: Duration,
    },
    /// A parameter was applied; carries the cached settings.
    SettingsChanged {
        camera: DeviceId,
        settings: CameraSettings,
    },
    /// Result of a discovery request.
    Discovered(Vec<CameraInfo>),
}
