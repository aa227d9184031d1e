//! Core library for the IOPanel lab application.
//!
//! Drives a wavelength-scanning unit, a multi-channel power monitor, a set
//! of cameras and a pair of piezo alignment stages from one interactive
//! process without ever blocking the interactive thread. Device calls run on per-device lanes of a bounded
//! executor; results come back on a single event bus that the interactive
//! side drains. The [`lab::Lab`] actor ties the pieces together and is used
//! by the `iopanel` binary.

pub mod alignment;
pub mod bus;
pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod export;
pub mod lab;
pub mod logging;
pub mod messages;
pub mod monitor;
pub mod retry;
pub mod scan;

pub use bus::{Delivery, Event, EventBus, EventReceiver, EventSender};
pub use config::AppConfig;
pub use error::{LabError, LabResult};
pub use lab::{Instruments, Lab, LabClient};
