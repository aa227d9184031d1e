//! Event/result bus.
//!
//! The bus is the single point where background work crosses back onto the
//! interactive thread. Background components hold an [`EventSender`]; the
//! consumer owns the one [`EventReceiver`] and drains it on its own thread.
//!
//! # Delivery guarantees
//!
//! - Events published through the same [`Publisher`] arrive in publish
//!   order, tagged with a gap-free per-producer sequence number.
//! - Events from different producers may interleave.
//! - Nothing is dropped except camera frames: each camera has one frame
//!   slot and a newer frame replaces an undelivered one ("latest wins").
//! - Completion callbacks posted by the executor run inside
//!   [`EventReceiver::next`] and friends, i.e. on the consumer thread.
//!
//! Publishing never blocks and never fails; once the receiver is gone,
//! events are discarded.

use crate::alignment::AlignmentEvent;
use crate::camera::CameraEvent;
use crate::device::{DeviceId, Frame, PowerData};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::executor::TaskEvent;
use crate::export::ExportEvent;
use crate::scan::ScanEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Component that raised an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// Lane bookkeeping and completion callbacks.
    Executor,
    /// Camera sessions and discovery.
    Camera,
    /// The scan orchestrator.
    Scan,
    /// The live power monitor.
    Monitor,
    /// Export writers.
    Export,
    /// Piezo alignment and mapping.
    Alignment,
    /// The command actor.
    Lab,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Executor => "executor",
            Self::Camera => "camera",
            Self::Scan => "scan",
            Self::Monitor => "monitor",
            Self::Export => "export",
            Self::Alignment => "alignment",
            Self::Lab => "lab",
        };
        f.write_str(name)
    }
}

/// A user-visible error with enough context to display and log it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Where the error was raised.
    pub component: Component,
    /// Device involved, if any.
    pub device: Option<DeviceId>,
    /// When the report was created.
    pub timestamp: DateTime<Utc>,
    /// Human readable description.
    pub message: String,
    /// Set when the error came from a device call.
    pub kind: Option<DeviceErrorKind>,
}

impl ErrorReport {
    /// Report without a device error kind.
    pub fn new(component: Component, device: Option<DeviceId>, message: impl Into<String>) -> Self {
        Self {
            component,
            device,
            timestamp: Utc::now(),
            message: message.into(),
            kind: None,
        }
    }

    /// Report for a failed device call.
    pub fn from_device(component: Component, err: &DeviceError) -> Self {
        Self {
            component,
            device: Some(err.device.clone()),
            timestamp: Utc::now(),
            message: err.message.clone(),
            kind: Some(err.kind),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "[{}] {}: {}", self.component, device, self.message),
            None => write!(f, "[{}] {}", self.component, self.message),
        }
    }
}

/// Origin of an event; ordering holds per producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Producer {
    /// The task executor.
    Executor,
    /// One camera session.
    Camera(DeviceId),
    /// One scan run.
    Scan(Uuid),
    /// The live power monitor.
    Monitor,
    /// The aligner.
    Alignment,
    /// The command actor, including exports.
    Lab,
}

/// Everything the consumer can be told.
#[derive(Debug, Clone)]
pub enum Event {
    /// A task submitted with a completion finished.
    Task(TaskEvent),
    /// Scan status, progress and results.
    Scan(ScanEvent),
    /// Camera state, settings and discovery.
    Camera(CameraEvent),
    /// A live power monitor reading.
    Power(PowerData),
    /// An export request finished.
    Export(ExportEvent),
    /// Alignment and mapping progress and results.
    Alignment(AlignmentEvent),
    /// A reported failure.
    Error(ErrorReport),
}

/// An event with its producer and per-producer sequence number.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Who published the event.
    pub producer: Producer,
    /// Gap-free per producer, starting at zero.
    pub sequence: u64,
    /// The payload.
    pub event: Event,
}

/// What the consumer receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An ordered event.
    Event(Envelope),
    /// Latest frame of a camera at the time of delivery.
    Frame(Frame),
}

type Callback = Box<dyn FnOnce() + Send>;

enum Message {
    Event(Envelope),
    Callback(Callback),
    FrameReady(DeviceId),
}

type FrameSlots = Arc<Mutex<HashMap<DeviceId, Frame>>>;

fn lock_slots(slots: &FrameSlots) -> MutexGuard<'_, HashMap<DeviceId, Frame>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Constructor for a sender/receiver pair.
pub struct EventBus;

impl EventBus {
    /// A connected sender and receiver.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots: FrameSlots = Arc::new(Mutex::new(HashMap::new()));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            EventSender {
                tx,
                slots: slots.clone(),
                dropped: dropped.clone(),
            },
            EventReceiver { rx, slots, dropped },
        )
    }
}

/// Cloneable publishing side of the bus.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Message>,
    slots: FrameSlots,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Creates a publisher with its own sequence counter.
    ///
    /// Components create one publisher per producer and share it (it is
    /// cheap to clone); two publishers for the same producer would each
    /// start counting at zero.
    pub fn publisher(&self, producer: Producer) -> Publisher {
        Publisher {
            producer,
            tx: self.tx.clone(),
            sequence: Arc::new(Mutex::new(0)),
        }
    }

    /// Queues `callback` to run on the consumer thread.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Message::Callback(Box::new(callback)));
    }

    /// Offers a frame under the latest-wins policy.
    ///
    /// Returns false when an undelivered frame of the same camera was replaced.
    pub fn publish_frame(&self, frame: Frame) -> bool {
        let camera = frame.camera.clone();
        let replaced = lock_slots(&self.slots).insert(camera.clone(), frame).is_some();
        if replaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(camera = %camera, "undelivered frame replaced");
        } else {
            let _ = self.tx.send(Message::FrameReady(camera));
        }
        !replaced
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Publishes events for one producer in order.
#[derive(Clone)]
pub struct Publisher {
    producer: Producer,
    tx: mpsc::UnboundedSender<Message>,
    sequence: Arc<Mutex<u64>>,
}

impl Publisher {
    /// Producer stamped on every envelope.
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Sends `event` with the next sequence number.
    pub fn publish(&self, event: Event) {
        // Numbering and enqueueing under one lock keeps sequence order equal to queue order.
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        let envelope = Envelope {
            producer: self.producer.clone(),
            sequence: *sequence,
            event,
        };
        *sequence += 1;
        let _ = self.tx.send(Message::Event(envelope));
    }

    /// Publishes an error report.
    pub fn error(&self, report: ErrorReport) {
        self.publish(Event::Error(report));
    }
}

/// Consuming side of the bus, owned by the interactive thread.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    slots: FrameSlots,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Waits for the next delivery. Returns `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            let message = self.rx.recv().await?;
            if let Some(delivery) = self.dispatch(message) {
                return Some(delivery);
            }
        }
    }

    /// Blocking variant of [`next`](Self::next) for a thread outside the runtime.
    pub fn blocking_next(&mut self) -> Option<Delivery> {
        loop {
            let message = self.rx.blocking_recv()?;
            if let Some(delivery) = self.dispatch(message) {
                return Some(delivery);
            }
        }
    }

    /// Returns the next delivery if one is ready.
    pub fn try_next(&mut self) -> Option<Delivery> {
        while let Ok(message) = self.rx.try_recv() {
            if let Some(delivery) = self.dispatch(message) {
                return Some(delivery);
            }
        }
        None
    }

    /// Everything currently queued, in order.
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Frames replaced before the consumer picked them up.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn dispatch(&mut self, message: Message) -> Option<Delivery> {
        match message {
            Message::Event(envelope) => Some(Delivery::Event(envelope)),
            Message::Callback(callback) => {
                callback();
                None
            }
            Message::FrameReady(camera) => lock_slots(&self.slots).remove(&camera).map(Delivery::Frame),
        }
    }
}
