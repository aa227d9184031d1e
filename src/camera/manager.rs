//! Camera session manager.
//!
//! Every configured camera gets a device lane at construction; the lane owns
//! the camera's [`Connection`] for the life of the manager. Opening a camera
//! spawns a session task that drives the [`SessionMachine`]:
//!
//! - **Connecting/Reconnecting**: submits an open op (close stale handle,
//!   open, re-apply cached settings) and waits for it.
//! - **Live**: the frame pump keeps exactly one read op queued, publishes
//!   each frame under the bus's latest-wins policy and checks the heartbeat.
//!   A failed read pauses the pump briefly; the first failure of a streak is
//!   reported, and a streak as long as the heartbeat threshold reconnects.
//!
//! Parameter changes are ordinary lane ops, so they never interleave with a
//! frame read. Closing cancels the session and queues a close op behind any
//! in-flight read without waiting for it.

use super::state::{CameraState, SessionMachine, Transition, WatchdogConfig};
use super::CameraEvent;
use crate::bus::{Component, ErrorReport, Event, EventSender, Producer, Publisher};
use crate::device::camera::FrameRateMonitor;
use crate::device::{
    CameraBackend, CameraDevice, CameraInfo, CameraParameter, CameraSettings, Connection, DeviceId, Frame,
};
use crate::error::{CameraError, DeviceError};
use crate::executor::{CancelToken, DeviceLane, TaskExecutor, TaskHandle, TaskOutcome};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lane used for SDK-wide calls such as discovery.
pub const DISCOVERY_LANE: &str = "camera-system";

/// A configured camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSpec {
    /// Vendor id used to open the camera.
    pub identifier: DeviceId,
    /// Display name.
    pub name: String,
    /// Mirror frames before publishing them.
    pub flip_horizontal: bool,
}

/// Snapshot of one camera session.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSession {
    /// Camera id.
    pub identifier: DeviceId,
    /// Display name.
    pub name: String,
    /// Current session state.
    pub state: CameraState,
    /// Settings re-applied after a reconnect.
    pub settings: CameraSettings,
    /// Timestamp of the newest frame.
    pub last_frame: Option<DateTime<Utc>>,
    /// Heartbeats in a row without a frame.
    pub missed_heartbeats: u32,
    /// Frame-rate estimate.
    pub fps: f64,
}

/// Lane resource for one camera.
struct CameraSlot {
    conn: Connection<Box<dyn CameraDevice>>,
    flip: bool,
    fps: FrameRateMonitor,
}

struct SessionShared {
    snapshot: CameraSession,
    running: bool,
}

type Shared = Arc<Mutex<SessionShared>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveSession {
    closing: CancelToken,
    inflight: Arc<Mutex<Option<CancelToken>>>,
}

struct CameraEntry {
    lane: DeviceLane<CameraSlot>,
    shared: Shared,
    events: Publisher,
    active: Option<ActiveSession>,
}

/// Owns every camera session.
pub struct CameraManager {
    executor: TaskExecutor,
    watchdog: WatchdogConfig,
    cameras: BTreeMap<DeviceId, CameraEntry>,
    discovery: DeviceLane<Arc<dyn CameraBackend>>,
    system_events: Publisher,
}

impl CameraManager {
    /// Registers a lane per camera plus the discovery lane.
    pub fn new(
        executor: TaskExecutor,
        backend: Arc<dyn CameraBackend>,
        watchdog: WatchdogConfig,
        specs: Vec<CameraSpec>,
    ) -> Result<Self, DeviceError> {
        let bus = executor.bus().clone();
        let system_id = DeviceId::from(DISCOVERY_LANE);
        let discovery = executor.register(system_id.clone(), backend.clone())?;

        let mut cameras = BTreeMap::new();
        for spec in specs {
            let slot = CameraSlot {
                conn: Connection::new(backend.camera(&spec.identifier), spec.identifier.as_str()),
                flip: spec.flip_horizontal,
                fps: FrameRateMonitor::default(),
            };
            let lane = executor.register(spec.identifier.clone(), slot)?;
            let shared = Arc::new(Mutex::new(SessionShared {
                snapshot: CameraSession {
                    identifier: spec.identifier.clone(),
                    name: spec.name.clone(),
                    state: CameraState::Disconnected,
                    settings: CameraSettings::default(),
                    last_frame: None,
                    missed_heartbeats: 0,
                    fps: 0.0,
                },
                running: false,
            }));
            let events = bus.publisher(Producer::Camera(spec.identifier.clone()));
            cameras.insert(
                spec.identifier,
                CameraEntry {
                    lane,
                    shared,
                    events,
                    active: None,
                },
            );
        }

        Ok(Self {
            system_events: bus.publisher(Producer::Camera(system_id)),
            executor,
            watchdog,
            cameras,
            discovery,
        })
    }

    fn entry(&self, camera: &DeviceId) -> Result<&CameraEntry, CameraError> {
        self.cameras
            .get(camera)
            .ok_or_else(|| CameraError::UnknownCamera(camera.clone()))
    }

    /// Starts a session. Returns immediately; progress arrives as events.
    pub fn open(&mut self, camera: &DeviceId) -> Result<(), CameraError> {
        let entry = self
            .cameras
            .get_mut(camera)
            .ok_or_else(|| CameraError::UnknownCamera(camera.clone()))?;
        {
            let mut shared = lock(&entry.shared);
            if shared.running {
                return Err(CameraError::AlreadyOpen(camera.clone()));
            }
            shared.running = true;
        }

        let closing = CancelToken::new();
        let inflight = Arc::new(Mutex::new(None));
        let task = SessionTask {
            camera: camera.clone(),
            lane: entry.lane.clone(),
            shared: entry.shared.clone(),
            events: entry.events.clone(),
            bus: self.executor.bus().clone(),
            closing: closing.clone(),
            inflight: inflight.clone(),
            watchdog: self.watchdog.clone(),
            machine: SessionMachine::new(&self.watchdog),
        };
        info!(camera = %camera, "opening camera");
        self.executor.runtime().spawn(task.run());
        entry.active = Some(ActiveSession { closing, inflight });
        Ok(())
    }

    /// Ends a session without waiting for in-flight device calls.
    pub fn close(&mut self, camera: &DeviceId) -> Result<(), CameraError> {
        let entry = self
            .cameras
            .get_mut(camera)
            .ok_or_else(|| CameraError::UnknownCamera(camera.clone()))?;
        let Some(active) = entry.active.take() else {
            return Ok(());
        };
        info!(camera = %camera, "closing camera");
        active.closing.cancel();
        if let Some(token) = lock(&active.inflight).take() {
            token.cancel();
        }
        // Queued behind any in-flight read.
        entry.lane.submit("close", |slot: &mut CameraSlot, _: &CancelToken| {
            slot.conn.close();
            Ok(())
        });

        let mut shared = lock(&entry.shared);
        if !shared.running && shared.snapshot.state != CameraState::Disconnected {
            // The session had already ended on its own.
            let from = shared.snapshot.state;
            shared.snapshot.state = CameraState::Disconnected;
            entry.events.publish(Event::Camera(CameraEvent::StateChanged {
                camera: camera.clone(),
                from,
                to: CameraState::Disconnected,
            }));
        }
        Ok(())
    }

    /// Applies a parameter to a live camera and caches it for reconnects.
    pub fn set_parameter(&self, camera: &DeviceId, param: CameraParameter) -> Result<TaskHandle<()>, CameraError> {
        let entry = self.entry(camera)?;
        if lock(&entry.shared).snapshot.state != CameraState::Live {
            return Err(CameraError::NotLive(camera.clone()));
        }
        let shared = entry.shared.clone();
        let events = entry.events.clone();
        let id = camera.clone();
        debug!(camera = %camera, ?param, "submitting camera parameter");
        Ok(entry
            .lane
            .submit("set parameter", move |slot: &mut CameraSlot, _: &CancelToken| {
                match slot.conn.configure(&param) {
                    Ok(()) => {
                        let settings = {
                            let mut shared = lock(&shared);
                            shared.snapshot.settings.apply(param);
                            shared.snapshot.settings
                        };
                        events.publish(Event::Camera(CameraEvent::SettingsChanged { camera: id, settings }));
                        Ok(())
                    }
                    Err(err) => {
                        events.error(ErrorReport::from_device(Component::Camera, &err));
                        Err(err)
                    }
                }
            }))
    }

    /// Lists attached cameras and publishes the result.
    pub fn discover(&self) -> TaskHandle<Vec<CameraInfo>> {
        let events = self.system_events.clone();
        self.discovery.submit(
            "discover cameras",
            move |backend: &mut Arc<dyn CameraBackend>, _: &CancelToken| match backend.discover() {
                Ok(cameras) => {
                    info!(count = cameras.len(), "camera discovery finished");
                    events.publish(Event::Camera(CameraEvent::Discovered(cameras.clone())));
                    Ok(cameras)
                }
                Err(err) => {
                    events.error(ErrorReport::from_device(Component::Camera, &err));
                    Err(err)
                }
            },
        )
    }

    /// Snapshot of one session.
    pub fn session(&self, camera: &DeviceId) -> Option<CameraSession> {
        self.cameras
            .get(camera)
            .map(|entry| lock(&entry.shared).snapshot.clone())
    }

    /// Snapshots of every configured camera, in configuration order.
    pub fn sessions(&self) -> Vec<CameraSession> {
        self.cameras
            .values()
            .map(|entry| lock(&entry.shared).snapshot.clone())
            .collect()
    }

    /// Configured camera identifiers.
    pub fn cameras(&self) -> impl Iterator<Item = &DeviceId> {
        self.cameras.keys()
    }

    /// Closes every open camera.
    pub fn shutdown(&mut self) {
        let ids: Vec<_> = self.cameras.keys().cloned().collect();
        for id in ids {
            let _ = self.close(&id);
        }
    }
}

enum Wake {
    Closing,
    Read(TaskOutcome<Frame>),
    Tick,
}

/// One camera's background session.
struct SessionTask {
    camera: DeviceId,
    lane: DeviceLane<CameraSlot>,
    shared: Shared,
    events: Publisher,
    bus: EventSender,
    closing: CancelToken,
    inflight: Arc<Mutex<Option<CancelToken>>>,
    watchdog: WatchdogConfig,
    machine: SessionMachine,
}

impl SessionTask {
    async fn run(mut self) {
        let opening = self.machine.open();
        self.apply(opening);

        while !self.closing.is_cancelled() {
            match self.machine.state() {
                CameraState::Connecting | CameraState::Reconnecting => self.connect().await,
                CameraState::Live => self.pump().await,
                CameraState::Disconnected | CameraState::Error => break,
            }
        }

        let mut shared = lock(&self.shared);
        if self.closing.is_cancelled() {
            if let Some(t) = self.machine.close() {
                Self::record(&mut shared, &self.events, &self.camera, t, self.machine.missed());
            }
        }
        shared.running = false;
        debug!(camera = %self.camera, state = %shared.snapshot.state, "camera session ended");
    }

    fn apply(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            let mut shared = lock(&self.shared);
            Self::record(&mut shared, &self.events, &self.camera, t, self.machine.missed());
        }
    }

    fn record(shared: &mut SessionShared, events: &Publisher, camera: &DeviceId, t: Transition, missed: u32) {
        let from = shared.snapshot.state;
        shared.snapshot.state = t.to;
        shared.snapshot.missed_heartbeats = missed;
        info!(camera = %camera, %from, to = %t.to, "camera state changed");
        events.publish(Event::Camera(CameraEvent::StateChanged {
            camera: camera.clone(),
            from,
            to: t.to,
        }));
    }

    async fn wait_for<T: Clone + Send + 'static>(&self, task: &TaskHandle<T>) -> Option<TaskOutcome<T>> {
        *lock(&self.inflight) = Some(task.token().clone());
        let outcome = tokio::select! {
            outcome = task.wait() => Some(outcome),
            _ = self.closing.cancelled() => None,
        };
        lock(&self.inflight).take();
        outcome
    }

    async fn connect(&mut self) {
        let settings = lock(&self.shared).snapshot.settings;
        let closing = self.closing.clone();
        let task = self.lane.submit("open camera", move |slot: &mut CameraSlot, token: &CancelToken| {
            if closing.is_cancelled() || token.is_cancelled() {
                return Err(DeviceError::transient(slot.conn.id(), "session closing"));
            }
            slot.conn.close();
            slot.conn.ensure_open()?;
            for param in settings.as_parameters() {
                slot.conn.configure(&param)?;
            }
            slot.fps.reset();
            Ok(())
        });

        let Some(outcome) = self.wait_for(&task).await else {
            return;
        };
        if self.closing.is_cancelled() {
            return;
        }
        match outcome {
            TaskOutcome::Completed(()) => {
                let t = self.machine.opened();
                self.apply(t);
            }
            TaskOutcome::Failed(err) => {
                warn!(camera = %self.camera, error = %err, "camera open failed");
                self.events.error(ErrorReport::from_device(Component::Camera, &err));
                let (t, delay) = self.machine.open_failed();
                self.apply(t);
                match delay {
                    Some(delay) => {
                        self.events.publish(Event::Camera(CameraEvent::ReconnectScheduled {
                            camera: self.camera.clone(),
                            attempt: self.machine.attempts(),
                            delay,
                        }));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.closing.cancelled() => return,
                        }
                        let t = self.machine.retry();
                        self.apply(t);
                    }
                    None => {
                        error!(camera = %self.camera, attempts = self.machine.attempts(), "giving up on camera");
                        self.events.error(ErrorReport::new(
                            Component::Camera,
                            Some(self.camera.clone()),
                            format!("could not open camera after {} attempts", self.machine.attempts()),
                        ));
                    }
                }
            }
            TaskOutcome::Cancelled => {}
        }
    }

    fn submit_read(&self) -> TaskHandle<Frame> {
        let closing = self.closing.clone();
        let task = self.lane.submit("read frame", move |slot: &mut CameraSlot, token: &CancelToken| {
            if closing.is_cancelled() || token.is_cancelled() {
                return Err(DeviceError::transient(slot.conn.id(), "read skipped"));
            }
            let frame = slot.conn.read()?;
            let fps = slot.fps.record(Instant::now());
            let frame = Frame { fps, ..frame };
            Ok(if slot.flip { frame.flipped_horizontal() } else { frame })
        });
        *lock(&self.inflight) = Some(task.token().clone());
        task
    }

    async fn pump(&mut self) {
        let interval = self.watchdog.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frame_seen = false;
        let mut read = self.submit_read();

        loop {
            let wake = tokio::select! {
                _ = self.closing.cancelled() => Wake::Closing,
                outcome = read.wait() => Wake::Read(outcome),
                _ = heartbeat.tick() => Wake::Tick,
            };
            if self.closing.is_cancelled() {
                read.cancel();
                return;
            }
            match wake {
                Wake::Closing => {
                    read.cancel();
                    return;
                }
                Wake::Read(TaskOutcome::Completed(frame)) => {
                    frame_seen = true;
                    self.machine.frame();
                    {
                        let mut shared = lock(&self.shared);
                        shared.snapshot.last_frame = Some(frame.timestamp);
                        shared.snapshot.fps = frame.fps;
                        shared.snapshot.missed_heartbeats = 0;
                    }
                    self.bus.publish_frame(frame);
                    read = self.submit_read();
                }
                Wake::Read(TaskOutcome::Failed(err)) if err.is_fatal() => {
                    error!(camera = %self.camera, error = %err, "fatal camera error");
                    self.events.error(ErrorReport::from_device(Component::Camera, &err));
                    let t = self.machine.fatal();
                    self.apply(t);
                    return;
                }
                Wake::Read(TaskOutcome::Failed(err)) => {
                    let (t, pause) = self.machine.read_failed();
                    if self.machine.read_failures() == 1 {
                        warn!(camera = %self.camera, error = %err, "frame read failed");
                        self.events.error(ErrorReport::from_device(Component::Camera, &err));
                    } else {
                        debug!(camera = %self.camera, error = %err, failures = self.machine.read_failures(), "no frame");
                    }
                    if t.is_some() {
                        warn!(camera = %self.camera, failures = self.machine.read_failures(), "camera reads keep failing, reconnecting");
                        self.apply(t);
                        return;
                    }
                    if let Some(pause) = pause {
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = self.closing.cancelled() => return,
                        }
                    }
                    read = self.submit_read();
                }
                Wake::Read(TaskOutcome::Cancelled) => {
                    read = self.submit_read();
                }
                Wake::Tick => {
                    let t = self.machine.heartbeat_tick(frame_seen);
                    frame_seen = false;
                    if t.is_some() {
                        warn!(camera = %self.camera, missed = self.machine.missed(), "camera heartbeat lost, reconnecting");
                        read.cancel();
                        self.apply(t);
                        return;
                    }
                    lock(&self.shared).snapshot.missed_heartbeats = self.machine.missed();
                }
            }
        }
    }
}
