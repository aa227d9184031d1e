//! Standalone live power monitor.
//!
//! Polls the power monitor through its device lane, the same lane an active
//! scan reads from, so the two never touch the device concurrently. Every
//! reading is flattened into per-channel [`PowerSample`]s kept in a fixed
//! capacity ring buffer (oldest evicted) and published on the bus.

use crate::bus::{Component, ErrorReport, Event, Publisher};
use crate::device::{Connection, Detector, MonitorSettings, PowerData, PowerMonitor, PowerSample};
use crate::error::DeviceError;
use crate::executor::{CancelToken, DeviceLane, TaskOutcome};
use crate::retry::RetryPolicy;
use ringbuf::ring_buffer::RbBase;
use ringbuf::{HeapRb, Rb};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lane owning the power monitor's connection.
pub type MonitorLane = DeviceLane<Connection<Box<dyn PowerMonitor>>>;

/// Samples kept by default.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Fixed-capacity history of flattened power samples.
pub struct PowerBuffer {
    samples: HeapRb<PowerSample>,
    /// Detector ports kept; `Pout` is always kept.
    channels: Vec<Detector>,
}

impl PowerBuffer {
    /// Buffer keeping Pout and every detector port.
    pub fn new(capacity: usize) -> Self {
        Self::with_channels(capacity, Detector::PORTS.to_vec())
    }

    /// Buffer keeping Pout and the given ports.
    pub fn with_channels(capacity: usize, channels: Vec<Detector>) -> Self {
        Self {
            samples: HeapRb::new(capacity.max(1)),
            channels,
        }
    }

    /// Appends the kept channels of `data`, evicting the oldest samples when full.
    pub fn push(&mut self, data: &PowerData) {
        for sample in data.samples() {
            if sample.channel == Detector::Pout || self.channels.contains(&sample.channel) {
                self.samples.push_overwrite(sample);
            }
        }
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples held before the oldest is evicted.
    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<PowerSample> {
        self.samples.iter().copied().collect()
    }

    /// Samples of one channel, oldest first.
    pub fn channel(&self, channel: Detector) -> Vec<PowerSample> {
        self.samples.iter().filter(|s| s.channel == channel).copied().collect()
    }

    /// Drops every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Live monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Laser settings applied once when monitoring starts.
    pub settings: MonitorSettings,
    /// Delay between readings.
    pub poll_interval: Duration,
    /// Ring buffer size in samples.
    pub capacity: usize,
    /// Detector ports stored in the buffer.
    pub channels: Vec<Detector>,
    /// Transient read failures are retried before being reported.
    pub retry: RetryPolicy,
}

struct Running {
    stop: CancelToken,
    task: JoinHandle<()>,
}

/// Starts and stops the polling loop and owns its buffer.
pub struct PowerMonitorService {
    lane: MonitorLane,
    options: MonitorOptions,
    runtime: Handle,
    events: Publisher,
    buffer: Arc<Mutex<PowerBuffer>>,
    running: Option<Running>,
}

impl PowerMonitorService {
    /// Stopped service over `lane`.
    pub fn new(runtime: Handle, lane: MonitorLane, events: Publisher, options: MonitorOptions) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(PowerBuffer::with_channels(
                options.capacity,
                options.channels.clone(),
            ))),
            lane,
            options,
            runtime,
            events,
            running: None,
        }
    }

    /// Lane of the monitored device.
    pub fn lane(&self) -> &MonitorLane {
        &self.lane
    }

    /// True while the polling loop is alive.
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Starts polling. Returns false if it was already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        let stop = CancelToken::new();
        let poller = Poller {
            lane: self.lane.clone(),
            options: self.options.clone(),
            events: self.events.clone(),
            buffer: self.buffer.clone(),
            stop: stop.clone(),
        };
        info!(device = %self.lane.device(), interval = ?self.options.poll_interval, "power monitor started");
        let task = self.runtime.spawn(poller.run());
        self.running = Some(Running { stop, task });
        true
    }

    /// Stops polling without waiting for an in-flight read. Returns false if
    /// it was not running.
    pub fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.stop.cancel();
        let was_running = !running.task.is_finished();
        if was_running {
            info!(device = %self.lane.device(), "power monitor stopped");
        }
        was_running
    }

    fn buffer(&self) -> MutexGuard<'_, PowerBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffered samples, oldest first.
    pub fn samples(&self) -> Vec<PowerSample> {
        self.buffer().snapshot()
    }

    /// Buffered samples of one channel, oldest first.
    pub fn channel(&self, channel: Detector) -> Vec<PowerSample> {
        self.buffer().channel(channel)
    }

    /// Empties the buffer.
    pub fn clear(&self) {
        self.buffer().clear();
    }
}

impl Drop for PowerMonitorService {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
        }
    }
}

struct Poller {
    lane: MonitorLane,
    options: MonitorOptions,
    events: Publisher,
    buffer: Arc<Mutex<PowerBuffer>>,
    stop: CancelToken,
}

impl Poller {
    async fn run(self) {
        let device = self.lane.device().clone();
        let settings = self.options.settings;
        let setup = self.lane.submit("configure monitor", move |conn, _: &CancelToken| {
            conn.ensure_open()?;
            conn.configure(&settings)
        });
        if let TaskOutcome::Failed(err) = setup.wait().await {
            self.events.error(ErrorReport::from_device(Component::Monitor, &err));
            if err.is_fatal() {
                error!(device = %device, error = %err, "power monitor setup failed");
                return;
            }
            warn!(device = %device, error = %err, "power monitor setup failed, polling anyway");
        }

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.cancelled() => break,
            }
            let read = tokio::select! {
                read = self.read() => read,
                _ = self.stop.cancelled() => break,
            };
            match read {
                Ok(Some(data)) => {
                    self.buffer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&data);
                    self.events.publish(Event::Power(data));
                }
                Ok(None) => break,
                Err(err) if err.is_fatal() => {
                    error!(device = %device, error = %err, "power monitor lost");
                    self.events.error(ErrorReport::from_device(Component::Monitor, &err));
                    break;
                }
                Err(err) => {
                    warn!(device = %device, error = %err, "power monitor read failed");
                    self.events.error(ErrorReport::from_device(Component::Monitor, &err));
                }
            }
        }
        debug!(device = %device, "power monitor loop ended");
    }

    /// One reading, `None` if the read was cancelled.
    async fn read(&self) -> Result<Option<PowerData>, DeviceError> {
        self.options
            .retry
            .run(|_| {
                let task = self.lane.submit("read power", |conn, token: &CancelToken| {
                    if token.is_cancelled() {
                        return Err(DeviceError::transient(conn.id(), "read skipped"));
                    }
                    conn.ensure_open()?;
                    conn.read()
                });
                async move { task.wait().await.into_result().transpose() }
            })
            .await
    }
}
