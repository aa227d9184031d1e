//! Scan orchestrator: drives one scan unit through the scan state machine.
//!
//! `configure` arms a run, `start` hands it to a driver task that owns the
//! run until it reaches a terminal state:
//!
//! 1. park the laser, then `SetLaser`, `SetScan`, `SetSamplingResolution`
//!    and `SetDetectorArray`, each retried on transient failure;
//! 2. `trigger` the sweep;
//! 3. poll at a bounded interval, reading the power monitor alongside when
//!    enabled, until the unit reports completion or the range is exhausted;
//! 4. best-effort stop (if the sweep was started) and park the laser again;
//! 5. archive the run in the history.
//!
//! All device calls go through the unit's lane; the power monitor lane is
//! shared with the live monitor, so their reads queue rather than race.

use super::config::{LaserLimits, ScanConfig};
use super::run::{ScanEvent, ScanRun, ScanStatus, ScanTrigger};
use crate::bus::{Component, ErrorReport, Event, EventSender, Producer, Publisher};
use crate::device::scan_unit::DetectorArray;
use crate::device::{Connection, DeviceId, LaserSource, PowerData, ScanReading, ScanState, ScanUnit, ScanUnitCommand};
use crate::error::{DeviceError, ScanError};
use crate::executor::{CancelToken, DeviceLane, TaskHandle};
use crate::monitor::MonitorLane;
use crate::retry::RetryPolicy;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal runs kept for export.
pub const HISTORY_LIMIT: usize = 16;

/// Lane owning the scan unit's connection.
pub type ScanUnitLane = DeviceLane<Connection<Box<dyn ScanUnit>>>;

/// Scan unit installation and polling parameters.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Tuning range of the installed laser.
    pub limits: LaserLimits,
    /// GPIB address of the laser.
    pub gpib_address: u8,
    /// Laser model.
    pub source: LaserSource,
    /// Detectors switched on for sweeps.
    pub detectors: DetectorArray,
    /// Wavelength the laser is parked at, disabled, between scans.
    pub park_wavelength_nm: f64,
    /// Delay between polls while running.
    pub poll_interval: Duration,
    /// Applied to every configure and poll call.
    pub retry: RetryPolicy,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            limits: LaserLimits::default(),
            gpib_address: 10,
            source: LaserSource::default(),
            detectors: DetectorArray::default(),
            park_wavelength_nm: 1550.0,
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

struct ActiveRun {
    run: ScanRun,
    abort: CancelToken,
    events: Publisher,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveRun>,
    history: VecDeque<ScanRun>,
}

struct Inner {
    unit: DeviceId,
    lane: ScanUnitLane,
    monitor: Option<MonitorLane>,
    settings: ScanSettings,
    bus: EventSender,
    runtime: Handle,
    state: Mutex<RunState>,
    finished: Notify,
}

/// Owns the scan state of one scan unit. Clones share it.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    /// Idle orchestrator over the unit lane and, optionally, the monitor lane.
    pub fn new(
        runtime: Handle,
        bus: EventSender,
        lane: ScanUnitLane,
        monitor: Option<MonitorLane>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                unit: lane.device().clone(),
                lane,
                monitor,
                settings,
                bus,
                runtime,
                state: Mutex::new(RunState::default()),
                finished: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The scan unit.
    pub fn unit(&self) -> &DeviceId {
        &self.inner.unit
    }

    /// Installation and polling parameters.
    pub fn settings(&self) -> &ScanSettings {
        &self.inner.settings
    }

    /// Validates `config` and arms a new run.
    ///
    /// Rejected with `Busy` while another run is Armed or Running; the
    /// existing run is left untouched.
    pub fn configure(&self, config: ScanConfig) -> Result<Uuid, ScanError> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            return Err(ScanError::Busy {
                unit: self.inner.unit.clone(),
                run: active.run.id,
            });
        }
        config.validate(&self.inner.settings.limits)?;

        let mut run = ScanRun::new(self.inner.unit.clone(), config);
        let events = self.inner.bus.publisher(Producer::Scan(run.id));
        if let Some(from) = run.apply(ScanTrigger::Configure) {
            events.publish(status_changed(&run, from));
        }
        info!(
            unit = %self.inner.unit,
            run = %run.id,
            start_nm = config.start_nm,
            end_nm = config.end_nm,
            resolution_nm = config.resolution_nm,
            "scan armed"
        );
        let id = run.id;
        state.active = Some(ActiveRun {
            run,
            abort: CancelToken::new(),
            events,
        });
        Ok(id)
    }

    /// Starts the armed run in the background.
    pub fn start(&self) -> Result<Uuid, ScanError> {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return Err(ScanError::NotArmed(self.inner.unit.clone()));
        };
        match active.run.status {
            ScanStatus::Armed => {}
            ScanStatus::Running => {
                return Err(ScanError::Busy {
                    unit: self.inner.unit.clone(),
                    run: active.run.id,
                })
            }
            _ => return Err(ScanError::NotArmed(self.inner.unit.clone())),
        }
        if let Some(from) = active.run.apply(ScanTrigger::Start) {
            active.events.publish(status_changed(&active.run, from));
        }
        let driver = Driver {
            orchestrator: self.clone(),
            run: active.run.id,
            config: active.run.config,
            abort: active.abort.clone(),
            events: active.events.clone(),
        };
        let id = active.run.id;
        info!(unit = %self.inner.unit, run = %id, "scan started");
        self.inner.runtime.spawn(driver.run());
        Ok(id)
    }

    /// Configures and starts in one step.
    pub fn start_scan(&self, config: ScanConfig) -> Result<Uuid, ScanError> {
        self.configure(config)?;
        self.start()
    }

    /// Aborts the active run.
    ///
    /// An armed run ends immediately. A running run stops at its next poll
    /// boundary; this call never waits for the device.
    pub fn abort(&self) -> Result<(), ScanError> {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return Err(ScanError::NoActiveRun(self.inner.unit.clone()));
        };
        match active.run.status {
            ScanStatus::Running => {
                info!(unit = %self.inner.unit, run = %active.run.id, "scan abort requested");
                active.abort.cancel();
                Ok(())
            }
            _ => {
                if let Some(active) = state.active.take() {
                    info!(unit = %self.inner.unit, run = %active.run.id, "armed scan discarded");
                    self.archive(&mut state, active, ScanTrigger::Abort, None);
                }
                Ok(())
            }
        }
    }

    /// Snapshot of the active run.
    pub fn current(&self) -> Option<ScanRun> {
        self.lock().active.as_ref().map(|a| a.run.clone())
    }

    /// Status of the active run, `Idle` when there is none.
    pub fn status(&self) -> ScanStatus {
        self.lock()
            .active
            .as_ref()
            .map_or(ScanStatus::Idle, |a| a.run.status)
    }

    /// Archived runs, oldest first.
    pub fn history(&self) -> Vec<ScanRun> {
        self.lock().history.iter().cloned().collect()
    }

    /// Active or archived run by id.
    pub fn run(&self, id: Uuid) -> Option<ScanRun> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .map(|a| &a.run)
            .filter(|run| run.id == id)
            .or_else(|| state.history.iter().find(|run| run.id == id))
            .cloned()
    }

    /// Most recently archived run.
    pub fn last_finished(&self) -> Option<ScanRun> {
        self.lock().history.back().cloned()
    }

    /// Waits until run `id` is archived and returns it.
    pub async fn wait_finished(&self, id: Uuid) -> Option<ScanRun> {
        loop {
            let notified = self.inner.finished.notified();
            {
                let state = self.lock();
                if let Some(run) = state.history.iter().find(|run| run.id == id) {
                    return Some(run.clone());
                }
                if !state.active.as_ref().is_some_and(|a| a.run.id == id) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Moves `active` into the history with its terminal status.
    fn archive(&self, state: &mut RunState, active: ActiveRun, trigger: ScanTrigger, failure: Option<String>) {
        let ActiveRun { mut run, events, .. } = active;
        let Some(from) = run.apply(trigger) else {
            warn!(run = %run.id, status = %run.status, ?trigger, "ignoring invalid scan transition");
            return;
        };
        run.failure = failure;
        run.associate_monitor();
        events.publish(status_changed(&run, from));
        events.publish(Event::Scan(ScanEvent::Finished {
            run: run.id,
            status: run.status,
            sample_count: run.samples.len(),
            failure: run.failure.clone(),
        }));
        info!(
            unit = %run.unit,
            run = %run.id,
            status = %run.status,
            samples = run.samples.len(),
            "scan finished"
        );
        state.history.push_back(run);
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
        self.inner.finished.notify_waiters();
    }
}

fn status_changed(run: &ScanRun, from: ScanStatus) -> Event {
    Event::Scan(ScanEvent::StatusChanged {
        run: run.id,
        unit: run.unit.clone(),
        from,
        to: run.status,
    })
}

/// How the driver loop ended.
enum Ending {
    Completed,
    Aborted,
    Failed(DeviceError),
}

async fn outcome_of<T: Clone + Send + 'static>(task: TaskHandle<T>, device: &DeviceId) -> Result<T, DeviceError> {
    task.wait()
        .await
        .into_result()
        .unwrap_or_else(|| Err(DeviceError::transient(device, "operation cancelled")))
}

/// Background task owning one running scan.
struct Driver {
    orchestrator: ScanOrchestrator,
    run: Uuid,
    config: ScanConfig,
    abort: CancelToken,
    events: Publisher,
}

impl Driver {
    fn inner(&self) -> &Inner {
        &self.orchestrator.inner
    }

    async fn run(self) {
        let mut started = false;
        let ending = self.drive(&mut started).await;
        self.cleanup(started).await;

        let (trigger, failure) = match ending {
            Ending::Completed => (ScanTrigger::Complete, None),
            Ending::Aborted => (ScanTrigger::Abort, None),
            Ending::Failed(err) => {
                error!(unit = %self.inner().unit, run = %self.run, error = %err, "scan failed");
                self.events.error(ErrorReport::from_device(Component::Scan, &err));
                (ScanTrigger::Fail, Some(err.to_string()))
            }
        };
        let mut state = self.orchestrator.lock();
        match state.active.take() {
            Some(active) if active.run.id == self.run => {
                self.orchestrator.archive(&mut state, active, trigger, failure);
            }
            other => state.active = other,
        }
    }

    /// Sends one scan-unit command, retrying transient failures.
    async fn command(&self, command: ScanUnitCommand) -> Result<(), DeviceError> {
        let inner = self.inner();
        inner
            .settings
            .retry
            .run(|_| {
                let command = command.clone();
                let task = inner.lane.submit("configure scan unit", move |conn, _: &CancelToken| {
                    conn.ensure_open()?;
                    conn.configure(&command)
                });
                outcome_of(task, &inner.unit)
            })
            .await
    }

    async fn drive(&self, started: &mut bool) -> Ending {
        let settings = &self.inner().settings;
        let config = self.config;
        let sequence = [
            ScanUnitCommand::park(config.input, settings.park_wavelength_nm),
            ScanUnitCommand::SetLaser {
                input: config.input,
                enable: true,
                gpib_address: settings.gpib_address,
                source: settings.source,
                min_wavelength_nm: settings.limits.min_wavelength_nm,
                max_wavelength_nm: settings.limits.max_wavelength_nm,
                speed_nm_s: config.speed_nm_s,
            },
            ScanUnitCommand::SetScan {
                power_mw: config.laser_power_mw,
                min_wavelength_nm: config.start_nm,
                max_wavelength_nm: config.end_nm,
            },
            ScanUnitCommand::SetSamplingResolution {
                picometres: config.resolution_pm(),
            },
            ScanUnitCommand::SetDetectorArray(settings.detectors),
        ];
        for command in sequence {
            if self.abort.is_cancelled() {
                return Ending::Aborted;
            }
            if let Err(err) = self.command(command).await {
                return Ending::Failed(err);
            }
        }
        if self.abort.is_cancelled() {
            return Ending::Aborted;
        }

        let unit = &self.inner().unit;
        let trigger = self.inner().lane.submit("start sweep", |conn, _: &CancelToken| conn.trigger());
        if let Err(err) = outcome_of(trigger, unit).await {
            return Ending::Failed(err);
        }
        *started = true;
        debug!(unit = %unit, run = %self.run, points = config.sample_count(), "sweep triggered");

        self.poll().await
    }

    async fn poll(&self) -> Ending {
        let inner = self.inner();
        let mut monitor = inner.monitor.as_ref().filter(|_| self.config.monitor_power);
        let mut ticker = tokio::time::interval(inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.abort.cancelled() => return Ending::Aborted,
            }

            let (reading, power) = futures::join!(self.read_unit(), read_monitor(monitor));
            if self.abort.is_cancelled() {
                // Samples of a poll that raced the abort are discarded.
                return Ending::Aborted;
            }
            let reading = match reading {
                Ok(reading) => reading,
                Err(err) => return Ending::Failed(err),
            };
            let power = match power {
                Ok(power) => power,
                Err(err) => {
                    warn!(run = %self.run, error = %err, "power monitor read failed during scan");
                    self.events.error(ErrorReport::from_device(Component::Scan, &err));
                    if err.is_fatal() {
                        monitor = None;
                    }
                    None
                }
            };

            let ScanReading { state: device_state, samples } = reading;
            let (progress, exhausted, count) = {
                let mut state = self.orchestrator.lock();
                let Some(active) = state.active.as_mut().filter(|a| a.run.id == self.run) else {
                    return Ending::Aborted;
                };
                // `abort` cancels under this lock, so nothing is appended after it returns.
                if self.abort.is_cancelled() {
                    return Ending::Aborted;
                }
                let run = &mut active.run;
                run.push_samples(&samples, Utc::now());
                if let Some(power) = power {
                    run.add_monitor_reading(power);
                }
                let progress = ScanEvent::Progress {
                    run: run.id,
                    percent: run.percent_complete(),
                    sample_count: run.samples.len(),
                    latest: run.samples.last().copied(),
                };
                (progress, run.range_exhausted(), run.samples.len())
            };
            self.events.publish(Event::Scan(progress));

            match device_state {
                ScanState::Fault { code, message } => {
                    return Ending::Failed(DeviceError::fault(&inner.unit, code, message));
                }
                ScanState::Complete if count == 0 => {
                    return Ending::Failed(DeviceError::fatal(&inner.unit, "scan completed without samples"));
                }
                ScanState::Complete => return Ending::Completed,
                ScanState::Running if exhausted => return Ending::Completed,
                ScanState::Running => {}
            }
        }
    }

    async fn read_unit(&self) -> Result<ScanReading, DeviceError> {
        let inner = self.inner();
        inner
            .settings
            .retry
            .run(|_| {
                let task = inner.lane.submit("poll sweep", |conn, _: &CancelToken| conn.read());
                outcome_of(task, &inner.unit)
            })
            .await
    }

    /// Stops a started sweep and parks the laser. Failures are logged only.
    async fn cleanup(&self, started: bool) {
        let inner = self.inner();
        let mut commands = Vec::with_capacity(2);
        if started {
            commands.push(("stop sweep", ScanUnitCommand::StopScan));
        }
        commands.push((
            "park laser",
            ScanUnitCommand::park(self.config.input, inner.settings.park_wavelength_nm),
        ));
        for (label, command) in commands {
            let task = inner.lane.submit(label, move |conn, _: &CancelToken| {
                conn.ensure_open()?;
                conn.configure(&command)
            });
            match outcome_of(task, &inner.unit).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    debug!(unit = %inner.unit, step = %label, error = %err, "cleanup step failed");
                }
                Err(err) => {
                    warn!(unit = %inner.unit, step = %label, error = %err, "cleanup step failed");
                    self.events.error(ErrorReport::from_device(Component::Scan, &err));
                }
            }
        }
    }
}

async fn read_monitor(lane: Option<&MonitorLane>) -> Result<Option<PowerData>, DeviceError> {
    let Some(lane) = lane else {
        return Ok(None);
    };
    let task = lane.submit("read power during scan", |conn, _: &CancelToken| {
        conn.ensure_open()?;
        conn.read()
    });
    outcome_of(task, lane.device()).await.map(Some)
}
