//! Fibre alignment and 2D power mapping with piezo stages.
//!
//! Two three-axis stages (left and right of the chip) are moved through
//! their device lanes while detector power is read through the power
//! monitor lane, so alignment never touches a device concurrently with a
//! scan or the live monitor.
//!
//! - **Alignment** climbs each axis in turn: step in one direction while
//!   power improves by more than `min_gain_db`, go back to the best point
//!   and try the other direction once, then settle on the best point. The
//!   left stage climbs z then x for butt coupling, every other stage y then x.
//! - **Mapping** rasters one stage over an x/y grid of offsets around its
//!   starting position, clamped to the drive range, and always returns the
//!   stage to where it started, cancelled or not.
//!
//! One task runs at a time. Progress, results and cancellation arrive on the
//! bus as [`AlignmentEvent`]s; device failures also as error reports.

use crate::bus::{Component, ErrorReport, Event, Publisher};
use crate::device::{Axis, Connection, Detector, PiezoCommand, PiezoPosition, PiezoStage};
use crate::error::{AlignmentError, DeviceError};
use crate::executor::{CancelToken, DeviceLane, TaskHandle};
use crate::monitor::MonitorLane;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lane owning a piezo controller's connection.
pub type PiezoLane = DeviceLane<Connection<Box<dyn PiezoStage>>>;

/// Which side of the chip a stage sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Input side.
    #[default]
    Left,
    /// Output side.
    Right,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Left => "left",
            Stage::Right => "right",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How light enters the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    /// Edge coupling; the left fibre moves along z towards the facet.
    #[default]
    Butt,
    /// Grating coupling from above.
    Top,
}

impl Coupling {
    /// Axes climbed on `stage`, in order.
    pub fn axes(self, stage: Stage) -> [Axis; 2] {
        match (self, stage) {
            (Coupling::Butt, Stage::Left) => [Axis::Z, Axis::X],
            _ => [Axis::Y, Axis::X],
        }
    }
}

/// Which task a [`AlignmentEvent`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentTask {
    /// Hill-climb alignment of both stages.
    Alignment,
    /// 2D power map of one stage.
    Mapping,
}

impl AlignmentTask {
    /// Lower-case name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            AlignmentTask::Alignment => "alignment",
            AlignmentTask::Mapping => "mapping",
        }
    }
}

/// Parameters of one alignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentSettings {
    /// Passes over both stages, 1-20.
    pub iterations: u32,
    /// Climb step, 10-1000 nm.
    pub step_nm: f64,
    /// Readings averaged per point, 1-10.
    pub samples_per_point: u32,
    /// Decides which axes are climbed.
    pub coupling: Coupling,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            iterations: 2,
            step_nm: 100.0,
            samples_per_point: 1,
            coupling: Coupling::Butt,
        }
    }
}

fn invalid(message: String) -> AlignmentError {
    AlignmentError::InvalidSettings(message)
}

impl AlignmentSettings {
    /// Rejects values outside the accepted ranges.
    pub fn validate(&self) -> Result<(), AlignmentError> {
        if !(1..=20).contains(&self.iterations) {
            return Err(invalid(format!("iterations {} must be 1-20", self.iterations)));
        }
        if !(10.0..=1000.0).contains(&self.step_nm) {
            return Err(invalid(format!("step_nm {} must be 10-1000", self.step_nm)));
        }
        validate_samples(self.samples_per_point)
    }
}

fn validate_samples(samples: u32) -> Result<(), AlignmentError> {
    if !(1..=10).contains(&samples) {
        return Err(invalid(format!("samples_per_point {} must be 1-10", samples)));
    }
    Ok(())
}

/// Parameters of one power map. Offsets are relative to the stage's
/// position when mapping starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    /// First x offset.
    pub x_min_nm: i32,
    /// Last x offset, inclusive when on the step grid.
    pub x_max_nm: i32,
    /// X spacing, 10-1000 nm.
    pub x_step_nm: u32,
    /// First y offset.
    pub y_min_nm: i32,
    /// Last y offset.
    pub y_max_nm: i32,
    /// Y spacing, 10-1000 nm.
    pub y_step_nm: u32,
    /// Readings averaged per point, 1-10.
    pub samples_per_point: u32,
    /// Stage that is moved.
    pub stage: Stage,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            x_min_nm: -3000,
            x_max_nm: 3000,
            x_step_nm: 500,
            y_min_nm: -3000,
            y_max_nm: 3000,
            y_step_nm: 500,
            samples_per_point: 1,
            stage: Stage::Left,
        }
    }
}

impl MappingSettings {
    /// Rejects values outside the accepted ranges.
    pub fn validate(&self) -> Result<(), AlignmentError> {
        for (axis, min, max, step) in [
            ("x", self.x_min_nm, self.x_max_nm, self.x_step_nm),
            ("y", self.y_min_nm, self.y_max_nm, self.y_step_nm),
        ] {
            if !(-5000..=5000).contains(&min) || !(-5000..=5000).contains(&max) {
                return Err(invalid(format!("{} range {}..{} nm must lie within -5000..5000", axis, min, max)));
            }
            if min > max {
                return Err(invalid(format!("{} range {}..{} nm is inverted", axis, min, max)));
            }
            if !(10..=1000).contains(&step) {
                return Err(invalid(format!("{} step {} nm must be 10-1000", axis, step)));
            }
        }
        validate_samples(self.samples_per_point)
    }

    /// X offsets from `x_min_nm` up to `x_max_nm` inclusive.
    pub fn x_offsets(&self) -> Vec<i32> {
        offsets(self.x_min_nm, self.x_max_nm, self.x_step_nm)
    }

    /// Y offsets from `y_min_nm` up to `y_max_nm` inclusive.
    pub fn y_offsets(&self) -> Vec<i32> {
        offsets(self.y_min_nm, self.y_max_nm, self.y_step_nm)
    }

    /// Grid size.
    pub fn point_count(&self) -> usize {
        self.x_offsets().len() * self.y_offsets().len()
    }
}

fn offsets(min: i32, max: i32, step: u32) -> Vec<i32> {
    let step = step.max(1) as usize;
    (min..=max).step_by(step).collect()
}

/// Result of a mapping: coupled power over the grid, `power_mw[x][y]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerMap {
    /// Mapped stage.
    pub stage: Stage,
    /// X offsets from the start position, µm.
    pub x_um: Vec<f64>,
    /// Y offsets, µm.
    pub y_um: Vec<f64>,
    /// Mean power per point, mW.
    pub power_mw: Vec<Vec<f64>>,
}

impl PowerMap {
    /// Grid point with the highest power: `(x_um, y_um, power_mw)`.
    pub fn peak(&self) -> Option<(f64, f64, f64)> {
        self.power_mw
            .iter()
            .enumerate()
            .flat_map(|(i, row)| row.iter().enumerate().map(move |(j, p)| (i, j, *p)))
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(i, j, p)| (self.x_um[i], self.y_um[j], p))
    }
}

/// Alignment and mapping progress published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlignmentEvent {
    /// Human readable step, with the latest power reading when there is one.
    Progress { message: String, power_dbm: Option<f64> },
    /// Alignment finished; power at the final position.
    Aligned { power_dbm: f64 },
    /// Published after every mapped point.
    MapProgress { percent: u8, done: usize, total: usize },
    /// Mapping finished; the stage is back at its start.
    Mapped(PowerMap),
    /// Stopped on request. A mapped stage is back at its start.
    Cancelled(AlignmentTask),
    /// A device call failed; an error report is published alongside.
    Failed { task: AlignmentTask, message: String },
}

/// Timing and detection parameters shared by every task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignerOptions {
    /// Wait after every move before reading power.
    pub settle_time: Duration,
    /// Gap between averaged readings of one point.
    pub sample_interval: Duration,
    /// Channel whose power is maximised.
    pub detector: Detector,
    /// Smallest improvement that counts as a gain.
    pub min_gain_db: f64,
    /// Steps per axis climb before giving up on finding the peak.
    pub max_climb_steps: usize,
}

impl Default for AlignerOptions {
    fn default() -> Self {
        Self {
            settle_time: Duration::from_millis(50),
            sample_interval: Duration::from_millis(20),
            detector: Detector::De1,
            min_gain_db: 0.01,
            max_climb_steps: 200,
        }
    }
}

struct Running {
    task: AlignmentTask,
    stop: CancelToken,
    handle: JoinHandle<()>,
}

/// Runs alignment and mapping tasks, one at a time.
pub struct Aligner {
    runtime: Handle,
    left: Option<PiezoLane>,
    right: Option<PiezoLane>,
    monitor: MonitorLane,
    events: Publisher,
    options: AlignerOptions,
    running: Option<Running>,
}

impl Aligner {
    /// Idle aligner. Either stage may be missing.
    pub fn new(
        runtime: Handle,
        left: Option<PiezoLane>,
        right: Option<PiezoLane>,
        monitor: MonitorLane,
        events: Publisher,
        options: AlignerOptions,
    ) -> Self {
        Self {
            runtime,
            left,
            right,
            monitor,
            events,
            options,
            running: None,
        }
    }

    /// Task currently running, if any.
    pub fn active(&self) -> Option<AlignmentTask> {
        self.running
            .as_ref()
            .filter(|running| !running.handle.is_finished())
            .map(|running| running.task)
    }

    fn lane(&self, stage: Stage) -> Result<PiezoLane, AlignmentError> {
        let lane = match stage {
            Stage::Left => self.left.as_ref(),
            Stage::Right => self.right.as_ref(),
        };
        lane.cloned().ok_or(AlignmentError::StageUnavailable(stage.name()))
    }

    fn ensure_idle(&self) -> Result<(), AlignmentError> {
        match self.active() {
            Some(task) => Err(AlignmentError::Busy(task.name())),
            None => Ok(()),
        }
    }

    fn worker(&self, stop: &CancelToken) -> Result<Worker, AlignmentError> {
        Ok(Worker {
            left: self.lane(Stage::Left)?,
            right: self.lane(Stage::Right)?,
            monitor: self.monitor.clone(),
            events: self.events.clone(),
            options: self.options,
            stop: stop.clone(),
        })
    }

    /// Starts aligning both stages.
    pub fn start_alignment(&mut self, settings: AlignmentSettings) -> Result<(), AlignmentError> {
        self.ensure_idle()?;
        settings.validate()?;
        let stop = CancelToken::new();
        let worker = self.worker(&stop)?;
        info!(?settings, "alignment started");
        let handle = self.runtime.spawn(worker.run_alignment(settings));
        self.running = Some(Running {
            task: AlignmentTask::Alignment,
            stop,
            handle,
        });
        Ok(())
    }

    /// Starts mapping one stage.
    pub fn start_mapping(&mut self, settings: MappingSettings) -> Result<(), AlignmentError> {
        self.ensure_idle()?;
        settings.validate()?;
        let lane = self.lane(settings.stage)?;
        let stop = CancelToken::new();
        let worker = Worker {
            left: lane.clone(),
            right: lane,
            monitor: self.monitor.clone(),
            events: self.events.clone(),
            options: self.options,
            stop: stop.clone(),
        };
        info!(?settings, points = settings.point_count(), "power mapping started");
        let handle = self.runtime.spawn(worker.run_mapping(settings));
        self.running = Some(Running {
            task: AlignmentTask::Mapping,
            stop,
            handle,
        });
        Ok(())
    }

    /// Requests the running task to stop. Returns false if none was running.
    pub fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.stop.cancel();
        let was_running = !running.handle.is_finished();
        if was_running {
            info!(task = running.task.name(), "alignment task stop requested");
        }
        was_running
    }
}

impl Drop for Aligner {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
        }
    }
}

/// Why a task stopped early.
enum Interrupt {
    Cancelled,
    Device(DeviceError),
}

impl From<DeviceError> for Interrupt {
    fn from(err: DeviceError) -> Self {
        Interrupt::Device(err)
    }
}

async fn outcome_of<T: Clone + Send + 'static>(task: TaskHandle<T>) -> Result<T, Interrupt> {
    match task.wait().await.into_result() {
        Some(result) => Ok(result?),
        None => Err(Interrupt::Cancelled),
    }
}

struct Worker {
    /// For mapping both lanes are the mapped stage.
    left: PiezoLane,
    right: PiezoLane,
    monitor: MonitorLane,
    events: Publisher,
    options: AlignerOptions,
    stop: CancelToken,
}

impl Worker {
    fn lane(&self, stage: Stage) -> &PiezoLane {
        match stage {
            Stage::Left => &self.left,
            Stage::Right => &self.right,
        }
    }

    fn progress(&self, message: String, power_dbm: Option<f64>) {
        debug!(power_dbm, "{}", message);
        self.events
            .publish(Event::Alignment(AlignmentEvent::Progress { message, power_dbm }));
    }

    fn check(&self) -> Result<(), Interrupt> {
        if self.stop.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// Waits `duration` unless stopped first.
    async fn pause(&self, duration: Duration) -> Result<(), Interrupt> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.stop.cancelled() => Err(Interrupt::Cancelled),
        }
    }

    async fn position(&self, lane: &PiezoLane) -> Result<PiezoPosition, Interrupt> {
        outcome_of(lane.submit("read piezo", |conn, _: &CancelToken| {
            conn.ensure_open()?;
            conn.read()
        }))
        .await
    }

    /// Drives one axis. Not interrupted by a stop request.
    async fn drive(&self, lane: &PiezoLane, axis: Axis, volts: f64) -> Result<(), Interrupt> {
        outcome_of(lane.submit("set piezo voltage", move |conn, _: &CancelToken| {
            conn.ensure_open()?;
            conn.configure(&PiezoCommand::SetVoltage { axis, volts })
        }))
        .await
    }

    async fn move_to(&self, lane: &PiezoLane, axis: Axis, volts: f64) -> Result<(), Interrupt> {
        self.drive(lane, axis, volts).await?;
        self.pause(self.options.settle_time).await
    }

    /// Mean detector power over `samples` readings, dBm.
    async fn read_power(&self, samples: u32) -> Result<f64, Interrupt> {
        let detector = self.options.detector;
        let mut total = 0.0;
        for i in 0..samples.max(1) {
            self.check()?;
            if i > 0 {
                self.pause(self.options.sample_interval).await?;
            }
            let data = outcome_of(self.monitor.submit("read power", |conn, _: &CancelToken| {
                conn.ensure_open()?;
                conn.read()
            }))
            .await?;
            total += data.channel(detector);
        }
        Ok(total / f64::from(samples.max(1)))
    }

    fn finish<T>(&self, task: AlignmentTask, result: Result<T, Interrupt>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(Interrupt::Cancelled) => {
                warn!(task = task.name(), "alignment task cancelled");
                self.events.publish(Event::Alignment(AlignmentEvent::Cancelled(task)));
                None
            }
            Err(Interrupt::Device(err)) => {
                error!(task = task.name(), error = %err, "alignment task failed");
                self.events.error(ErrorReport::from_device(Component::Alignment, &err));
                self.events.publish(Event::Alignment(AlignmentEvent::Failed {
                    task,
                    message: err.to_string(),
                }));
                None
            }
        }
    }

    async fn run_alignment(self, settings: AlignmentSettings) {
        let result = self.align(&settings).await;
        if let Some(power_dbm) = self.finish(AlignmentTask::Alignment, result) {
            info!(power_dbm, "alignment finished");
            self.events
                .publish(Event::Alignment(AlignmentEvent::Aligned { power_dbm }));
        }
    }

    async fn align(&self, settings: &AlignmentSettings) -> Result<f64, Interrupt> {
        for iteration in 1..=settings.iterations {
            for stage in [Stage::Left, Stage::Right] {
                self.check()?;
                self.progress(
                    format!("iteration {}/{}: aligning {} stage", iteration, settings.iterations, stage),
                    None,
                );
                for axis in settings.coupling.axes(stage) {
                    self.climb(stage, axis, settings).await?;
                }
            }
        }
        self.read_power(settings.samples_per_point).await
    }

    /// Single-axis hill climb. Leaves the axis at the best position found.
    async fn climb(&self, stage: Stage, axis: Axis, settings: &AlignmentSettings) -> Result<f64, Interrupt> {
        let lane = self.lane(stage);
        let samples = settings.samples_per_point;
        let mut best_power = self.read_power(samples).await?;
        let mut best_volts = self.position(lane).await?.voltage(axis);
        self.progress(format!("{} stage: climbing {} axis", stage, axis), Some(best_power));

        let mut direction = 1.0;
        let mut flipped = false;
        let mut peaked = false;
        for _ in 0..self.options.max_climb_steps {
            self.check()?;
            let position = self.position(lane).await?;
            let target = position
                .range(axis)
                .clamp(position.offset(axis, direction * settings.step_nm));
            self.move_to(lane, axis, target).await?;
            let power = self.read_power(samples).await?;
            self.progress(format!("{} stage: climbing {} axis", stage, axis), Some(power));

            if power > best_power + self.options.min_gain_db {
                best_power = power;
                best_volts = target;
            } else if !flipped {
                direction = -1.0;
                flipped = true;
                self.move_to(lane, axis, best_volts).await?;
            } else {
                peaked = true;
                break;
            }
        }
        if !peaked {
            warn!(stage = %stage, axis = %axis, "climb stopped at the step limit");
        }

        self.move_to(lane, axis, best_volts).await?;
        let power = self.read_power(samples).await?;
        info!(stage = %stage, axis = %axis, volts = best_volts, power_dbm = power, "axis aligned");
        self.progress(format!("{} stage: {} axis aligned", stage, axis), Some(power));
        Ok(power)
    }

    async fn run_mapping(self, settings: MappingSettings) {
        let lane = self.lane(settings.stage).clone();
        let result = match self.position(&lane).await {
            Ok(start) => {
                let result = self.raster(&lane, &start, &settings).await;
                self.restore(&lane, &start).await;
                result
            }
            Err(err) => Err(err),
        };
        if let Some(map) = self.finish(AlignmentTask::Mapping, result) {
            info!(stage = %map.stage, peak = ?map.peak(), "power mapping finished");
            self.events.publish(Event::Alignment(AlignmentEvent::Mapped(map)));
        }
    }

    async fn raster(
        &self,
        lane: &PiezoLane,
        start: &PiezoPosition,
        settings: &MappingSettings,
    ) -> Result<PowerMap, Interrupt> {
        let xs = settings.x_offsets();
        let ys = settings.y_offsets();
        let total = xs.len() * ys.len();
        let (x_range, y_range) = (start.range(Axis::X), start.range(Axis::Y));
        let mut grid = vec![vec![0.0; ys.len()]; xs.len()];
        let mut done = 0;
        let mut clamped = false;

        for (i, &x_nm) in xs.iter().enumerate() {
            for (j, &y_nm) in ys.iter().enumerate() {
                self.check()?;
                let target_x = start.offset(Axis::X, f64::from(x_nm));
                let target_y = start.offset(Axis::Y, f64::from(y_nm));
                let (x, y) = (x_range.clamp(target_x), y_range.clamp(target_y));
                if !clamped && ((x - target_x).abs() > 1e-3 || (y - target_y).abs() > 1e-3) {
                    warn!(target_x, target_y, x, y, "map point outside the drive range, clamping");
                    clamped = true;
                }
                self.drive(lane, Axis::X, x).await?;
                self.move_to(lane, Axis::Y, y).await?;
                grid[i][j] = self.read_power(settings.samples_per_point).await?;

                done += 1;
                let percent = (100 * done / total) as u8;
                self.events
                    .publish(Event::Alignment(AlignmentEvent::MapProgress { percent, done, total }));
            }
        }

        Ok(PowerMap {
            stage: settings.stage,
            x_um: xs.iter().map(|&x| f64::from(x) / 1000.0).collect(),
            y_um: ys.iter().map(|&y| f64::from(y) / 1000.0).collect(),
            power_mw: grid
                .into_iter()
                .map(|row| row.into_iter().map(|dbm| 10f64.powf(dbm / 10.0)).collect())
                .collect(),
        })
    }

    /// Best-effort return to the starting position.
    async fn restore(&self, lane: &PiezoLane, start: &PiezoPosition) {
        for axis in [Axis::X, Axis::Y] {
            if let Err(Interrupt::Device(err)) = self.drive(lane, axis, start.voltage(axis)).await {
                warn!(device = %lane.device(), axis = %axis, error = %err, "could not return stage to its start");
            }
        }
    }
}
