//! Scan run data model and its state machine.
//!
//! ```text
//! Idle --configure--> Armed --start--> Running --complete--> Completed
//!                       |                 |--abort--> Aborted
//!                       +--abort--> Aborted  +--fail--> Failed
//! ```

use super::config::ScanConfig;
use crate::device::{DeviceId, PowerData, RawSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    /// No run.
    Idle,
    /// Validated and waiting to start.
    Armed,
    /// Sweep in progress.
    Running,
    /// The device finished the sweep.
    Completed,
    /// Stopped on request.
    Aborted,
    /// A fatal error ended the run.
    Failed,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs of the scan state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    /// A valid configuration was accepted.
    Configure,
    /// The sweep was triggered.
    Start,
    /// The device reported completion.
    Complete,
    /// The user aborted.
    Abort,
    /// A fatal error occurred.
    Fail,
}

impl ScanStatus {
    /// Next status, or `None` if `trigger` is not accepted here.
    pub fn on(self, trigger: ScanTrigger) -> Option<ScanStatus> {
        use ScanStatus::*;
        use ScanTrigger::*;
        match (self, trigger) {
            (Idle, Configure) => Some(Armed),
            (Armed, Start) => Some(Running),
            (Armed, Abort) => Some(Aborted),
            (Running, Complete) => Some(Completed),
            (Running, Abort) => Some(Aborted),
            (Running, Fail) => Some(Failed),
            _ => None,
        }
    }

    /// Armed or Running: the unit is taken.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Armed | Self::Running)
    }

    /// Completed, Aborted or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    /// Runs with data worth writing out.
    pub fn is_exportable(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// One acquired point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    /// Wavelength, nm.
    pub wavelength_nm: f64,
    /// Detector 1 power, dBm.
    pub power_dbm: f64,
    /// Acquisition time, interpolated across the poll.
    pub timestamp: DateTime<Utc>,
    /// Time since the sweep was started.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Power monitor reading nearest in time, if monitoring was enabled.
    pub monitor: Option<PowerData>,
}

/// One execution of a wavelength scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRun {
    /// Run id.
    pub id: Uuid,
    /// Scan unit it ran on.
    pub unit: DeviceId,
    /// Validated configuration.
    pub config: ScanConfig,
    /// Current status.
    pub status: ScanStatus,
    /// Acquired points, strictly increasing in wavelength.
    pub samples: Vec<ScanSample>,
    /// Power monitor readings taken during the sweep.
    pub monitor_readings: Vec<PowerData>,
    /// When the run was armed.
    pub created_at: DateTime<Utc>,
    /// When the sweep was triggered.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Error that failed the run.
    pub failure: Option<String>,
    #[serde(skip)]
    last_poll: Option<DateTime<Utc>>,
}

impl ScanRun {
    /// Idle run with a fresh id.
    pub fn new(unit: DeviceId, config: ScanConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit,
            config,
            status: ScanStatus::Idle,
            samples: Vec::new(),
            monitor_readings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            failure: None,
            last_poll: None,
        }
    }

    /// Applies `trigger`, stamping start and end times.
    ///
    /// Returns the previous status, or `None` if the trigger was refused.
    pub fn apply(&mut self, trigger: ScanTrigger) -> Option<ScanStatus> {
        let from = self.status;
        let to = from.on(trigger)?;
        let now = Utc::now();
        if to == ScanStatus::Running {
            self.started_at = Some(now);
            self.last_poll = Some(now);
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = to;
        Some(from)
    }

    /// Appends one poll's samples, keeping wavelength strictly increasing.
    ///
    /// Sample times are spread evenly between the previous poll and
    /// `polled_at`. Samples at or below the last wavelength are dropped.
    /// Returns how many were kept.
    pub fn push_samples(&mut self, raw: &[RawSample], polled_at: DateTime<Utc>) -> usize {
        let started = self.started_at.unwrap_or(polled_at);
        let previous = self.last_poll.unwrap_or(started).min(polled_at);
        self.last_poll = Some(polled_at);

        let mut last = self.samples.last().map(|s| s.wavelength_nm);
        let fresh: Vec<&RawSample> = raw
            .iter()
            .filter(|s| {
                let keep = s.wavelength_nm.is_finite() && last.map_or(true, |l| s.wavelength_nm > l);
                if keep {
                    last = Some(s.wavelength_nm);
                }
                keep
            })
            .collect();

        let span = polled_at - previous;
        let count = fresh.len() as i32;
        for (i, sample) in fresh.into_iter().enumerate() {
            let timestamp = previous + span * (i as i32 + 1) / count;
            self.samples.push(ScanSample {
                wavelength_nm: sample.wavelength_nm,
                power_dbm: sample.power_dbm,
                timestamp,
                elapsed: (timestamp - started).to_std().unwrap_or_default(),
                monitor: None,
            });
        }
        count as usize
    }

    /// Records a monitor reading and attaches it to samples that have none.
    pub fn add_monitor_reading(&mut self, reading: PowerData) {
        let at = self
            .monitor_readings
            .partition_point(|r| r.timestamp <= reading.timestamp);
        self.monitor_readings.insert(at, reading);
        let readings = &self.monitor_readings;
        for sample in self.samples.iter_mut().filter(|s| s.monitor.is_none()) {
            sample.monitor = nearest(readings, sample.timestamp);
        }
    }

    /// Re-associates every sample with its nearest monitor reading.
    pub fn associate_monitor(&mut self) {
        let readings = &self.monitor_readings;
        for sample in &mut self.samples {
            sample.monitor = nearest(readings, sample.timestamp);
        }
    }

    /// True once the last sample reached the end of the configured range.
    pub fn range_exhausted(&self) -> bool {
        let tolerance = self.config.resolution_nm / 2.0;
        self.samples
            .last()
            .is_some_and(|s| s.wavelength_nm >= self.config.end_nm - tolerance)
    }

    /// Percent of the wavelength range covered so far.
    pub fn percent_complete(&self) -> f64 {
        if self.status == ScanStatus::Completed {
            return 100.0;
        }
        let Some(last) = self.samples.last() else {
            return 0.0;
        };
        let span = self.config.end_nm - self.config.start_nm;
        if span <= 0.0 {
            return 0.0;
        }
        ((last.wavelength_nm - self.config.start_nm) / span * 100.0).clamp(0.0, 100.0)
    }

    /// Time from start to end, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        (end - start).to_std().ok()
    }
}

/// Reading closest in time to `at`. `readings` is sorted by timestamp.
fn nearest(readings: &[PowerData], at: DateTime<Utc>) -> Option<PowerData> {
    let idx = readings.partition_point(|r| r.timestamp < at);
    let after = readings.get(idx);
    let before = idx.checked_sub(1).and_then(|i| readings.get(i));
    match (before, after) {
        (Some(b), Some(a)) => {
            if at - b.timestamp <= a.timestamp - at {
                Some(*b)
            } else {
                Some(*a)
            }
        }
        (Some(r), None) | (None, Some(r)) => Some(*r),
        (None, None) => None,
    }
}

/// Scan notifications published on the bus, in order per run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The run changed status.
    StatusChanged {
        run: Uuid,
        unit: DeviceId,
        from: ScanStatus,
        to: ScanStatus,
    },
    /// Published after every poll.
    Progress {
        run: Uuid,
        percent: f64,
        sample_count: usize,
        latest: Option<ScanSample>,
    },
    /// The run reached a terminal status.
    Finished {
        run: Uuid,
        status: ScanStatus,
        sample_count: usize,
        failure: Option<String>,
    },
}
