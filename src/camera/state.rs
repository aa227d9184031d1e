//! Per-camera connectivity state machine.
//!
//! ```text
//! Disconnected --open--> Connecting --success--> Live
//! Live --N missed heartbeats--> Reconnecting --success--> Live
//! Connecting/Reconnecting --failure--> Disconnected --backoff--> Connecting/Reconnecting
//! Live --N failed reads in a row--> Reconnecting
//! Live --fatal read error--> Error
//! any --close--> Disconnected
//! ```
//!
//! The machine is pure: it decides transitions and retry delays, the
//! session task performs them. A first connection gives up after a bounded
//! number of attempts; a reconnection retries until the camera is closed.

use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connectivity of one camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraState {
    /// No session, or the session gave up.
    Disconnected,
    /// First open in progress.
    Connecting,
    /// Frames are flowing.
    Live,
    /// Lost while live; reopening with backoff.
    Reconnecting,
    /// Fatal device error while live. Requires an explicit reopen.
    Error,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Watchdog and reconnect tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// How often frame arrival is checked.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeats without a frame before reconnecting.
    pub missed_threshold: u32,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// Attempts for the first connection before giving up.
    pub max_open_attempts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            missed_threshold: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_open_attempts: 3,
        }
    }
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: CameraState,
    /// State after.
    pub to: CameraState,
}

/// Pure session state machine: states, heartbeats, backoff and read failures.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: CameraState,
    missed: u32,
    threshold: u32,
    open_attempts: u32,
    max_open_attempts: u32,
    read_failures: u32,
    read_pause: Duration,
    reconnecting: bool,
    backoff: Backoff,
}

impl SessionMachine {
    /// Disconnected machine with the given tuning.
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            state: CameraState::Disconnected,
            missed: 0,
            threshold: config.missed_threshold.max(1),
            open_attempts: 0,
            max_open_attempts: config.max_open_attempts.max(1),
            read_failures: 0,
            read_pause: config.initial_backoff.min(config.heartbeat_interval),
            reconnecting: false,
            backoff: Backoff::new(config.initial_backoff, config.max_backoff),
        }
    }

    /// Current state.
    pub fn state(&self) -> CameraState {
        self.state
    }

    /// Consecutive heartbeats without a frame.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Failed opens since the last success.
    pub fn attempts(&self) -> u32 {
        self.open_attempts
    }

    /// Transient read failures since the last frame.
    pub fn read_failures(&self) -> u32 {
        self.read_failures
    }

    fn go(&mut self, to: CameraState) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(Transition { from, to })
    }

    /// User asked to open the camera.
    pub fn open(&mut self) -> Option<Transition> {
        match self.state {
            CameraState::Disconnected | CameraState::Error => {
                self.open_attempts = 0;
                self.reconnecting = false;
                self.missed = 0;
                self.backoff.reset();
                self.go(CameraState::Connecting)
            }
            CameraState::Connecting | CameraState::Live | CameraState::Reconnecting => None,
        }
    }

    /// The device opened and cached settings were applied.
    pub fn opened(&mut self) -> Option<Transition> {
        match self.state {
            CameraState::Connecting | CameraState::Reconnecting => {
                self.missed = 0;
                self.read_failures = 0;
                self.open_attempts = 0;
                self.reconnecting = false;
                self.backoff.reset();
                self.go(CameraState::Live)
            }
            _ => None,
        }
    }

    /// Opening failed. Returns the transition and, if another attempt
    /// should follow, the delay before it.
    pub fn open_failed(&mut self) -> (Option<Transition>, Option<Duration>) {
        if !matches!(self.state, CameraState::Connecting | CameraState::Reconnecting) {
            return (None, None);
        }
        let transition = self.go(CameraState::Disconnected);
        self.open_attempts += 1;
        let retry = if self.reconnecting || self.open_attempts < self.max_open_attempts {
            Some(self.backoff.next_delay())
        } else {
            None
        };
        (transition, retry)
    }

    /// Backoff elapsed: try again.
    pub fn retry(&mut self) -> Option<Transition> {
        if self.state != CameraState::Disconnected {
            return None;
        }
        if self.reconnecting {
            self.go(CameraState::Reconnecting)
        } else {
            self.go(CameraState::Connecting)
        }
    }

    /// A frame arrived.
    pub fn frame(&mut self) {
        if self.state == CameraState::Live {
            self.missed = 0;
            self.read_failures = 0;
        }
    }

    /// A frame read failed transiently. Either escalates to a reconnect once
    /// the failures reach the missed-heartbeat threshold, or returns the
    /// pause before the next read.
    pub fn read_failed(&mut self) -> (Option<Transition>, Option<Duration>) {
        if self.state != CameraState::Live {
            return (None, None);
        }
        self.read_failures += 1;
        if self.read_failures >= self.threshold {
            self.reconnecting = true;
            self.backoff.reset();
            (self.go(CameraState::Reconnecting), None)
        } else {
            (None, Some(self.read_pause))
        }
    }

    /// One heartbeat interval elapsed. `frame_seen` tells whether any frame
    /// arrived during it.
    pub fn heartbeat_tick(&mut self, frame_seen: bool) -> Option<Transition> {
        if self.state != CameraState::Live {
            return None;
        }
        if frame_seen {
            self.missed = 0;
            return None;
        }
        self.missed += 1;
        if self.missed >= self.threshold {
            self.reconnecting = true;
            self.backoff.reset();
            self.go(CameraState::Reconnecting)
        } else {
            None
        }
    }

    /// Fatal device error while live.
    pub fn fatal(&mut self) -> Option<Transition> {
        match self.state {
            CameraState::Live => self.go(CameraState::Error),
            _ => None,
        }
    }

    /// User closed the camera.
    pub fn close(&mut self) -> Option<Transition> {
        self.reconnecting = false;
        self.go(CameraState::Disconnected)
    }
}
