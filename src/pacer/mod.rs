//! Frame pacer (host side).
//!
//! Turns display-refresh callbacks into [`TimingSnapshot`]s and hands each one to
//! a frame callback. The pacer does not own a clock: whoever drives it passes the
//! refresh timestamp to [`FramePacer::on_refresh`]. [`RefreshDriver`] is the
//! thread-based driver.
//!
//! ```text
//!              start            pause
//!   stopped ─────────► running ───────► paused
//!      ▲                  │  ◄───────     │ step() runs one frame
//!      │      stop        │   resume      │ and stays paused
//!      └──────────────────┴───────────────┘
//!
//!   dispose(): any state → disposed (terminal)
//! ```
//!
//! Counters: `frame` starts at 0 and increments once per executed frame, so the
//! first frame reports 1. `elapsed` is the sum of reported deltas. Both survive
//! pause/stop and are zeroed only by [`FramePacer::reset`].

mod driver;

pub use driver::RefreshDriver;

use std::time::Duration;

use crate::config::PacerConfig;
use crate::types::TimingSnapshot;

/// Called once per executed frame.
pub type FrameCallback = Box<dyn FnMut(TimingSnapshot) + Send>;

pub struct FramePacer {
    config: PacerConfig,
    callback: FrameCallback,

    running: bool,
    paused: bool,
    disposed: bool,

    frame: u64,
    elapsed: f64,
    delta: f64,
    last_timestamp: Option<Duration>,
}

impl FramePacer {
    pub fn new(config: PacerConfig, callback: impl FnMut(TimingSnapshot) + Send + 'static) -> Self {
        Self {
            config,
            callback: Box::new(callback),
            running: false,
            paused: false,
            disposed: false,
            frame: 0,
            elapsed: 0.0,
            delta: 0.0,
            last_timestamp: None,
        }
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Begin scheduling frames. No-op if already running or disposed.
    pub fn start(&mut self) {
        if self.disposed {
            tracing::debug!("pacer start ignored: disposed");
            return;
        }
        if self.running {
            return;
        }
        self.running = true;
        self.paused = false;
        self.last_timestamp = None;
        tracing::debug!(frame = self.frame, "pacer started");
    }

    /// Cancel scheduling and clear the running and paused flags. Counters are kept.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.paused = false;
        self.last_timestamp = None;
        tracing::debug!(frame = self.frame, "pacer stopped");
    }

    pub fn pause(&mut self) {
        if self.running && !self.paused {
            self.paused = true;
            tracing::debug!(frame = self.frame, "pacer paused");
        }
    }

    pub fn resume(&mut self) {
        if self.running && self.paused {
            self.paused = false;
            self.last_timestamp = None;
            tracing::debug!(frame = self.frame, "pacer resumed");
        }
    }

    /// Execute exactly one frame while paused, advancing by one nominal interval.
    ///
    /// Returns whether a frame ran. Not paused → no-op.
    pub fn step(&mut self) -> bool {
        if self.disposed || !self.paused {
            return false;
        }
        let delta = self.config.frame_interval().min(self.config.max_delta);
        self.execute(delta);
        true
    }

    /// Zero the frame number, elapsed time and last delta. Running state is untouched.
    pub fn reset(&mut self) {
        self.frame = 0;
        self.elapsed = 0.0;
        self.delta = 0.0;
    }

    /// Stop for good. Later `start` calls are ignored.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.stop();
        self.disposed = true;
        tracing::debug!("pacer disposed");
    }

    // =========================================================================
    // REFRESH
    // =========================================================================

    /// Display refresh at `timestamp` (any monotonic origin).
    ///
    /// Runs one frame if running and not paused, and returns whether it did.
    /// The delta is the gap since the previous refresh, clamped to
    /// `[0, max_delta]`; the first refresh after start or resume has delta 0.
    pub fn on_refresh(&mut self, timestamp: Duration) -> bool {
        if !self.running || self.paused {
            return false;
        }
        let raw = match self.last_timestamp {
            Some(previous) => timestamp.saturating_sub(previous).as_secs_f64(),
            None => 0.0,
        };
        self.last_timestamp = Some(timestamp);
        self.execute(clamp_delta(raw, self.config.max_delta));
        true
    }

    fn execute(&mut self, delta: f64) {
        self.frame += 1;
        self.delta = delta;
        self.elapsed += delta;
        let snapshot = self.snapshot();
        (self.callback)(snapshot);
    }

    // =========================================================================
    // GETTERS
    // =========================================================================

    /// Timing of the most recently executed frame.
    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            delta: self.delta,
            elapsed: self.elapsed,
            frame: self.frame,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }
}

impl std::fmt::Debug for FramePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacer")
            .field("running", &self.running)
            .field("paused", &self.paused)
            .field("disposed", &self.disposed)
            .field("frame", &self.frame)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

fn clamp_delta(raw: f64, max_delta: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, max_delta)
}

// =============================================================================
// TESTS
// =============================================================================
