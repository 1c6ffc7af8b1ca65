//! Frame-rate pacing for senders without a vsync of their own.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Sleeps the calling thread so successive [`hold`](PacingClock::hold) calls
/// are spaced at least one frame period apart.
#[derive(Debug, Default)]
pub struct PacingClock {
    target: Option<i32>,
    period: Duration,
    last: Option<Instant>,
}

impl PacingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until one period of `target_fps` has passed since the previous
    /// call.
    ///
    /// The first call, and the first call after the target changes, only
    /// start the clock. A target of zero or less does nothing.
    pub fn hold(&mut self, target_fps: i32) {
        if target_fps <= 0 {
            return;
        }
        let last = match self.last {
            Some(last) if self.target == Some(target_fps) => last,
            _ => {
                debug!("Pacing at {target_fps} fps");
                self.target = Some(target_fps);
                self.period = Duration::from_secs_f64(1.0 / f64::from(target_fps));
                self.last = Some(Instant::now());
                return;
            }
        };

        let elapsed = last.elapsed();
        if elapsed < self.period {
            thread::sleep(self.period - elapsed);
        }
        self.last = Some(Instant::now());
    }

    /// Forget the previous call; the next [`hold`](PacingClock::hold) only
    /// restarts the clock.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn target_fps(&self) -> Option<i32> {
        self.target
    }
}
