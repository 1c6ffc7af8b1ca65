//! Damped frame-rate estimate over a fixed window of frames.

use std::time::{Duration, Instant};

use crate::config::SyncConfig;

/// Mean frame times below this (in seconds) are treated as noise.
const MIN_FRAME_TIME: f64 = 0.0001;

/// Rolling fps estimator.
///
/// Elapsed time and frame-equivalents accumulate until the window is full;
/// the mean frame time then yields an instantaneous fps that is blended into
/// the running estimate. A consumer that skipped frames passes several
/// frame-equivalents in one update.
#[derive(Debug, Clone)]
pub struct FpsEstimator {
    fps: f64,
    window: u32,
    damping: f64,
    elapsed_total: Duration,
    frames_total: u64,
    last: Instant,
}

impl FpsEstimator {
    pub fn new(default_fps: f64, window: u32, damping: f64) -> Self {
        Self {
            fps: default_fps,
            window: window.max(1),
            damping: damping.clamp(0.0, 1.0),
            elapsed_total: Duration::ZERO,
            frames_total: 0,
            last: Instant::now(),
        }
    }

    pub fn from_config(config: &SyncConfig, default_fps: f64) -> Self {
        Self::new(default_fps, config.fps_window, config.fps_damping)
    }

    /// Drop accumulated samples and restart from `default_fps`.
    pub fn reset(&mut self, default_fps: f64) {
        self.fps = default_fps;
        self.elapsed_total = Duration::ZERO;
        self.frames_total = 0;
        self.last = Instant::now();
    }

    /// Account for `frames` new frames since the previous update.
    pub fn update(&mut self, frames: i64) {
        if frames <= 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        self.update_with_elapsed(frames, elapsed);
    }

    /// Account for `frames` new frames produced over `elapsed`.
    pub fn update_with_elapsed(&mut self, frames: i64, elapsed: Duration) {
        if frames <= 0 {
            return;
        }
        self.elapsed_total += elapsed;
        self.frames_total += frames as u64;
        if self.frames_total < u64::from(self.window) {
            return;
        }

        let frame_time = self.elapsed_total.as_secs_f64() / self.frames_total as f64;
        self.elapsed_total = Duration::ZERO;
        self.frames_total = 0;
        if frame_time > MIN_FRAME_TIME {
            let sample = 1.0 / frame_time;
            self.fps = self.damping * self.fps + (1.0 - self.damping) * sample;
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}
