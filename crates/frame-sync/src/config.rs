//! Tunable constants shared by every wait point and estimator.
//!
//! Every cooperating process must agree on the name suffixes. The wait bound
//! and the fps window are local choices.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Bound on every cross-process wait: about 4 frames at 60 fps.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(67);

/// Frame-equivalents accumulated before the fps estimate is refreshed.
pub const DEFAULT_FPS_WINDOW: u32 = 16;

/// Weight of the previous estimate when blending in a new fps sample.
pub const DEFAULT_FPS_DAMPING: f64 = 0.85;

/// Fallback fps when the display refresh rate cannot be queried.
pub const DEFAULT_REFRESH_RATE: f64 = 60.0;

/// Suffix appended to a channel name to form its access lock name.
pub const LOCK_SUFFIX: &str = "_SpoutAccessMutex";

/// Suffix appended to a channel name to form its frame counter name.
pub const COUNTER_SUFFIX: &str = "_Count_Semaphore";

/// Maximum count of the frame counter: `LONG_MAX` on Windows, about 2071
/// days of frames at 60 fps.
pub const COUNTER_CAPACITY: i64 = i32::MAX as i64;

const ENV_WAIT_MS: &str = "FRAME_SYNC_WAIT_MS";
const ENV_NAMESPACE: &str = "FRAME_SYNC_NAMESPACE";
const ENV_REFRESH_RATE: &str = "FRAME_SYNC_REFRESH_RATE";

/// Configuration for frame counters and access arbiters.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Bound on acquire waits and named-object bookkeeping.
    pub wait_timeout: Duration,
    /// Frame-equivalents per fps refresh.
    pub fps_window: u32,
    /// Weight of the previous fps estimate, in `0.0..1.0`.
    pub fps_damping: f64,
    /// Maximum count of the frame counter primitive.
    pub counter_capacity: i64,
    pub lock_suffix: String,
    pub counter_suffix: String,
    /// Fixed fps default instead of the display refresh rate.
    pub refresh_rate: Option<f64>,
    /// Directory holding named objects. Unix only; `None` picks
    /// `/dev/shm/frame-sync` or `$TMPDIR/frame-sync`.
    pub namespace: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            fps_window: DEFAULT_FPS_WINDOW,
            fps_damping: DEFAULT_FPS_DAMPING,
            counter_capacity: COUNTER_CAPACITY,
            lock_suffix: LOCK_SUFFIX.to_string(),
            counter_suffix: COUNTER_SUFFIX.to_string(),
            refresh_rate: None,
            namespace: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `FRAME_SYNC_WAIT_MS`, `FRAME_SYNC_NAMESPACE`
    /// and `FRAME_SYNC_REFRESH_RATE` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = env::var(ENV_WAIT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.wait_timeout = Duration::from_millis(ms),
                Err(e) => warn!("Ignoring {ENV_WAIT_MS}={raw:?}: {e}"),
            }
        }
        if let Ok(raw) = env::var(ENV_REFRESH_RATE) {
            match raw.trim().parse::<f64>() {
                Ok(hz) if hz > 0.0 => config.refresh_rate = Some(hz),
                Ok(hz) => warn!("Ignoring {ENV_REFRESH_RATE}={hz}: not positive"),
                Err(e) => warn!("Ignoring {ENV_REFRESH_RATE}={raw:?}: {e}"),
            }
        }
        if let Some(dir) = env::var_os(ENV_NAMESPACE) {
            if !dir.is_empty() {
                config.namespace = Some(PathBuf::from(dir));
            }
        }

        config
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_fps_window(mut self, window: u32) -> Self {
        self.fps_window = window.max(1);
        self
    }

    pub fn with_refresh_rate(mut self, hz: f64) -> Self {
        self.refresh_rate = Some(hz);
        self
    }

    pub fn with_namespace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.namespace = Some(dir.into());
        self
    }

    /// Name of the access lock for `channel`.
    pub fn lock_name(&self, channel: &str) -> String {
        format!("{channel}{}", self.lock_suffix)
    }

    /// Name of the frame counter for `channel`.
    pub fn counter_name(&self, channel: &str) -> String {
        format!("{channel}{}", self.counter_suffix)
    }
}
