//! Cross-process frame counter built on a named semaphore.
//!
//! There is no shared memory between a sender and its receivers, only named
//! kernel objects, so the frame number lives in the count of a semaphore
//! named after the channel.
//!
//! The semaphore starts at 1 and is never left at 0 for longer than one
//! claim:
//!
//! - The sender claims one unit and releases two, a net increase of one per
//!   frame. After `n` frames the count is `n + 1`.
//! - A receiver peeks by claiming one unit and releasing it again. The
//!   release reports the count it found after the claim, which is `n`. The
//!   peek leaves the count where it was.
//!
//! A receiver compares the value it peeked with the previous one to decide
//! whether the frame is new. Every failure path answers "new frame" so that
//! a receiver never stalls against a sender that does not count frames.
//!
//! The sender increments the count inside the texture access lock, and
//! receivers peek inside it, so a peek never races a publish.

use tracing::{debug, error, info, trace, warn};

use gpu_interop::WaitStatus;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::fps::FpsEstimator;
use crate::platform::{self, NamedSemaphore};
use crate::settings::{self, SettingsStore};

/// Frame counting state of one sender or receiver.
///
/// The same type serves both sides: a sender calls
/// [`publish`](FrameCounter::publish) after every texture update, a receiver
/// calls [`poll`](FrameCounter::poll) after every texture read.
pub struct FrameCounter {
    config: SyncConfig,
    settings: Box<dyn SettingsStore>,
    /// Global switch, read from the settings store at construction.
    frame_count_setting: bool,
    /// Set by [`disable`](FrameCounter::disable).
    app_disabled: bool,
    channel: Option<String>,
    semaphore: Option<NamedSemaphore>,
    frame_count: i64,
    last_observed: i64,
    is_new_frame: bool,
    fps: FpsEstimator,
}

impl FrameCounter {
    /// Counter configured from the environment, using the platform settings
    /// store.
    pub fn new() -> Self {
        Self::with_settings(SyncConfig::from_env(), settings::platform_store())
    }

    pub fn with_settings(config: SyncConfig, settings: Box<dyn SettingsStore>) -> Self {
        let frame_count_setting = settings.frame_count().unwrap_or(false);
        let fps = FpsEstimator::from_config(&config, platform::refresh_rate(&config));
        debug!("Frame counting setting: {frame_count_setting}");
        Self {
            config,
            settings,
            frame_count_setting,
            app_disabled: false,
            channel: None,
            semaphore: None,
            frame_count: 0,
            last_observed: 0,
            is_new_frame: false,
            fps,
        }
    }

    /// Switch frame counting on or off for every application of this user.
    ///
    /// Switching on also lifts a previous [`disable`](FrameCounter::disable).
    /// Switching off closes the current channel.
    pub fn set_frame_count(&mut self, enable: bool) {
        if enable {
            if !self.frame_count_setting {
                self.persist(true);
                self.frame_count_setting = true;
            }
            self.app_disabled = false;
        } else {
            if self.frame_count_setting {
                self.close_channel();
            }
            self.persist(false);
            self.frame_count_setting = false;
            self.app_disabled = false;
        }
    }

    fn persist(&mut self, enable: bool) {
        if let Err(e) = self.settings.set_frame_count(enable) {
            warn!("Could not persist frame counting setting: {e}");
        }
    }

    /// Open frame counting for the channel `name`.
    ///
    /// Creates the channel's semaphore, or opens it if the other side already
    /// did. Does nothing when frame counting is switched off, disabled by the
    /// application, or already open for `name`. Returns whether the channel
    /// is open afterwards.
    pub fn enable(&mut self, name: &str) -> bool {
        match self.open_channel(name) {
            Ok(()) => true,
            Err(SyncError::NotEnabled) => {
                debug!("Frame counting not enabled");
                false
            }
            Err(e @ SyncError::InvalidName) => {
                warn!("Frame counting: {e}");
                false
            }
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    fn open_channel(&mut self, name: &str) -> Result<()> {
        if !self.is_enabled() {
            return Err(SyncError::NotEnabled);
        }
        if name.is_empty() {
            return Err(SyncError::InvalidName);
        }
        if self.semaphore.is_some() && self.channel.as_deref() == Some(name) {
            trace!("Frame counting already enabled [{name}]");
            return Ok(());
        }

        info!("Enabling frame counting [{name}]");
        self.semaphore = None;
        self.reset_counters();
        self.channel = Some(name.to_string());

        let semaphore_name = self.config.counter_name(name);
        self.semaphore = Some(NamedSemaphore::create_or_open(
            &semaphore_name,
            1,
            self.config.counter_capacity,
            &self.config,
        )?);
        Ok(())
    }

    /// Close the channel and refuse to reopen it until frame counting is
    /// switched on again with [`set_frame_count`](FrameCounter::set_frame_count).
    pub fn disable(&mut self) {
        self.close_channel();
        self.app_disabled = true;
    }

    /// Whether the global switch is on and the application has not disabled
    /// counting.
    pub fn is_enabled(&self) -> bool {
        self.frame_count_setting && !self.app_disabled
    }

    /// Name of the open channel.
    pub fn channel_name(&self) -> Option<&str> {
        self.semaphore.as_ref()?;
        self.channel.as_deref()
    }

    /// Sender side: count one new frame.
    ///
    /// Never waits. A frame that cannot be counted is logged and skipped.
    pub fn publish(&mut self) {
        if !self.is_enabled() {
            return;
        }
        let Some(semaphore) = self.semaphore.as_mut() else {
            return;
        };

        match semaphore.try_claim() {
            WaitStatus::Signaled => match semaphore.release(2) {
                Ok(_) => {
                    self.frame_count += 1;
                    self.fps.update(1);
                }
                Err(e) => {
                    error!("Frame count not incremented: {e}");
                    // Give back the unit the claim took.
                    if let Err(e) = semaphore.release(1) {
                        error!("{e}");
                    }
                }
            },
            WaitStatus::Timeout => warn!("Frame count semaphore busy, frame not counted"),
            WaitStatus::Abandoned => error!("Frame count semaphore abandoned"),
            WaitStatus::Failed => error!("Frame count semaphore wait failed"),
        }
    }

    /// Receiver side: check whether the sender produced a new frame since
    /// the previous poll.
    ///
    /// Returns `true` when counting is off, the channel is not open, or the
    /// sender never published, so a receiver is never blocked by a sender
    /// that does not count frames.
    pub fn poll(&mut self) -> bool {
        if !self.is_enabled() {
            self.is_new_frame = true;
            return true;
        }
        let Some(semaphore) = self.semaphore.as_mut() else {
            trace!("No frame count semaphore");
            self.is_new_frame = true;
            return true;
        };

        let observed = match semaphore.try_claim() {
            WaitStatus::Signaled => match semaphore.release(1) {
                Ok(previous) => previous,
                Err(e) => {
                    error!("Frame count not restored: {e}");
                    self.is_new_frame = true;
                    return true;
                }
            },
            status => {
                warn!("Frame count peek failed: {status:?}");
                self.is_new_frame = true;
                return true;
            }
        };

        self.frame_count = observed;
        // Zero until the sender publishes its first frame.
        if observed == 0 {
            self.is_new_frame = true;
            return true;
        }

        let previous = self.last_observed;
        self.is_new_frame = observed != previous;
        if self.is_new_frame {
            // A slow receiver may have missed several frames.
            self.fps.update((observed - previous).max(0));
            self.last_observed = observed;
        }
        self.is_new_frame
    }

    /// Sender: frames published. Receiver: last value peeked.
    pub fn frame_number(&self) -> i64 {
        self.frame_count
    }

    /// Estimated sender frame rate.
    pub fn fps(&self) -> f64 {
        self.fps.fps()
    }

    /// Result of the last [`poll`](FrameCounter::poll).
    pub fn is_frame_new(&self) -> bool {
        self.is_new_frame
    }

    fn close_channel(&mut self) {
        if self.semaphore.is_none() && self.channel.is_none() {
            return;
        }
        debug!("Closing frame counting [{}]", self.channel.as_deref().unwrap_or(""));
        // Other processes keep the semaphore alive while they hold it.
        self.semaphore = None;
        self.channel = None;
        self.reset_counters();
    }

    fn reset_counters(&mut self) {
        self.frame_count = 0;
        self.last_observed = 0;
        self.is_new_frame = false;
        self.fps.reset(platform::refresh_rate(&self.config));
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn unique(tag: &str) -> String {
        format!(
            "counter-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn config(dir: &Path) -> SyncConfig {
        SyncConfig::default()
            .with_namespace(dir)
            .with_refresh_rate(60.0)
    }

    fn counter(dir: &Path) -> FrameCounter {
        FrameCounter::with_settings(config(dir), Box::new(MemorySettings::enabled()))
    }

    #[test]
    fn publishes_are_visible_to_a_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("visible");
        let mut sender = counter(dir.path());
        let mut receiver = counter(dir.path());
        assert!(sender.enable(&name));
        assert!(receiver.enable(&name));

        for _ in 0..5 {
            sender.publish();
        }
        assert_eq!(sender.frame_number(), 5);
        assert!(receiver.poll());
        assert_eq!(receiver.frame_number(), 5);
        assert!(receiver.is_frame_new());
    }

    #[test]
    fn one_poll_per_publish() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("lockstep");
        let mut sender = counter(dir.path());
        let mut receiver = counter(dir.path());
        sender.enable(&name);
        receiver.enable(&name);

        for frame in 1..=10 {
            sender.publish();
            assert!(receiver.poll(), "frame {frame} not seen");
            assert_eq!(receiver.frame_number(), frame);
            assert!(!receiver.poll(), "frame {frame} seen twice");
            assert!(!receiver.is_frame_new());
        }
    }

    #[test]
    fn never_published_reads_as_new() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("silent");
        let mut sender = counter(dir.path());
        let mut receiver = counter(dir.path());
        sender.enable(&name);
        receiver.enable(&name);

        assert!(receiver.poll());
        assert!(receiver.poll());
        assert_eq!(receiver.frame_number(), 0);
    }

    #[test]
    fn repeated_poll_without_publish() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("repeat");
        let mut sender = counter(dir.path());
        let mut receiver = counter(dir.path());
        sender.enable(&name);
        receiver.enable(&name);
        sender.publish();
        sender.publish();

        assert!(receiver.poll());
        assert!(!receiver.poll());
        assert_eq!(receiver.frame_number(), 2);
    }

    #[test]
    fn receiver_that_opens_first_still_sees_frames() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("early");
        let mut receiver = counter(dir.path());
        assert!(receiver.enable(&name));
        let mut sender = counter(dir.path());
        assert!(sender.enable(&name));

        sender.publish();
        assert!(receiver.poll());
        assert_eq!(receiver.frame_number(), 1);
    }

    #[test]
    fn disable_resets_and_blocks_enable() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("disable");
        let mut sender = FrameCounter::with_settings(
            config(dir.path()).with_fps_window(1),
            Box::new(MemorySettings::enabled()),
        );
        sender.enable(&name);
        for _ in 0..3 {
            // At most 50 fps, well below the 60 Hz default.
            std::thread::sleep(std::time::Duration::from_millis(20));
            sender.publish();
        }
        assert_eq!(sender.frame_number(), 3);
        assert!(sender.fps() < 60.0, "fps {}", sender.fps());

        sender.disable();
        assert_eq!(sender.channel_name(), None);
        assert!(!sender.is_enabled());
        assert!(!sender.enable(&name));
        sender.publish();
        assert_eq!(sender.frame_number(), 0);
        assert_eq!(sender.fps(), 60.0);

        sender.set_frame_count(true);
        assert!(sender.enable(&name));
        assert_eq!(sender.frame_number(), 0);
        assert_eq!(sender.fps(), 60.0);
    }

    #[test]
    fn switched_off_counter_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut off =
            FrameCounter::with_settings(config(dir.path()), Box::new(MemorySettings::new()));
        assert!(!off.is_enabled());
        assert!(!off.enable("anything"));
        off.publish();
        assert_eq!(off.frame_number(), 0);
        assert!(off.poll());
    }

    #[test]
    fn empty_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = counter(dir.path());
        assert!(!sender.enable(""));
        assert_eq!(sender.channel_name(), None);
        assert!(sender.poll());
    }

    #[test]
    fn enable_is_idempotent_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique("first");
        let second = unique("second");
        let mut sender = counter(dir.path());
        sender.enable(&first);
        sender.publish();
        sender.publish();
        sender.publish();

        assert!(sender.enable(&first));
        assert_eq!(sender.frame_number(), 3);

        assert!(sender.enable(&second));
        assert_eq!(sender.channel_name(), Some(second.as_str()));
        assert_eq!(sender.frame_number(), 0);
    }

    #[test]
    fn switching_off_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique("switch");
        let mut sender = counter(dir.path());
        sender.enable(&name);
        assert_eq!(sender.channel_name(), Some(name.as_str()));

        sender.set_frame_count(false);
        assert_eq!(sender.channel_name(), None);
        assert!(!sender.is_enabled());
        assert!(!sender.enable(&name));

        sender.set_frame_count(true);
        assert!(sender.is_enabled());
        assert!(sender.enable(&name));
    }
}
