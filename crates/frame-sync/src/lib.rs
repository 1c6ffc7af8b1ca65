//! Frame synchronization between processes sharing a GPU texture.
//!
//! A sender writes frames into a shared texture; any number of receivers in
//! other processes read them. This crate provides the pieces they need to
//! agree on frames without a shared memory block:
//!
//! - [`FrameCounter`] publishes a frame number through a named semaphore and
//!   lets receivers check, without waiting, whether a new frame arrived. It
//!   also estimates the sender's frame rate.
//! - [`AccessArbiter`] serializes access to the texture, through the
//!   texture's keyed mutex when it has one, otherwise through a named mutex
//!   for the channel. Every wait is bounded.
//! - [`PacingClock`] holds a sender to a target frame rate.
//!
//! Frame counting is switched on per user through a persisted setting (see
//! [`SettingsStore`]). While it is off, or whenever a named object cannot be
//! used, every check reports a new frame so receivers keep rendering.
//!
//! # Example
//!
//! ```no_run
//! use frame_sync::{AccessArbiter, FrameCounter, SharedResource};
//!
//! fn send(texture: &dyn SharedResource) {
//!     let mut arbiter = AccessArbiter::new();
//!     let mut counter = FrameCounter::new();
//!     arbiter.create_or_open("camera");
//!     counter.enable("camera");
//!
//!     let access = arbiter.access(Some(texture));
//!     if let Ok(_guard) = access {
//!         // write the frame
//!         counter.publish();
//!     }
//! }
//! ```

pub mod arbiter;
pub mod config;
pub mod counter;
pub mod error;
pub mod fps;
pub mod logging;
pub mod pacing;
pub mod platform;
pub mod settings;

pub use arbiter::{AccessArbiter, AccessGuard, AcquireResult};
pub use config::SyncConfig;
pub use counter::FrameCounter;
pub use error::{Result, SyncError};
pub use fps::FpsEstimator;
pub use pacing::PacingClock;
pub use settings::{MemorySettings, SettingsStore};

pub use gpu_interop::{SharedResource, WaitStatus};
