//! Shared GPU resource access across process boundaries.
//!
//! This crate defines the [`SharedResource`] trait, the capability a shared
//! GPU resource exposes to cross-process synchronisation: whether it carries
//! its own keyed mutex, and how to acquire and release that mutex with a
//! bounded wait. [`WaitStatus`] is the outcome type shared by every bounded
//! wait, GPU-intrinsic or OS named object alike.
//!
//! On Windows, D3D11 textures created with
//! `D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX` implement [`SharedResource`]
//! through `IDXGIKeyedMutex`. Other platforms have no keyed resources; callers
//! there fall back to a generic named lock.

pub mod resource;
pub use resource::{SharedResource, WaitStatus, DEFAULT_SYNC_KEY};

// Platform-specific implementations.

#[cfg(target_os = "windows")]
pub mod dx11;
