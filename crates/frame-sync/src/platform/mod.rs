//! Named kernel objects shared between processes.
//!
//! Two primitives back the whole crate:
//!
//! - [`NamedSemaphore`], a counting semaphore with a capacity bound whose
//!   release reports the previous count. The frame counter is built on it.
//! - [`NamedMutex`], an exclusive lock whose waits are bounded and which
//!   reports [`WaitStatus::Abandoned`] when a holder died without releasing.
//!
//! On Windows these are the kernel semaphore and mutex objects. On Unix they
//! are emulated with files in a namespace directory: a memory-mapped integer
//! guarded by `flock` for the semaphore, and an `flock`ed lock file for the
//! mutex. Both platforms close the local handle on drop; the object itself
//! lives until the last process closes it.
//!
//! [`WaitStatus::Abandoned`]: gpu_interop::WaitStatus::Abandoned

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{refresh_rate, NamedMutex, NamedSemaphore};

#[cfg(target_os = "windows")]
mod win32;
#[cfg(target_os = "windows")]
pub use win32::{refresh_rate, NamedMutex, NamedSemaphore};
