//! Win32 named semaphore and mutex.

use std::io;
use std::time::Duration;

use gpu_interop::WaitStatus;
use tracing::{debug, error, warn};
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, WAIT_ABANDONED, WAIT_FAILED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Graphics::Gdi::{EnumDisplaySettingsW, DEVMODEW, ENUM_CURRENT_SETTINGS};
use windows::Win32::System::Threading::{
    CreateMutexW, CreateSemaphoreW, ReleaseMutex, ReleaseSemaphore, WaitForSingleObject,
};

use crate::config::{SyncConfig, DEFAULT_REFRESH_RATE};
use crate::error::{Result, SyncError};

fn wait_millis(timeout: Duration) -> u32 {
    // INFINITE is u32::MAX; stay one below so no wait is unbounded.
    timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32
}

fn wait(handle: HANDLE, millis: u32, name: &str) -> WaitStatus {
    let result = unsafe { WaitForSingleObject(handle, millis) };
    match result {
        r if r == WAIT_OBJECT_0 => WaitStatus::Signaled,
        r if r == WAIT_ABANDONED => WaitStatus::Abandoned,
        r if r == WAIT_TIMEOUT => WaitStatus::Timeout,
        r if r == WAIT_FAILED => {
            error!("[{name}] WAIT_FAILED: {:?}", unsafe { GetLastError() });
            WaitStatus::Failed
        }
        r => {
            error!("[{name}] unknown wait result 0x{:X}", r.0);
            WaitStatus::Failed
        }
    }
}

fn close(handle: HANDLE, name: &str) {
    if let Err(e) = unsafe { CloseHandle(handle) } {
        warn!("CloseHandle [{name}] failed: {e}");
    }
}

/// Counting semaphore shared by name between processes.
pub struct NamedSemaphore {
    name: String,
    handle: HANDLE,
}

// SAFETY: a kernel object handle is valid from any thread of the process.
unsafe impl Send for NamedSemaphore {}

impl NamedSemaphore {
    /// Create the semaphore `name` with `initial` count and `max` capacity, or
    /// open it unchanged if another process already created it.
    pub fn create_or_open(
        name: &str,
        initial: i64,
        max: i64,
        _config: &SyncConfig,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::InvalidName);
        }
        let initial = initial.clamp(0, i64::from(i32::MAX)) as i32;
        let max = max.clamp(1, i64::from(i32::MAX)) as i32;
        let wide = HSTRING::from(name);

        let handle = unsafe { CreateSemaphoreW(None, initial, max, &wide) }.map_err(|e| {
            SyncError::PrimitiveCreateFailed {
                name: name.to_string(),
                source: io::Error::other(e),
            }
        })?;
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            debug!("Semaphore [{name}] already exists");
        } else {
            debug!("Semaphore [{name}] created");
        }

        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decrement the count if it is positive, without waiting for it to
    /// become so.
    pub fn try_claim(&mut self) -> WaitStatus {
        wait(self.handle, 0, &self.name)
    }

    /// Add `count` and return the count before the addition.
    pub fn release(&mut self, count: i64) -> Result<i64> {
        let count = count.clamp(0, i64::from(i32::MAX)) as i32;
        let mut previous: i32 = 0;
        unsafe { ReleaseSemaphore(self.handle, count, Some(&mut previous as *mut i32)) }.map_err(|e| {
            SyncError::ReleaseFailed {
                name: self.name.clone(),
                source: io::Error::other(e),
            }
        })?;
        Ok(i64::from(previous))
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        close(self.handle, &self.name);
    }
}

/// Exclusive lock shared by name between processes.
pub struct NamedMutex {
    name: String,
    handle: HANDLE,
    held: bool,
}

// SAFETY: see `NamedSemaphore`. Ownership itself is per thread, which the
// single-caller discipline of the arbiter respects.
unsafe impl Send for NamedMutex {}

impl NamedMutex {
    /// Create the mutex `name` unowned, or open it if it already exists.
    pub fn create_or_open(name: &str, _config: &SyncConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::InvalidName);
        }
        let wide = HSTRING::from(name);
        let handle = unsafe { CreateMutexW(None, false, &wide) }.map_err(|e| {
            SyncError::PrimitiveCreateFailed {
                name: name.to_string(),
                source: io::Error::other(e),
            }
        })?;
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            debug!("Mutex [{name}] already exists");
        } else {
            debug!("Mutex [{name}] created");
        }

        Ok(Self {
            name: name.to_string(),
            handle,
            held: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait at most `timeout` for ownership.
    pub fn wait(&mut self, timeout: Duration) -> WaitStatus {
        if self.held {
            return WaitStatus::Signaled;
        }
        let status = wait(self.handle, wait_millis(timeout), &self.name);
        if status.is_owned() {
            self.held = true;
        }
        status
    }

    /// Give up ownership. Fails if this handle does not own the mutex.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(SyncError::ReleaseFailed {
                name: self.name.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "mutex not owned"),
            });
        }
        self.held = false;
        unsafe { ReleaseMutex(self.handle) }.map_err(|e| SyncError::ReleaseFailed {
            name: self.name.clone(),
            source: io::Error::other(e),
        })
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.release() {
                warn!("{e}");
            }
        }
        close(self.handle, &self.name);
    }
}

/// Refresh rate of the primary display, used as the fps default.
pub fn refresh_rate(config: &SyncConfig) -> f64 {
    if let Some(hz) = config.refresh_rate {
        return hz;
    }
    let mut mode = DEVMODEW {
        dmSize: std::mem::size_of::<DEVMODEW>() as u16,
        ..Default::default()
    };
    let found = unsafe { EnumDisplaySettingsW(PCWSTR::null(), ENUM_CURRENT_SETTINGS, &mut mode) };
    // 0 and 1 mean "hardware default".
    if found.as_bool() && mode.dmDisplayFrequency > 1 {
        f64::from(mode.dmDisplayFrequency)
    } else {
        DEFAULT_REFRESH_RATE
    }
}
