//! File-backed named objects for Unix.
//!
//! Each object lives in the namespace directory as a payload file plus a
//! `.ref` companion:
//!
//! - `<name>.ref` carries the reference count. Every open handle holds a
//!   shared `flock` on it; on close, a handle that can take it exclusively is
//!   the last one and removes both files. A process that dies drops its
//!   shared lock with its descriptors, so a crashed peer never keeps an
//!   object alive.
//! - `<name>.sem` is a 16-byte memory-mapped `[count, max]` pair, read and
//!   written only under an exclusive `flock` on the same file.
//! - `<name>.lock` is the mutex. Its `flock` is the lock itself; the file
//!   body records the holder's pid, cleared on release, so a holder that
//!   died mid-section is detected by the next owner.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use gpu_interop::WaitStatus;
use memmap2::MmapMut;
use tracing::{debug, error, trace, warn};

use crate::config::{SyncConfig, DEFAULT_REFRESH_RATE};
use crate::error::{Result, SyncError};

/// Sleep between non-blocking `flock` attempts.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

const COUNT_OFFSET: usize = 0;
const MAX_OFFSET: usize = 8;
const SEMAPHORE_LEN: u64 = 16;

fn namespace_dir(config: &SyncConfig) -> PathBuf {
    if let Some(dir) = &config.namespace {
        return dir.clone();
    }
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join("frame-sync")
    } else {
        std::env::temp_dir().join("frame-sync")
    }
}

/// Map an object name onto a portable file stem.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} stayed locked"))
}

fn open_shared(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Take `op` (`LOCK_SH` or `LOCK_EX`) within `timeout`.
///
/// Returns `Ok(false)` when the bound elapses first.
fn flock_bounded(file: &File, op: libc::c_int, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        match flock(file, op | libc::LOCK_NB) {
            Ok(()) => return Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {}
            Err(e) => return Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// One handle's share of a named object's reference count.
struct ObjectRef {
    file: File,
    path: PathBuf,
    payload: PathBuf,
}

impl ObjectRef {
    fn join(dir: &Path, stem: &str, kind: &str, timeout: Duration) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}.ref"));
        let payload = dir.join(format!("{stem}.{kind}"));
        let deadline = Instant::now() + timeout;

        loop {
            let file = open_shared(&path)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !flock_bounded(&file, libc::LOCK_SH, remaining)? {
                return Err(timed_out("reference count"));
            }
            // The last closer may have unlinked the file between our open and
            // our lock; retry against the fresh one.
            if same_file(&file, &path)? {
                return Ok(Self {
                    file,
                    path,
                    payload,
                });
            }
        }
    }

    fn payload(&self) -> &Path {
        &self.payload
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        // Only succeeds when no other handle holds a shared lock.
        if flock(&self.file, libc::LOCK_EX | libc::LOCK_NB).is_ok() {
            let _ = fs::remove_file(&self.payload);
            let _ = fs::remove_file(&self.path);
            trace!("Removed named object {}", self.payload.display());
        }
    }
}

// ---------------------------------------------------------------------------
// NamedSemaphore
// ---------------------------------------------------------------------------

/// Counting semaphore shared by name between processes.
pub struct NamedSemaphore {
    name: String,
    map: MmapMut,
    file: File,
    bound: Duration,
    // Dropped last so the payload is unmapped before a last-closer removal.
    _member: ObjectRef,
}

impl NamedSemaphore {
    /// Create the semaphore `name` with `initial` count and `max` capacity, or
    /// open it unchanged if another handle already created it.
    pub fn create_or_open(name: &str, initial: i64, max: i64, config: &SyncConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::InvalidName);
        }
        Self::open_inner(name, initial, max, config).map_err(|source| {
            SyncError::PrimitiveCreateFailed {
                name: name.to_string(),
                source,
            }
        })
    }

    fn open_inner(name: &str, initial: i64, max: i64, config: &SyncConfig) -> io::Result<Self> {
        let bound = config.wait_timeout;
        let member = ObjectRef::join(&namespace_dir(config), &file_stem(name), "sem", bound)?;
        let file = open_shared(member.payload())?;

        if !flock_bounded(&file, libc::LOCK_EX, bound)? {
            return Err(timed_out("semaphore"));
        }
        let created = file.metadata()?.len() < SEMAPHORE_LEN;
        if created {
            file.set_len(SEMAPHORE_LEN)?;
        }
        let mapped = unsafe { MmapMut::map_mut(&file) };
        let mut map = match mapped {
            Ok(map) => map,
            Err(e) => {
                let _ = flock(&file, libc::LOCK_UN);
                return Err(e);
            }
        };
        if created {
            write_slot(&mut map, COUNT_OFFSET, initial);
            write_slot(&mut map, MAX_OFFSET, max);
            debug!("Semaphore [{name}] created");
        } else {
            debug!("Semaphore [{name}] already exists");
        }
        flock(&file, libc::LOCK_UN)?;

        Ok(Self {
            name: name.to_string(),
            map,
            file,
            bound,
            _member: member,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decrement the count if it is positive, without waiting for it to
    /// become so.
    pub fn try_claim(&mut self) -> WaitStatus {
        let claimed = self.with_locked(|map| {
            let count = read_slot(map, COUNT_OFFSET);
            if count > 0 {
                write_slot(map, COUNT_OFFSET, count - 1);
                true
            } else {
                false
            }
        });
        match claimed {
            Ok(true) => WaitStatus::Signaled,
            Ok(false) => WaitStatus::Timeout,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => WaitStatus::Timeout,
            Err(e) => {
                error!("Semaphore [{}] claim failed: {e}", self.name);
                WaitStatus::Failed
            }
        }
    }

    /// Add `count` and return the count before the addition.
    ///
    /// Fails without changing anything if the result would exceed the
    /// semaphore's capacity.
    pub fn release(&mut self, count: i64) -> Result<i64> {
        let released = self.with_locked(|map| {
            let previous = read_slot(map, COUNT_OFFSET);
            let max = read_slot(map, MAX_OFFSET);
            match previous.checked_add(count) {
                Some(next) if count > 0 && next <= max => {
                    write_slot(map, COUNT_OFFSET, next);
                    Ok(previous)
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("release of {count} exceeds capacity {max} at count {previous}"),
                )),
            }
        });
        released
            .and_then(|inner| inner)
            .map_err(|source| SyncError::ReleaseFailed {
                name: self.name.clone(),
                source,
            })
    }

    fn with_locked<T>(&mut self, f: impl FnOnce(&mut MmapMut) -> T) -> io::Result<T> {
        if !flock_bounded(&self.file, libc::LOCK_EX, self.bound)? {
            return Err(timed_out("semaphore"));
        }
        let out = f(&mut self.map);
        flock(&self.file, libc::LOCK_UN)?;
        Ok(out)
    }
}

fn read_slot(map: &MmapMut, offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&map[offset..offset + 8]);
    i64::from_ne_bytes(bytes)
}

fn write_slot(map: &mut MmapMut, offset: usize, value: i64) {
    map[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

// ---------------------------------------------------------------------------
// NamedMutex
// ---------------------------------------------------------------------------

/// Exclusive lock shared by name between processes.
pub struct NamedMutex {
    name: String,
    file: File,
    held: bool,
    _member: ObjectRef,
}

impl NamedMutex {
    /// Create the mutex `name` unowned, or open it if it already exists.
    pub fn create_or_open(name: &str, config: &SyncConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::InvalidName);
        }
        let open = || -> io::Result<Self> {
            let member = ObjectRef::join(
                &namespace_dir(config),
                &file_stem(name),
                "lock",
                config.wait_timeout,
            )?;
            let file = open_shared(member.payload())?;
            Ok(Self {
                name: name.to_string(),
                file,
                held: false,
                _member: member,
            })
        };
        open().map_err(|source| SyncError::PrimitiveCreateFailed {
            name: name.to_string(),
            source,
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
        match flock_bounded(&self.file, libc::LOCK_EX, timeout) {
            Ok(true) => {}
            Ok(false) => return WaitStatus::Timeout,
            Err(e) => {
                error!("Mutex [{}] wait failed: {e}", self.name);
                return WaitStatus::Failed;
            }
        }
        self.held = true;

        let mut previous = [0u8; 4];
        let previous = match self.file.read_exact_at(&mut previous, 0) {
            Ok(()) => u32::from_ne_bytes(previous),
            Err(_) => 0,
        };
        if let Err(e) = self
            .file
            .write_all_at(&std::process::id().to_ne_bytes(), 0)
        {
            warn!("Mutex [{}] could not record owner: {e}", self.name);
        }

        if previous != 0 {
            debug!("Mutex [{}] previous owner {previous} exited while holding it", self.name);
            WaitStatus::Abandoned
        } else {
            WaitStatus::Signaled
        }
    }

    /// Give up ownership. Fails if this handle does not own the mutex.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Err(SyncError::ReleaseFailed {
                name: self.name.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "mutex not owned"),
            });
        }
        let _ = self.file.write_all_at(&0u32.to_ne_bytes(), 0);
        self.held = false;
        flock(&self.file, libc::LOCK_UN).map_err(|source| SyncError::ReleaseFailed {
            name: self.name.clone(),
            source,
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
    }
}

/// Nominal display refresh rate used as the fps default.
///
/// There is no portable query on Unix; the configured value or 60 Hz is used.
pub fn refresh_rate(config: &SyncConfig) -> f64 {
    config.refresh_rate.unwrap_or(DEFAULT_REFRESH_RATE)
}
