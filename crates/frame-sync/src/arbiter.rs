//! Exclusive access to a shared texture.
//!
//! A texture created with a keyed mutex carries its own lock, which every
//! process opening the texture shares. Any other texture is guarded by a
//! named mutex derived from the channel name. The arbiter picks the keyed
//! mutex whenever the texture has one, so the two locks are never held
//! together.

use tracing::{debug, error, info, trace, warn};

use gpu_interop::{SharedResource, WaitStatus, DEFAULT_SYNC_KEY};

use crate::config::SyncConfig;
use crate::platform::NamedMutex;

/// Outcome of [`AccessArbiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    /// Not acquired within the wait bound.
    Timeout,
    /// The previous holder exited without releasing. Access is granted, the
    /// texture contents may be incomplete.
    Abandoned,
    Error,
}

impl AcquireResult {
    /// Whether the caller may use the texture, and must release it.
    pub fn is_acquired(self) -> bool {
        matches!(self, AcquireResult::Acquired | AcquireResult::Abandoned)
    }
}

impl From<WaitStatus> for AcquireResult {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Signaled => AcquireResult::Acquired,
            WaitStatus::Abandoned => AcquireResult::Abandoned,
            WaitStatus::Timeout => AcquireResult::Timeout,
            WaitStatus::Failed => AcquireResult::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Keyed,
    Named,
}

/// The lock this arbiter holds and the resource instance it was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Holding {
    kind: Held,
    resource: usize,
}

/// Address of the resource instance, ignoring the vtable.
fn identity(resource: &dyn SharedResource) -> usize {
    (resource as *const _) as *const () as usize
}

/// Per-channel texture access lock.
pub struct AccessArbiter {
    config: SyncConfig,
    lock: Option<NamedMutex>,
    channel: Option<String>,
    held: Option<Holding>,
}

impl AccessArbiter {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::from_env())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            config,
            lock: None,
            channel: None,
            held: None,
        }
    }

    /// Create the named lock for `channel`, or open it if another process
    /// created it first.
    ///
    /// Opening the lock that is already open is a no-op. Returns whether the
    /// lock is open afterwards.
    pub fn create_or_open(&mut self, channel: &str) -> bool {
        if channel.is_empty() {
            warn!("Access lock needs a sender name");
            return false;
        }
        if self.lock.is_some() && self.channel.as_deref() == Some(channel) {
            return true;
        }
        self.close();

        let name = self.config.lock_name(channel);
        match NamedMutex::create_or_open(&name, &self.config) {
            Ok(lock) => {
                info!("Opened access lock [{name}]");
                self.lock = Some(lock);
                self.channel = Some(channel.to_string());
                true
            }
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    /// Close the named lock, releasing it first if held.
    pub fn close(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            if self.held.is_some_and(|held| held.kind == Held::Named) {
                if let Err(e) = lock.release() {
                    warn!("{e}");
                }
                self.held = None;
            }
            debug!("Closed access lock [{}]", lock.name());
        }
        self.channel = None;
    }

    /// Name of the open named lock.
    pub fn lock_name(&self) -> Option<&str> {
        self.lock.as_ref().map(NamedMutex::name)
    }

    /// Whether this arbiter currently holds one of the locks.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Wait, up to the configured bound, for exclusive access to `resource`.
    ///
    /// No resource, or a plain texture with no named lock open, is granted
    /// straight away: there is nothing to synchronize with. A texture with a
    /// keyed mutex is locked with it and never touches the named lock.
    ///
    /// Every result for which [`AcquireResult::is_acquired`] holds must be
    /// paired with a [`release`](AccessArbiter::release) of the same resource.
    /// Asking again for the resource already held returns `Acquired` without
    /// waiting; asking for another one while holding is an `Error`.
    pub fn acquire(&mut self, resource: Option<&dyn SharedResource>) -> AcquireResult {
        let Some(resource) = resource else {
            return AcquireResult::Acquired;
        };
        if let Some(held) = self.held {
            if held.resource == identity(resource) {
                debug!("Access already held ({:?})", held.kind);
                return AcquireResult::Acquired;
            }
            warn!("Access {:?} held for another resource", held.kind);
            return AcquireResult::Error;
        }

        let timeout = self.config.wait_timeout;
        let (status, held) = if resource.has_keyed_mutex() {
            (resource.acquire_key(DEFAULT_SYNC_KEY, timeout), Held::Keyed)
        } else {
            let Some(lock) = self.lock.as_mut() else {
                trace!("No access lock open");
                return AcquireResult::Acquired;
            };
            (lock.wait(timeout), Held::Named)
        };

        if status.is_owned() {
            self.held = Some(Holding {
                kind: held,
                resource: identity(resource),
            });
        }
        let result = AcquireResult::from(status);
        match result {
            AcquireResult::Acquired => {}
            AcquireResult::Timeout => debug!("Access {held:?} timed out after {timeout:?}"),
            AcquireResult::Abandoned => error!("Access {held:?} abandoned by previous holder"),
            AcquireResult::Error => error!("Access {held:?} wait failed"),
        }
        result
    }

    /// Release the lock taken for `resource`. Does nothing unless this
    /// arbiter holds a lock for that very instance.
    pub fn release(&mut self, resource: Option<&dyn SharedResource>) {
        let Some(resource) = resource else {
            return;
        };
        let held = match self.held {
            Some(held) if held.resource == identity(resource) => held,
            _ => {
                trace!("Access not held for this resource");
                return;
            }
        };
        self.held = None;

        match held.kind {
            Held::Keyed => {
                if !resource.release_key(DEFAULT_SYNC_KEY) {
                    warn!("Keyed mutex release failed");
                }
            }
            Held::Named => {
                if let Some(lock) = self.lock.as_mut() {
                    if let Err(e) = lock.release() {
                        warn!("{e}");
                    }
                }
            }
        }
    }

    /// [`acquire`](AccessArbiter::acquire) returning a guard that releases
    /// on drop. Fails with the result when access was not granted.
    pub fn access<'a>(
        &'a mut self,
        resource: Option<&'a dyn SharedResource>,
    ) -> Result<AccessGuard<'a>, AcquireResult> {
        let result = self.acquire(resource);
        if !result.is_acquired() {
            return Err(result);
        }
        Ok(AccessGuard {
            arbiter: self,
            resource,
            result,
        })
    }
}

impl Default for AccessArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AccessArbiter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scoped texture access from [`AccessArbiter::access`].
pub struct AccessGuard<'a> {
    arbiter: &'a mut AccessArbiter,
    resource: Option<&'a dyn SharedResource>,
    result: AcquireResult,
}

impl AccessGuard<'_> {
    /// [`AcquireResult::Abandoned`] if the texture may hold a torn frame.
    pub fn result(&self) -> AcquireResult {
        self.result
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.arbiter.release(self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn unique(tag: &str) -> String {
        format!(
            "arbiter-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn config(dir: &Path) -> SyncConfig {
        SyncConfig::default().with_namespace(dir)
    }

    struct MockTexture {
        keyed: bool,
        status: WaitStatus,
        acquires: Cell<u32>,
        releases: Cell<u32>,
    }

    impl MockTexture {
        fn plain() -> Self {
            Self::keyed_with(WaitStatus::Signaled, false)
        }

        fn keyed(status: WaitStatus) -> Self {
            Self::keyed_with(status, true)
        }

        fn keyed_with(status: WaitStatus, keyed: bool) -> Self {
            Self {
                keyed,
                status,
                acquires: Cell::new(0),
                releases: Cell::new(0),
            }
        }
    }

    impl SharedResource for MockTexture {
        fn has_keyed_mutex(&self) -> bool {
            self.keyed
        }

        fn acquire_key(&self, key: u64, _timeout: Duration) -> WaitStatus {
            assert_eq!(key, DEFAULT_SYNC_KEY);
            self.acquires.set(self.acquires.get() + 1);
            self.status
        }

        fn release_key(&self, key: u64) -> bool {
            assert_eq!(key, DEFAULT_SYNC_KEY);
            self.releases.set(self.releases.get() + 1);
            true
        }
    }

    /// Hold the named lock for `channel` on another thread until the
    /// returned sender is dropped.
    fn hold_elsewhere(dir: &Path, channel: &str) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let config = config(dir);
        let channel = channel.to_string();
        let handle = thread::spawn(move || {
            let mut holder = AccessArbiter::with_config(config);
            assert!(holder.create_or_open(&channel));
            let texture = MockTexture::plain();
            assert_eq!(holder.acquire(Some(&texture)), AcquireResult::Acquired);
            locked_tx.send(()).unwrap();
            let _ = done_rx.recv();
            holder.release(Some(&texture));
        });
        locked_rx.recv().unwrap();
        (done_tx, handle)
    }

    #[test]
    fn absent_resource_is_granted() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        assert_eq!(arbiter.acquire(None), AcquireResult::Acquired);
        assert!(!arbiter.is_held());
        arbiter.release(None);
    }

    #[test]
    fn plain_texture_without_lock_is_granted() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        let texture = MockTexture::plain();
        assert_eq!(arbiter.acquire(Some(&texture)), AcquireResult::Acquired);
        assert!(!arbiter.is_held());
        assert_eq!(texture.acquires.get(), 0);
    }

    #[test]
    fn create_or_open_needs_a_name() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        assert!(!arbiter.create_or_open(""));
        assert_eq!(arbiter.lock_name(), None);
    }

    #[test]
    fn lock_name_follows_channel() {
        let dir = tempfile::tempdir().unwrap();
        let channel = unique("name");
        let mut arbiter = AccessArbiter::with_config(config(dir.path()));
        assert!(arbiter.create_or_open(&channel));
        assert!(arbiter.create_or_open(&channel));
        assert_eq!(
            arbiter.lock_name(),
            Some(format!("{channel}_SpoutAccessMutex").as_str())
        );
        arbiter.close();
        assert_eq!(arbiter.lock_name(), None);
    }

    #[test]
    fn named_lock_times_out_while_held_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let channel = unique("timeout");
        let (done, holder) = hold_elsewhere(dir.path(), &channel);

        let mut arbiter = AccessArbiter::with_config(config(dir.path()));
        assert!(arbiter.create_or_open(&channel));
        let texture = MockTexture::plain();
        let start = Instant::now();
        assert_eq!(arbiter.acquire(Some(&texture)), AcquireResult::Timeout);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(60), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
        assert!(!arbiter.is_held());

        drop(done);
        holder.join().unwrap();
        assert_eq!(arbiter.acquire(Some(&texture)), AcquireResult::Acquired);
        arbiter.release(Some(&texture));
    }

    #[test]
    fn keyed_texture_bypasses_named_lock() {
        let dir = tempfile::tempdir().unwrap();
        let channel = unique("keyed");
        let (done, holder) = hold_elsewhere(dir.path(), &channel);

        let mut arbiter = AccessArbiter::with_config(config(dir.path()));
        assert!(arbiter.create_or_open(&channel));
        let keyed = MockTexture::keyed(WaitStatus::Signaled);
        let start = Instant::now();
        assert_eq!(arbiter.acquire(Some(&keyed)), AcquireResult::Acquired);
        assert!(start.elapsed() < Duration::from_millis(30));
        assert!(arbiter.is_held());
        arbiter.release(Some(&keyed));
        assert_eq!((keyed.acquires.get(), keyed.releases.get()), (1, 1));

        let plain = MockTexture::plain();
        assert_eq!(arbiter.acquire(Some(&plain)), AcquireResult::Timeout);
        assert_eq!(plain.acquires.get(), 0);

        drop(done);
        holder.join().unwrap();
    }

    #[test]
    fn release_without_acquire_is_a_no_op() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        let keyed = MockTexture::keyed(WaitStatus::Signaled);
        arbiter.release(Some(&keyed));
        assert_eq!(keyed.releases.get(), 0);
    }

    #[test]
    fn failed_keyed_wait_is_not_released() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        for (status, expected) in [
            (WaitStatus::Timeout, AcquireResult::Timeout),
            (WaitStatus::Failed, AcquireResult::Error),
        ] {
            let keyed = MockTexture::keyed(status);
            assert_eq!(arbiter.acquire(Some(&keyed)), expected);
            assert!(!expected.is_acquired());
            arbiter.release(Some(&keyed));
            assert_eq!(keyed.releases.get(), 0);
        }
    }

    #[test]
    fn abandoned_keyed_wait_is_owned() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        let keyed = MockTexture::keyed(WaitStatus::Abandoned);
        let result = arbiter.acquire(Some(&keyed));
        assert_eq!(result, AcquireResult::Abandoned);
        assert!(result.is_acquired());
        arbiter.release(Some(&keyed));
        assert_eq!(keyed.releases.get(), 1);
    }

    #[test]
    fn nested_acquire_does_not_wait_again() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        let keyed = MockTexture::keyed(WaitStatus::Signaled);
        assert_eq!(arbiter.acquire(Some(&keyed)), AcquireResult::Acquired);
        assert_eq!(arbiter.acquire(Some(&keyed)), AcquireResult::Acquired);
        assert_eq!(keyed.acquires.get(), 1);
        arbiter.release(Some(&keyed));
        arbiter.release(Some(&keyed));
        assert_eq!(keyed.releases.get(), 1);
    }

    #[test]
    fn other_resource_is_refused_while_holding() {
        let mut arbiter = AccessArbiter::with_config(SyncConfig::default());
        let first = MockTexture::keyed(WaitStatus::Signaled);
        let second = MockTexture::keyed(WaitStatus::Signaled);
        assert_eq!(arbiter.acquire(Some(&first)), AcquireResult::Acquired);

        assert_eq!(arbiter.acquire(Some(&second)), AcquireResult::Error);
        arbiter.release(Some(&second));
        assert_eq!((second.acquires.get(), second.releases.get()), (0, 0));
        assert!(arbiter.is_held());

        arbiter.release(Some(&first));
        assert_eq!(first.releases.get(), 1);
        assert!(!arbiter.is_held());

        assert_eq!(arbiter.acquire(Some(&second)), AcquireResult::Acquired);
        arbiter.release(Some(&second));
        assert_eq!((second.acquires.get(), second.releases.get()), (1, 1));
    }

    #[test]
    fn holding_keyed_does_not_grant_named_lock() {
        let dir = tempfile::tempdir().unwrap();
        let channel = unique("mixed");
        let (done, holder) = hold_elsewhere(dir.path(), &channel);

        let mut arbiter = AccessArbiter::with_config(config(dir.path()));
        assert!(arbiter.create_or_open(&channel));
        let keyed = MockTexture::keyed(WaitStatus::Signaled);
        let plain = MockTexture::plain();
        assert_eq!(arbiter.acquire(Some(&keyed)), AcquireResult::Acquired);
        assert!(!arbiter.acquire(Some(&plain)).is_acquired());

        arbiter.release(Some(&plain));
        assert_eq!(keyed.releases.get(), 0);
        arbiter.release(Some(&keyed));
        assert_eq!(keyed.releases.get(), 1);

        // The named lock is still owned elsewhere.
        assert_eq!(arbiter.acquire(Some(&plain)), AcquireResult::Timeout);

        drop(done);
        holder.join().unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let channel = unique("guard");
        let texture = MockTexture::plain();
        let mut first = AccessArbiter::with_config(config(dir.path()));
        assert!(first.create_or_open(&channel));

        {
            let guard = first.access(Some(&texture)).unwrap();
            assert_eq!(guard.result(), AcquireResult::Acquired);
        }
        assert!(!first.is_held());

        let keyed = MockTexture::keyed(WaitStatus::Timeout);
        assert_eq!(first.access(Some(&keyed)).err(), Some(AcquireResult::Timeout));
    }
}
