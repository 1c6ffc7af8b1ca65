//! Common interface for GPU resources that can be locked across processes.

use std::time::Duration;

/// Key used for every keyed-mutex acquire and release.
///
/// All cooperating processes acquire and release the same key, which turns
/// the keyed mutex into a plain exclusive lock.
pub const DEFAULT_SYNC_KEY: u64 = 0;

/// Outcome of a bounded wait on a cross-process synchronisation object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// The object was signalled and the caller now owns it.
    Signaled,
    /// The previous owner terminated while holding the object. Ownership has
    /// passed to the caller.
    Abandoned,
    /// The bound elapsed before the object was signalled.
    Timeout,
    /// The wait failed for any other reason.
    Failed,
}

impl WaitStatus {
    /// Whether the caller owns the object after this wait.
    pub fn is_owned(self) -> bool {
        matches!(self, WaitStatus::Signaled | WaitStatus::Abandoned)
    }
}

/// A GPU resource shared with other processes.
///
/// Some resource types carry their own cross-process lock: a D3D11 texture
/// created with `D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX` must be accessed
/// through `IDXGIKeyedMutex::AcquireSync`/`ReleaseSync`, and copies into it
/// fail when a separate named mutex is used instead. Whether a resource has
/// one is fixed at creation time but can differ between instances, so callers
/// query [`has_keyed_mutex`](SharedResource::has_keyed_mutex) on every access.
pub trait SharedResource {
    /// Whether this resource instance was created with a keyed mutex.
    fn has_keyed_mutex(&self) -> bool;

    /// Acquire the resource's keyed mutex for `key`, waiting at most
    /// `timeout`.
    ///
    /// Resources without a keyed mutex return [`WaitStatus::Failed`].
    fn acquire_key(&self, key: u64, timeout: Duration) -> WaitStatus;

    /// Release the resource's keyed mutex for `key`.
    ///
    /// Returns `false` if the release failed (not held, no keyed mutex).
    fn release_key(&self, key: u64) -> bool;
}

impl<T: SharedResource + ?Sized> SharedResource for &T {
    fn has_keyed_mutex(&self) -> bool {
        (**self).has_keyed_mutex()
    }

    fn acquire_key(&self, key: u64, timeout: Duration) -> WaitStatus {
        (**self).acquire_key(key, timeout)
    }

    fn release_key(&self, key: u64) -> bool {
        (**self).release_key(key)
    }
}

impl<T: SharedResource + ?Sized> SharedResource for Box<T> {
    fn has_keyed_mutex(&self) -> bool {
        (**self).has_keyed_mutex()
    }

    fn acquire_key(&self, key: u64, timeout: Duration) -> WaitStatus {
        (**self).acquire_key(key, timeout)
    }

    fn release_key(&self, key: u64) -> bool {
        (**self).release_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Flagged {
        keyed: bool,
        released: Cell<u32>,
    }

    impl SharedResource for Flagged {
        fn has_keyed_mutex(&self) -> bool {
            self.keyed
        }

        fn acquire_key(&self, _key: u64, _timeout: Duration) -> WaitStatus {
            if self.keyed {
                WaitStatus::Signaled
            } else {
                WaitStatus::Failed
            }
        }

        fn release_key(&self, _key: u64) -> bool {
            self.released.set(self.released.get() + 1);
            self.keyed
        }
    }

    #[test]
    fn owned_statuses() {
        assert!(WaitStatus::Signaled.is_owned());
        assert!(WaitStatus::Abandoned.is_owned());
        assert!(!WaitStatus::Timeout.is_owned());
        assert!(!WaitStatus::Failed.is_owned());
    }

    #[test]
    fn references_and_boxes_forward() {
        let res = Flagged {
            keyed: true,
            released: Cell::new(0),
        };
        let by_ref: &dyn SharedResource = &res;
        assert!(by_ref.has_keyed_mutex());
        assert_eq!(
            (&by_ref).acquire_key(DEFAULT_SYNC_KEY, Duration::ZERO),
            WaitStatus::Signaled
        );
        assert!((&by_ref).release_key(DEFAULT_SYNC_KEY));
        assert_eq!(res.released.get(), 1);

        let boxed: Box<dyn SharedResource> = Box::new(Flagged {
            keyed: false,
            released: Cell::new(0),
        });
        assert!(!boxed.has_keyed_mutex());
        assert_eq!(
            boxed.acquire_key(DEFAULT_SYNC_KEY, Duration::ZERO),
            WaitStatus::Failed
        );
    }
}
