//! Per-stack verification leases.
//!
//! At most one verifier may run per stack key at any instant. Acquisition is
//! a non-blocking try-lock: a held key returns
//! [`SpecError::ConcurrencyViolation`] immediately and the caller decides when
//! to retry. Nothing is queued.
//!
//! A guard built with [`ConcurrencyGuard::with_lock_dir`] also holds an
//! exclusive `fs2` lock on `<dir>/<stack>.lock` for each lease, so guards in
//! other processes sharing the directory see the stack as busy too. The OS
//! drops the lock if the holding process dies.
//!
//! # Example
//!
//! ```
//! use specflow::guard::ConcurrencyGuard;
//!
//! let guard = ConcurrencyGuard::new();
//! let lease = guard.try_acquire("rust").unwrap();
//! assert!(guard.try_acquire("rust").is_err());
//! guard.release(&lease).unwrap();
//! assert!(guard.try_acquire("rust").is_ok());
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SpecError};

/// Token granting exclusive verification rights for one stack key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    stack: String,
    id: Uuid,
    acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Stack key this lease covers.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Unique lease id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the lease was granted.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

#[derive(Debug)]
struct HeldLease {
    id: Uuid,
    lock: Option<File>,
}

/// Registry of outstanding leases keyed by stack.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    held: Mutex<HashMap<String, HeldLease>>,
    lock_dir: Option<PathBuf>,
}

impl ConcurrencyGuard {
    /// Create an empty in-process guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty guard ready to share across workers.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a guard whose leases are also held as lock files in `dir`.
    #[must_use]
    pub fn with_lock_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            held: Mutex::default(),
            lock_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    /// Directory holding the stack lock files, if any.
    #[must_use]
    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, HeldLease>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Try to take the lease for `stack` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::ConcurrencyViolation`] if the key is already held.
    pub fn try_acquire(&self, stack: &str) -> Result<Lease> {
        let mut held = self.held();
        if held.contains_key(stack) {
            debug!(stack = %stack, "Verification lease busy");
            return Err(SpecError::ConcurrencyViolation {
                stack: stack.to_string(),
            });
        }

        let lock = match &self.lock_dir {
            Some(dir) => Some(lock_stack_file(dir, stack)?),
            None => None,
        };

        let lease = Lease {
            stack: stack.to_string(),
            id: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        held.insert(
            lease.stack.clone(),
            HeldLease {
                id: lease.id,
                lock,
            },
        );
        debug!(stack = %stack, lease = %lease.id, "Verification lease acquired");
        Ok(lease)
    }

    /// Return a lease.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidLeaseState`] if the lease was already
    /// released or the key is held by a different lease.
    pub fn release(&self, lease: &Lease) -> Result<()> {
        let mut held = self.held();
        match held.get(&lease.stack) {
            Some(current) if current.id == lease.id => {
                if let Some(entry) = held.remove(&lease.stack) {
                    if let Some(file) = entry.lock {
                        FileExt::unlock(&file)?;
                    }
                }
                debug!(stack = %lease.stack, lease = %lease.id, "Verification lease released");
                Ok(())
            }
            Some(_) => Err(SpecError::InvalidLeaseState {
                stack: lease.stack.clone(),
                reason: format!("lease {} is not the current holder", lease.id),
            }),
            None => Err(SpecError::InvalidLeaseState {
                stack: lease.stack.clone(),
                reason: format!("lease {} was already released", lease.id),
            }),
        }
    }

    /// Take the lease for `stack` and release it when the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::ConcurrencyViolation`] if the key is already held.
    pub fn acquire_scoped(self: &Arc<Self>, stack: &str) -> Result<LeaseGuard> {
        let lease = self.try_acquire(stack)?;
        Ok(LeaseGuard {
            guard: Arc::clone(self),
            lease,
            released: false,
        })
    }

    /// Whether `stack` currently has an outstanding lease from this guard.
    #[must_use]
    pub fn is_held(&self, stack: &str) -> bool {
        self.held().contains_key(stack)
    }

    /// Stack keys with outstanding leases, sorted.
    #[must_use]
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Take the exclusive lock file for `stack` without waiting.
fn lock_stack_file(dir: &Path, stack: &str) -> Result<File> {
    fs::create_dir_all(dir)?;
    let name: String = stack
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(format!("{name}.lock")))?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            debug!(stack = %stack, "Verification lease held by another process");
            Err(SpecError::ConcurrencyViolation {
                stack: stack.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Scoped lease: released exactly once, on [`LeaseGuard::release`] or on drop.
///
/// Dropping covers every exit path, including a cancelled future that owned
/// the guard.
#[derive(Debug)]
pub struct LeaseGuard {
    guard: Arc<ConcurrencyGuard>,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    /// The underlying lease.
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release now and surface any error instead of logging it.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidLeaseState`] if the lease was released
    /// behind the guard's back.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.guard.release(&self.lease)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.guard.release(&self.lease) {
            warn!(stack = %self.lease.stack, error = %e, "Failed to release verification lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_second_acquire_is_busy() {
        let guard = ConcurrencyGuard::new();
        let _lease = guard.try_acquire("rust").unwrap();
        let err = guard.try_acquire("rust").unwrap_err();
        assert!(matches!(err, SpecError::ConcurrencyViolation { ref stack } if stack == "rust"));
    }

    #[test]
    fn test_keys_are_independent() {
        let guard = ConcurrencyGuard::new();
        let _rust = guard.try_acquire("rust").unwrap();
        assert!(guard.try_acquire("python").is_ok());
        assert_eq!(guard.held_keys(), vec!["python", "rust"]);
    }

    #[test]
    fn test_release_then_reacquire() {
        let guard = ConcurrencyGuard::new();
        let first = guard.try_acquire("rust").unwrap();
        assert!(guard.try_acquire("rust").is_err());
        guard.release(&first).unwrap();
        let third = guard.try_acquire("rust").unwrap();
        assert_ne!(first.id(), third.id());
    }

    #[test]
    fn test_double_release_is_invalid() {
        let guard = ConcurrencyGuard::new();
        let lease = guard.try_acquire("go").unwrap();
        guard.release(&lease).unwrap();
        let err = guard.release(&lease).unwrap_err();
        assert!(matches!(err, SpecError::InvalidLeaseState { .. }));
    }

    #[test]
    fn test_stale_lease_cannot_release_new_holder() {
        let guard = ConcurrencyGuard::new();
        let old = guard.try_acquire("go").unwrap();
        guard.release(&old).unwrap();
        let _new = guard.try_acquire("go").unwrap();
        assert!(guard.release(&old).is_err());
        assert!(guard.is_held("go"));
    }

    #[test]
    fn test_scoped_lease_released_on_drop() {
        let guard = ConcurrencyGuard::shared();
        {
            let scoped = guard.acquire_scoped("rust").unwrap();
            assert_eq!(scoped.lease().stack(), "rust");
            assert!(guard.is_held("rust"));
        }
        assert!(!guard.is_held("rust"));
    }

    #[test]
    fn test_scoped_lease_released_on_panic() {
        let guard = ConcurrencyGuard::shared();
        let inner = Arc::clone(&guard);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scoped = inner.acquire_scoped("rust").unwrap();
            panic!("verifier crashed");
        }));
        assert!(result.is_err());
        assert!(!guard.is_held("rust"));
    }

    #[test]
    fn test_explicit_scoped_release() {
        let guard = ConcurrencyGuard::shared();
        let scoped = guard.acquire_scoped("ts").unwrap();
        scoped.release().unwrap();
        assert!(guard.try_acquire("ts").is_ok());
    }

    #[test]
    fn test_lock_dir_is_shared_between_guards() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = ConcurrencyGuard::with_lock_dir(dir.path());
        let second = ConcurrencyGuard::with_lock_dir(dir.path());

        let lease = first.try_acquire("rust").unwrap();
        assert!(dir.path().join("rust.lock").exists());
        let err = second.try_acquire("rust").unwrap_err();
        assert!(matches!(err, SpecError::ConcurrencyViolation { ref stack } if stack == "rust"));
        assert!(second.try_acquire("python").is_ok());

        first.release(&lease).unwrap();
        assert!(second.try_acquire("rust").is_ok());
    }

    #[test]
    fn test_dropped_scoped_lease_unlocks_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = Arc::new(ConcurrencyGuard::with_lock_dir(dir.path()));
        let second = ConcurrencyGuard::with_lock_dir(dir.path());
        {
            let _scoped = first.acquire_scoped("go").unwrap();
            assert!(second.try_acquire("go").is_err());
        }
        assert!(second.try_acquire("go").is_ok());
    }

    #[test]
    fn test_stack_keys_are_safe_file_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let guard = ConcurrencyGuard::with_lock_dir(dir.path());
        let _lease = guard.try_acquire("../web app").unwrap();
        assert!(dir.path().join("___web_app.lock").exists());
    }

    fn race(n: usize) -> (usize, usize) {
        let guard = ConcurrencyGuard::shared();
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    guard.try_acquire("rust")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let leases = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(SpecError::ConcurrencyViolation { .. })))
            .count();
        (leases, busy)
    }

    #[test]
    fn test_two_simultaneous_acquires() {
        assert_eq!(race(2), (1, 1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_exactly_one_lease_wins(n in 2usize..16) {
            prop_assert_eq!(race(n), (1, n - 1));
        }
    }
}
