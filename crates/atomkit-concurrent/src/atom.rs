use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use atomkit_core::{check_shareable, Result};
use crossbeam_utils::Backoff;
use tracing::trace;

/// A lock-free, atomically swappable reference cell.
///
/// Every value is held behind its own `Arc`. Updates go through [`swap`],
/// which runs a compare-and-swap retry loop keyed on pointer identity: the
/// candidate is installed only if the slot still holds the exact allocation
/// the update function was given.
///
/// The update function only ever sees `&T` and must return a fresh `T`, so
/// the CAS comparand can never be mutated in place behind the loop's back.
/// Interior mutability can still change a value through `&T`. Doing so from
/// an update function is unsupported: the change happens before the CAS and
/// survives a lost race.
///
/// [`swap`]: AtomicReference::swap
pub struct AtomicReference<T> {
    inner: ArcSwap<T>,
}

impl<T> AtomicReference<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// Snapshot of the current value. Never observes a half-written value.
    #[inline]
    pub fn value(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Read the current value without bumping its reference count.
    #[inline]
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.load();
        f(&**guard)
    }

    /// Atomically replace the value with `update(current)` and return the
    /// value that was installed.
    ///
    /// `update` may run more than once when other threads win the race; it
    /// must be a pure function of its argument. Lock-free: some caller always
    /// makes progress, but a single caller can in principle retry forever.
    pub fn swap<F>(&self, mut update: F) -> Arc<T>
    where
        F: FnMut(&T) -> T,
    {
        let backoff = Backoff::new();
        let mut retries = 0usize;
        let mut current = self.inner.load();
        loop {
            let candidate = Arc::new(update(&**current));
            let previous = self.inner.compare_and_swap(&*current, Arc::clone(&candidate));
            if Arc::ptr_eq(&*previous, &*current) {
                if retries > 0 {
                    trace!(retries, "swap won after contention");
                }
                return candidate;
            }
            retries += 1;
            current = previous;
            backoff.spin();
        }
    }

    /// Install `new` only if the slot still holds `expected` (by identity).
    ///
    /// Returns the installed value on success and the value that was found
    /// instead on failure.
    pub fn compare_and_set(
        &self,
        expected: &Arc<T>,
        new: T,
    ) -> std::result::Result<Arc<T>, Arc<T>> {
        let candidate = Arc::new(new);
        let previous = self.inner.compare_and_swap(expected, Arc::clone(&candidate));
        if Arc::ptr_eq(&*previous, expected) {
            Ok(candidate)
        } else {
            Err(arc_swap::Guard::into_inner(previous))
        }
    }

    /// Consume the reference, returning the last installed value.
    pub fn into_inner(self) -> Arc<T> {
        self.inner.into_inner()
    }
}

impl<T: Any> AtomicReference<T> {
    /// Like [`new`](AtomicReference::new), but runs the process-wide share
    /// hook on `initial` first.
    pub fn try_new(initial: T) -> Result<Self> {
        check_shareable(&initial)?;
        Ok(Self::new(initial))
    }

    /// Like [`swap`](AtomicReference::swap), but every candidate is vetted
    /// by the share hook before the CAS. A rejected candidate is never
    /// installed and the slot keeps its current value.
    pub fn try_swap<F>(&self, mut update: F) -> Result<Arc<T>>
    where
        F: FnMut(&T) -> T,
    {
        let backoff = Backoff::new();
        let mut current = self.inner.load();
        loop {
            let candidate = update(&**current);
            check_shareable(&candidate)?;
            let candidate = Arc::new(candidate);
            let previous = self.inner.compare_and_swap(&*current, Arc::clone(&candidate));
            if Arc::ptr_eq(&*previous, &*current) {
                return Ok(candidate);
            }
            current = previous;
            backoff.spin();
        }
    }
}

impl<T: Default> Default for AtomicReference<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for AtomicReference<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicReference")
            .field(&*self.inner.load())
            .finish()
    }
}
