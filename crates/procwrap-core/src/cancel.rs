//! Shareable cancellation token with callback registration.
//!
//! A `CancellationToken` can be cloned and handed to any number of parties.
//! Besides polling `is_cancelled()`, interested code can `register` a callback
//! that runs once when the token is cancelled. Process handles use this to
//! converge their own token and a caller-supplied token on one cancel path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: HashMap<u64, Callback>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// A cancellation token for cooperative cancellation.
///
/// This token can be cloned and shared across threads. When `cancel()` is
/// called on any clone, all clones observe the cancellation and every
/// registered callback runs exactly once.
///
/// # Example
///
/// ```
/// use procwrap_core::CancellationToken;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let token = CancellationToken::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = hits.clone();
/// let _registration = token.register(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// token.clone().cancel();
/// token.cancel();
/// assert!(token.is_cancelled());
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    ///
    /// The first call runs all registered callbacks on the calling thread.
    /// Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // Callbacks run outside the lock so they may register, drop
        // registrations, or take their own locks freely.
        let callbacks = {
            let mut guard = lock_callbacks(&self.inner);
            std::mem::take(&mut guard.entries)
        };

        let mut callbacks: Vec<_> = callbacks.into_iter().collect();
        callbacks.sort_by_key(|(id, _)| *id);
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a callback to run when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread. Dropping the returned registration unregisters the
    /// callback if it has not run yet.
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = lock_callbacks(&self.inner);
        if self.is_cancelled() {
            drop(guard);
            callback();
            return CancellationRegistration::inert();
        }

        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.insert(id, Box::new(callback));

        CancellationRegistration {
            token: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    #[cfg(test)]
    fn registered_callbacks(&self) -> usize {
        lock_callbacks(&self.inner).entries.len()
    }
}

fn lock_callbacks(inner: &Inner) -> std::sync::MutexGuard<'_, Callbacks> {
    // A panicking callback never runs under this lock, so the data is intact.
    inner
        .callbacks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscription returned by [`CancellationToken::register`].
///
/// Dropping it removes the callback. It holds only a weak reference, so it
/// never keeps the token alive.
#[derive(Debug)]
pub struct CancellationRegistration {
    token: Weak<Inner>,
    id: Option<u64>,
}

impl CancellationRegistration {
    fn inert() -> Self {
        Self {
            token: Weak::new(),
            id: None,
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        let (Some(id), Some(inner)) = (self.id.take(), self.token.upgrade()) else {
            return;
        };
        let removed = lock_callbacks(&inner).entries.remove(&id);
        // Drop the closure after releasing the lock; it may own other handles.
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let clone = hits.clone();
        (hits, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_callback_runs_once() {
        let token = CancellationToken::new();
        let (hits, callback) = counter();
        let _registration = token.register(callback);

        token.cancel();
        token.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(token.registered_callbacks(), 0);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let (hits, callback) = counter();
        let _registration = token.register(callback);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_fire() {
        let token = CancellationToken::new();
        let (hits, callback) = counter();
        let registration = token.register(callback);
        assert_eq!(token.registered_callbacks(), 1);

        drop(registration);
        assert_eq!(token.registered_callbacks(), 0);

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registration_outlives_token() {
        let token = CancellationToken::new();
        let (_hits, callback) = counter();
        let registration = token.register(callback);

        drop(token);
        drop(registration);
    }

    #[test]
    fn test_callback_may_register_again() {
        let token = CancellationToken::new();
        let nested = token.clone();
        let (hits, callback) = counter();
        let _registration = token.register(move || {
            // Already cancelled, so this runs inline without deadlocking.
            let _inner = nested.register(callback);
        });

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_cancel_fires_once() {
        let token = CancellationToken::new();
        let (hits, callback) = counter();
        let _registration = token.register(callback);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let token = token.clone();
                std::thread::spawn(move || token.cancel())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
