//! A small object pool with scoped checkout.
//!
//! [`Pool::checkout`] hands out a [`Pooled`] guard that owns the value
//! exclusively; dropping the guard puts the value back, so every exit path of
//! a request (including early returns and unwinding) releases it. The pool
//! keeps at most `max_idle` values around and drops the rest.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct Pool<T> {
    inner: Arc<Shared<T>>,
}

struct Shared<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    create: Factory<T>,
}

impl<T> Pool<T> {
    pub fn new<F>(max_idle: usize, create: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self { inner: Arc::new(Shared { idle: Mutex::new(Vec::new()), max_idle, create: Box::new(create) }) }
    }

    /// Takes an idle value, or creates a fresh one when none is left.
    ///
    /// The value is handed out as it was returned; callers reset it.
    pub fn checkout(&self) -> Pooled<T> {
        let value = self.inner.lock().pop().unwrap_or_else(|| (self.inner.create)());
        Pooled { value: Some(value), pool: Arc::clone(&self.inner) }
    }

    /// Number of values currently waiting in the pool.
    pub fn idle(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("idle", &self.idle()).field("max_idle", &self.inner.max_idle).finish()
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        // a panic while holding the lock leaves the Vec intact
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, value: T) {
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(value);
        }
    }
}

/// A value checked out of a [`Pool`], returned to it on drop.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<Shared<T>>,
}

impl<T> Pooled<T> {
    /// Detaches the value from the pool; it will not be returned.
    pub fn into_inner(mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only `into_inner` and `drop` take the value, both consume the guard
        self.value.as_ref().unwrap_or_else(|| unreachable!("pooled value is present until drop"))
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!("pooled value is present until drop"))
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn returns_on_drop_and_reuses() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::new(4, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            BytesMut::with_capacity(64)
        });

        {
            let mut buf = pool.checkout();
            buf.extend_from_slice(b"abc");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.checkout();
        assert_eq!(&buf[..], b"abc");
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounded_idle_count() {
        let pool = Pool::new(1, Vec::<u8>::new);
        let a = pool.checkout();
        let b = pool.checkout();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn into_inner_detaches() {
        let pool = Pool::new(2, || 7u32);
        let value = pool.checkout().into_inner();
        assert_eq!(value, Some(7));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn released_when_unwinding() {
        let pool = Pool::new(2, || 0u8);
        let cloned = pool.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _held = cloned.checkout();
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
