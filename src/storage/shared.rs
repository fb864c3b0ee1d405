//! Shared access to a single cache engine.
//!
//! Connections on every reactor thread and every pool worker go through one
//! coarse lock held for exactly one engine operation. Engine operations are
//! O(1) (or O(k) for k evictions), so the critical section stays short.

use crate::storage::engine::CacheEngine;
use std::sync::{Arc, Mutex, PoisonError};

/// A cloneable handle to a mutex-protected [`CacheEngine`].
#[derive(Debug, Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<CacheEngine>>,
}

impl SharedCache {
    /// Creates a new engine with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self::from_engine(CacheEngine::new(capacity))
    }

    pub fn from_engine(engine: CacheEngine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Runs `f` with exclusive access to the engine.
    ///
    /// A poisoned lock is recovered: the engine never panics mid-update, so
    /// a poisoned guard only means some caller panicked while holding it.
    pub fn with<R>(&self, f: impl FnOnce(&mut CacheEngine) -> R) -> R {
        let mut engine = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut engine)
    }
}
