//! Live-updatable configuration handle.
//!
//! The admission guard reads its parameters through a [`DynamicConfig`] on
//! every call, so operators can tighten or relax thresholds without
//! rebuilding the guard. Default backend is `ArcSwap` for lock-free reads;
//! feature `adaptive-rwlock` switches to a `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared config cell. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value. Snapshots taken earlier keep the old one.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get());
        self.set(next);
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::config::AdmissionConfig;
    use std::time::Duration;

    #[test]
    fn snapshots_survive_updates() {
        let cfg = DynamicConfig::new(AdmissionConfig::default());
        let before = cfg.get();
        cfg.set(
            AdmissionConfig::new(2, Duration::from_secs(30), 10, Duration::from_secs(5)).unwrap(),
        );
        assert_eq!(before.max_failed_attempts(), 5);
        assert_eq!(cfg.get().max_failed_attempts(), 2);
    }

    #[test]
    fn clones_share_updates() {
        let a = DynamicConfig::new(1u32);
        let b = a.clone();
        a.update(|v| v + 3);
        assert_eq!(*b.get(), 4);
    }
}
