use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-system exclusive locks. Whoever holds a system's guard is the only
/// writer of that system's rows.
#[derive(Clone, Default)]
pub struct SystemLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

pub type SystemGuard = OwnedMutexGuard<()>;

impl SystemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, system_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(system_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Take the lock if nobody holds it.
    pub fn try_lock(&self, system_id: &str) -> Option<SystemGuard> {
        self.slot(system_id).try_lock_owned().ok()
    }

    /// Wait for the lock.
    pub async fn lock(&self, system_id: &str) -> SystemGuard {
        self.slot(system_id).lock_owned().await
    }

    pub fn is_locked(&self, system_id: &str) -> bool {
        self.slot(system_id).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_per_system() {
        let locks = SystemLocks::new();

        let guard = locks.try_lock("sys-1").unwrap();
        assert!(locks.try_lock("sys-1").is_none());
        assert!(locks.is_locked("sys-1"));
        assert!(locks.try_lock("sys-2").is_some());

        drop(guard);
        assert!(!locks.is_locked("sys-1"));
        let _again = locks.lock("sys-1").await;
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let locks = SystemLocks::new();
        let other = locks.clone();
        let _guard = locks.lock("sys-1").await;
        assert!(other.try_lock("sys-1").is_none());
    }
}
