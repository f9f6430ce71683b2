use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kuberes_core::AppKey;
use tokio::sync::OwnedMutexGuard;

/// Advisory per-identity locks shared by workers in one process.
#[derive(Default)]
pub struct DeployLocks {
    inner: Mutex<HashMap<AppKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeployLocks {
    pub fn new() -> Self { Self::default() }

    /// Wait for exclusive use of `key`; released when the guard drops.
    pub async fn acquire(&self, key: &AppKey) -> OwnedMutexGuard<()> {
        let m = {
            let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            // idle entries are only referenced by the map
            g.retain(|_, m| Arc::strong_count(m) > 1);
            g.entry(key.clone()).or_default().clone()
        };
        m.lock_owned().await
    }

    /// Identities currently held or awaited.
    pub fn len(&self) -> usize {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.values().filter(|m| Arc::strong_count(m) > 1).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(DeployLocks::new());
        let key = AppKey::new("c1", "ns", "svc");
        let g1 = locks.acquire(&key).await;
        let l2 = locks.clone();
        let k2 = key.clone();
        let waiter = tokio::spawn(async move { let _g = l2.acquire(&k2).await; });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(g1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("waiter released").unwrap();
    }

    #[tokio::test]
    async fn other_keys_do_not_block_and_idle_entries_are_pruned() {
        let locks = DeployLocks::new();
        let a = locks.acquire(&AppKey::new("c1", "ns", "a")).await;
        let b = locks.acquire(&AppKey::new("c1", "ns", "b")).await;
        assert_eq!(locks.len(), 2);
        drop(a);
        drop(b);
        assert!(locks.is_empty());
        let _c = locks.acquire(&AppKey::new("c1", "ns", "c")).await;
        assert_eq!(locks.inner.lock().unwrap().len(), 1);
    }
}
