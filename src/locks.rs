// Per-key async mutexes (per tx hash, per currency, per withdrawal id)

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. The guard releases on drop.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop mutexes nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_held_locks() {
        tokio_test::block_on(async {
            let locks = KeyedLocks::new();
            let held = locks.lock("ETH").await;
            drop(locks.lock("USDT").await);

            assert_eq!(locks.len(), 2);
            assert_eq!(locks.prune(), 1);
            assert_eq!(locks.len(), 1);

            drop(held);
            assert_eq!(locks.prune(), 1);
            assert!(locks.is_empty());
        });
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("0xabc").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("0xabc").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
