//! 按键互斥锁
//! 每个钱包 / 每笔多签交易一把异步锁，不同键之间互不阻塞
//! 用于：Nonce分配、多签签名计数

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 锁守卫（超出作用域自动释放）
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    _guard: OwnedMutexGuard<()>,
    key: K,
    registry: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        let mut locks = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // 只剩注册表和当前守卫持有时才回收，避免表无限增长
        if let Some(entry) = locks.get(&self.key) {
            if Arc::strong_count(entry) <= 2 {
                locks.remove(&self.key);
            }
        }
    }
}

pub struct KeyedLocks<K: Eq + Hash + Clone> {
    registry: Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 获取指定键的锁（等待直到可用）
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let entry = {
            let mut locks = match self.registry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;

        KeyedGuard {
            _guard: guard,
            key,
            registry: self.registry.clone(),
        }
    }

    /// 当前登记的键数量
    pub fn len(&self) -> usize {
        match self.registry.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let counter = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
                counter.lock().await.push(("enter", i));
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.lock().await.push(("leave", i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let events = counter.lock().await;
        for pair in events.chunks(2) {
            assert_eq!(pair[0].0, "enter");
            assert_eq!(pair[1].0, "leave");
            assert_eq!(pair[0].1, pair[1].1);
        }
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.acquire(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_entries_are_reclaimed() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _guard = locks.acquire(9).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
