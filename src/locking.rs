//! 命名空间锁：串行化同一发布命名空间内的"探测可用名称并重命名"操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Waiting for the lock exceeded the configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

/// Manages asynchronous mutexes keyed by publish namespace.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取命名空间锁。
    pub async fn lock_with_timeout(
        &self,
        namespace: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(normalize_lock_key(namespace))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }
}

fn normalize_lock_key(namespace: &str) -> String {
    namespace.trim().trim_end_matches(['/', '\\']).replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out_while_first_holds() {
        let manager = LockManager::new();
        let guard = manager
            .lock_with_timeout("uploads", Duration::from_millis(50))
            .await
            .expect("first lock");

        let blocked = manager
            .lock_with_timeout("uploads/", Duration::from_millis(20))
            .await;
        assert_eq!(blocked.err(), Some(LockTimeout));

        let other = manager
            .lock_with_timeout("elsewhere", Duration::from_millis(20))
            .await;
        assert!(other.is_ok());

        drop(guard);
        manager
            .lock_with_timeout("uploads", Duration::from_millis(20))
            .await
            .expect("lock after release");
    }
}
