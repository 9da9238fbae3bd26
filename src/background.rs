//! 后台任务：内存元数据过期清理与孤儿上传区域回收。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::STORE_PURGE_INTERVAL_SECS;
use crate::engine::UploadEngine;
use crate::store::MemoryStore;

/// 启动后台任务；`memory_store` 为空表示使用外部存储，由其自身处理过期。
pub fn spawn_background_tasks(
    engine: Arc<UploadEngine>,
    memory_store: Option<Arc<MemoryStore>>,
    sweep_interval: Duration,
) {
    if let Some(store) = memory_store {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(STORE_PURGE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let purged = store.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "purged expired upload metadata");
                }
            }
        });
    }

    if sweep_interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        let older_than = engine.config().metadata_ttl;
        loop {
            interval.tick().await;
            match engine.sweep_orphans(older_than).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "orphaned upload cleanup finished"),
                Err(err) => warn!(error = %err, "orphaned upload cleanup failed"),
            }
        }
    });
}
