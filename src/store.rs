//! 元数据存储适配层：带 TTL 的键值读写与原子自增。
//!
//! 所有操作都是单键操作，不假设多键事务。键不存在是正常结果（`None`），
//! 后端不可达才是错误。

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("value at {0} is not an integer")]
    NotAnInteger(String),

    #[error("metadata store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed metadata backend with per-key expiry.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// 删除键，键不存在时不报错。
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// 原子地把整数值加上 `delta` 并返回新值。
    ///
    /// 键不存在时从 0 开始且不设置过期时间；已存在的键保留原有过期时间。
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// 仅当键存在时自增，返回新值；键不存在（含已过期）时返回 `None` 且不创建键。
    async fn increment_existing(&self, key: &str, delta: i64) -> StoreResult<Option<i64>>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// 进程内存储实现，单实例部署与测试使用。
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 清除所有已过期的键，返回清除数量。
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    #[cfg(test)]
    pub(crate) async fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: Some(Instant::now() + ttl),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut entries = self.entries.lock().await;
        let current = live_entry(&entries, key);
        let (value, expires_at) = match current {
            Some((value, expires_at)) => (value?, expires_at),
            None => (0, None),
        };
        apply_delta(&mut entries, key, value, delta, expires_at)
    }

    async fn increment_existing(&self, key: &str, delta: i64) -> StoreResult<Option<i64>> {
        let mut entries = self.entries.lock().await;
        let Some((value, expires_at)) = live_entry(&entries, key) else {
            return Ok(None);
        };
        apply_delta(&mut entries, key, value?, delta, expires_at).map(Some)
    }
}

fn live_entry(
    entries: &HashMap<String, Entry>,
    key: &str,
) -> Option<(StoreResult<i64>, Option<Instant>)> {
    let now = Instant::now();
    entries
        .get(key)
        .filter(|entry| entry.is_live(now))
        .map(|entry| (parse_integer(key, &entry.value), entry.expires_at))
}

fn apply_delta(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    current: i64,
    delta: i64,
    expires_at: Option<Instant>,
) -> StoreResult<i64> {
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StoreError::Backend(format!("increment overflow at {key}")))?;
    entries.insert(
        key.to_string(),
        Entry {
            value: next.to_string().into_bytes(),
            expires_at,
        },
    );
    Ok(next)
}

/// 解析以十进制 ASCII 存储的整数值。
pub fn parse_integer(key: &str, value: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok())
        .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Script};
    use std::time::Duration;

    use super::{MetaStore, StoreError, StoreResult};

    /// Redis 实现；连接管理器在启动时创建一次，每次调用克隆句柄。
    #[derive(Clone)]
    pub struct RedisStore {
        connection: ConnectionManager,
    }

    impl RedisStore {
        pub async fn connect(url: &str) -> StoreResult<Self> {
            let client = redis::Client::open(url).map_err(map_redis_error)?;
            let connection = client
                .get_connection_manager()
                .await
                .map_err(map_redis_error)?;
            Ok(Self { connection })
        }
    }

    /// `EXISTS` 与 `INCRBY` 在同一脚本中执行，键不存在时返回 nil。
    const INCREMENT_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

    fn map_increment_error(key: &str, err: redis::RedisError) -> StoreError {
        match err.kind() {
            redis::ErrorKind::ResponseError
            | redis::ErrorKind::TypeError
            | redis::ErrorKind::ExtensionError => StoreError::NotAnInteger(key.to_string()),
            _ => map_redis_error(err),
        }
    }

    fn map_redis_error(err: redis::RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }

    #[async_trait]
    impl MetaStore for RedisStore {
        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
            let mut connection = self.connection.clone();
            connection
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_redis_error)
        }

        async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            let mut connection = self.connection.clone();
            connection
                .get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(map_redis_error)
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            let mut connection = self.connection.clone();
            connection
                .del::<_, ()>(key)
                .await
                .map_err(map_redis_error)
        }

        async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
            let mut connection = self.connection.clone();
            connection
                .incr::<_, _, i64>(key, delta)
                .await
                .map_err(|err| map_increment_error(key, err))
        }

        async fn increment_existing(&self, key: &str, delta: i64) -> StoreResult<Option<i64>> {
            let mut connection = self.connection.clone();
            let next: Option<i64> = Script::new(INCREMENT_EXISTING)
                .key(key)
                .arg(delta)
                .invoke_async(&mut connection)
                .await
                .map_err(|err| map_increment_error(key, err))?;
            Ok(next)
        }
    }
}
