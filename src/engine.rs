//! 上传协议引擎：创建、查询、追加、终止会话，以及孤儿区域回收。
//!
//! 引擎不缓存任何会话状态，每次调用都重新读取元数据存储。
//! 偏移推进依赖存储的原子自增；完成阶段的"探测名称并重命名"在
//! 命名空间锁内执行。

use futures_util::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locking::LockManager;
use crate::metadata::UploadMetadata;
use crate::session::{SessionKeys, UploadSession, read_unsigned};
use crate::sink::{ByteSink, SinkError, validate_public_name};
use crate::store::{MetaStore, StoreError};

/// Public name used when the client sends no `filename` metadata.
pub const DEFAULT_FINAL_NAME: &str = "upload.bin";

/// 名称冲突时最多尝试的计数后缀数量。
pub const MAX_NAME_PROBES: u32 = 10_000;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("upload length {size} exceeds maximum {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload gone: {0}")]
    Gone(String),

    #[error("offset conflict: server at {expected}, client sent {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for UploadError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(msg) | StoreError::Backend(msg) => {
                UploadError::StoreUnavailable(msg)
            }
            StoreError::NotAnInteger(key) => {
                UploadError::Internal(format!("corrupt metadata entry {key}"))
            }
        }
    }
}

impl From<SinkError> for UploadError {
    fn from(error: SinkError) -> Self {
        match error {
            SinkError::Allocation(msg) => UploadError::Allocation(msg),
            SinkError::Io(err) => UploadError::Io(err.to_string()),
            SinkError::Missing(id) => UploadError::Gone(id),
            SinkError::InvalidName(name) => UploadError::Validation(format!("invalid name {name}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub metadata_ttl: Duration,
    pub io_timeout: Duration,
    pub lock_timeout: Duration,
    /// 0 表示不限制。
    pub max_size: u64,
}

/// Parsed creation request.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub declared_size: u64,
    pub metadata: UploadMetadata,
    pub raw_metadata: String,
}

impl CreateRequest {
    /// 由声明长度与 `Upload-Metadata` 原文构造，元数据格式错误时拒绝。
    pub fn new(declared_size: u64, raw_metadata: Option<&str>) -> Result<Self, UploadError> {
        let raw_metadata = raw_metadata.unwrap_or_default().to_string();
        let metadata = UploadMetadata::parse(&raw_metadata).map_err(UploadError::Validation)?;
        Ok(Self {
            declared_size,
            metadata,
            raw_metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedUpload {
    pub resource_id: String,
    /// 声明长度为 0 时创建即完成，这里是发布后的名称。
    pub published_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub offset: u64,
    pub declared_size: Option<u64>,
    /// 创建时的 `Upload-Metadata` 原文，为空时不返回。
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub offset: u64,
    pub published_name: Option<String>,
}

pub struct UploadEngine {
    store: Arc<dyn MetaStore>,
    sink: Arc<dyn ByteSink>,
    locks: LockManager,
    config: EngineConfig,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn MetaStore>, sink: Arc<dyn ByteSink>, config: EngineConfig) -> Self {
        Self {
            store,
            sink,
            locks: LockManager::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn bounded<T, E>(
        &self,
        what: &'static str,
        operation: impl Future<Output = Result<T, E>>,
    ) -> Result<T, UploadError>
    where
        UploadError: From<E>,
    {
        match time::timeout(self.config.io_timeout, operation).await {
            Ok(result) => result.map_err(UploadError::from),
            Err(_) => Err(UploadError::Timeout(what)),
        }
    }

    /// 创建会话：写入四个元数据键并预分配字节区域。
    ///
    /// 区域分配失败时已写入的元数据保持原样，由 TTL 过期回收。
    pub async fn create_session(&self, request: CreateRequest) -> Result<CreatedUpload, UploadError> {
        let declared_size = request.declared_size;
        if self.config.max_size > 0 && declared_size > self.config.max_size {
            return Err(UploadError::TooLarge {
                size: declared_size,
                max: self.config.max_size,
            });
        }
        let final_name = request
            .metadata
            .filename()
            .unwrap_or(DEFAULT_FINAL_NAME)
            .to_string();
        validate_public_name(&final_name)?;

        let resource_id = Uuid::new_v4().to_string();
        let keys = SessionKeys::new(&resource_id);
        let ttl = self.config.metadata_ttl;
        let size_text = declared_size.to_string();
        let entries: [(&str, &[u8]); 4] = [
            (keys.filename.as_str(), final_name.as_bytes()),
            (keys.file_size.as_str(), size_text.as_bytes()),
            (keys.offset.as_str(), b"0".as_slice()),
            (keys.upload_metadata.as_str(), request.raw_metadata.as_bytes()),
        ];
        self.bounded(
            "metadata write",
            try_join_all(
                entries
                    .iter()
                    .map(|(key, value)| self.store.set(key, value, ttl)),
            ),
        )
        .await?;

        if let Err(err) = self
            .bounded("sink allocation", self.sink.create(&resource_id, declared_size))
            .await
        {
            warn!(
                upload_id = resource_id,
                error = %err,
                "byte sink allocation failed, metadata left to expire"
            );
            return Err(err);
        }

        info!(
            upload_id = resource_id,
            name = final_name,
            size = declared_size,
            "upload created"
        );

        let published_name = if declared_size == 0 {
            Some(self.finalize(&resource_id, &final_name).await?)
        } else {
            None
        };

        Ok(CreatedUpload {
            resource_id,
            published_name,
        })
    }

    /// 查询当前偏移；偏移键不存在即为未找到。
    pub async fn get_status(&self, resource_id: &str) -> Result<UploadStatus, UploadError> {
        let not_found = || UploadError::NotFound(resource_id.to_string());
        let id = parse_resource_id(resource_id).ok_or_else(not_found)?;
        let keys = SessionKeys::new(&id);
        let offset = self
            .bounded("offset read", read_unsigned(self.store.as_ref(), &keys.offset))
            .await?
            .ok_or_else(not_found)?;
        let declared_size = self
            .bounded("size read", read_unsigned(self.store.as_ref(), &keys.file_size))
            .await?;
        let metadata = self
            .bounded("metadata read", self.store.get(&keys.upload_metadata))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .filter(|raw| !raw.is_empty());
        Ok(UploadStatus {
            offset,
            declared_size,
            metadata,
        })
    }

    /// 在客户端声明的偏移处追加数据并推进偏移。
    ///
    /// 会话或区域不存在返回 `Gone`（包括已完成发布的会话）；偏移不一致
    /// 在写入前返回 `Conflict`。完成发布失败时撤销最后一次自增，客户端
    /// 重发同一分片即可重新触发发布。
    pub async fn append_chunk(
        &self,
        resource_id: &str,
        client_offset: u64,
        bytes: &[u8],
    ) -> Result<AppendOutcome, UploadError> {
        let gone = || UploadError::Gone(resource_id.to_string());
        let id = parse_resource_id(resource_id).ok_or_else(gone)?;
        let session = self
            .bounded("session read", UploadSession::load(self.store.as_ref(), &id))
            .await?
            .ok_or_else(gone)?;
        if !self.bounded("sink probe", self.sink.exists(&id)).await? {
            return Err(gone());
        }

        if client_offset != session.current_offset {
            debug!(
                upload_id = id,
                expected = session.current_offset,
                got = client_offset,
                "offset mismatch"
            );
            return Err(UploadError::Conflict {
                expected: session.current_offset,
                actual: client_offset,
            });
        }

        let length = bytes.len() as u64;
        let end = client_offset
            .checked_add(length)
            .filter(|end| *end <= session.declared_size)
            .ok_or_else(|| {
                UploadError::Validation(format!(
                    "chunk of {length} bytes at {client_offset} exceeds upload length {}",
                    session.declared_size
                ))
            })?;
        let delta = i64::try_from(length)
            .map_err(|_| UploadError::Validation("chunk too large".into()))?;

        if length > 0 {
            self.bounded("sink write", self.sink.write(&id, client_offset, bytes))
                .await?;
        }

        let keys = SessionKeys::new(&id);
        let new_offset = self
            .bounded(
                "offset increment",
                self.store.increment_existing(&keys.offset, delta),
            )
            .await?
            .ok_or_else(gone)?;
        if new_offset != end as i64 {
            // 并发请求先推进了偏移，撤销本次自增。
            self.revert_offset(&id, &keys, delta).await;
            let expected = u64::try_from(new_offset - delta).unwrap_or_default();
            warn!(
                upload_id = id,
                expected,
                got = client_offset,
                "concurrent append detected"
            );
            return Err(UploadError::Conflict {
                expected,
                actual: client_offset,
            });
        }

        debug!(
            upload_id = session.resource_id,
            state = %session.state(),
            offset = end,
            size = session.declared_size,
            bytes = length,
            "chunk appended"
        );

        if end < session.declared_size {
            return Ok(AppendOutcome {
                offset: end,
                published_name: None,
            });
        }

        match self.finalize(&id, &session.final_name).await {
            Ok(name) => Ok(AppendOutcome {
                offset: end,
                published_name: Some(name),
            }),
            // 暂存区域已被移走，说明另一个请求已完成发布。
            Err(err @ UploadError::Gone(_)) => Err(err),
            Err(err) => {
                warn!(
                    upload_id = id,
                    error = %err,
                    "finalize failed, rolling back final chunk"
                );
                self.revert_offset(&id, &keys, delta).await;
                Err(err)
            }
        }
    }

    async fn revert_offset(&self, id: &str, keys: &SessionKeys, delta: i64) {
        if delta == 0 {
            return;
        }
        match self
            .bounded(
                "offset revert",
                self.store.increment_existing(&keys.offset, -delta),
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(upload_id = id, "session expired before offset revert"),
            Err(err) => warn!(upload_id = id, error = %err, "failed to revert offset increment"),
        }
    }

    /// 删除会话的元数据与字节区域，可重复调用。
    pub async fn delete_session(&self, resource_id: &str) -> Result<(), UploadError> {
        let Some(id) = parse_resource_id(resource_id) else {
            return Ok(());
        };
        let keys = SessionKeys::new(&id);
        self.bounded(
            "metadata delete",
            try_join_all(keys.all().into_iter().map(|key| self.store.delete(key))),
        )
        .await?;

        if let Err(err) = self.bounded("sink delete", self.sink.delete(&id)).await {
            warn!(upload_id = id, error = %err, "failed to delete byte sink");
        }
        info!(upload_id = id, "upload terminated");
        Ok(())
    }

    /// 回收元数据已过期但字节区域仍在的暂存区域，返回回收数量。
    ///
    /// 单个区域检查或删除失败只记录日志，不影响其余区域。
    pub async fn sweep_orphans(&self, older_than: Duration) -> Result<usize, UploadError> {
        let candidates = self
            .bounded("staging scan", self.sink.stale_sessions(older_than))
            .await?;
        let mut removed = 0;
        for id in candidates {
            let keys = SessionKeys::new(&id);
            match self.bounded("offset read", self.store.get(&keys.offset)).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    warn!(upload_id = id, error = %err, "skipping orphan check");
                    continue;
                }
            }
            if let Err(err) = self.bounded("sink delete", self.sink.delete(&id)).await {
                warn!(upload_id = id, error = %err, "failed to remove orphaned byte sink");
                continue;
            }
            info!(upload_id = id, "removed orphaned byte sink");
            removed += 1;
        }
        Ok(removed)
    }

    async fn finalize(&self, id: &str, declared_name: &str) -> Result<String, UploadError> {
        let namespace = self.sink.namespace();
        let _guard = self
            .locks
            .lock_with_timeout(&namespace, self.config.lock_timeout)
            .await
            .map_err(|_| UploadError::Timeout("namespace lock"))?;

        let name = self.resolve_public_name(declared_name).await?;
        self.bounded("sink rename", self.sink.rename(id, &name))
            .await?;
        info!(upload_id = id, name, "upload complete");
        Ok(name)
    }

    /// 名称被占用时依次尝试 `name.1`、`name.2` ……
    async fn resolve_public_name(&self, declared_name: &str) -> Result<String, UploadError> {
        if !self
            .bounded("name probe", self.sink.name_taken(declared_name))
            .await?
        {
            return Ok(declared_name.to_string());
        }
        for counter in 1..=MAX_NAME_PROBES {
            let candidate = format!("{declared_name}.{counter}");
            if !self
                .bounded("name probe", self.sink.name_taken(&candidate))
                .await?
            {
                return Ok(candidate);
            }
        }
        Err(UploadError::Io(format!(
            "no free name for {declared_name} after {MAX_NAME_PROBES} probes"
        )))
    }
}

fn parse_resource_id(resource_id: &str) -> Option<String> {
    Uuid::parse_str(resource_id).ok().map(|id| id.to_string())
}
