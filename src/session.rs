//! 上传会话：元数据键布局、状态推导与从存储加载。

use std::fmt;

use crate::store::{MetaStore, StoreError, StoreResult, parse_integer};

const KEY_PREFIX: &str = "file-uploads";

/// 每个会话在元数据存储中的四个键，共享同一过期时间。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub filename: String,
    pub file_size: String,
    pub offset: String,
    pub upload_metadata: String,
}

impl SessionKeys {
    pub fn new(resource_id: &str) -> Self {
        let prefix = format!("{KEY_PREFIX}/{resource_id}");
        Self {
            filename: format!("{prefix}/filename"),
            file_size: format!("{prefix}/file_size"),
            offset: format!("{prefix}/offset"),
            upload_metadata: format!("{prefix}/upload-metadata"),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            &self.filename,
            &self.file_size,
            &self.offset,
            &self.upload_metadata,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Uploading,
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "created",
            SessionState::Uploading => "uploading",
            SessionState::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Snapshot of one session as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub resource_id: String,
    pub final_name: String,
    pub declared_size: u64,
    pub current_offset: u64,
}

impl UploadSession {
    pub fn state(&self) -> SessionState {
        if self.current_offset >= self.declared_size {
            SessionState::Completed
        } else if self.current_offset == 0 {
            SessionState::Created
        } else {
            SessionState::Uploading
        }
    }

    /// 读取会话的全部元数据；文件名、大小或偏移任一缺失都视为会话不存在。
    pub async fn load(store: &dyn MetaStore, resource_id: &str) -> StoreResult<Option<Self>> {
        let keys = SessionKeys::new(resource_id);
        let Some(filename) = store.get(&keys.filename).await? else {
            return Ok(None);
        };
        let declared_size = read_unsigned(store, &keys.file_size).await?;
        let current_offset = read_unsigned(store, &keys.offset).await?;
        let (Some(declared_size), Some(current_offset)) = (declared_size, current_offset) else {
            return Ok(None);
        };

        Ok(Some(Self {
            resource_id: resource_id.to_string(),
            final_name: String::from_utf8_lossy(&filename).into_owned(),
            declared_size,
            current_offset,
        }))
    }
}

/// 读取以十进制存储的非负整数。
pub async fn read_unsigned(store: &dyn MetaStore, key: &str) -> StoreResult<Option<u64>> {
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };
    let parsed = parse_integer(key, &value)?;
    u64::try_from(parsed)
        .map(Some)
        .map_err(|_| StoreError::NotAnInteger(key.to_string()))
}
