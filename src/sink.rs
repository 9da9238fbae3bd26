//! 字节存储适配层：每个上传会话一块预分配、可按偏移写入的区域。
//!
//! 进行中的区域放在上传根目录下的暂存目录中，以资源 ID 命名；
//! 完成后重命名到根目录下的公开文件名。

use async_trait::async_trait;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

pub const STAGING_DIR: &str = ".partial";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("byte sink missing: {0}")]
    Missing(String),

    #[error("invalid name: {0}")]
    InvalidName(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Per-session byte-addressable storage.
#[async_trait]
pub trait ByteSink: Send + Sync {
    /// 分配恰好 `size` 字节的稀疏区域，未写入部分读出为 0。
    async fn create(&self, id: &str, size: u64) -> SinkResult<()>;

    /// 在 `offset` 处写入；调用方保证 `offset + bytes.len() <= size`。
    async fn write(&self, id: &str, offset: u64, bytes: &[u8]) -> SinkResult<()>;

    async fn exists(&self, id: &str) -> SinkResult<bool>;

    /// 删除区域，区域不存在不算错误。
    async fn delete(&self, id: &str) -> SinkResult<()>;

    /// 公开命名空间中是否已存在该名称。
    async fn name_taken(&self, name: &str) -> SinkResult<bool>;

    /// 以公开名称发布区域。
    async fn rename(&self, id: &str, final_name: &str) -> SinkResult<()>;

    /// 公开命名空间标识，用作完成阶段的锁键。
    fn namespace(&self) -> String;

    /// 最后修改时间早于 `older_than` 之前的暂存区域 ID。
    async fn stale_sessions(&self, older_than: Duration) -> SinkResult<Vec<String>>;
}

/// Filesystem-backed sink rooted at the upload directory.
#[derive(Clone, Debug)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.staging_root()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn staged_path(&self, id: &str) -> SinkResult<PathBuf> {
        let id = Uuid::parse_str(id)
            .map_err(|_| SinkError::InvalidName(format!("resource id {id:?}")))?;
        Ok(self.staging_root().join(id.to_string()))
    }

    fn public_path(&self, name: &str) -> SinkResult<PathBuf> {
        validate_public_name(name)?;
        Ok(self.root.join(name))
    }
}

/// 校验公开文件名只包含一个普通路径分量。
pub fn validate_public_name(name: &str) -> SinkResult<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(segment)), None) if segment == name => Ok(()),
        _ => Err(SinkError::InvalidName(name.to_string())),
    }
}

async fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ByteSink for FsSink {
    async fn create(&self, id: &str, size: u64) -> SinkResult<()> {
        let path = self.staged_path(id)?;
        fs::create_dir_all(self.staging_root())
            .await
            .map_err(|err| SinkError::Allocation(err.to_string()))?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| SinkError::Allocation(err.to_string()))?;
        if let Err(err) = file.set_len(size).await {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(SinkError::Allocation(err.to_string()));
        }
        Ok(())
    }

    async fn write(&self, id: &str, offset: u64, bytes: &[u8]) -> SinkResult<()> {
        let path = self.staged_path(id)?;
        let mut file = match OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SinkError::Missing(id.to_string()));
            }
            Err(err) => return Err(SinkError::Io(err)),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> SinkResult<bool> {
        let path = self.staged_path(id)?;
        Ok(path_exists(&path).await?)
    }

    async fn delete(&self, id: &str) -> SinkResult<()> {
        let path = self.staged_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SinkError::Io(err)),
        }
    }

    async fn name_taken(&self, name: &str) -> SinkResult<bool> {
        let path = self.public_path(name)?;
        Ok(path_exists(&path).await?)
    }

    async fn rename(&self, id: &str, final_name: &str) -> SinkResult<()> {
        let source = self.staged_path(id)?;
        let target = self.public_path(final_name)?;
        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SinkError::Missing(id.to_string()))
            }
            Err(err) => Err(SinkError::Io(err)),
        }
    }

    fn namespace(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    async fn stale_sessions(&self, older_than: Duration) -> SinkResult<Vec<String>> {
        let staging = self.staging_root();
        if !path_exists(&staging).await? {
            return Ok(Vec::new());
        }

        let now = SystemTime::now();
        let mut stale = Vec::new();
        let mut dir = fs::read_dir(&staging).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Uuid::parse_str(&name).is_err() {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age >= older_than {
                stale.push(name);
            }
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_sink() -> (tempfile::TempDir, FsSink) {
        let temp = tempdir().expect("tempdir");
        let sink = FsSink::new(temp.path().join("uploads"));
        (temp, sink)
    }

    #[tokio::test]
    async fn create_preallocates_zeroed_region() {
        let (_temp, sink) = make_sink();
        let id = Uuid::new_v4().to_string();
        sink.create(&id, 8).await.expect("create");

        let contents = fs::read(sink.staged_path(&id).expect("path"))
            .await
            .expect("read");
        assert_eq!(contents, vec![0u8; 8]);
    }

    #[tokio::test]
    async fn write_lands_at_offset_and_leaves_rest_untouched() {
        let (_temp, sink) = make_sink();
        let id = Uuid::new_v4().to_string();
        sink.create(&id, 6).await.expect("create");
        sink.write(&id, 2, b"ab").await.expect("write");

        let contents = fs::read(sink.staged_path(&id).expect("path"))
            .await
            .expect("read");
        assert_eq!(contents, b"\0\0ab\0\0");
    }

    #[tokio::test]
    async fn write_to_missing_region_reports_missing() {
        let (_temp, sink) = make_sink();
        sink.ensure_root().await.expect("root");
        let id = Uuid::new_v4().to_string();
        let result = sink.write(&id, 0, b"x").await;
        assert!(matches!(result, Err(SinkError::Missing(_))));
    }

    #[tokio::test]
    async fn rename_publishes_under_public_name() {
        let (_temp, sink) = make_sink();
        let id = Uuid::new_v4().to_string();
        sink.create(&id, 3).await.expect("create");
        sink.write(&id, 0, b"abc").await.expect("write");
        assert!(!sink.name_taken("a.txt").await.expect("probe"));

        sink.rename(&id, "a.txt").await.expect("rename");
        assert!(sink.name_taken("a.txt").await.expect("probe"));
        assert!(!sink.exists(&id).await.expect("exists"));
        let contents = fs::read(sink.root_path().join("a.txt"))
            .await
            .expect("read");
        assert_eq!(contents, b"abc");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_temp, sink) = make_sink();
        let id = Uuid::new_v4().to_string();
        sink.create(&id, 1).await.expect("create");
        sink.delete(&id).await.expect("delete");
        sink.delete(&id).await.expect("delete again");
        assert!(!sink.exists(&id).await.expect("exists"));
    }

    #[tokio::test]
    async fn rejects_non_uuid_ids_and_path_like_names() {
        let (_temp, sink) = make_sink();
        assert!(matches!(
            sink.create("../escape", 1).await,
            Err(SinkError::InvalidName(_))
        ));
        for name in ["../a.txt", "dir/a.txt", "/abs", ".", "..", ""] {
            assert!(
                validate_public_name(name).is_err(),
                "{name:?} should be rejected"
            );
        }
        validate_public_name("report.final.pdf").expect("plain name");
    }

    #[tokio::test]
    async fn stale_sessions_lists_only_old_staged_regions() {
        let (_temp, sink) = make_sink();
        let id = Uuid::new_v4().to_string();
        sink.create(&id, 1).await.expect("create");

        let fresh = sink
            .stale_sessions(Duration::from_secs(3600))
            .await
            .expect("scan");
        assert!(fresh.is_empty());

        let all = sink.stale_sessions(Duration::ZERO).await.expect("scan");
        assert_eq!(all, vec![id]);
    }
}
