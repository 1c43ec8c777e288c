//! 上传内容的临时存储
//!
//! 上传的文件先以流的方式写入 spool 目录下的临时文件，写入过程中实时检查大小上限。
//! [`StoredPayload`] 被最后一个持有者释放时删除临时文件，因此无论会话以何种方式结束，
//! 磁盘资源都会被回收。

use crate::error::RelayError;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// 文件名为空时使用的名称
pub const FALLBACK_FILENAME: &str = "unnamed-file";

const PAYLOAD_EXTENSION: &str = "payload";

/// 已落盘的上传内容
#[derive(Debug)]
pub struct StoredPayload {
    path: PathBuf,
    filename: String,
    size: u64,
    mime_type: String,
}

impl StoredPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// 以只读方式打开临时文件
    pub async fn open(&self) -> std::io::Result<File> {
        File::open(&self.path).await
    }
}

impl Drop for StoredPayload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed spooled payload {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove spooled payload {:?}: {}", self.path, e),
        }
    }
}

/// 临时存储目录
#[derive(Debug, Clone)]
pub struct PayloadSpool {
    dir: PathBuf,
    max_bytes: u64,
}

impl PayloadSpool {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// 确保目录存在，并清理上次运行遗留的 `*.payload` 文件
    ///
    /// 进程被强制结束时 [`StoredPayload`] 来不及释放，残留文件只能在下次启动时回收。
    /// 返回清理的文件数量。
    pub async fn prepare(&self) -> std::io::Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != PAYLOAD_EXTENSION) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove stale payload {:?}: {}", path, e),
            }
        }
        if removed > 0 {
            info!("Removed {} stale payload(s) from {:?}", removed, self.dir);
        }
        Ok(removed)
    }

    /// 将字节流写入新的临时文件
    ///
    /// 超过上限时立即中止并删除已写入的部分。
    pub async fn store<S, E>(&self, filename: &str, stream: S) -> Result<StoredPayload, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<RelayError>,
    {
        let filename = sanitize_filename(filename);
        let mut payload = StoredPayload {
            path: self
                .dir
                .join(format!("{}.{PAYLOAD_EXTENSION}", uuid::Uuid::new_v4())),
            mime_type: mime_guess::from_path(&filename)
                .first_or_octet_stream()
                .to_string(),
            filename,
            size: 0,
        };
        let mut file = File::create(&payload.path).await?;
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::<RelayError>::into)?;
            payload.size += chunk.len() as u64;
            if payload.size > self.max_bytes {
                warn!(
                    "Upload {:?} exceeded limit of {} bytes",
                    payload.filename, self.max_bytes
                );
                return Err(RelayError::PayloadTooLarge {
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(
            "Spooled {:?} ({} bytes) to {:?}",
            payload.filename, payload.size, payload.path
        );
        Ok(payload)
    }
}

/// 只保留路径的最后一段并去掉控制字符
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned.to_string()
    }
}
