//! 下载字节流的来源

use crate::error::RelayError;
use crate::session::{ClaimedSession, InviteCode};
use crate::storage::StoredPayload;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// 被领取会话的字节流
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// 决定下载方从哪里拿到字节
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// 会话创建后调用，用于准备与会话绑定的资源
    ///
    /// `cancel` 在会话离开注册表时被取消。
    async fn arm(
        &self,
        _code: InviteCode,
        _payload: Arc<StoredPayload>,
        _cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        Ok(())
    }

    /// 为已领取的会话打开字节流
    async fn open(&self, session: &ClaimedSession) -> Result<PayloadReader, RelayError>;
}

/// 直接读取服务器上的临时文件
pub struct SpoolSource;

#[async_trait]
impl PayloadSource for SpoolSource {
    async fn open(&self, session: &ClaimedSession) -> Result<PayloadReader, RelayError> {
        let file = session.payload.open().await.map_err(|e| {
            RelayError::TransferFailure(format!(
                "cannot open payload for session {}: {e}",
                session.code
            ))
        })?;
        Ok(Box::new(file))
    }
}
