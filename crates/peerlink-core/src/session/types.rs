//! 传输会话类型

use super::code::InviteCode;
use crate::storage::StoredPayload;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// 会话状态
///
/// `Armed → Delivering → Closed` 为成功路径，`Armed → Expired` 为超时路径，
/// 下载中断时 `Delivering → Closed`。终态不会再迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已上传，等待下载
    Armed,
    /// 正在下载
    Delivering,
    Closed,
    Expired,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Armed | SessionState::Delivering)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Armed => "armed",
            SessionState::Delivering => "delivering",
            SessionState::Closed => "closed",
            SessionState::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 注册表中的会话记录
#[derive(Debug)]
pub struct TransferSession {
    pub code: InviteCode,
    pub payload: Arc<StoredPayload>,
    pub state: SessionState,
    pub created_at: Instant,
    /// 会话离开注册表时取消，用于停止与会话绑定的后台任务
    pub cancel: CancellationToken,
}

impl TransferSession {
    pub fn new(code: InviteCode, payload: Arc<StoredPayload>) -> Self {
        Self {
            code,
            payload,
            state: SessionState::Armed,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// 成功领取后交给下载方的会话快照
#[derive(Debug, Clone)]
pub struct ClaimedSession {
    pub code: InviteCode,
    pub payload: Arc<StoredPayload>,
    pub cancel: CancellationToken,
}

impl ClaimedSession {
    pub fn filename(&self) -> &str {
        self.payload.filename()
    }

    pub fn size(&self) -> u64 {
        self.payload.size()
    }
}
