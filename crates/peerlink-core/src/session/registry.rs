//! 会话注册表
//!
//! 邀请码到会话的唯一映射，负责会话的存活判定和一次性领取。
//!
//! 所有状态迁移都在同一把互斥锁内完成，锁不会跨越 `.await`，数据传输本身不持有锁。

use super::code::{CodeAllocator, CodeSpace, InviteCode};
use super::types::{ClaimedSession, SessionState, TransferSession};
use crate::error::RelayError;
use crate::storage::StoredPayload;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<InviteCode, TransferSession>>,
    allocator: CodeAllocator,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(space: CodeSpace, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            allocator: CodeAllocator::new(space),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InviteCode, TransferSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 创建一个处于 `Armed` 状态的新会话并返回其邀请码
    pub fn create(&self, payload: Arc<StoredPayload>) -> Result<InviteCode, RelayError> {
        let code = self.allocator.issue()?;
        let size = payload.size();
        let filename = payload.filename().to_string();

        self.lock().insert(code, TransferSession::new(code, payload));

        info!("Session {} armed: {:?} ({} bytes)", code, filename, size);
        Ok(code)
    }

    /// 原子地领取会话：只有 `Armed` 且未超时的会话可以被领取，且只有一个调用者会成功
    pub fn claim(&self, code: InviteCode) -> Result<ClaimedSession, RelayError> {
        self.claim_at(code, Instant::now())
    }

    fn claim_at(&self, code: InviteCode, now: Instant) -> Result<ClaimedSession, RelayError> {
        let expired = {
            let mut sessions = self.lock();
            let session = sessions.get_mut(&code).ok_or(RelayError::NotFound)?;

            if session.state != SessionState::Armed {
                debug!("Session {} is {}, claim rejected", code, session.state);
                return Err(RelayError::NotFound);
            }

            if now.saturating_duration_since(session.created_at) < self.ttl {
                session.state = SessionState::Delivering;
                debug!("Session {} claimed", code);
                return Ok(ClaimedSession {
                    code,
                    payload: session.payload.clone(),
                    cancel: session.cancel.clone(),
                });
            }

            sessions.remove(&code)
        };

        // 超时但还没被清理任务回收
        if let Some(session) = expired {
            info!("Session {} expired before claim", code);
            self.retire(session, SessionState::Expired);
        }
        Err(RelayError::NotFound)
    }

    /// 下载完成：`Delivering → Closed`
    pub fn finalize(&self, code: InviteCode) -> bool {
        self.close_delivering(code, "delivered")
    }

    /// 下载中途失败：`Delivering → Closed`，不会回到 `Armed`
    pub fn abort_delivery(&self, code: InviteCode) -> bool {
        self.close_delivering(code, "aborted")
    }

    fn close_delivering(&self, code: InviteCode, outcome: &str) -> bool {
        match self.remove_if(code, SessionState::Delivering) {
            Some(session) => {
                info!("Session {} {}", code, outcome);
                self.retire(session, SessionState::Closed);
                true
            }
            None => false,
        }
    }

    /// 丢弃一个尚未被领取的会话（例如对端监听器无法启动）
    pub fn discard(&self, code: InviteCode) -> bool {
        match self.remove_if(code, SessionState::Armed) {
            Some(session) => {
                info!("Session {} discarded", code);
                self.retire(session, SessionState::Closed);
                true
            }
            None => false,
        }
    }

    /// 撤回一个尚未被领取的会话，但邀请码继续占用
    ///
    /// 调用者负责之后通过 [`CodeAllocator::release`] 归还邀请码。
    pub fn withdraw(&self, code: InviteCode) -> bool {
        match self.remove_if(code, SessionState::Armed) {
            Some(mut session) => {
                session.state = SessionState::Closed;
                session.cancel.cancel();
                info!("Session {} withdrawn, code held back", code);
                true
            }
            None => false,
        }
    }

    /// 仅当会话处于 `expected` 状态时将其移出映射表
    fn remove_if(&self, code: InviteCode, expected: SessionState) -> Option<TransferSession> {
        let mut sessions = self.lock();
        let matches = sessions.get(&code).is_some_and(|s| s.state == expected);
        if matches { sessions.remove(&code) } else { None }
    }

    /// 回收所有超时的 `Armed` 会话，返回回收数量
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        let expired: Vec<TransferSession> = {
            let mut sessions = self.lock();
            let codes: Vec<InviteCode> = sessions
                .values()
                .filter(|s| {
                    s.state == SessionState::Armed
                        && now.saturating_duration_since(s.created_at) >= self.ttl
                })
                .map(|s| s.code)
                .collect();
            codes
                .into_iter()
                .filter_map(|code| sessions.remove(&code))
                .collect()
        };

        let count = expired.len();
        for session in expired {
            self.retire(session, SessionState::Expired);
        }
        if count > 0 {
            info!("Expired {} idle session(s)", count);
        }
        count
    }

    /// 启动后台过期清理任务，`shutdown` 被取消时退出
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Session sweeper stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        registry.sweep_expired();
                    }
                }
            }
        })
    }

    /// 关闭所有会话并归还全部邀请码
    pub fn shutdown(&self) {
        let drained: Vec<TransferSession> = self.lock().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            self.retire(session, SessionState::Closed);
        }
        info!("Session registry shut down ({} session(s) dropped)", count);
    }

    /// 会话已经离开映射表：取消后台任务并归还邀请码
    fn retire(&self, mut session: TransferSession, terminal: SessionState) {
        session.state = terminal;
        session.cancel.cancel();
        self.allocator.release(session.code);
        debug!("Session {} is now {}", session.code, session.state);
    }

    pub fn state(&self, code: InviteCode) -> Option<SessionState> {
        self.lock().get(&code).map(|s| s.state)
    }

    pub fn session_token(&self, code: InviteCode) -> Option<CancellationToken> {
        self.lock().get(&code).map(|s| s.cancel.clone())
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn allocator(&self) -> &CodeAllocator {
        &self.allocator
    }
}
