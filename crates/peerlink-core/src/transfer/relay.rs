//! 中继服务
//!
//! 上传：写入临时存储 → 创建会话 → 准备字节来源 → 返回邀请码。
//! 下载：领取会话 → 打开字节来源 → 返回会在结束时更新注册表的字节流。

use log::{info, warn};

use crate::config::{RelaySettings, TransferMode};
use crate::error::RelayError;
use crate::session::{InviteCode, SessionRegistry};
use crate::storage::{PayloadSpool, StoredPayload};
use crate::transfer::delivery::DeliveryStream;
use crate::transfer::peer::PeerSource;
use crate::transfer::source::{PayloadSource, SpoolSource};
use axum::body::Bytes;
use futures_util::Stream;
use std::sync::Arc;

/// peer 模式下端口绑定失败时换码重试的次数
const ARM_ATTEMPTS: usize = 3;

/// 一次已领取的下载
pub struct Delivery {
    pub code: InviteCode,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub stream: DeliveryStream,
}

pub struct RelayService {
    registry: Arc<SessionRegistry>,
    spool: PayloadSpool,
    source: Arc<dyn PayloadSource>,
}

impl RelayService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        spool: PayloadSpool,
        source: Arc<dyn PayloadSource>,
    ) -> Self {
        Self {
            registry,
            spool,
            source,
        }
    }

    pub fn from_settings(settings: &RelaySettings) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            settings.code_space(),
            settings.session_ttl(),
        ));
        let spool = PayloadSpool::new(&settings.spool_dir, settings.max_payload_bytes);
        let source: Arc<dyn PayloadSource> = match settings.mode {
            TransferMode::Relay => Arc::new(SpoolSource),
            TransferMode::Peer => Arc::new(PeerSource::new(
                settings.peer_host,
                settings.peer_connect_timeout(),
            )),
        };
        Self::new(registry, spool, source)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn spool(&self) -> &PayloadSpool {
        &self.spool
    }

    /// 接收上传内容并返回邀请码
    ///
    /// 超过大小上限时不会创建会话，也不会分配邀请码。
    pub async fn upload<S, E>(&self, filename: &str, body: S) -> Result<InviteCode, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<RelayError>,
    {
        let payload = Arc::new(self.spool.store(filename, body).await?);

        // 端口无法绑定的邀请码在本次上传结束前保持占用，保证每次重试换一个新码
        let mut rejected = Vec::new();
        let result = self.arm_session(&payload, &mut rejected).await;
        for code in rejected {
            self.registry.allocator().release(code);
        }
        result
    }

    async fn arm_session(
        &self,
        payload: &Arc<StoredPayload>,
        rejected: &mut Vec<InviteCode>,
    ) -> Result<InviteCode, RelayError> {
        let mut last_error = RelayError::ExhaustedKeyspace;
        for attempt in 1..=ARM_ATTEMPTS {
            let code = self.registry.create(Arc::clone(payload))?;
            let Some(cancel) = self.registry.session_token(code) else {
                return Err(RelayError::TransferFailure(format!(
                    "session {code} vanished before it was armed"
                )));
            };

            match self.source.arm(code, Arc::clone(payload), cancel).await {
                Ok(()) => {
                    info!(
                        "Upload {:?} ({} bytes) is available under code {}",
                        payload.filename(),
                        payload.size(),
                        code
                    );
                    return Ok(code);
                }
                Err(e) => {
                    warn!("Failed to arm session {} (attempt {}): {}", code, attempt, e);
                    if self.registry.withdraw(code) {
                        rejected.push(code);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// 领取会话并打开字节流
    pub async fn download(&self, code: InviteCode) -> Result<Delivery, RelayError> {
        let session = self.registry.claim(code)?;

        let reader = match self.source.open(&session).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Session {} could not be delivered: {}", code, e);
                self.registry.abort_delivery(code);
                return Err(e);
            }
        };

        Ok(Delivery {
            code,
            filename: session.filename().to_string(),
            size: session.size(),
            mime_type: session.payload.mime_type().to_string(),
            stream: DeliveryStream::new(Arc::clone(&self.registry), session, reader),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClaimedSession, CodeSpace};
    use crate::transfer::source::PayloadReader;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::collections::HashSet;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// 某些邀请码对应的端点永远无法启动
    struct BlockedSource {
        blocked: HashSet<u16>,
    }

    #[async_trait]
    impl PayloadSource for BlockedSource {
        async fn arm(
            &self,
            code: InviteCode,
            _payload: Arc<StoredPayload>,
            _cancel: CancellationToken,
        ) -> Result<(), RelayError> {
            if self.blocked.contains(&code.value()) {
                Err(RelayError::TransferFailure(format!("port {code} in use")))
            } else {
                Ok(())
            }
        }

        async fn open(&self, session: &ClaimedSession) -> Result<PayloadReader, RelayError> {
            SpoolSource.open(session).await
        }
    }

    fn service(dir: &std::path::Path, space: CodeSpace, blocked: &[u16]) -> RelayService {
        RelayService::new(
            Arc::new(SessionRegistry::new(space, Duration::from_secs(60))),
            PayloadSpool::new(dir, 1024),
            Arc::new(BlockedSource {
                blocked: blocked.iter().copied().collect(),
            }),
        )
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn test_failed_code_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), CodeSpace::new(23000, 23001), &[23000]);

        for _ in 0..40 {
            let code = service.upload("a.txt", body(b"abc")).await.unwrap();
            assert_eq!(code.value(), 23001);

            // 被拒绝的邀请码在上传结束后归还
            assert_eq!(service.registry().allocator().live_count(), 1);

            let delivery = service.download(code).await.unwrap();
            drop(delivery);
            assert_eq!(service.registry().allocator().live_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_every_code_blocked_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(
            dir.path(),
            CodeSpace::new(23000, 23009),
            &(23000..=23009).collect::<Vec<_>>(),
        );

        let result = service.upload("a.txt", body(b"abc")).await;
        assert!(matches!(result, Err(RelayError::TransferFailure(_))));
        assert_eq!(service.registry().live_count(), 0);
        assert_eq!(service.registry().allocator().live_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_keyspace_exhausted_by_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), CodeSpace::new(23000, 23000), &[23000]);

        let result = service.upload("a.txt", body(b"abc")).await;
        assert!(matches!(result, Err(RelayError::ExhaustedKeyspace)));
        assert_eq!(service.registry().allocator().live_count(), 0);
    }
}
