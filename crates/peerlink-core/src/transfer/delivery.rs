//! 下载字节流
//!
//! [`DeliveryStream`] 包装被领取会话的字节流，并在结束时更新注册表：
//! `size` 字节全部交给 HTTP 层之后，在流被再次轮询到结尾（或被 HTTP 层按
//! `Content-Length` 释放）时 `finalize`；读取出错、提前结束或在字节发完之前被丢弃
//! （下载方断开）则 `abort_delivery`。

use log::{debug, warn};

use crate::session::{ClaimedSession, InviteCode, SessionRegistry};
use crate::transfer::source::PayloadReader;
use axum::body::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio_util::io::ReaderStream;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct DeliveryStream {
    inner: ReaderStream<PayloadReader>,
    registry: Arc<SessionRegistry>,
    session: ClaimedSession,
    sent: u64,
    finished: bool,
}

impl DeliveryStream {
    pub fn new(
        registry: Arc<SessionRegistry>,
        session: ClaimedSession,
        reader: PayloadReader,
    ) -> Self {
        let mut stream = Self {
            inner: ReaderStream::with_capacity(reader, CHUNK_SIZE),
            registry,
            session,
            sent: 0,
            finished: false,
        };
        // 空文件无需读取即已完成
        if stream.session.size() == 0 {
            stream.complete(true);
        }
        stream
    }

    pub fn code(&self) -> InviteCode {
        self.session.code
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    fn complete(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if success {
            self.registry.finalize(self.session.code);
        } else {
            self.registry.abort_delivery(self.session.code);
        }
    }
}

impl Stream for DeliveryStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let expected = this.session.size();
        if this.sent == expected {
            this.complete(true);
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(mut chunk)) => {
                let remaining = expected - this.sent;
                if chunk.len() as u64 > remaining {
                    // 对端多发的字节不转发
                    chunk.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
                }
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                warn!(
                    "Session {} read error after {} bytes: {}",
                    this.session.code, this.sent, e
                );
                this.complete(false);
                Poll::Ready(Some(Err(e)))
            }
            None => {
                warn!(
                    "Session {} source ended after {} of {} bytes",
                    this.session.code, this.sent, expected
                );
                this.complete(false);
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("payload truncated at {} of {} bytes", this.sent, expected),
                ))))
            }
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // 带 Content-Length 的响应在最后一块写出后不再轮询，直接释放字节流
        let delivered = self.sent == self.session.size();
        if !delivered {
            debug!(
                "Download of session {} dropped after {} bytes",
                self.session.code, self.sent
            );
        }
        self.complete(delivered);
    }
}
