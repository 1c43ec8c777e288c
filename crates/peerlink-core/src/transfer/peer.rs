//! 对端端点
//!
//! 邀请码同时就是端口号：会话创建后在 `peer_host:邀请码` 上开启一次性 TCP 监听，
//! 下载请求被领取后再连接该端口，把收到的字节原样转发给下载方。
//!
//! # 协议
//!
//! 监听端先写一行 `Filename: <name>\n`，随后是完整的文件内容，然后关闭连接。

use log::{debug, info, warn};

use crate::error::RelayError;
use crate::session::{ClaimedSession, InviteCode};
use crate::storage::StoredPayload;
use crate::transfer::source::{PayloadReader, PayloadSource};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const HEADER_PREFIX: &str = "Filename: ";

/// 头部行的最大长度
const MAX_HEADER_LEN: usize = 4096;

pub struct PeerSource {
    host: IpAddr,
    connect_timeout: Duration,
}

impl PeerSource {
    pub fn new(host: IpAddr, connect_timeout: Duration) -> Self {
        Self {
            host,
            connect_timeout,
        }
    }

    fn endpoint(&self, code: InviteCode) -> SocketAddr {
        SocketAddr::new(self.host, code.value())
    }
}

#[async_trait]
impl PayloadSource for PeerSource {
    async fn arm(
        &self,
        code: InviteCode,
        payload: Arc<StoredPayload>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        let addr = self.endpoint(code);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RelayError::TransferFailure(format!("cannot open peer endpoint {addr}: {e}"))
        })?;

        info!("Peer endpoint for session {} listening on {}", code, addr);
        tokio::spawn(serve_once(code, listener, payload, cancel));
        Ok(())
    }

    async fn open(&self, session: &ClaimedSession) -> Result<PayloadReader, RelayError> {
        let addr = self.endpoint(session.code);
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RelayError::TransferFailure(format!("timed out connecting to {addr}")))?
            .map_err(|e| RelayError::TransferFailure(format!("peer {addr} unreachable: {e}")))?;

        let mut reader = BufReader::new(stream);
        let mut header = String::new();
        timeout(self.connect_timeout, read_header(&mut reader, &mut header))
            .await
            .map_err(|_| RelayError::TransferFailure("timed out waiting for peer header".into()))?
            .map_err(|e| RelayError::TransferFailure(format!("peer header: {e}")))?;

        let filename = parse_header(&header).ok_or_else(|| {
            RelayError::TransferFailure(format!("malformed peer header: {header:?}"))
        })?;
        if filename != session.filename() {
            return Err(RelayError::TransferFailure(format!(
                "peer announced {filename:?}, expected {:?}",
                session.filename()
            )));
        }

        debug!("Connected to peer endpoint {} for session {}", addr, session.code);
        Ok(Box::new(reader))
    }
}

async fn read_header(
    reader: &mut BufReader<TcpStream>,
    header: &mut String,
) -> std::io::Result<()> {
    let mut limited = (&mut *reader).take(MAX_HEADER_LEN as u64);
    let n = limited.read_line(header).await?;
    if n == 0 || !header.ends_with('\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed before sending a header",
        ));
    }
    Ok(())
}

/// 解析 `Filename: <name>\n`
pub fn parse_header(line: &str) -> Option<&str> {
    let name = line.strip_suffix('\n')?.strip_prefix(HEADER_PREFIX)?;
    let name = name.strip_suffix('\r').unwrap_or(name);
    if name.is_empty() { None } else { Some(name) }
}

/// 接受一个连接并发送文件，会话结束时放弃
async fn serve_once(
    code: InviteCode,
    listener: TcpListener,
    payload: Arc<StoredPayload>,
    cancel: CancellationToken,
) {
    let (mut stream, peer) = tokio::select! {
        () = cancel.cancelled() => {
            debug!("Peer endpoint for session {} closed before use", code);
            return;
        }
        accepted = listener.accept() => match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Peer endpoint for session {} failed to accept: {}", code, e);
                return;
            }
        }
    };
    drop(listener);
    debug!("Peer endpoint for session {} serving {}", code, peer);

    tokio::select! {
        () = cancel.cancelled() => {
            debug!("Peer transfer for session {} cancelled", code);
        }
        result = send_payload(&mut stream, &payload) => match result {
            Ok(sent) => debug!("Peer endpoint for session {} sent {} bytes", code, sent),
            Err(e) => warn!("Peer endpoint for session {} failed: {}", code, e),
        }
    }
}

async fn send_payload(stream: &mut TcpStream, payload: &StoredPayload) -> std::io::Result<u64> {
    stream
        .write_all(format!("{HEADER_PREFIX}{}\n", payload.filename()).as_bytes())
        .await?;
    let mut file = payload.open().await?;
    let sent = tokio::io::copy(&mut file, stream).await?;
    stream.shutdown().await?;
    Ok(sent)
}
