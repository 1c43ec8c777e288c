//! HTTP 中继服务器
//!
//! # 路由
//!
//! - `POST /upload`：multipart 字段 `file`，返回 `{"port": "<code>"}`
//! - `GET /download/:code`：返回文件内容，文件名放在 `Content-Disposition` 中

use log::{debug, error, info, warn};

use crate::config::{RelaySettings, TransferMode};
use crate::error::RelayError;
use crate::session::{InviteCode, SessionRegistry};
use crate::transfer::relay::RelayService;
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Linux 默认临时端口范围的起点
const EPHEMERAL_PORT_START: u16 = 32768;

/// multipart 分隔符和字段头的额外余量
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// 上传成功的响应
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub port: InviteCode,
}

/// 中继服务器
pub struct RelayServer {
    settings: RelaySettings,
    service: Arc<RelayService>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    serve_task: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(settings: RelaySettings) -> anyhow::Result<Self> {
        settings.validate()?;
        let service = Arc::new(RelayService::from_settings(&settings));
        Ok(Self {
            settings,
            service,
            shutdown: CancellationToken::new(),
            local_addr: None,
            serve_task: None,
        })
    }

    pub fn service(&self) -> &Arc<RelayService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.service.registry()
    }

    /// 实际监听的地址（启动后可用）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn router(&self) -> Router {
        router(
            Arc::clone(&self.service),
            self.settings.max_payload_bytes.saturating_add(MULTIPART_OVERHEAD),
        )
    }

    /// 启动服务器和过期清理任务，返回监听地址
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        self.service.spool().prepare().await?;
        if self.settings.mode == TransferMode::Peer
            && self.settings.code_range_end >= EPHEMERAL_PORT_START
        {
            warn!(
                "Invite code range {}-{} overlaps the ephemeral port range; peer endpoints may fail to bind",
                self.settings.code_range_start, self.settings.code_range_end
            );
        }

        let listener = TcpListener::bind(self.settings.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);

        self.registry()
            .spawn_sweeper(self.settings.sweep_interval(), self.shutdown.clone());

        let app = self.router();
        let shutdown = self.shutdown.clone();
        self.serve_task = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Relay server error: {}", e);
            }
        }));

        info!(
            "Relay server listening on {} (mode={}, max={} bytes, ttl={}s)",
            addr,
            self.settings.mode.name(),
            self.settings.max_payload_bytes,
            self.settings.session_ttl_secs
        );
        Ok(addr)
    }

    /// 停止接收新连接并清空注册表
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry().shutdown();
    }

    /// 等待服务器任务退出
    pub async fn stopped(&mut self) {
        if let Some(task) = self.serve_task.take()
            && let Err(e) = task.await
        {
            error!("Relay server task failed: {}", e);
        }
    }
}

pub fn router(service: Arc<RelayService>, body_limit: u64) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/download/:code", get(download_handler))
        .layer(DefaultBodyLimit::max(
            usize::try_from(body_limit).unwrap_or(usize::MAX),
        ))
        .with_state(service)
}

async fn upload_handler(
    State(service): State<Arc<RelayService>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, RelayError> {
    let limit = service.spool().max_bytes();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(&e, limit))?
    {
        if field.name() != Some("file") {
            debug!("Skipping multipart field {:?}", field.name());
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let body = field.map_err(move |e| multipart_error(&e, limit));
        let result = service.upload(&filename, body).await;
        drain(&mut multipart).await;
        return result.map(|code| Json(UploadResponse { port: code }));
    }

    Err(RelayError::Validation("Missing file field".into()))
}

/// 请求体超过 body limit 时 axum 报告 413，其余 multipart 错误都算请求不合法
fn multipart_error(e: &MultipartError, limit: u64) -> RelayError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        RelayError::PayloadTooLarge { limit }
    } else {
        RelayError::Validation(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// 读完剩余的请求体再响应，避免客户端在读到响应前连接被重置（总量受 body limit 约束）
async fn drain(multipart: &mut Multipart) {
    while let Ok(Some(mut field)) = multipart.next_field().await {
        while let Ok(Some(_)) = field.chunk().await {}
    }
}

async fn download_handler(
    State(service): State<Arc<RelayService>>,
    Path(raw_code): Path<String>,
) -> Result<Response, RelayError> {
    let code: InviteCode = raw_code.parse()?;
    let delivery = service.download(code).await?;

    info!(
        "Delivering session {}: {:?} ({} bytes)",
        delivery.code, delivery.filename, delivery.size
    );

    let headers = [
        (header::CONTENT_TYPE, delivery.mime_type.clone()),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&delivery.filename),
        ),
        (header::CONTENT_LENGTH, delivery.size.to_string()),
    ];
    Ok((headers, Body::from_stream(delivery.stream)).into_response())
}

/// 生成 `attachment; filename="..."`，非 ASCII 文件名额外附带 RFC 5987 `filename*`
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if filename.is_ascii() {
        return format!("attachment; filename=\"{fallback}\"");
    }

    let mut encoded = String::new();
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
