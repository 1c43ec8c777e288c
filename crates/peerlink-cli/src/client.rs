//! HTTP Client - 与中继服务通信

use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use peerlink_core::storage::sanitize_filename;
use peerlink_core::{InviteCode, UploadResponse};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// 服务器未给出文件名时使用的名称
const DEFAULT_DOWNLOAD_NAME: &str = "downloaded-file";

const INVALID_CODE_MESSAGE: &str = "Invalid invite code. Please check and try again.";
const PEER_UNREACHABLE_MESSAGE: &str =
    "Unable to connect to peer. Make sure the invite code is correct and the sender is online.";

pub struct RelayClient {
    base: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: server.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// 上传文件，返回邀请码
    pub async fn upload(&self, path: &Path) -> Result<InviteCode> {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), size)
            .file_name(name);
        let response = self
            .http
            .post(format!("{}/upload", self.base))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            bail!("Upload failed ({status}): {text}");
        }

        let body: UploadResponse = response.json().await?;
        Ok(body.port)
    }

    /// 下载文件到 `output_dir`，返回保存路径
    pub async fn download(&self, code: &str, output_dir: &Path) -> Result<PathBuf> {
        let response = self
            .http
            .get(format!("{}/download/{}", self.base, code.trim()))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::BAD_REQUEST => bail!(INVALID_CODE_MESSAGE),
            StatusCode::INTERNAL_SERVER_ERROR => bail!(PEER_UNREACHABLE_MESSAGE),
            other => bail!("Failed to download file ({other}). Please try again."),
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .map(|name| sanitize_filename(&name))
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string());

        tokio::fs::create_dir_all(output_dir).await?;
        let target = output_dir.join(&filename);
        let mut file = File::create(&target)
            .await
            .with_context(|| format!("Failed to create {}", target.display()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => file.write_all(&chunk).await?,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&target).await;
                    return Err(e).context("Transfer interrupted");
                }
            }
        }
        file.flush().await?;

        Ok(target)
    }
}

/// 从 `Content-Disposition` 中取出文件名，优先使用 `filename*`
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        if let Some(encoded) = param.strip_prefix("filename*=") {
            let encoded = encoded
                .strip_prefix("UTF-8''")
                .or_else(|| encoded.strip_prefix("utf-8''"))?;
            return percent_decode(encoded);
        }
        if let Some(raw) = param.strip_prefix("filename=") {
            plain = Some(raw.trim_matches('"').to_string());
        }
    }
    plain.filter(|name| !name.is_empty())
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
