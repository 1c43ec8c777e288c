//! 集成测试 - HTTP 上传/下载协议
//!
//! 启动真实的 `RelayServer`（监听 127.0.0.1 随机端口），用 reqwest 模拟网页端的两个请求。

use peerlink_core::{RelaySettings, RelayServer, TransferMode, UploadResponse};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    server: RelayServer,
    base: String,
    client: reqwest::Client,
    spool: TempDir,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut RelaySettings)) -> Self {
        Self::start_in(tempfile::tempdir().unwrap(), configure).await
    }

    async fn start_in(spool: TempDir, configure: impl FnOnce(&mut RelaySettings)) -> Self {
        let mut settings = RelaySettings {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            spool_dir: spool.path().to_path_buf(),
            ..Default::default()
        };
        configure(&mut settings);

        let mut server = RelayServer::new(settings).unwrap();
        let addr = server.start().await.unwrap();
        Self {
            server,
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            spool,
        }
    }

    async fn upload(&self, filename: &str, data: Vec<u8>) -> reqwest::Response {
        let form = Form::new().part("file", Part::bytes(data).file_name(filename.to_string()));
        self.client
            .post(format!("{}/upload", self.base))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn upload_ok(&self, filename: &str, data: Vec<u8>) -> String {
        let response = self.upload(filename, data).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: UploadResponse = response.json().await.unwrap();
        body.port.to_string()
    }

    async fn download(&self, code: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/download/{code}", self.base))
            .send()
            .await
            .unwrap()
    }

    fn spooled_files(&self) -> usize {
        std::fs::read_dir(self.spool.path()).unwrap().count()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 上传 report.pdf → {"port":"54321"} → 下载成功 → 再次下载 400
#[tokio::test]
async fn test_report_pdf_scenario() {
    let harness = Harness::start(|s| {
        s.code_range_start = 54321;
        s.code_range_end = 54321;
    })
    .await;
    let data = sample(1_048_576);

    let response = harness.upload("report.pdf", data.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json, serde_json::json!({ "port": "54321" }));

    let response = harness.download("54321").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"report.pdf\""
    );
    assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 1_048_576);
    assert_eq!(body.as_ref(), data.as_slice());

    let response = harness.download("54321").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "Invalid invite code");

    assert_eq!(harness.server.registry().live_count(), 0);
    assert_eq!(harness.spooled_files(), 0);
}

/// 从未发放过的邀请码和格式错误的邀请码都返回 400
#[tokio::test]
async fn test_unknown_codes_are_bad_requests() {
    let harness = Harness::start(|_| {}).await;

    for code in ["99999", "49152", "abc", "12%2034"] {
        let response = harness.download(code).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "code {code}");
        assert_eq!(response.text().await.unwrap(), "Invalid invite code");
    }
}

/// 空文件可以上传并且只能下载一次
#[tokio::test]
async fn test_empty_file_roundtrip() {
    let harness = Harness::start(|_| {}).await;

    let code = harness.upload_ok("empty.txt", Vec::new()).await;

    let response = harness.download(&code).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.bytes().await.unwrap().is_empty());

    assert_eq!(
        harness.download(&code).await.status(),
        StatusCode::BAD_REQUEST
    );
}

/// 超过上限的上传被拒绝，且不分配邀请码、不留下临时文件
#[tokio::test]
async fn test_oversized_upload_issues_no_code() {
    let harness = Harness::start(|s| s.max_payload_bytes = 1024).await;

    let response = harness.upload("big.bin", sample(4096)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(harness.server.registry().live_count(), 0);
    assert_eq!(harness.server.registry().allocator().live_count(), 0);
    assert_eq!(harness.spooled_files(), 0);

    // 上限以内仍然可以上传
    harness.upload_ok("small.bin", sample(1024)).await;
}

/// 在 `file` 之前塞入超大的其他字段同样按超限处理
#[tokio::test]
async fn test_oversized_extra_field_is_payload_too_large() {
    let harness = Harness::start(|s| s.max_payload_bytes = 1024).await;

    let form = Form::new()
        .text("note", "x".repeat(70_000))
        .part("file", Part::bytes(sample(16)).file_name("small.bin"));
    let response = harness
        .client
        .post(format!("{}/upload", harness.base))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.server.registry().live_count(), 0);
    assert_eq!(harness.spooled_files(), 0);
}

/// 缺少 `file` 字段时返回 400
#[tokio::test]
async fn test_missing_file_field() {
    let harness = Harness::start(|_| {}).await;

    let form = Form::new().text("note", "no file here");
    let response = harness
        .client
        .post(format!("{}/upload", harness.base))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.server.registry().live_count(), 0);
}

/// 会话超时后下载返回 400
#[tokio::test]
async fn test_expired_session_is_not_downloadable() {
    let harness = Harness::start(|s| s.session_ttl_secs = 1).await;

    let code = harness.upload_ok("late.txt", b"too late".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(
        harness.download(&code).await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(harness.server.registry().live_count(), 0);
    assert_eq!(harness.spooled_files(), 0);
}

/// 同一邀请码的并发下载只有一个成功
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_downloads_single_winner() {
    let harness = Harness::start(|_| {}).await;
    let data = sample(256 * 1024);
    let code = harness.upload_ok("shared.bin", data.clone()).await;

    let attempts = (0..8).map(|_| harness.download(&code));
    let responses = futures_util::future::join_all(attempts).await;

    let mut winners = 0;
    for response in responses {
        match response.status() {
            StatusCode::OK => {
                winners += 1;
                assert_eq!(response.bytes().await.unwrap().as_ref(), data.as_slice());
            }
            StatusCode::BAD_REQUEST => {}
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(winners, 1);
}

/// 邀请码在会话结束后可以被再次分配
#[tokio::test]
async fn test_code_is_reused_after_delivery() {
    let harness = Harness::start(|s| {
        s.code_range_start = 50000;
        s.code_range_end = 50000;
    })
    .await;

    let first = harness.upload_ok("one.txt", b"one".to_vec()).await;
    assert_eq!(
        harness.upload("two.txt", b"two".to_vec()).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    let response = harness.download(&first).await;
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"one");

    let second = harness.upload_ok("two.txt", b"two".to_vec()).await;
    assert_eq!(first, second);
    let response = harness.download(&second).await;
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"two.txt\""
    );
}

/// peer 模式：邀请码即端口，下载经由对端端点转发
#[tokio::test]
async fn test_peer_mode_roundtrip() {
    let harness = Harness::start(|s| {
        s.mode = TransferMode::Peer;
        s.code_range_start = 21000;
        s.code_range_end = 21999;
    })
    .await;
    let data = sample(300_000);

    let code = harness.upload_ok("peer.bin", data.clone()).await;

    let response = harness.download(&code).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"peer.bin\""
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), data.as_slice());

    assert_eq!(
        harness.download(&code).await.status(),
        StatusCode::BAD_REQUEST
    );
}

/// peer 模式：对端不可达时返回 500，且邀请码随之失效
#[tokio::test]
async fn test_peer_unreachable_is_server_error() {
    let harness = Harness::start(|s| {
        s.mode = TransferMode::Peer;
        s.code_range_start = 22000;
        s.code_range_end = 22999;
        s.peer_connect_timeout_secs = 1;
    })
    .await;

    let code = harness.upload_ok("gone.bin", sample(1000)).await;
    let parsed = code.parse().unwrap();

    // 模拟上传方离线：关闭对端监听
    harness
        .server
        .registry()
        .session_token(parsed)
        .unwrap()
        .cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.download(&code).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        harness.download(&code).await.status(),
        StatusCode::BAD_REQUEST
    );
    assert!(!harness.server.registry().allocator().is_live(parsed));
}

/// peer 模式：某个邀请码的端口被占用时，上传换用其他邀请码
#[tokio::test]
async fn test_peer_mode_skips_occupied_port() {
    let _occupied = std::net::TcpListener::bind("127.0.0.1:24000").unwrap();
    let harness = Harness::start(|s| {
        s.mode = TransferMode::Peer;
        s.code_range_start = 24000;
        s.code_range_end = 24001;
    })
    .await;

    for round in 0..20 {
        let data = sample(1000 + round);
        let code = harness.upload_ok("busy.bin", data.clone()).await;
        assert_eq!(code, "24001", "round {round}");

        let response = harness.download(&code).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.bytes().await.unwrap().as_ref(), data.as_slice());
    }

    assert_eq!(harness.server.registry().allocator().live_count(), 0);
}

/// 启动时清理上次运行遗留在 spool 目录里的临时文件
#[tokio::test]
async fn test_stale_payloads_removed_on_start() {
    let spool = tempfile::tempdir().unwrap();
    std::fs::write(spool.path().join("0000-stale.payload"), sample(4096)).unwrap();

    let harness = Harness::start_in(spool, |_| {}).await;
    assert_eq!(harness.spooled_files(), 0);

    let code = harness.upload_ok("fresh.txt", b"fresh".to_vec()).await;
    assert_eq!(harness.spooled_files(), 1);
    assert_eq!(
        harness.download(&code).await.bytes().await.unwrap().as_ref(),
        b"fresh"
    );
}
