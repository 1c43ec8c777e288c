//! PeerLink Server
//!
//! 中继服务进程，负责：
//! - 加载配置 (`relay.toml`) 并应用命令行覆盖
//! - HTTP 上传/下载服务
//! - 后台过期会话清理
//! - 收到 SIGINT / SIGTERM 后停止服务并清理所有会话

use anyhow::Result;
use clap::Parser;
use peerlink_core::{RelayServer, RelaySettings, TransferMode};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerlink-server", version, about = "PeerLink - 邀请码文件中转服务")]
struct Args {
    /// 配置文件路径 (默认: ~/.config/peerlink/relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// 监听地址
    #[arg(short, long)]
    bind: Option<SocketAddr>,
    /// 传输模式 (relay, peer)
    #[arg(short, long)]
    mode: Option<TransferMode>,
    /// 上传大小上限 (MiB)
    #[arg(long)]
    max_payload_mb: Option<u64>,
    /// 未领取会话的存活时间 (秒)
    #[arg(long)]
    ttl_secs: Option<u64>,
}

impl Args {
    fn settings(&self) -> Result<RelaySettings> {
        let mut settings = match &self.config {
            Some(path) => RelaySettings::load_from(path)?,
            None => RelaySettings::load(),
        };

        if let Some(bind) = self.bind {
            settings.bind_addr = bind;
        }
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(mb) = self.max_payload_mb {
            settings.max_payload_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(ttl) = self.ttl_secs {
            settings.session_ttl_secs = ttl;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（peerlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerlink_core=debug")),
        )
        .try_init();

    let args = Args::parse();
    let settings = args.settings()?;
    tracing::debug!("Effective settings: {:?}", settings);

    tracing::info!("PeerLink server starting...");
    let mut server = RelayServer::new(settings)?;
    let addr = server.start().await?;
    tracing::info!("Ready on http://{}", addr);

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down...");
    server.shutdown();
    server.stopped().await;

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            result = tokio::signal::ctrl_c() => result?,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
