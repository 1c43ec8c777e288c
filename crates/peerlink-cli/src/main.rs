//! PeerLink CLI
//!
//! 命令行客户端，通过 HTTP 与中继服务通信

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "peerlink", version, about = "PeerLink - 用邀请码分享文件")]
struct Cli {
    /// 中继服务地址
    #[arg(short, long, global = true, default_value = "http://localhost:8080")]
    server: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 上传文件并获取邀请码
    Upload {
        /// 要分享的文件路径
        file: PathBuf,
    },
    /// 使用邀请码下载文件
    Download {
        /// 邀请码 (例如 54321)
        code: String,
        /// 保存目录 (默认: ~/Downloads)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = client::RelayClient::new(&cli.server);

    match cli.command {
        Commands::Upload { file } => {
            println!("📤 上传文件: {}", file.display());
            let code = client.upload(&file).await?;
            println!("✅ 邀请码: {}", code);
            println!("   对方可运行: peerlink download {}", code);
        }
        Commands::Download { code, output } => {
            let dir = output.unwrap_or_else(|| {
                dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
            });
            println!("📥 下载中 (保存到: {})", dir.display());
            let path = client.download(&code, &dir).await?;
            println!("✅ 已保存: {}", path.display());
        }
    }

    Ok(())
}
