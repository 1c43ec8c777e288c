//! PeerLink Core Library
//!
//! 邀请码文件中转的核心实现：上传方拿到一个数字邀请码，下载方凭邀请码取走文件，
//! 每个邀请码只能使用一次。
//!
//! # 模块
//!
//! - **session**: 邀请码分配、会话状态与注册表
//! - **storage**: 上传内容的临时存储
//! - **transfer**: HTTP 服务器、中继服务与字节来源
//! - **config**: 中继配置
//!
//! # 使用示例
//!
//! ```ignore
//! use peerlink_core::{RelayServer, RelaySettings};
//!
//! let mut server = RelayServer::new(RelaySettings::load())?;
//! let addr = server.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! server.shutdown();
//! server.stopped().await;
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod storage;
pub mod transfer;

pub use config::{RelaySettings, TransferMode};
pub use error::RelayError;

// Session re-exports
pub use session::{
    ClaimedSession, CodeAllocator, CodeSpace, InviteCode, SessionRegistry, SessionState,
};

pub use storage::{PayloadSpool, StoredPayload};

// Transfer re-exports
pub use transfer::{
    Delivery, DeliveryStream, PayloadSource, PeerSource, RelayServer, RelayService, SpoolSource,
    UploadResponse,
};
