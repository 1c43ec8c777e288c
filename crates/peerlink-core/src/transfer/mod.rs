//! 文件传输模块
//!
//! 包含:
//! - HTTP 服务器 (`POST /upload`, `GET /download/:code`)
//! - 中继服务（上传 → 会话 → 下载）
//! - 字节来源：服务器临时文件或对端端口
//! - 带会话收尾的下载字节流

pub mod delivery;
pub mod http_server;
pub mod peer;
pub mod relay;
pub mod source;

pub use delivery::DeliveryStream;
pub use http_server::{RelayServer, UploadResponse};
pub use peer::PeerSource;
pub use relay::{Delivery, RelayService};
pub use source::{PayloadReader, PayloadSource, SpoolSource};
