//! 会话模块
//!
//! 包含:
//! - 邀请码与分配器
//! - 传输会话状态
//! - 会话注册表（领取、完成、中止、过期回收）

pub mod code;
pub mod registry;
pub mod types;

pub use code::{CodeAllocator, CodeSpace, InviteCode};
pub use registry::SessionRegistry;
pub use types::{ClaimedSession, SessionState, TransferSession};
