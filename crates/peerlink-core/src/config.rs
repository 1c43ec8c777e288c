//! 中继配置和持久化
//!
//! 提供监听地址、上传大小上限、会话过期时间和邀请码空间等设置的存储和读取。

use crate::session::code::{CodeSpace, DEFAULT_CODE_RANGE_END, DEFAULT_CODE_RANGE_START};
use anyhow::{Context, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 默认上传大小上限 (100 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// 下载字节流的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// 服务器缓存上传内容并直接回传
    #[default]
    Relay,
    /// 每个会话在 `端口 = 邀请码` 上开启一次性监听，下载时从该端口拉取
    Peer,
}

impl TransferMode {
    pub fn name(&self) -> &'static str {
        match self {
            TransferMode::Relay => "relay",
            TransferMode::Peer => "peer",
        }
    }
}

impl FromStr for TransferMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relay" => Ok(TransferMode::Relay),
            "peer" => Ok(TransferMode::Peer),
            other => bail!("unknown transfer mode: {other}"),
        }
    }
}

/// 中继设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// HTTP 监听地址
    pub bind_addr: SocketAddr,
    /// 单个上传的最大字节数
    pub max_payload_bytes: u64,
    /// 未被领取的会话存活时间（秒）
    pub session_ttl_secs: u64,
    /// 过期清理间隔（秒）
    pub sweep_interval_secs: u64,
    pub code_range_start: u16,
    pub code_range_end: u16,
    /// 上传内容的临时目录
    pub spool_dir: PathBuf,
    pub mode: TransferMode,
    /// peer 模式下监听器绑定和连接的地址
    pub peer_host: IpAddr,
    pub peer_connect_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            session_ttl_secs: 600,
            sweep_interval_secs: 30,
            code_range_start: DEFAULT_CODE_RANGE_START,
            code_range_end: DEFAULT_CODE_RANGE_END,
            spool_dir: std::env::temp_dir().join("peerlink"),
            mode: TransferMode::Relay,
            peer_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            peer_connect_timeout_secs: 5,
        }
    }
}

impl RelaySettings {
    /// 默认配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerlink")
            .join("relay.toml")
    }

    /// 加载默认路径下的设置（文件不存在或无法解析时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("{:#}, using defaults", e),
            }
        }
        Self::default()
    }

    /// 从指定路径加载设置，文件必须存在
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.code_range_start > self.code_range_end {
            bail!(
                "code range is empty: {}..={}",
                self.code_range_start,
                self.code_range_end
            );
        }
        if self.max_payload_bytes == 0 {
            bail!("max_payload_bytes must be greater than zero");
        }
        if self.session_ttl_secs == 0 {
            bail!("session_ttl_secs must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than zero");
        }
        if self.mode == TransferMode::Peer && self.code_range_start == 0 {
            bail!("peer mode cannot use port 0 as an invite code");
        }
        Ok(())
    }

    pub fn code_space(&self) -> CodeSpace {
        CodeSpace::new(self.code_range_start, self.code_range_end)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }
}
