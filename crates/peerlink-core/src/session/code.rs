//! 邀请码与邀请码分配器
//!
//! 邀请码是一个数字（同时可以作为端口号使用），只在当前存活的会话之间保证唯一。
//! 会话关闭或过期后，邀请码会被归还并可以再次分配。

use crate::error::RelayError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// 默认邀请码空间起点（IANA 动态端口范围）
///
/// 与 Linux 默认的临时端口范围（32768-60999）重叠，出站连接可能占用某个邀请码对应的端口。
/// peer 模式下建议把 `code_range_start`/`code_range_end` 配置到 32768 以下。
pub const DEFAULT_CODE_RANGE_START: u16 = 49152;
/// 默认邀请码空间终点（包含）
pub const DEFAULT_CODE_RANGE_END: u16 = 65535;

/// 随机碰撞多少次之后退化为线性扫描
const RANDOM_ATTEMPTS: usize = 32;

/// 邀请码
///
/// 在 JSON 中序列化为字符串，例如 `"54321"`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InviteCode(u16);

impl InviteCode {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InviteCode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RelayError::NotFound);
        }
        s.parse::<u16>()
            .map(InviteCode)
            .map_err(|_| RelayError::NotFound)
    }
}

impl Serialize for InviteCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InviteCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid invite code: {raw}")))
    }
}

/// 邀请码空间（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSpace {
    pub start: u16,
    pub end: u16,
}

impl CodeSpace {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, code: InviteCode) -> bool {
        (self.start..=self.end).contains(&code.value())
    }

    /// 空间内的邀请码总数；区间颠倒时为 0
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeSpace {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_RANGE_START, DEFAULT_CODE_RANGE_END)
    }
}

/// 邀请码分配器
pub struct CodeAllocator {
    space: CodeSpace,
    live: Mutex<HashSet<u16>>,
}

impl CodeAllocator {
    pub fn new(space: CodeSpace) -> Self {
        Self {
            space,
            live: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 分配一个当前未被使用的邀请码
    ///
    /// 先随机抽取，多次碰撞后线性扫描，保证空间耗尽时能准确返回
    /// [`RelayError::ExhaustedKeyspace`]。
    pub fn issue(&self) -> Result<InviteCode, RelayError> {
        if self.space.is_empty() {
            return Err(RelayError::ExhaustedKeyspace);
        }

        let mut live = self.lock();
        if live.len() >= self.space.len() {
            return Err(RelayError::ExhaustedKeyspace);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = rng.gen_range(self.space.start..=self.space.end);
            if live.insert(candidate) {
                return Ok(InviteCode(candidate));
            }
        }

        for candidate in self.space.start..=self.space.end {
            if live.insert(candidate) {
                return Ok(InviteCode(candidate));
            }
        }

        Err(RelayError::ExhaustedKeyspace)
    }

    /// 归还邀请码
    pub fn release(&self, code: InviteCode) {
        self.lock().remove(&code.value());
    }

    pub fn is_live(&self, code: InviteCode) -> bool {
        self.lock().contains(&code.value())
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.space.len()
    }

    pub fn space(&self) -> CodeSpace {
        self.space
    }
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new(CodeSpace::default())
    }
}
