//! 序列号生成器 / Sequence generator
//!
//! 每个会话目标一个单调计数器，持久化后才返回。
//! One monotonic counter per conversation target, durable before it is returned.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::error;

use crate::error::{ImError, ImResult};

#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// 原子地返回 `current + 1` / Atomically issue `current + 1`
    async fn next(&self, key: &str) -> ImResult<u64>;

    /// 已发放的最大值，未发放过为 0 / Highest issued value, 0 when none
    async fn current(&self, key: &str) -> ImResult<u64>;
}

/// sled 持久化实现 / sled-backed generator
pub struct SledSequence {
    tree: sled::Tree,
}

impl SledSequence {
    pub fn open(db: &sled::Db) -> ImResult<Self> {
        Ok(Self {
            tree: db.open_tree("sequences")?,
        })
    }
}

fn decode(raw: Option<&[u8]>) -> u64 {
    raw.and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn increment(old: Option<&[u8]>) -> Option<Vec<u8>> {
    Some((decode(old) + 1).to_be_bytes().to_vec())
}

// 生成器故障无法安全重试单个步骤，统一升级为 Fatal
// A failed generator step cannot be retried in place, escalate to Fatal
fn fatal(e: impl std::fmt::Display) -> ImError {
    error!(error = %e, "🔢 sequence store failure");
    ImError::Fatal(format!("sequence store: {}", e))
}

#[async_trait]
impl SequenceGenerator for SledSequence {
    async fn next(&self, key: &str) -> ImResult<u64> {
        let updated = self
            .tree
            .update_and_fetch(key.as_bytes(), increment)
            .map_err(fatal)?;
        let value = decode(updated.as_deref());
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || tree.flush())
            .await
            .map_err(fatal)?
            .map_err(fatal)?;
        Ok(value)
    }

    async fn current(&self, key: &str) -> ImResult<u64> {
        let raw = self.tree.get(key.as_bytes()).map_err(fatal)?;
        Ok(decode(raw.as_deref()))
    }
}

/// 进程内实现，不持久化，仅用于测试与单机演示
/// In-process generator without durability, for tests and single-process demos
#[derive(Default)]
pub struct MemorySequence {
    counters: DashMap<String, u64>,
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceGenerator for MemorySequence {
    async fn next(&self, key: &str) -> ImResult<u64> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn current(&self, key: &str) -> ImResult<u64> {
        Ok(self.counters.get(key).map(|c| *c).unwrap_or(0))
    }
}
