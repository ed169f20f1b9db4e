//! 去重存储 / Dedup store
//!
//! 记录"已处理"标记，带过期时间。调用方必须先完成副作用再打标记。
//! Holds "already processed" marks with a TTL. Callers mark only after the side effect is done.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ImError, ImResult};

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn contains(&self, key: &str) -> ImResult<bool>;

    async fn mark(&self, key: &str, ttl: Duration) -> ImResult<()>;

    /// 不存在时写入，返回是否由本次写入 / Insert when absent, true when this call inserted
    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> ImResult<bool>;

    /// 清理过期标记 / Drop lapsed marks
    async fn purge_expired(&self) -> ImResult<usize>;
}

/// 离线落库去重键 / Key for "persisted to offline store"
pub fn persist_key(message_id: &str) -> String {
    format!("persist:{}", message_id)
}

/// 设备确认去重键 / Key for "acknowledged by this device"
pub fn ack_key(message_id: &str, user_id: &str, device_id: &str) -> String {
    format!("ack:{}:{}:{}", message_id, user_id, device_id)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn storage(e: sled::Error) -> ImError {
    ImError::transient("dedup", e)
}

/// sled 实现，过期时间存为墙钟毫秒 / sled-backed, expiry stored as wall-clock millis
pub struct SledDedup {
    tree: sled::Tree,
}

impl SledDedup {
    pub fn open(db: &sled::Db) -> ImResult<Self> {
        Ok(Self {
            tree: db.open_tree("dedup").map_err(storage)?,
        })
    }

    fn expiry(raw: &[u8]) -> i64 {
        <[u8; 8]>::try_from(raw)
            .map(i64::from_be_bytes)
            .unwrap_or(0)
    }

    fn encode(ttl: Duration) -> [u8; 8] {
        (now_ms() + ttl.as_millis() as i64).to_be_bytes()
    }
}

#[async_trait]
impl DedupStore for SledDedup {
    async fn contains(&self, key: &str) -> ImResult<bool> {
        Ok(self
            .tree
            .get(key.as_bytes())
            .map_err(storage)?
            .map(|v| Self::expiry(&v) > now_ms())
            .unwrap_or(false))
    }

    async fn mark(&self, key: &str, ttl: Duration) -> ImResult<()> {
        self.tree
            .insert(key.as_bytes(), &Self::encode(ttl)[..])
            .map_err(storage)?;
        Ok(())
    }

    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> ImResult<bool> {
        loop {
            let current = self.tree.get(key.as_bytes()).map_err(storage)?;
            if let Some(v) = &current {
                if Self::expiry(v) > now_ms() {
                    return Ok(false);
                }
            }
            let swapped = self
                .tree
                .compare_and_swap(key.as_bytes(), current, Some(&Self::encode(ttl)[..]))
                .map_err(storage)?;
            if swapped.is_ok() {
                return Ok(true);
            }
        }
    }

    async fn purge_expired(&self) -> ImResult<usize> {
        let now = now_ms();
        let mut removed = 0;
        for item in self.tree.iter() {
            let (k, v) = item.map_err(storage)?;
            if Self::expiry(&v) <= now {
                self.tree.remove(k).map_err(storage)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// 进程内实现 / In-process store
#[derive(Default)]
pub struct MemoryDedup {
    marks: DashMap<String, Instant>,
}

impl MemoryDedup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[async_trait]
impl DedupStore for MemoryDedup {
    async fn contains(&self, key: &str) -> ImResult<bool> {
        Ok(self
            .marks
            .get(key)
            .map(|exp| *exp > Instant::now())
            .unwrap_or(false))
    }

    async fn mark(&self, key: &str, ttl: Duration) -> ImResult<()> {
        self.marks.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> ImResult<bool> {
        let now = Instant::now();
        let mut entry = self.marks.entry(key.to_string()).or_insert(now);
        if *entry > now {
            return Ok(false);
        }
        *entry = now + ttl;
        Ok(true)
    }

    async fn purge_expired(&self) -> ImResult<usize> {
        let now = Instant::now();
        let before = self.marks.len();
        self.marks.retain(|_, exp| *exp > now);
        Ok(before - self.marks.len())
    }
}
