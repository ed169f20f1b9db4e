//! 在线注册中心 / Presence registry
//!
//! 键为 `user_id/device_id`，值为承载会话的网关节点，绑定租约。
//! Keys are `user_id/device_id`, values are the hosting gateway node, bound to a lease.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::ImResult;

pub use memory::MemoryRegistry;

pub type LeaseId = u64;

/// 注册得到的租约句柄 / Lease handle returned by registration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub user_id: String,
    pub device_id: String,
    pub ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub user_id: String,
    pub device_id: String,
    pub gateway_node_id: String,
    pub lease_id: LeaseId,
}

impl RegistryEntry {
    pub fn key(&self) -> String {
        entry_key(&self.user_id, &self.device_id)
    }
}

pub fn entry_key(user_id: &str, device_id: &str) -> String {
    format!("{}/{}", user_id, device_id)
}

/// 注册中心变更事件 / Registry change event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Put(RegistryEntry),
    Deleted(RegistryEntry),
    Expired(RegistryEntry),
}

impl ChangeEvent {
    pub fn entry(&self) -> &RegistryEntry {
        match self {
            ChangeEvent::Put(e) | ChangeEvent::Deleted(e) | ChangeEvent::Expired(e) => e,
        }
    }

    pub fn is_removal(&self) -> bool {
        !matches!(self, ChangeEvent::Put(_))
    }
}

/// 按键前缀过滤的变更订阅 / Change subscription filtered by key prefix
pub struct Watcher {
    rx: broadcast::Receiver<ChangeEvent>,
    prefix: String,
}

impl Watcher {
    pub(crate) fn new(rx: broadcast::Receiver<ChangeEvent>, prefix: &str) -> Self {
        Self {
            rx,
            prefix: prefix.to_string(),
        }
    }

    /// 注册中心关闭时返回 `None` / `None` once the registry is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.entry().key().starts_with(&self.prefix) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("👀 registry watcher lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// 租约管理接口 / Lease manager interface
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// 同一 (user, device) 的旧条目被原子替换 / An older entry for the same (user, device) is replaced atomically
    async fn register(
        &self,
        user_id: &str,
        device_id: &str,
        gateway_node_id: &str,
        ttl: Duration,
    ) -> ImResult<Lease>;

    /// 续约，过期后返回 `LeaseExpired` / Extend the lease, `LeaseExpired` once it lapsed
    async fn renew(&self, lease: &Lease) -> ImResult<()>;

    /// 返回该用户全部未过期设备 / All unexpired devices of the user
    async fn lookup(&self, user_id: &str) -> ImResult<Vec<RegistryEntry>>;

    async fn deregister(&self, lease: &Lease) -> ImResult<()>;

    fn watch(&self, prefix: &str) -> Watcher;
}
