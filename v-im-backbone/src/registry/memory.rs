use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ChangeEvent, Lease, LeaseId, LeaseManager, RegistryEntry, Watcher};
use crate::error::{ImError, ImResult};

struct LeaseRecord {
    entry: RegistryEntry,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    // user_id -> device_id -> record
    users: HashMap<String, HashMap<String, LeaseRecord>>,
    // lease_id -> (user_id, device_id)
    leases: HashMap<LeaseId, (String, String)>,
}

impl State {
    fn remove(&mut self, user_id: &str, device_id: &str) -> Option<LeaseRecord> {
        let devices = self.users.get_mut(user_id)?;
        let record = devices.remove(device_id)?;
        if devices.is_empty() {
            self.users.remove(user_id);
        }
        self.leases.remove(&record.entry.lease_id);
        Some(record)
    }
}

/// 进程内租约注册中心 / In-process lease registry
///
/// 过期判定基于 `tokio::time`，过期条目在读取时即不可见，
/// 后台回收器负责删除并发出 `Expired` 事件。
/// Expiry uses `tokio::time`; lapsed entries are invisible to reads right away and
/// the reaper removes them and emits `Expired`.
pub struct MemoryRegistry {
    state: Mutex<State>,
    next_lease: AtomicU64,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            next_lease: AtomicU64::new(1),
            events,
        }
    }

    fn emit(&self, events: Vec<ChangeEvent>) {
        for ev in events {
            // 无订阅者时发送失败，忽略 / Fails only without subscribers
            let _ = self.events.send(ev);
        }
    }

    /// 删除已过期条目，返回数量 / Remove lapsed entries, returns how many
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RegistryEntry> = {
            let mut state = self.state.lock();
            let lapsed: Vec<(String, String)> = state
                .users
                .iter()
                .flat_map(|(user, devices)| {
                    devices
                        .iter()
                        .filter(move |(_, r)| r.expires_at <= now)
                        .map(move |(device, _)| (user.clone(), device.clone()))
                })
                .collect();
            lapsed
                .into_iter()
                .filter_map(|(u, d)| state.remove(&u, &d))
                .map(|r| r.entry)
                .collect()
        };
        let count = expired.len();
        if count > 0 {
            info!(count, "⌛ expired registry entries reaped");
        }
        self.emit(expired.into_iter().map(ChangeEvent::Expired).collect());
        count
    }

    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => { registry.reap_expired(); }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.state.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseManager for MemoryRegistry {
    async fn register(
        &self,
        user_id: &str,
        device_id: &str,
        gateway_node_id: &str,
        ttl: Duration,
    ) -> ImResult<Lease> {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let entry = RegistryEntry {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            gateway_node_id: gateway_node_id.to_string(),
            lease_id: id,
        };
        let mut events = Vec::with_capacity(2);
        {
            let mut state = self.state.lock();
            if let Some(old) = state.remove(user_id, device_id) {
                debug!(
                    "🔁 registry entry {} moved {} -> {}",
                    old.entry.key(),
                    old.entry.gateway_node_id,
                    gateway_node_id
                );
                events.push(ChangeEvent::Deleted(old.entry));
            }
            state
                .leases
                .insert(id, (user_id.to_string(), device_id.to_string()));
            state.users.entry(user_id.to_string()).or_default().insert(
                device_id.to_string(),
                LeaseRecord {
                    entry: entry.clone(),
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        events.push(ChangeEvent::Put(entry));
        self.emit(events);
        Ok(Lease {
            id,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            ttl,
        })
    }

    async fn renew(&self, lease: &Lease) -> ImResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let record = state
            .users
            .get_mut(&lease.user_id)
            .and_then(|d| d.get_mut(&lease.device_id))
            .filter(|r| r.entry.lease_id == lease.id && r.expires_at > now)
            .ok_or(ImError::LeaseExpired(lease.id))?;
        record.expires_at = now + record.ttl;
        Ok(())
    }

    async fn lookup(&self, user_id: &str) -> ImResult<Vec<RegistryEntry>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .users
            .get(user_id)
            .map(|devices| {
                devices
                    .values()
                    .filter(|r| r.expires_at > now)
                    .map(|r| r.entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn deregister(&self, lease: &Lease) -> ImResult<()> {
        let removed = {
            let mut state = self.state.lock();
            let owns = state
                .leases
                .get(&lease.id)
                .map(|(u, d)| u == &lease.user_id && d == &lease.device_id)
                .unwrap_or(false);
            if owns {
                state.remove(&lease.user_id, &lease.device_id)
            } else {
                None
            }
        };
        if let Some(record) = removed {
            self.emit(vec![ChangeEvent::Deleted(record.entry)]);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher::new(self.events.subscribe(), prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(90);

    #[tokio::test]
    async fn lookup_returns_every_device() {
        let reg = MemoryRegistry::new();
        reg.register("u1", "phone", "gw-1", TTL).await.unwrap();
        reg.register("u1", "laptop", "gw-2", TTL).await.unwrap();
        let mut nodes: Vec<String> = reg
            .lookup("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.gateway_node_id)
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["gw-1", "gw-2"]);
        assert!(reg.lookup("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reregistration_replaces_and_old_lease_cannot_renew() {
        let reg = MemoryRegistry::new();
        let mut watcher = reg.watch("u1/");
        let old = reg.register("u1", "phone", "gw-1", TTL).await.unwrap();
        let new = reg.register("u1", "phone", "gw-2", TTL).await.unwrap();

        let entries = reg.lookup("u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gateway_node_id, "gw-2");
        assert!(matches!(reg.renew(&old).await, Err(ImError::LeaseExpired(_))));
        reg.renew(&new).await.unwrap();

        // 旧租约注销不影响新条目 / Deregistering the old lease leaves the new one alone
        reg.deregister(&old).await.unwrap();
        assert_eq!(reg.lookup("u1").await.unwrap().len(), 1);

        assert!(matches!(watcher.recv().await, Some(ChangeEvent::Put(_))));
        match watcher.recv().await {
            Some(ChangeEvent::Deleted(e)) => assert_eq!(e.gateway_node_id, "gw-1"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(watcher.recv().await, Some(ChangeEvent::Put(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_lapse_without_renewal() {
        let reg = MemoryRegistry::new();
        let mut watcher = reg.watch("");
        let lease = reg.register("u1", "phone", "gw-1", TTL).await.unwrap();
        let _ = watcher.recv().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        reg.renew(&lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(reg.lookup("u1").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(reg.lookup("u1").await.unwrap().is_empty());
        assert!(reg.renew(&lease).await.is_err());
        assert_eq!(reg.reap_expired(), 1);
        assert!(matches!(watcher.recv().await, Some(ChangeEvent::Expired(_))));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn watcher_filters_by_prefix() {
        let reg = MemoryRegistry::new();
        let mut watcher = reg.watch("u2/");
        reg.register("u1", "d", "gw-1", TTL).await.unwrap();
        reg.register("u2", "d", "gw-1", TTL).await.unwrap();
        assert_eq!(watcher.recv().await.unwrap().entry().user_id, "u2");
    }
}
