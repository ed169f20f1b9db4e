//! 网关：持有客户端长连接、注册在线状态、推送消息
//! Gateway: holds client connections, registers presence and pushes messages

pub mod delivery;
pub mod fanout;
pub mod health;
pub mod membership;
pub mod session;

use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::dedup::{ack_key, DedupStore};
use crate::domain::{OfflineMessage, ServerFrame};
use crate::error::{ImError, ImResult};
use crate::registry::LeaseManager;
use crate::router::MessageRouter;
use crate::service::auth::Authenticator;
use crate::storage::Storage;

pub use membership::GroupMembershipCache;
pub use session::{ConnState, Identity, Session};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// 未鉴权连接的存活上限 / How long an unauthenticated connection may live
    pub auth_deadline: Duration,
    /// 推送后等待确认的时限，`None` 关闭回落 / Ack wait after a push, `None` disables the fallback
    pub ack_deadline: Option<Duration>,
    pub ack_ttl: Duration,
    pub idle_timeout: Duration,
    pub default_offline_page: usize,
    pub max_offline_page: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            auth_deadline: Duration::from_secs(5),
            ack_deadline: None,
            ack_ttl: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(90),
            default_offline_page: 50,
            max_offline_page: 200,
        }
    }
}

/// 网关依赖的共享基础设施 / Shared infrastructure a gateway depends on
#[derive(Clone)]
pub struct GatewayDeps {
    pub registry: Arc<dyn LeaseManager>,
    pub router: Arc<MessageRouter>,
    pub dedup: Arc<dyn DedupStore>,
    pub bus: Arc<dyn MessageBus>,
    pub membership: Arc<GroupMembershipCache>,
    pub authenticator: Arc<dyn Authenticator>,
    pub storage: Arc<Storage>,
}

pub struct Gateway {
    node_id: String,
    config: GatewayConfig,
    sessions: DashMap<String, Arc<Session>>,
    user_sessions: DashMap<String, HashSet<String>>, // uid -> session ids
    deps: GatewayDeps,
    shutdown_tx: watch::Sender<bool>,
}

fn close_message(reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: std::borrow::Cow::Owned(reason.to_string()),
    }))
}

impl Gateway {
    pub fn new(node_id: impl Into<String>, config: GatewayConfig, deps: GatewayDeps) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            sessions: DashMap::new(),
            user_sessions: DashMap::new(),
            deps,
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.deps.router
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.deps.storage
    }

    pub fn registry(&self) -> &Arc<dyn LeaseManager> {
        &self.deps.registry
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<Arc<Session>> {
        let ids: Vec<String> = self
            .user_sessions
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.session(id)).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn online_users(&self) -> usize {
        self.user_sessions.len()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// 新连接：发送欢迎帧并进入鉴权 / New connection: send welcome and start authenticating
    pub fn open_session(
        &self,
        addr: Option<SocketAddr>,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> ImResult<Arc<Session>> {
        let session = Arc::new(Session::new(addr, sender));
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        session.send_frame(&ServerFrame::Welcome {
            node_id: self.node_id.clone(),
            session_id: session.session_id.clone(),
        })?;
        session.transition(ConnState::Authenticating)?;
        info!(
            session_id = %session.session_id,
            node_id = %self.node_id,
            addr = ?addr,
            "✅ session opened"
        );
        Ok(session)
    }

    /// 校验令牌后注册 / Validate the token, then register
    pub async fn authenticate(
        self: &Arc<Self>,
        session: &Arc<Session>,
        token: &str,
        device_id: &str,
    ) -> ImResult<Identity> {
        if session.state() != ConnState::Authenticating {
            return Err(ImError::InvalidTransition {
                from: session.state(),
                to: ConnState::Registering,
            });
        }
        let user_id = match self.deps.authenticator.authenticate(token).await {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                let _ = session.send_frame(&ServerFrame::AuthFailed {
                    reason: "invalid token".to_string(),
                });
                self.close_session(&session.session_id, "auth failed").await;
                return Err(ImError::PermanentReject("invalid token".into()));
            }
            Err(e) => {
                let _ = session.send_frame(&ServerFrame::AuthFailed {
                    reason: e.to_string(),
                });
                self.close_session(&session.session_id, "auth unavailable").await;
                return Err(e);
            }
        };
        self.register_session(session, &user_id, device_id).await
    }

    /// 写入注册中心并开始续约 / Write the registry entry and start renewing it
    pub async fn register_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
        user_id: &str,
        device_id: &str,
    ) -> ImResult<Identity> {
        if device_id.trim().is_empty() {
            return Err(ImError::PermanentReject("device_id is required".into()));
        }
        session.transition(ConnState::Registering)?;

        // 同设备旧连接被新连接取代 / An older connection of the same device is superseded
        for old in self.sessions_of(user_id) {
            let same_device = old
                .identity()
                .map(|i| i.device_id == device_id)
                .unwrap_or(false);
            if same_device && old.session_id != session.session_id {
                self.kick(&old, "replaced by a newer connection").await;
            }
        }

        let lease = match self
            .deps
            .registry
            .register(user_id, device_id, &self.node_id, self.config.lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(user_id, device_id, error = %e, "⚠️ registry unavailable");
                let _ = session.send_frame(&ServerFrame::Error {
                    message_id: None,
                    reason: e.to_string(),
                    retry: true,
                });
                self.close_session(&session.session_id, "registration failed")
                    .await;
                return Err(e);
            }
        };

        let identity = Identity {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            lease: lease.clone(),
        };
        session.set_identity(identity.clone());
        self.user_sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session.session_id.clone());
        session.transition(ConnState::Connected)?;
        session.send_frame(&ServerFrame::AuthOk {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        })?;
        crate::tasks::heartbeat::spawn_lease_keeper(self.clone(), session.clone(), lease);
        info!(
            user_id,
            device_id,
            node_id = %self.node_id,
            session_id = %session.session_id,
            "🔐 registered"
        );
        Ok(identity)
    }

    /// 关闭会话：注销租约、移出索引、通知读循环 / Close: drop the lease, unindex, wake the read loop
    pub async fn close_session(&self, session_id: &str, reason: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        if session.transition(ConnState::Disconnecting).is_err() {
            return;
        }
        let _ = session.send_raw(close_message(reason));
        let _ = session.transition(ConnState::Cleanup);

        if let Some(identity) = session.identity() {
            let now_empty = self
                .user_sessions
                .get_mut(&identity.user_id)
                .map(|mut set| {
                    set.remove(session_id);
                    set.is_empty()
                })
                .unwrap_or(false);
            if now_empty {
                self.user_sessions
                    .remove_if(&identity.user_id, |_, set| set.is_empty());
            }
            if let Err(e) = self.deps.registry.deregister(&identity.lease).await {
                // 租约到期后条目自然消失 / The entry lapses with its lease anyway
                warn!(lease_id = identity.lease.id, error = %e, "⚠️ deregister failed");
            }
        }
        self.sessions.remove(session_id);
        let _ = session.transition(ConnState::Closed);
        session.signal_closed();
        info!(session_id, reason, "👋 session closed");
    }

    /// 通知客户端后关闭 / Tell the client why, then close
    pub async fn kick(&self, session: &Arc<Session>, reason: &str) {
        let _ = session.send_frame(&ServerFrame::Kicked {
            reason: reason.to_string(),
        });
        self.close_session(&session.session_id, reason).await;
    }

    /// 关闭超过空闲时限的会话 / Close sessions idle past the limit
    pub async fn cleanup_idle_sessions(&self, idle_timeout: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > idle_timeout)
            .map(|s| s.key().clone())
            .collect();
        for id in &stale {
            self.close_session(id, "idle timeout").await;
        }
        if !stale.is_empty() {
            info!(node_id = %self.node_id, closed = stale.len(), "🧹 idle sessions closed");
        }
        stale.len()
    }

    /// 拉取某设备的离线消息 / Pull the offline queue of one device
    ///
    /// 离线副本写入前就已确认的消息（快路径送达该设备）按确认标记排除。
    /// Messages the device acked before the offline copy landed (fast path hit it) are
    /// dropped using the ack marks.
    pub async fn pull_offline(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> ImResult<(Vec<OfflineMessage>, Option<String>)> {
        let limit = limit
            .unwrap_or(self.config.default_offline_page)
            .clamp(1, self.config.max_offline_page);
        let (items, next_cursor) = self
            .deps
            .storage
            .pull_offline(user_id, device_id, cursor, limit)?;
        let Some(device_id) = device_id else {
            return Ok((items, next_cursor));
        };
        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            let key = ack_key(&item.message.message_id, user_id, device_id);
            match self.deps.dedup.contains(&key).await {
                Ok(true) => continue,
                Ok(false) => pending.push(item),
                // 宁可重复也不丢 / prefer a duplicate over a loss
                Err(e) => {
                    warn!(user_id, device_id, error = %e, "⚠️ ack lookup failed during pull");
                    pending.push(item);
                }
            }
        }
        Ok((pending, next_cursor))
    }

    /// 用鉴权服务解析令牌 / Resolve a token through the authenticator
    pub async fn authenticate_token(&self, token: &str) -> ImResult<Option<String>> {
        self.deps.authenticator.authenticate(token).await
    }

    /// 停止后台任务与续约，会话原样留下，租约到期自然消失（模拟进程崩溃）
    /// Stop background tasks and lease renewals, leaving sessions as they are so their
    /// leases lapse on their own (a crashed process)
    pub fn halt(&self) {
        self.shutdown_tx.send_replace(true);
        warn!(node_id = %self.node_id, sessions = self.sessions.len(), "💥 gateway halted");
    }

    /// 停止后台任务并关闭全部会话 / Stop background tasks and close every session
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.close_session(&id, "gateway shutting down").await;
        }
        info!(node_id = %self.node_id, "🛑 gateway stopped");
    }
}

/// 单元测试用网关：内存序列号、内存总线、信任鉴权、临时库
/// Gateway for unit tests: in-memory sequences and bus, trusting auth, throwaway storage
#[cfg(test)]
pub(crate) fn test_gateway(registry: Arc<dyn LeaseManager>, config: GatewayConfig) -> Arc<Gateway> {
    use crate::bus::LogBus;
    use crate::cluster::Directory;
    use crate::dedup::MemoryDedup;
    use crate::router::forward::ClusterForwarder;
    use crate::router::RouterConfig;
    use crate::sequence::MemorySequence;
    use crate::service::auth::TrustAuthenticator;
    use crate::service::filter::FilterChain;
    use crate::service::membership::LocalMembership;

    let bus: Arc<dyn MessageBus> = Arc::new(LogBus::in_memory(4));
    let forwarder = ClusterForwarder::new(Directory::new(), Duration::from_millis(200)).unwrap();
    let router = Arc::new(MessageRouter::new(
        Arc::new(MemorySequence::new()),
        registry.clone(),
        bus.clone(),
        Arc::new(forwarder),
        Arc::new(FilterChain::new()),
        RouterConfig::default(),
    ));
    let deps = GatewayDeps {
        registry,
        router,
        dedup: Arc::new(MemoryDedup::new()),
        bus: bus.clone(),
        membership: Arc::new(GroupMembershipCache::new(
            Arc::new(LocalMembership::new(bus)),
            Duration::from_secs(30),
        )),
        authenticator: Arc::new(TrustAuthenticator),
        storage: Arc::new(Storage::open_temporary().unwrap()),
    };
    Gateway::new("gw-test", config, deps)
}
