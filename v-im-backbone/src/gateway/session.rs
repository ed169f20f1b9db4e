use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::domain::ServerFrame;
use crate::error::{ImError, ImResult};
use crate::registry::Lease;

/// 连接状态 / Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    Connecting,
    Authenticating,
    Registering,
    Connected,
    Heartbeat,
    Disconnecting,
    Cleanup,
    Closed,
}

impl ConnState {
    pub fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;
        match (self, to) {
            (Connecting, Authenticating)
            | (Authenticating, Registering)
            | (Registering, Connected)
            | (Connected, Heartbeat)
            | (Heartbeat, Heartbeat)
            | (Disconnecting, Cleanup)
            | (Cleanup, Closed) => true,
            // 任何活动状态都可能因错误或关闭进入断开 / Any live state may start disconnecting
            (from, Disconnecting) => !matches!(from, Disconnecting | Cleanup | Closed),
            _ => false,
        }
    }

    /// 已完成注册、可以收发消息 / Registered and able to exchange messages
    pub fn is_ready(self) -> bool {
        matches!(self, ConnState::Connected | ConnState::Heartbeat)
    }
}

/// 会话身份，注册成功后设置 / Session identity, set once registration succeeds
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
    pub lease: Lease,
}

/// 最近推送过的消息ID，有界 / Bounded set of recently pushed message ids
pub(crate) struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// 首次出现返回 true / True the first time an id is seen
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }
}

/// 网关上的一条客户端会话 / One client session on a gateway
pub struct Session {
    pub session_id: String,
    pub addr: Option<SocketAddr>,
    pub connected_at: i64,
    sender: mpsc::UnboundedSender<WsMessage>,
    state: Mutex<ConnState>,
    identity: RwLock<Option<Identity>>,
    last_seen: Mutex<Instant>,
    pushed: Mutex<RecentIds>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(addr: Option<SocketAddr>, sender: mpsc::UnboundedSender<WsMessage>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            addr,
            connected_at: chrono::Utc::now().timestamp_millis(),
            sender,
            state: Mutex::new(ConnState::Connecting),
            identity: RwLock::new(None),
            last_seen: Mutex::new(Instant::now()),
            pushed: Mutex::new(RecentIds::new(1024)),
            closed_tx,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// 按状态机迁移，返回原状态 / Move along the state machine, returns the previous state
    pub fn transition(&self, to: ConnState) -> ImResult<ConnState> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition(to) {
            return Err(ImError::InvalidTransition { from, to });
        }
        *state = to;
        Ok(from)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.user_id.clone())
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> ImResult<()> {
        self.send_raw(frame.to_ws()?)
    }

    pub fn send_raw(&self, message: WsMessage) -> ImResult<()> {
        self.sender
            .send(message)
            .map_err(|_| ImError::transient("session", format!("{} writer gone", self.session_id)))
    }

    pub(crate) fn already_pushed(&self, message_id: &str) -> bool {
        self.pushed.lock().contains(message_id)
    }

    pub(crate) fn remember_pushed(&self, message_id: &str) -> bool {
        self.pushed.lock().insert(message_id)
    }

    /// 会话结束信号，供心跳与读循环退出 / Close signal for the lease keeper and read loop
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub(crate) fn signal_closed(&self) {
        self.closed_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let s = Session::new(None, tx);
        for to in [
            ConnState::Authenticating,
            ConnState::Registering,
            ConnState::Connected,
            ConnState::Heartbeat,
            ConnState::Heartbeat,
            ConnState::Disconnecting,
            ConnState::Cleanup,
            ConnState::Closed,
        ] {
            s.transition(to).unwrap();
        }
        assert_eq!(s.state(), ConnState::Closed);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let s = Session::new(None, tx);
        assert!(matches!(
            s.transition(ConnState::Connected),
            Err(ImError::InvalidTransition { .. })
        ));
        s.transition(ConnState::Disconnecting).unwrap();
        assert!(s.transition(ConnState::Disconnecting).is_err());
        assert!(!ConnState::Closed.can_transition(ConnState::Authenticating));
    }

    #[test]
    fn recent_ids_are_bounded() {
        let mut ids = RecentIds::new(2);
        assert!(ids.insert("a"));
        assert!(!ids.insert("a"));
        ids.insert("b");
        ids.insert("c");
        assert!(!ids.contains("a"));
        assert!(ids.contains("c"));
    }

    #[test]
    fn send_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = Session::new(None, tx);
        s.send_frame(&ServerFrame::Pong { timestamp: 1 }).unwrap();
        drop(rx);
        assert!(s.send_frame(&ServerFrame::Pong { timestamp: 2 }).is_err());
    }
}
