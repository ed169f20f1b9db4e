use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Gateway;
use crate::bus::{Record, StartFrom, TOPIC_GROUP, TOPIC_MEMBERSHIP};
use crate::domain::{DeliveryOutcome, MembershipChange, Message, Target};
use crate::error::{ImError, ImResult};
use crate::registry::{ChangeEvent, RegistryEntry};
use crate::worker::{drive, DriveConfig, RecordHandler};

impl Gateway {
    /// 推给本网关上在线的群成员，返回成功推送的会话数
    /// Push to the group members online on this gateway, returns sessions reached
    pub async fn fanout_group(&self, message: &Message) -> ImResult<usize> {
        let Target::Group(group_id) = &message.target else {
            return Err(ImError::PermanentReject(format!(
                "{} is not a group message",
                message.message_id
            )));
        };
        let members = self.deps.membership.members(group_id).await?;

        // 遍历较小的一侧 / Walk whichever side is smaller
        let online: Vec<String> = if members.len() <= self.user_sessions.len() {
            members
                .iter()
                .filter(|uid| self.user_sessions.contains_key(*uid))
                .cloned()
                .collect()
        } else {
            self.user_sessions
                .iter()
                .filter(|e| members.contains(e.key()))
                .map(|e| e.key().clone())
                .collect()
        };

        let mut reached = 0;
        for uid in online {
            for session in self.sessions_of(&uid) {
                match self.push(&session, message).await {
                    DeliveryOutcome::Delivered => reached += 1,
                    DeliveryOutcome::AlreadySeen => {}
                    // 该成员下次拉取群历史补齐 / The member catches up from group history
                    DeliveryOutcome::Failed(e) => {
                        debug!(session_id = %session.session_id, error = %e, "group push skipped")
                    }
                }
            }
        }
        debug!(
            message_id = %message.message_id,
            seq = message.sequence_number,
            group_id = %group_id,
            node_id = %self.node_id,
            reached,
            "📣 group fanout"
        );
        Ok(reached)
    }

    pub fn group_consumer_group(&self) -> String {
        format!("gateway-{}", self.node_id)
    }

    /// 启动本网关的群消费、成员变更消费与注册中心监听
    /// Start this gateway's group consumer, membership consumer and registry watch
    pub async fn spawn_background(self: &Arc<Self>, drive_cfg: DriveConfig) -> ImResult<()> {
        let group_consumer = self
            .deps
            .bus
            .subscribe(
                &self.group_consumer_group(),
                TOPIC_GROUP,
                &self.node_id,
                StartFrom::Latest,
            )
            .await?;
        tokio::spawn(drive(
            group_consumer,
            Arc::new(GroupFanout {
                gateway: self.clone(),
                name: format!("{}-fanout", self.node_id),
            }),
            drive_cfg.clone(),
            self.shutdown_signal(),
        ));

        let membership_consumer = self
            .deps
            .bus
            .subscribe(
                &format!("gateway-{}-membership", self.node_id),
                TOPIC_MEMBERSHIP,
                &self.node_id,
                StartFrom::Latest,
            )
            .await?;
        tokio::spawn(drive(
            membership_consumer,
            Arc::new(MembershipInvalidator {
                gateway: self.clone(),
                name: format!("{}-membership", self.node_id),
            }),
            drive_cfg,
            self.shutdown_signal(),
        ));

        self.spawn_registry_watch();
        crate::tasks::heartbeat::spawn_idle_cleanup(self.clone(), self.config.idle_timeout);
        info!(node_id = %self.node_id, "🛰️ gateway background tasks started");
        Ok(())
    }

    // 本节点持有的租约被删除或过期时，踢掉对应的旧会话
    // When a lease this node holds is removed or lapses, evict the stale session
    fn spawn_registry_watch(self: &Arc<Self>) {
        let gateway = self.clone();
        let mut watcher = self.deps.registry.watch("");
        let mut shutdown_rx = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = watcher.recv() => match event {
                        Some(ev) if ev.is_removal() => gateway.evict_stale(&ev).await,
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
    }

    async fn evict_stale(&self, event: &ChangeEvent) {
        let entry: &RegistryEntry = event.entry();
        if entry.gateway_node_id != self.node_id {
            return;
        }
        for session in self.sessions_of(&entry.user_id) {
            let holds_lease = session
                .identity()
                .map(|i| i.lease.id == entry.lease_id)
                .unwrap_or(false);
            if holds_lease && session.state().is_ready() {
                let cause = match event {
                    ChangeEvent::Expired(_) => "expired",
                    _ => "superseded",
                };
                warn!(session_id = %session.session_id, cause, "🪦 registry entry lost, evicting");
                self.kick(&session, "presence lease lost").await;
            }
        }
    }
}

struct GroupFanout {
    gateway: Arc<Gateway>,
    name: String,
}

#[async_trait]
impl RecordHandler for GroupFanout {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, record: &Record) -> DeliveryOutcome {
        let message = match record.decode::<Message>() {
            Ok(m) => m,
            Err(e) => return DeliveryOutcome::Failed(e),
        };
        match self.gateway.fanout_group(&message).await {
            Ok(_) => DeliveryOutcome::Delivered,
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }
}

struct MembershipInvalidator {
    gateway: Arc<Gateway>,
    name: String,
}

#[async_trait]
impl RecordHandler for MembershipInvalidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, record: &Record) -> DeliveryOutcome {
        match record.decode::<MembershipChange>() {
            Ok(change) => {
                self.gateway.deps.membership.invalidate(&change.group_id);
                DeliveryOutcome::Delivered
            }
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }
}
