//! 消息路由器 / Message router
//!
//! 校验 → 过滤 → 分配序列号 → 群消息入总线 / 单聊快路径，失败回落慢路径。
//! Validate, filter, sequence, then groups go to the bus and direct messages take the
//! fast path with a slow-path fallback.

pub mod forward;

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{publish_json, MessageBus, TOPIC_GROUP, TOPIC_OFFLINE};
use crate::domain::{DeviceDelivery, Envelope, Message, RoutePath, RouteResult, Target};
use crate::error::{ImError, ImResult};
use crate::registry::{LeaseManager, RegistryEntry};
use crate::sequence::SequenceGenerator;
use crate::service::filter::{FilterChain, FilterVerdict};

pub use forward::{ClusterForwarder, DeliverRequest, DeliverResponse, GatewayForwarder};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// 单个网关快路径等待上限 / Per-gateway fast-path wait
    pub fast_path_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fast_path_timeout: Duration::from_millis(500),
            max_payload_bytes: 64 * 1024,
        }
    }
}

pub struct MessageRouter {
    sequences: Arc<dyn SequenceGenerator>,
    registry: Arc<dyn LeaseManager>,
    bus: Arc<dyn MessageBus>,
    forwarder: Arc<dyn GatewayForwarder>,
    filters: Arc<FilterChain>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        sequences: Arc<dyn SequenceGenerator>,
        registry: Arc<dyn LeaseManager>,
        bus: Arc<dyn MessageBus>,
        forwarder: Arc<dyn GatewayForwarder>,
        filters: Arc<FilterChain>,
        config: RouterConfig,
    ) -> Self {
        Self {
            sequences,
            registry,
            bus,
            forwarder,
            filters,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn route(&self, envelope: Envelope) -> ImResult<RouteResult> {
        self.validate(&envelope)?;
        let envelope = self.filter(envelope).await?;

        let key = envelope.target.sequence_key();
        let sequence_number = self.sequences.next(&key).await.map_err(|e| match e {
            ImError::Fatal(_) => e,
            other => ImError::Fatal(other.to_string()),
        })?;
        let message = Message::sequenced(envelope, sequence_number);
        debug!(
            message_id = %message.message_id,
            sequence_key = %key,
            seq = sequence_number,
            "🔢 sequence issued"
        );

        match message.target.clone() {
            Target::Group(group_id) => {
                publish_json(self.bus.as_ref(), TOPIC_GROUP, &group_id, &message).await?;
                info!(
                    message_id = %message.message_id,
                    seq = message.sequence_number,
                    group_id = %group_id,
                    "📣 routed to group"
                );
                Ok(RouteResult {
                    message,
                    path: RoutePath::Group,
                    devices: Vec::new(),
                })
            }
            Target::User(user_id) => self.route_direct(message, &user_id).await,
        }
    }

    fn validate(&self, envelope: &Envelope) -> ImResult<()> {
        if envelope.message_id.trim().is_empty() {
            return Err(ImError::PermanentReject("message_id is required".into()));
        }
        if envelope.sender_id.trim().is_empty() {
            return Err(ImError::PermanentReject("sender_id is required".into()));
        }
        if envelope.target.id().trim().is_empty() {
            return Err(ImError::PermanentReject("target id is required".into()));
        }
        if envelope.payload.len() > self.config.max_payload_bytes {
            return Err(ImError::PermanentReject(format!(
                "payload of {} bytes exceeds {}",
                envelope.payload.len(),
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    async fn filter(&self, mut envelope: Envelope) -> ImResult<Envelope> {
        let payload = std::mem::take(&mut envelope.payload);
        match self.filters.apply(&envelope.sender_id, payload).await? {
            FilterVerdict::Pass(payload) => {
                envelope.payload = payload;
                Ok(envelope)
            }
            FilterVerdict::Reject(reason) => Err(ImError::PermanentReject(reason)),
        }
    }

    async fn route_direct(&self, message: Message, user_id: &str) -> ImResult<RouteResult> {
        // 注册中心不可达按离线处理，消息仍可靠落库 / An unreachable registry is treated as offline, the message still lands durably
        let entries = match self.registry.lookup(user_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(user_id, error = %e, "⚠️ registry lookup failed, using slow path");
                Vec::new()
            }
        };

        if entries.is_empty() {
            self.slow_path(&message).await?;
            info!(
                message_id = %message.message_id,
                seq = message.sequence_number,
                user_id,
                "📭 recipient offline, routed to slow path"
            );
            return Ok(RouteResult {
                message,
                path: RoutePath::Slow,
                devices: Vec::new(),
            });
        }

        let devices = self.fast_path(&message, entries).await;
        let accepted = devices.iter().filter(|d| d.accepted).count();
        // 任一设备未收到都要落离线，保证该设备重连后能拉到
        // Any device that missed it needs the offline copy to pull after reconnecting
        if accepted < devices.len() {
            self.slow_path(&message).await?;
        }
        let path = if accepted > 0 {
            RoutePath::Fast
        } else {
            RoutePath::Slow
        };
        info!(
            message_id = %message.message_id,
            seq = message.sequence_number,
            user_id,
            path = ?path,
            accepted,
            devices = devices.len(),
            "📨 routed"
        );
        Ok(RouteResult {
            message,
            path,
            devices,
        })
    }

    async fn fast_path(&self, message: &Message, entries: Vec<RegistryEntry>) -> Vec<DeviceDelivery> {
        let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in entries {
            by_node
                .entry(entry.gateway_node_id)
                .or_default()
                .push(entry.device_id);
        }

        let attempts = by_node.into_iter().map(|(node_id, device_ids)| async move {
            let outcome = tokio::time::timeout(
                self.config.fast_path_timeout,
                self.forwarder.forward(&node_id, message, &device_ids),
            )
            .await;
            let failure = match outcome {
                Ok(Ok(report)) => return report,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", self.config.fast_path_timeout),
            };
            warn!(
                node_id = %node_id,
                message_id = %message.message_id,
                failure = %failure,
                "⏱️ fast path failed"
            );
            device_ids
                .into_iter()
                .map(|device_id| DeviceDelivery {
                    device_id,
                    node_id: node_id.clone(),
                    accepted: false,
                })
                .collect::<Vec<_>>()
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// 写入 `offline_msg`，按接收方分区 / Publish to `offline_msg`, keyed by recipient
    pub async fn slow_path(&self, message: &Message) -> ImResult<()> {
        let recipient = message.recipient().ok_or_else(|| {
            ImError::PermanentReject("group messages never take the slow path".into())
        })?;
        publish_json(self.bus.as_ref(), TOPIC_OFFLINE, recipient, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LogBus, StartFrom};
    use crate::registry::MemoryRegistry;
    use crate::sequence::MemorySequence;
    use crate::service::filter::{SensitiveMode, SensitiveWordFilter};
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Accept,
        Fail,
        Hang,
    }

    struct ScriptedForwarder {
        nodes: HashMap<String, Behaviour>,
    }

    #[async_trait]
    impl GatewayForwarder for ScriptedForwarder {
        async fn forward(
            &self,
            node_id: &str,
            _message: &Message,
            device_ids: &[String],
        ) -> ImResult<Vec<DeviceDelivery>> {
            match self.nodes.get(node_id).copied().unwrap_or(Behaviour::Fail) {
                Behaviour::Accept => Ok(device_ids
                    .iter()
                    .map(|d| DeviceDelivery {
                        device_id: d.clone(),
                        node_id: node_id.to_string(),
                        accepted: true,
                    })
                    .collect()),
                Behaviour::Fail => Err(ImError::transient("gateway", "connection refused")),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    struct Fixture {
        router: MessageRouter,
        registry: Arc<MemoryRegistry>,
        bus: Arc<LogBus>,
        filters: Arc<FilterChain>,
    }

    fn fixture(nodes: &[(&str, Behaviour)]) -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let bus = Arc::new(LogBus::in_memory(4));
        let filters = Arc::new(FilterChain::new());
        let forwarder = ScriptedForwarder {
            nodes: nodes.iter().map(|(n, b)| (n.to_string(), *b)).collect(),
        };
        let router = MessageRouter::new(
            Arc::new(MemorySequence::new()),
            registry.clone(),
            bus.clone(),
            Arc::new(forwarder),
            filters.clone(),
            RouterConfig::default(),
        );
        Fixture {
            router,
            registry,
            bus,
            filters,
        }
    }

    fn to_bob(text: &str) -> Envelope {
        Envelope::new("alice", Target::User("bob".into()), text)
    }

    #[tokio::test]
    async fn offline_recipient_takes_slow_path() {
        let f = fixture(&[]);
        let result = f.router.route(to_bob("hi")).await.unwrap();
        assert_eq!(result.path, RoutePath::Slow);
        assert_eq!(result.message.sequence_number, 1);
        assert_eq!(f.bus.end_offsets(TOPIC_OFFLINE).unwrap().iter().sum::<u64>(), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn routing_logs_carry_message_fields() {
        let f = fixture(&[]);
        let result = f.router.route(to_bob("hi")).await.unwrap();
        let id = format!("message_id={}", result.message.message_id);
        assert!(logs_contain(&id));
        assert!(logs_contain("seq=1"));
        assert!(logs_contain("recipient offline, routed to slow path"));
    }

    #[tokio::test]
    async fn online_recipient_takes_fast_path() {
        let f = fixture(&[("gw-1", Behaviour::Accept)]);
        f.registry
            .register("bob", "phone", "gw-1", Duration::from_secs(90))
            .await
            .unwrap();
        let result = f.router.route(to_bob("hi")).await.unwrap();
        assert_eq!(result.path, RoutePath::Fast);
        assert_eq!(result.devices.len(), 1);
        assert!(f.bus.end_offsets(TOPIC_OFFLINE).unwrap().iter().all(|o| *o == 0));
    }

    #[tokio::test]
    async fn failed_gateway_falls_back_to_slow_path() {
        let f = fixture(&[("gw-2", Behaviour::Fail)]);
        f.registry
            .register("bob", "phone", "gw-2", Duration::from_secs(90))
            .await
            .unwrap();
        let result = f.router.route(to_bob("hi")).await.unwrap();
        assert_eq!(result.path, RoutePath::Slow);
        assert!(!result.devices[0].accepted);
        assert_eq!(f.bus.end_offsets(TOPIC_OFFLINE).unwrap().iter().sum::<u64>(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_gateway_is_cut_off_and_healthy_device_still_served() {
        let f = fixture(&[("gw-1", Behaviour::Accept), ("gw-3", Behaviour::Hang)]);
        let ttl = Duration::from_secs(90);
        f.registry.register("bob", "phone", "gw-1", ttl).await.unwrap();
        f.registry.register("bob", "laptop", "gw-3", ttl).await.unwrap();

        let result = f.router.route(to_bob("hi")).await.unwrap();
        assert_eq!(result.path, RoutePath::Fast);
        let laptop = result
            .devices
            .iter()
            .find(|d| d.device_id == "laptop")
            .unwrap();
        assert!(!laptop.accepted);
        // 笔记本需要离线副本 / The laptop needs the offline copy
        assert_eq!(f.bus.end_offsets(TOPIC_OFFLINE).unwrap().iter().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn group_messages_go_to_group_topic_keyed_by_group() {
        let f = fixture(&[]);
        let env = Envelope::new("alice", Target::Group("g1".into()), "hello");
        let result = f.router.route(env).await.unwrap();
        assert_eq!(result.path, RoutePath::Group);

        let mut c = f
            .bus
            .subscribe("t", TOPIC_GROUP, "m", StartFrom::Earliest)
            .await
            .unwrap();
        let records = c.poll(10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "g1");
    }

    #[tokio::test]
    async fn rejections_never_consume_a_sequence_number() {
        let f = fixture(&[]);
        f.filters.register(Arc::new(SensitiveWordFilter::new(
            vec!["forbidden".into()],
            SensitiveMode::Reject,
        )));
        let big = Envelope::new("alice", Target::User("bob".into()), vec![0u8; 70 * 1024]);
        assert!(matches!(f.router.route(big).await, Err(ImError::PermanentReject(_))));
        assert!(matches!(
            f.router.route(to_bob("forbidden words")).await,
            Err(ImError::PermanentReject(_))
        ));
        let ok = f.router.route(to_bob("fine")).await.unwrap();
        assert_eq!(ok.message.sequence_number, 1);
    }

    #[tokio::test]
    async fn sequences_are_per_target() {
        let f = fixture(&[]);
        for _ in 0..3 {
            f.router.route(to_bob("x")).await.unwrap();
        }
        let other = f
            .router
            .route(Envelope::new("alice", Target::User("carol".into()), "x"))
            .await
            .unwrap();
        assert_eq!(other.message.sequence_number, 1);
    }
}
