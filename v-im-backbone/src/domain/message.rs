use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;

use crate::error::ImError;

/// 消息目标：单聊用户或群组 / Message target: a user or a group
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    User(String),
    Group(String),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::User(id) | Target::Group(id) => id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Target::Group(_))
    }

    /// 序列号计数器键（每个会话目标一个）/ Sequence counter key, one per conversation target
    pub fn sequence_key(&self) -> String {
        match self {
            Target::User(id) => format!("user:{}", id),
            Target::Group(id) => format!("group:{}", id),
        }
    }
}

/// 不透明负载，JSON 线上格式为 base64 / Opaque payload, base64 on the JSON wire
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload(v)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// 客户端提交、尚未分配序列号的消息 / Client submission before sequencing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub sender_id: String,
    pub target: Target,
    pub payload: Payload,
    #[serde(default)]
    pub client_timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(sender_id: impl Into<String>, target: Target, payload: impl Into<Payload>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            target,
            payload: payload.into(),
            client_timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

/// 已分配序列号的消息，创建后不可变 / Sequenced message, immutable once created
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub target: Target,
    pub sequence_number: u64,
    pub payload: Payload,
    pub created_at: i64,
}

impl Message {
    pub(crate) fn sequenced(envelope: Envelope, sequence_number: u64) -> Self {
        Self {
            message_id: envelope.message_id,
            sender_id: envelope.sender_id,
            target: envelope.target,
            sequence_number,
            payload: envelope.payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 单聊接收方 / Direct recipient, `None` for group messages
    pub fn recipient(&self) -> Option<&str> {
        match &self.target {
            Target::User(id) => Some(id),
            Target::Group(_) => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ImError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 路由路径 / Which path a message took
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePath {
    Fast,
    Slow,
    Group,
}

/// 单个设备的快路径投递结果 / Fast-path result for one device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDelivery {
    pub device_id: String,
    pub node_id: String,
    pub accepted: bool,
}

/// 路由结果 / Result of routing one message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteResult {
    pub message: Message,
    pub path: RoutePath,
    pub devices: Vec<DeviceDelivery>,
}

/// 投递结果（无异常控制流）/ Delivery outcome, no exceptions as control flow
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered,
    AlreadySeen,
    Failed(ImError),
}

impl DeliveryOutcome {
    /// 可以提交位点 / Safe to commit the bus offset
    pub fn is_settled(&self) -> bool {
        !matches!(self, DeliveryOutcome::Failed(_))
    }
}

/// 离线存储中的一条消息 / One message held in the offline store
///
/// 每台设备各自确认；`delivered` 表示不带设备的整户确认。
/// Each device acknowledges on its own; `delivered` is a user-wide ack that names no device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub message: Message,
    pub delivered: bool,
    #[serde(default)]
    pub delivered_to: BTreeSet<String>,
    pub stored_at: i64,
}

impl OfflineMessage {
    /// 该设备是否还需要这条消息 / Whether this device still needs the message
    pub fn pending_for(&self, device_id: Option<&str>) -> bool {
        if self.delivered {
            return false;
        }
        match device_id {
            Some(device) => !self.delivered_to.contains(device),
            None => true,
        }
    }
}

/// 群成员变更事件 / Group membership change event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub group_id: String,
    pub user_id: String,
    pub joined: bool,
}
