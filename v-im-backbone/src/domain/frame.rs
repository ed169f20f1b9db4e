use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::message::{Message, OfflineMessage, Payload, RoutePath, Target};
use crate::error::ImResult;

/// 客户端上行帧 / Client-to-gateway frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
        device_id: String,
    },
    Send {
        #[serde(default)]
        message_id: Option<String>,
        target: Target,
        payload: Payload,
        #[serde(default)]
        client_timestamp: Option<i64>,
    },
    Ack {
        message_id: String,
    },
    Ping,
    PullOffline {
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// 网关下行帧 / Gateway-to-client frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        node_id: String,
        session_id: String,
    },
    AuthOk {
        user_id: String,
        device_id: String,
    },
    AuthFailed {
        reason: String,
    },
    Deliver {
        message: Message,
    },
    SendAck {
        message_id: String,
        sequence_number: u64,
        path: RoutePath,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        reason: String,
        retry: bool,
    },
    Pong {
        timestamp: i64,
    },
    OfflinePage {
        items: Vec<OfflineMessage>,
        next_cursor: Option<String>,
    },
    Kicked {
        reason: String,
    },
}

impl ServerFrame {
    pub fn to_ws(&self) -> ImResult<WsMessage> {
        Ok(WsMessage::Text(serde_json::to_string(self)?))
    }
}
