use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::cluster::Directory;
use crate::domain::{DeviceDelivery, Message};
use crate::error::{ImError, ImResult};

/// 跨网关投递请求 / Cross-gateway delivery request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub message: Message,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverResponse {
    pub devices: Vec<DeviceDelivery>,
}

/// 把消息交给目标网关上的指定设备 / Hand a message to specific devices on a target gateway
#[async_trait]
pub trait GatewayForwarder: Send + Sync {
    async fn forward(
        &self,
        node_id: &str,
        message: &Message,
        device_ids: &[String],
    ) -> ImResult<Vec<DeviceDelivery>>;
}

/// 本进程网关直接调用，其余走内部 HTTP
/// In-process gateways are called directly, others over internal HTTP
pub struct ClusterForwarder {
    directory: Directory,
    client: reqwest::Client,
}

impl ClusterForwarder {
    pub fn new(directory: Directory, timeout: Duration) -> ImResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImError::transient("forwarder", e))?;
        Ok(Self { directory, client })
    }
}

#[async_trait]
impl GatewayForwarder for ClusterForwarder {
    async fn forward(
        &self,
        node_id: &str,
        message: &Message,
        device_ids: &[String],
    ) -> ImResult<Vec<DeviceDelivery>> {
        if let Some(gateway) = self.directory.get_gateway(node_id) {
            return Ok(gateway.deliver_local(message, device_ids).await);
        }
        let addr = match self.directory.node_info(node_id) {
            Some(info) if info.is_alive => info.http_addr,
            _ => None,
        }
        .ok_or_else(|| ImError::transient("gateway", format!("node {} unreachable", node_id)))?;

        debug!(message_id = %message.message_id, node_id, addr = %addr, "🛰️ forwarding");
        let resp = self
            .client
            .post(format!("{}/v1/internal/deliver", addr.trim_end_matches('/')))
            .json(&DeliverRequest {
                message: message.clone(),
                device_ids: device_ids.to_vec(),
            })
            .send()
            .await
            .map_err(|e| ImError::transient("gateway", e))?;
        if !resp.status().is_success() {
            return Err(ImError::transient(
                "gateway",
                format!("node {} answered {}", node_id, resp.status()),
            ));
        }
        let body: DeliverResponse = resp
            .json()
            .await
            .map_err(|e| ImError::transient("gateway", e))?;
        Ok(body.devices)
    }
}
