use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

use crate::gateway::Gateway;

/// 节点信息 / Node information
#[derive(Clone, Debug, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// 内部 HTTP 地址，跨进程转发用 / Internal HTTP address for cross-process forwarding
    pub http_addr: Option<String>,
    pub is_alive: bool,
}

/// 目录服务 / Directory service
#[derive(Clone, Default)]
pub struct Directory {
    nodes: Arc<DashMap<String, NodeInfo>>, // 节点元信息 / Node metadata
    gateways: Arc<DashMap<String, Arc<Gateway>>>, // 本进程网关 / In-process gateways
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&self, info: NodeInfo) {
        self.nodes.insert(info.node_id.clone(), info);
    }

    pub fn mark_alive(&self, node_id: &str, alive: bool) {
        if let Some(mut n) = self.nodes.get_mut(node_id) {
            n.is_alive = alive;
        }
    }

    pub fn register_gateway(&self, gateway: Arc<Gateway>, http_addr: Option<String>) {
        let node_id = gateway.node_id().to_string();
        self.register_node(NodeInfo {
            node_id: node_id.clone(),
            http_addr,
            is_alive: true,
        });
        self.gateways.insert(node_id, gateway);
    }

    /// 摘除本进程网关（崩溃或下线）/ Drop an in-process gateway (crash or shutdown)
    pub fn remove_gateway(&self, node_id: &str) -> Option<Arc<Gateway>> {
        self.mark_alive(node_id, false);
        self.gateways.remove(node_id).map(|(_, g)| g)
    }

    pub fn get_gateway(&self, node_id: &str) -> Option<Arc<Gateway>> {
        self.gateways.get(node_id).map(|g| g.value().clone())
    }

    pub fn node_info(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|it| it.value().clone()).collect()
    }

    pub fn local_gateways(&self) -> Vec<Arc<Gateway>> {
        self.gateways.iter().map(|g| g.value().clone()).collect()
    }
}
