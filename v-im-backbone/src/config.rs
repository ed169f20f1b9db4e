use anyhow::Result;
use std::time::Duration;

use crate::gateway::GatewayConfig;
use crate::router::RouterConfig;
use crate::service::filter::SensitiveMode;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub node_id: String,
    pub ws_port: u16,
    pub http_port: u16,
    /// 进程内网关数量 / Gateways hosted by this process
    pub gateways: usize,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub lease_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// 过期扫描与变更传播周期 / Expiry sweep and change propagation period
    pub propagation_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub persist_ttl_ms: u64,
    pub ack_ttl_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub retention_ms: u64,
    pub purge_interval_ms: u64,
    pub max_page: usize,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub cache_ttl_ms: u64,
    pub service_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfigLite {
    pub enabled: bool,
    pub center_url: String,
    pub timeout_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub sensitive_words: Vec<String>,
    pub mode: SensitiveMode,
}

/// 骨干服务的全部配置 / Full backbone configuration
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
    pub bus_partitions: u32,
    pub dedup: DedupConfig,
    pub offline: OfflineConfig,
    pub membership: MembershipConfig,
    pub auth: AuthConfigLite,
    /// 0 表示关闭确认回落 / 0 disables the ack fallback
    pub ack_deadline_ms: u64,
    pub filter: FilterConfig,
    /// sled 数据目录；`None` 仅供测试，使用进程退出即删的临时库
    /// sled data directory; `None` is for tests and opens a throwaway database
    pub storage_path: Option<String>,
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_STORAGE_PATH: &str = "data/backbone.sled";

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::from_manager(&v::ConfigManager::empty())
    }
}

impl BackboneConfig {
    /// 从全局配置管理器加载 / Load from the global config manager
    pub fn load() -> Result<Self> {
        let cm = v::get_global_config_manager()?;
        Ok(Self::from_manager(&cm))
    }

    pub fn from_manager(cm: &v::ConfigManager) -> Self {
        let ms = |key: &str, default: i64| cm.get_or(key, default).max(0) as u64;
        let words: Vec<String> = cm.get_or("filter.sensitive_words", Vec::new());
        let mode = match cm.get_or("filter.mode", "mask".to_string()).as_str() {
            "reject" => SensitiveMode::Reject,
            _ => SensitiveMode::Mask,
        };
        Self {
            server: ServerConfig {
                host: cm.get_or("server.host", "127.0.0.1".to_string()),
                node_id: cm.get_or("server.node_id", "node-local".to_string()),
                ws_port: cm.get_or("server.ws_port", 5200_i64) as u16,
                http_port: cm.get_or("server.http_port", 8080_i64) as u16,
                gateways: cm.get_or("server.gateways", 1_i64).max(1) as usize,
            },
            registry: RegistryConfig {
                lease_ttl_ms: ms("registry.lease_ttl_ms", 90_000),
                heartbeat_interval_ms: ms("registry.heartbeat_interval_ms", 30_000),
                propagation_interval_ms: ms("registry.propagation_interval_ms", 1_000),
            },
            router: RouterConfig {
                fast_path_timeout: Duration::from_millis(ms("router.fast_path_timeout_ms", 500)),
                max_payload_bytes: ms("router.max_payload_bytes", 65_536) as usize,
            },
            bus_partitions: cm.get_or("bus.partitions", 16_i64).max(1) as u32,
            dedup: DedupConfig {
                persist_ttl_ms: ms("dedup.persist_ttl_ms", 7 * DAY_MS),
                ack_ttl_ms: ms("dedup.ack_ttl_ms", 600_000),
            },
            offline: OfflineConfig {
                retention_ms: ms("offline.retention_ms", 7 * DAY_MS),
                purge_interval_ms: ms("offline.purge_interval_ms", 60_000),
                max_page: ms("offline.max_page", 200).max(1) as usize,
                workers: cm.get_or("offline.workers", 2_i64).max(1) as usize,
            },
            membership: MembershipConfig {
                cache_ttl_ms: ms("membership.cache_ttl_ms", 30_000),
                service_url: cm.get::<String>("membership.service_url").ok(),
            },
            auth: AuthConfigLite {
                enabled: cm.get_or("auth.enabled", false),
                center_url: cm.get_or("auth.center_url", "http://127.0.0.1:8090".to_string()),
                timeout_ms: ms("auth.timeout_ms", 1_000),
                deadline_ms: ms("auth.deadline_ms", 5_000),
            },
            ack_deadline_ms: ms("delivery.ack_deadline_ms", 10_000),
            filter: FilterConfig {
                sensitive_words: words,
                mode,
            },
            storage_path: match cm.get_or("storage.temporary", false) {
                true => None,
                false => Some(cm.get_or("storage.path", DEFAULT_STORAGE_PATH.to_string())),
            },
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.registry.lease_ttl_ms)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let lease_ttl = self.lease_ttl();
        GatewayConfig {
            lease_ttl,
            heartbeat_interval: Duration::from_millis(self.registry.heartbeat_interval_ms),
            auth_deadline: Duration::from_millis(self.auth.deadline_ms),
            ack_deadline: match self.ack_deadline_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            ack_ttl: Duration::from_millis(self.dedup.ack_ttl_ms),
            idle_timeout: lease_ttl,
            max_offline_page: self.offline.max_page,
            ..GatewayConfig::default()
        }
    }

    /// 第 i 个网关的节点名与端口 / Node id and ports of the i-th gateway
    pub fn gateway_slot(&self, index: usize) -> (String, u16, u16) {
        let node_id = if self.server.gateways == 1 {
            self.server.node_id.clone()
        } else {
            format!("{}-{}", self.server.node_id, index)
        };
        (
            node_id,
            self.server.ws_port.saturating_add(index as u16),
            self.server.http_port.saturating_add(index as u16),
        )
    }
}
