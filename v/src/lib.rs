// v 库主入口：配置、日志、HTTP 响应与健康检查
// v library entry: configuration, logging, HTTP responses and health checks

pub mod comm;
pub use crate::comm::config::*;
pub use crate::comm::tracing::{init_tracing, init_tracing_with_level};

#[cfg(feature = "web_actix")]
pub mod response;

pub use tracing::{debug, error, info, trace, warn};

use async_trait::async_trait;

/// 健康状态 / Health status of one component
#[derive(Debug, serde::Serialize)]
pub struct HealthStatus {
    /// 组件名称 / Component name
    pub component: String,
    pub healthy: bool,
    /// 附加消息 / Extra detail
    pub message: Option<String>,
    /// 采样时间（UTC）/ Sample time (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// 健康检查通用接口 / Generic health check interface
#[async_trait]
pub trait HealthCheck {
    async fn check_health(&self) -> HealthStatus;
}
