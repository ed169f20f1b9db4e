use async_trait::async_trait;
use v::{HealthCheck, HealthStatus};

use super::Gateway;

// 为网关实现统一健康检查接口
// Unified HealthCheck for a gateway
#[async_trait]
impl HealthCheck for Gateway {
    /// 会话数、在线用户数与关闭状态 / Session count, online users and shutdown state
    async fn check_health(&self) -> HealthStatus {
        let shutting_down = self.is_shutting_down();
        HealthStatus {
            component: format!("gateway:{}", self.node_id()),
            healthy: !shutting_down,
            message: Some(format!(
                "sessions={} users={} shutting_down={}",
                self.session_count(),
                self.online_users(),
                shutting_down
            )),
            timestamp: chrono::Utc::now(),
        }
    }
}
