use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::gateway::Gateway;

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(health_ready_handle)));
}

// 就绪检查：关闭中的网关不再接收流量
// Readiness check: a gateway that is shutting down takes no traffic
pub async fn health_ready_handle(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    let is_ready = !gateway.is_shutting_down();
    let payload = serde_json::json!({
        "ready": is_ready,
        "node_id": gateway.node_id(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "sessions": gateway.session_count(),
        "online_users": gateway.online_users(),
    });
    let code = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    respond_any(code, payload)
}
