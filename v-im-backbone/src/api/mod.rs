//! HTTP 接口 / HTTP API
pub mod v1;

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::warn;
use v::response::{respond_any, respond_error};

use crate::error::ImError;
use crate::gateway::Gateway;

/// 注册全部路由 / Register every route
pub fn configure(cfg: &mut web::ServiceConfig) {
    v1::health::basic::register(cfg, "/v1/health");
    v1::health::live::register(cfg, "/v1/health/live");
    v1::health::ready::register(cfg, "/v1/health/ready");
    v1::offline::pull::register(cfg, "/v1/offline/pull");
    v1::offline::ack::register(cfg, "/v1/offline/ack");
    v1::group::history::register(cfg, "/v1/group/history");
    // 内部跨节点API / internal cross-node APIs
    v1::internal::deliver::register(cfg, "/v1/internal/deliver");
    v1::internal::route::register(cfg, "/v1/internal/route");
    v1::internal::lookup::register(cfg, "/v1/internal/lookup");
}

// 错误分类映射为状态码 / Map the error class onto a status code
pub(crate) fn error_response(e: &ImError) -> HttpResponse {
    let code = match e {
        ImError::PermanentReject(_) | ImError::Serialization(_) => StatusCode::BAD_REQUEST,
        ImError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ImError::LeaseExpired(_) => StatusCode::GONE,
        ImError::TransientInfra { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ImError::Fatal(_) | ImError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond_error(code, e.to_string(), e.is_retryable())
}

/// 解析 `Authorization: Bearer <token>` 并换成用户 ID
/// Parse `Authorization: Bearer <token>` and resolve it to a user id
pub(crate) async fn bearer_user(req: &HttpRequest, gateway: &Gateway) -> Result<String, HttpResponse> {
    let authorize_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if authorize_header.is_empty() {
        return Err(respond_any(
            StatusCode::UNAUTHORIZED,
            "缺少授权头 / Missing Authorization header",
        ));
    }
    let Some(token) = authorize_header.strip_prefix("Bearer ") else {
        warn!("Authorization 格式错误 / Malformed Authorization header");
        return Err(respond_any(
            StatusCode::UNAUTHORIZED,
            "Authorization 格式错误，应为 Bearer <token> / Malformed Authorization header, expected Bearer <token>",
        ));
    };
    match gateway.authenticate_token(token.trim()).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(respond_any(
            StatusCode::UNAUTHORIZED,
            "令牌无效 / Invalid token",
        )),
        Err(e) => {
            warn!(error = %e, "鉴权服务不可用 / Authenticator unavailable");
            Err(error_response(&e))
        }
    }
}
