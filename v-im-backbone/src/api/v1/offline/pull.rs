use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::domain::OfflineMessage;
use crate::gateway::Gateway;

#[derive(serde::Deserialize)]
pub struct PullQuery {
    pub device_id: Option<String>, // 拉取设备，缺省只排除整户确认 / Pulling device, without it only user-wide acks are hidden
    pub limit: Option<usize>,      // 条数限制 / Limit
    pub cursor: Option<String>,    // 上一页最后的序号 / Last sequence of the previous page
}

#[derive(serde::Serialize, Debug)]
pub struct PullResponse {
    pub items: Vec<OfflineMessage>,
    pub next_cursor: Option<String>,
}

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(offline_pull_handle)));
}

// 用户来自令牌，只能读自己的队列 / The user comes from the token, so only their own queue is readable
pub async fn offline_pull_handle(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<PullQuery>,
    req: HttpRequest,
) -> impl Responder {
    let user_id = match crate::api::bearer_user(&req, &gateway).await {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };
    match gateway
        .pull_offline(
            &user_id,
            query.device_id.as_deref(),
            query.cursor.as_deref(),
            query.limit,
        )
        .await
    {
        Ok((items, next_cursor)) => respond_any(StatusCode::OK, PullResponse { items, next_cursor }),
        Err(e) => crate::api::error_response(&e),
    }
}
