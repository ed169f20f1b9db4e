use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::domain::Message;
use crate::gateway::Gateway;

#[derive(serde::Deserialize)]
pub struct HistoryQuery {
    pub group_id: String,
    /// 只返回大于该序号的消息 / Only messages after this sequence
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
}

#[derive(serde::Serialize, Debug)]
pub struct HistoryResponse {
    pub items: Vec<Message>,
    /// 下一页的 after / `after` for the next page
    pub next_after: Option<u64>,
}

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(group_history_handle)));
}

pub async fn group_history_handle(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<HistoryQuery>,
) -> impl Responder {
    let config = gateway.config();
    let limit = query
        .limit
        .unwrap_or(config.default_offline_page)
        .clamp(1, config.max_offline_page);
    match gateway.storage().group_history(&query.group_id, query.after, limit) {
        Ok(items) => {
            let next_after = if items.len() == limit {
                items.last().map(|m| m.sequence_number)
            } else {
                None
            };
            respond_any(StatusCode::OK, HistoryResponse { items, next_after })
        }
        Err(e) => crate::api::error_response(&e),
    }
}
