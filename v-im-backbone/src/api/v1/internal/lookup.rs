use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::gateway::Gateway;

#[derive(serde::Deserialize)]
pub struct LookupQuery {
    pub uid: String,
}

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::get().to(lookup_handle)));
}

// 查询用户的在线设备 / List a user's registered devices
pub async fn lookup_handle(
    gateway: web::Data<Arc<Gateway>>,
    query: web::Query<LookupQuery>,
) -> impl Responder {
    match gateway.registry().lookup(&query.uid).await {
        Ok(entries) => respond_any(
            StatusCode::OK,
            serde_json::json!({ "uid": query.uid, "entries": entries }),
        ),
        Err(e) => crate::api::error_response(&e),
    }
}
