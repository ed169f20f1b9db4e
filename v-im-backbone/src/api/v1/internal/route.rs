use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::domain::Envelope;
use crate::gateway::Gateway;

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(route_handle)));
}

// 路由一条消息（服务间调用）/ Route one message (service-to-service)
pub async fn route_handle(
    gateway: web::Data<Arc<Gateway>>,
    envelope: web::Json<Envelope>,
) -> impl Responder {
    match gateway.router().route(envelope.into_inner()).await {
        Ok(result) => respond_any(StatusCode::OK, result),
        Err(e) => crate::api::error_response(&e),
    }
}
