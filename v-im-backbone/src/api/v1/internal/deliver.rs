use actix_web::http::StatusCode;
use actix_web::{web, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::gateway::Gateway;
use crate::router::forward::{DeliverRequest, DeliverResponse};

// 路由注册入口（POST）/ Register route (POST)
pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(deliver_handle)));
}

// 快路径：推给本节点上的指定设备 / Fast path: push to the named devices on this node
pub async fn deliver_handle(
    gateway: web::Data<Arc<Gateway>>,
    req: web::Json<DeliverRequest>,
) -> impl Responder {
    let DeliverRequest { message, device_ids } = req.into_inner();
    let devices = gateway.deliver_local(&message, &device_ids).await;
    respond_any(StatusCode::OK, DeliverResponse { devices })
}
