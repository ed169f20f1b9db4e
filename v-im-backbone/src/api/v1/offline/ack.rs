use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, Responder};
use std::sync::Arc;
use v::response::respond_any;

use crate::gateway::Gateway;

#[derive(serde::Deserialize)]
pub struct AckRequest {
    /// 确认的设备；缺省时对全部设备生效 / Acking device, without it the ack covers every device
    #[serde(default)]
    pub device_id: Option<String>,
    pub message_ids: Vec<String>,
}

pub fn register(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path).route(web::post().to(offline_ack_handle)));
}

// 标记离线消息已送达 / Mark offline messages delivered
pub async fn offline_ack_handle(
    gateway: web::Data<Arc<Gateway>>,
    body: web::Json<AckRequest>,
    req: HttpRequest,
) -> impl Responder {
    let user_id = match crate::api::bearer_user(&req, &gateway).await {
        Ok(uid) => uid,
        Err(resp) => return resp,
    };
    match gateway
        .storage()
        .ack_offline(&user_id, body.device_id.as_deref(), &body.message_ids)
    {
        Ok(acked) => respond_any(StatusCode::OK, serde_json::json!({ "acked": acked })),
        Err(e) => crate::api::error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Envelope, Message, Target};
    use crate::gateway::{test_gateway, GatewayConfig};
    use crate::registry::MemoryRegistry;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_ack_requires_a_token_and_stays_in_its_own_queue() {
        let gateway = test_gateway(Arc::new(MemoryRegistry::new()), GatewayConfig::default());
        let message = Message::sequenced(
            Envelope::new("alice", Target::User("carol".into()), "hi").with_message_id("m1"),
            1,
        );
        gateway.storage().upsert_offline(&message).unwrap();
        let storage = gateway.storage().clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(gateway))
                .configure(|cfg| register(cfg, "/v1/offline/ack")),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/offline/ack")
            .set_json(serde_json::json!({ "message_ids": ["m1"] }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        // bob 的令牌碰不到 carol 的消息 / bob's token cannot touch carol's row
        let req = test::TestRequest::post()
            .uri("/v1/offline/ack")
            .insert_header(("Authorization", "Bearer bob"))
            .set_json(serde_json::json!({ "message_ids": ["m1"] }))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        let (rows, _) = storage.pull_offline("carol", None, None, 10).unwrap();
        assert_eq!(rows.len(), 1);

        let req = test::TestRequest::post()
            .uri("/v1/offline/ack")
            .insert_header(("Authorization", "Bearer carol"))
            .set_json(serde_json::json!({ "device_id": "tablet", "message_ids": ["m1"] }))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        let (rows, _) = storage.pull_offline("carol", Some("tablet"), None, 10).unwrap();
        assert!(rows.is_empty());
        let (rows, _) = storage.pull_offline("carol", Some("phone"), None, 10).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
