#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use v_im_backbone::domain::{Message, ServerFrame};
use v_im_backbone::gateway::{Gateway, Session};
use v_im_backbone::BackboneConfig;

/// 测试用配置：临时库、小分区数、短快路径超时、关闭确认回落
/// Test config: throwaway database, few partitions, short fast-path timeout, no ack fallback
pub fn test_config() -> BackboneConfig {
    let mut cfg = BackboneConfig::default();
    cfg.storage_path = None;
    cfg.bus_partitions = 4;
    cfg.ack_deadline_ms = 0;
    cfg.router.fast_path_timeout = Duration::from_millis(200);
    cfg.registry.propagation_interval_ms = 50;
    cfg
}

/// 进程内模拟客户端 / In-process client double
pub struct TestClient {
    pub session: Arc<Session>,
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

impl TestClient {
    pub async fn connect(gateway: &Arc<Gateway>, user_id: &str, device_id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = gateway.open_session(None, tx).unwrap();
        gateway.authenticate(&session, user_id, device_id).await.unwrap();
        let mut client = Self { session, rx };
        assert!(matches!(client.next_frame().await, Some(ServerFrame::Welcome { .. })));
        assert!(matches!(client.next_frame().await, Some(ServerFrame::AuthOk { .. })));
        client
    }

    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        self.next_frame_within(Duration::from_secs(3)).await
    }

    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<ServerFrame> {
        loop {
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(WsMessage::Text(text))) => return serde_json::from_str(&text).ok(),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// 下一条推送（跳过其他帧）/ Next pushed message, skipping other frames
    pub async fn next_delivery(&mut self) -> Option<Message> {
        self.next_delivery_within(Duration::from_secs(3)).await
    }

    pub async fn next_delivery_within(&mut self, wait: Duration) -> Option<Message> {
        while let Some(frame) = self.next_frame_within(wait).await {
            if let ServerFrame::Deliver { message } = frame {
                return Some(message);
            }
        }
        None
    }
}

/// 轮询直到条件成立或超时 / Poll until the condition holds or time runs out
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
