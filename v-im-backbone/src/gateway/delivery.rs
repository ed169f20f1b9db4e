use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Gateway, Session};
use crate::dedup::ack_key;
use crate::domain::{DeliveryOutcome, DeviceDelivery, Message, ServerFrame};
use crate::error::{ImError, ImResult};

impl Gateway {
    /// 推送到单个会话，按会话近期记录与设备确认去重
    /// Push to one session, deduplicated by the session's recent ids and device acks
    pub async fn push(&self, session: &Session, message: &Message) -> DeliveryOutcome {
        let Some(identity) = session.identity() else {
            return DeliveryOutcome::Failed(ImError::transient("session", "not registered"));
        };
        if !session.state().is_ready() {
            return DeliveryOutcome::Failed(ImError::transient(
                "session",
                format!("{} is {:?}", session.session_id, session.state()),
            ));
        }
        if session.already_pushed(&message.message_id) {
            return DeliveryOutcome::AlreadySeen;
        }
        let key = ack_key(&message.message_id, &identity.user_id, &identity.device_id);
        match self.deps.dedup.contains(&key).await {
            Ok(true) => return DeliveryOutcome::AlreadySeen,
            Ok(false) => {}
            // 去重不可用时宁可重复也不丢 / Without dedup, prefer a duplicate over a loss
            Err(e) => warn!(error = %e, "⚠️ ack dedup lookup failed, pushing anyway"),
        }
        if let Err(e) = session.send_frame(&ServerFrame::Deliver {
            message: message.clone(),
        }) {
            return DeliveryOutcome::Failed(e);
        }
        session.remember_pushed(&message.message_id);
        debug!(
            message_id = %message.message_id,
            seq = message.sequence_number,
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            "📤 pushed"
        );
        DeliveryOutcome::Delivered
    }

    /// 快路径入口：把单聊消息推给本网关上的指定设备
    /// Fast-path entry: push a direct message to the named devices on this gateway
    pub async fn deliver_local(&self, message: &Message, device_ids: &[String]) -> Vec<DeviceDelivery> {
        let Some(user_id) = message.recipient() else {
            return Vec::new();
        };
        let sessions = self.sessions_of(user_id);
        let mut report = Vec::with_capacity(device_ids.len());
        let mut pushed_devices = Vec::new();
        for device_id in device_ids {
            let session = sessions.iter().find(|s| {
                s.identity()
                    .map(|i| &i.device_id == device_id)
                    .unwrap_or(false)
            });
            let outcome = match session {
                Some(session) => self.push(session, message).await,
                None => DeliveryOutcome::Failed(ImError::transient(
                    "session",
                    format!("{}/{} not on {}", user_id, device_id, self.node_id),
                )),
            };
            if matches!(outcome, DeliveryOutcome::Delivered) {
                pushed_devices.push(device_id.clone());
            }
            report.push(DeviceDelivery {
                device_id: device_id.clone(),
                node_id: self.node_id.clone(),
                accepted: outcome.is_settled(),
            });
        }
        if !pushed_devices.is_empty() {
            self.watch_for_ack(message, user_id, pushed_devices);
        }
        report
    }

    /// 确认后不再重推，同时标记离线副本对该设备已投递
    /// After an ack the message is never re-pushed to this device and its offline copy is flagged for it
    pub async fn record_ack(&self, session: &Session, message_id: &str) -> ImResult<()> {
        let identity = session
            .identity()
            .ok_or_else(|| ImError::PermanentReject("not authenticated".into()))?;
        let key = ack_key(message_id, &identity.user_id, &identity.device_id);
        self.deps.dedup.mark(&key, self.config.ack_ttl).await?;
        if let Err(e) = self
            .deps
            .storage
            .ack_offline(
                &identity.user_id,
                Some(&identity.device_id),
                &[message_id.to_string()],
            )
        {
            warn!(message_id, error = %e, "⚠️ offline ack failed");
        }
        debug!(
            message_id,
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            "✔️ ack recorded"
        );
        Ok(())
    }

    // 推送后在时限内无任何设备确认，则补走慢路径
    // When no pushed device acks within the deadline, the message also takes the slow path
    fn watch_for_ack(&self, message: &Message, user_id: &str, device_ids: Vec<String>) {
        let Some(deadline) = self.config.ack_deadline else {
            return;
        };
        let dedup = self.deps.dedup.clone();
        let router = Arc::clone(&self.deps.router);
        let message = message.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            for device_id in &device_ids {
                match dedup
                    .contains(&ack_key(&message.message_id, &user_id, device_id))
                    .await
                {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "⚠️ ack check failed"),
                }
            }
            info!(
                message_id = %message.message_id,
                user_id = %user_id,
                deadline = ?deadline,
                "⏰ not acked in time, storing offline"
            );
            if let Err(e) = router.slow_path(&message).await {
                warn!(message_id = %message.message_id, error = %e, "⚠️ ack fallback failed");
            }
        });
    }
}
