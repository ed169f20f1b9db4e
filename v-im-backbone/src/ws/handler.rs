use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{ClientFrame, Envelope, Payload, ServerFrame, Target};
use crate::gateway::{Gateway, Session};

/// 处理一条客户端文本帧 / Handle one client text frame
pub async fn dispatch(gateway: &Arc<Gateway>, session: &Arc<Session>, text: &str) -> Result<()> {
    match parse_frame(session, text)? {
        Some(frame) => handle_frame(gateway, session, frame).await,
        None => Ok(()),
    }
}

/// 解析文本帧；无法解析时已回复错误帧 / Parse a text frame, an error frame is already sent on failure
pub fn parse_frame(session: &Session, text: &str) -> Result<Option<ClientFrame>> {
    debug!(session_id = %session.session_id, text, "📨 frame received");
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            session.send_frame(&ServerFrame::Error {
                message_id: None,
                reason: format!("invalid frame: {}", e),
                retry: false,
            })?;
            Ok(None)
        }
    }
}

/// 已登录会话的心跳帧可以不排队直接应答 / Pings on a ready session can be answered without queueing
pub fn answers_inline(session: &Session, frame: &ClientFrame) -> bool {
    matches!(frame, ClientFrame::Ping) && session.state().is_ready()
}

pub async fn handle_frame(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    frame: ClientFrame,
) -> Result<()> {
    match frame {
        ClientFrame::Auth { token, device_id } => {
            if let Err(e) = gateway.authenticate(session, &token, &device_id).await {
                warn!(session_id = %session.session_id, error = %e, "🔐 auth failed");
                // 会话可能已被关闭，发送失败无妨 / The session may already be closed
                let _ = session.send_frame(&ServerFrame::Error {
                    message_id: None,
                    reason: e.to_string(),
                    retry: e.is_retryable(),
                });
            }
        }
        _ if !session.state().is_ready() => {
            session.send_frame(&ServerFrame::Error {
                message_id: None,
                reason: "not authenticated".to_string(),
                retry: false,
            })?;
        }
        ClientFrame::Send {
            message_id,
            target,
            payload,
            client_timestamp,
        } => handle_send(gateway, session, message_id, target, payload, client_timestamp).await?,
        ClientFrame::Ack { message_id } => {
            if let Err(e) = gateway.record_ack(session, &message_id).await {
                warn!(message_id, session_id = %session.session_id, error = %e, "⚠️ ack not recorded");
            }
        }
        ClientFrame::Ping => {
            session.touch();
            session.send_frame(&ServerFrame::Pong {
                timestamp: chrono::Utc::now().timestamp_millis(),
            })?;
        }
        ClientFrame::PullOffline { cursor, limit } => {
            let Some(identity) = session.identity() else {
                return Ok(());
            };
            let reply = match gateway
                .pull_offline(
                    &identity.user_id,
                    Some(&identity.device_id),
                    cursor.as_deref(),
                    limit,
                )
                .await
            {
                Ok((items, next_cursor)) => ServerFrame::OfflinePage { items, next_cursor },
                Err(e) => ServerFrame::Error {
                    message_id: None,
                    reason: e.to_string(),
                    retry: e.is_retryable(),
                },
            };
            session.send_frame(&reply)?;
        }
    }
    Ok(())
}

// 同一连接上的发送串行处理，发送方顺序即路由顺序
// Sends on one connection are handled serially, so sender order is routing order
async fn handle_send(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    message_id: Option<String>,
    target: Target,
    payload: Payload,
    client_timestamp: Option<i64>,
) -> Result<()> {
    let Some(sender_id) = session.user_id() else {
        return Ok(());
    };
    let envelope = Envelope {
        message_id: message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        sender_id,
        target,
        payload,
        client_timestamp,
    };
    let message_id = envelope.message_id.clone();
    let reply = match gateway.router().route(envelope).await {
        Ok(result) => ServerFrame::SendAck {
            message_id,
            sequence_number: result.message.sequence_number,
            path: result.path,
        },
        Err(e) => {
            warn!(message_id = %message_id, error = %e, "⚠️ route failed");
            ServerFrame::Error {
                message_id: Some(message_id),
                reason: e.to_string(),
                retry: e.is_retryable(),
            }
        }
    };
    session.send_frame(&reply)?;
    Ok(())
}
