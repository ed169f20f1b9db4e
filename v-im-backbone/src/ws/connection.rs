use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::domain::ClientFrame;
use crate::gateway::{ConnState, Gateway};
use crate::ws::handler;

/// 处理新连接 / Handle new connection
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, gateway: Arc<Gateway>) -> Result<()> {
    tracing::info!(%peer_addr, "📨 new connection");

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(&msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::debug!("Failed to send message to {}: {}", peer_addr, e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    let session = gateway.open_session(Some(peer_addr), tx)?;
    let session_id = session.session_id.clone();

    {
        let deadline = gateway.config().auth_deadline;
        let watchdog_gateway = gateway.clone();
        let watchdog_session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if watchdog_session.state() == ConnState::Authenticating {
                tracing::warn!(session_id = %watchdog_session.session_id, "disconnecting unauthenticated session");
                watchdog_gateway
                    .close_session(&watchdog_session.session_id, "auth deadline exceeded")
                    .await;
            }
        });
    }

    // 除心跳外的帧进入本连接的串行队列，路由慢时心跳仍能即时应答
    // Frames other than pings go through this connection's serial queue, so a slow route never delays a pong
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let worker_gateway = gateway.clone();
    let worker_session = session.clone();
    let frame_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = handler::handle_frame(&worker_gateway, &worker_session, frame).await {
                tracing::error!(session_id = %worker_session.session_id, error = %e, "frame handling failed");
            }
        }
    });

    let mut closed = session.closed();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    let frame = match handler::parse_frame(&session, &text) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!(session_id = %session_id, error = %e, "frame rejected");
                            continue;
                        }
                    };
                    if handler::answers_inline(&session, &frame) {
                        if let Err(e) = handler::handle_frame(&gateway, &session, frame).await {
                            tracing::error!(session_id = %session_id, error = %e, "ping failed");
                        }
                    } else if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    let _ = session.send_frame(&crate::domain::ServerFrame::Error {
                        message_id: None,
                        reason: "only text frames are supported".to_string(),
                        retry: false,
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session_id, error = %e, "WebSocket error");
                    break;
                }
            },
            _ = closed.changed() => break,
        }
    }

    drop(frame_tx);
    gateway.close_session(&session_id, "connection closed").await;
    // 进行中的路由自行结束，不在半途取消 / An in-flight route runs to completion, never cancelled midway
    drop(frame_task);
    drop(session);
    // 给写任务一点时间把关闭帧发出去 / Let the writer flush the close frame
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
        send_task.abort();
    }
    tracing::info!(session_id = %session_id, "👋 client disconnected");
    Ok(())
}
