use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::gateway::Gateway;

/// 启动WS监听 / Start WS listener
pub async fn run(gateway: Arc<Gateway>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    serve(gateway, listener).await
}

/// 在已绑定的监听器上接受连接，直到网关关闭 / Accept on a bound listener until the gateway shuts down
pub async fn serve(gateway: Arc<Gateway>, listener: TcpListener) -> Result<()> {
    info!(
        "🚀 gateway {} WebSocket listening on {}",
        gateway.node_id(),
        listener.local_addr()?
    );
    let mut shutdown_rx = gateway.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = crate::ws::connection::handle_connection(stream, peer_addr, gateway).await {
                        tracing::error!("Connection error from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
    info!("🛑 gateway {} stopped accepting", gateway.node_id());
    Ok(())
}
