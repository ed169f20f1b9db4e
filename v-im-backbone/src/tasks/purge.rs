use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::bus::LogBus;
use crate::dedup::DedupStore;
use crate::storage::Storage;

/// 离线消息保留期清理、过期去重标记回收与总线裁剪
/// Offline retention purge, expired dedup mark reclamation and bus trimming
pub fn spawn_purge_task(
    storage: Arc<Storage>,
    dedup: Arc<dyn DedupStore>,
    bus: LogBus,
    retention: Duration,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cutoff = chrono::Utc::now().timestamp_millis() - retention.as_millis() as i64;
                    if let Err(e) = storage.purge_offline(cutoff) {
                        warn!(error = %e, "⚠️ offline purge failed");
                    }
                    match dedup.purge_expired().await {
                        Ok(n) if n > 0 => debug!(dropped = n, "🧹 expired dedup marks removed"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "⚠️ dedup purge failed"),
                    }
                    if let Err(e) = bus.trim() {
                        warn!(error = %e, "⚠️ bus trim failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
}
