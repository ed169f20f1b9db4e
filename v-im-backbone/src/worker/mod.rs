//! 总线消费者：统一的拉取-处理-提交循环
//! Bus consumers: one shared poll, handle, commit loop

pub mod archive;
pub mod offline;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{Consumer, Record};
use crate::domain::DeliveryOutcome;

pub use archive::GroupArchiver;
pub use offline::OfflineWorker;

#[async_trait]
pub trait RecordHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, record: &Record) -> DeliveryOutcome;
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub batch: usize,
    pub poll_wait: Duration,
    pub retry_backoff: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            batch: 64,
            poll_wait: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// 处理成功才提交；可重试失败时回退到已提交位点并退避
/// Commit only after success; a retryable failure rewinds to the committed offset and backs off
pub async fn drive(
    mut consumer: Box<dyn Consumer>,
    handler: Arc<dyn RecordHandler>,
    cfg: DriveConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(worker = handler.name(), "▶️ consuming");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let polled = tokio::select! {
            polled = consumer.poll(cfg.batch, cfg.poll_wait) => polled,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() { break; }
                continue;
            }
        };
        let records = match polled {
            Ok(records) => records,
            Err(e) => {
                warn!(worker = handler.name(), error = %e, "⚠️ poll failed");
                tokio::time::sleep(cfg.retry_backoff).await;
                continue;
            }
        };
        for record in records {
            match handler.handle(&record).await {
                DeliveryOutcome::Failed(e) if e.is_retryable() => {
                    warn!(
                        worker = handler.name(),
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "🔁 handling failed, will retry"
                    );
                    if let Err(e) = consumer.rewind().await {
                        warn!(worker = handler.name(), error = %e, "⚠️ rewind failed");
                    }
                    tokio::time::sleep(cfg.retry_backoff).await;
                    break;
                }
                outcome => {
                    if let DeliveryOutcome::Failed(e) = &outcome {
                        error!(
                            worker = handler.name(),
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "☠️ dropping record"
                        );
                    }
                    if let Err(e) = consumer.commit(&record).await {
                        warn!(worker = handler.name(), error = %e, "⚠️ commit failed");
                    }
                }
            }
        }
    }
    info!(worker = handler.name(), "⏹️ stopped");
}
