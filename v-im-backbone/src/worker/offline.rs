use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::RecordHandler;
use crate::bus::Record;
use crate::dedup::{persist_key, DedupStore};
use crate::domain::{DeliveryOutcome, Message};
use crate::storage::Storage;

/// 离线消费组名 / Offline consumer group name
pub const OFFLINE_GROUP: &str = "offline-worker";

/// 消费 `offline_msg`，先落库再打去重标记
/// Consumes `offline_msg`: persist first, mark dedup second
pub struct OfflineWorker {
    worker_id: String,
    storage: Arc<Storage>,
    dedup: Arc<dyn DedupStore>,
    persist_ttl: Duration,
}

impl OfflineWorker {
    pub fn new(
        worker_id: impl Into<String>,
        storage: Arc<Storage>,
        dedup: Arc<dyn DedupStore>,
        persist_ttl: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            storage,
            dedup,
            persist_ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn process(&self, message: &Message) -> DeliveryOutcome {
        let key = persist_key(&message.message_id);
        match self.dedup.contains(&key).await {
            Ok(true) => {
                debug!(worker = %self.worker_id, message_id = %message.message_id, "♻️ already persisted");
                return DeliveryOutcome::AlreadySeen;
            }
            Ok(false) => {}
            Err(e) => return DeliveryOutcome::Failed(e),
        }
        // 存储按 message_id 幂等，标记丢失时重放也安全
        // The store is idempotent on message_id, so a replay after a lost mark is safe
        if let Err(e) = self.storage.upsert_offline(message) {
            return DeliveryOutcome::Failed(e);
        }
        if let Err(e) = self.dedup.mark(&key, self.persist_ttl).await {
            return DeliveryOutcome::Failed(e);
        }
        debug!(
            worker = %self.worker_id,
            message_id = %message.message_id,
            seq = message.sequence_number,
            user_id = message.recipient().unwrap_or_default(),
            "📥 stored offline"
        );
        DeliveryOutcome::Delivered
    }
}

#[async_trait]
impl RecordHandler for OfflineWorker {
    fn name(&self) -> &str {
        &self.worker_id
    }

    async fn handle(&self, record: &Record) -> DeliveryOutcome {
        match record.decode::<Message>() {
            Ok(message) => self.process(&message).await,
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }
}
