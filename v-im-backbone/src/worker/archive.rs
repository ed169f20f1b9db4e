use async_trait::async_trait;
use std::sync::Arc;

use super::RecordHandler;
use crate::bus::Record;
use crate::domain::{DeliveryOutcome, Message};
use crate::storage::Storage;

pub const ARCHIVE_GROUP: &str = "group-archiver";

/// 群消息归档，独立消费组，支撑历史查询
/// Group history archiver on its own consumer group, backs history reads
pub struct GroupArchiver {
    storage: Arc<Storage>,
}

impl GroupArchiver {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RecordHandler for GroupArchiver {
    fn name(&self) -> &str {
        ARCHIVE_GROUP
    }

    async fn handle(&self, record: &Record) -> DeliveryOutcome {
        let message = match record.decode::<Message>() {
            Ok(m) => m,
            Err(e) => return DeliveryOutcome::Failed(e),
        };
        match self.storage.archive_group(&message) {
            Ok(true) => DeliveryOutcome::Delivered,
            Ok(false) => DeliveryOutcome::AlreadySeen,
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }
}
