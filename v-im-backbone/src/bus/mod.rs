//! 消息总线 / Message bus
//!
//! 分区、持久的追加日志，带消费组与显式位点提交。
//! 未提交的记录在重平衡、回退或进程重启后会被再次投递（至少一次）。
//! Partitioned append-only log with consumer groups and explicit offset commits.
//! Uncommitted records are redelivered after a rebalance, a rewind or a restart (at-least-once).

pub mod log;
pub mod store;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::{ImError, ImResult};

pub use log::LogBus;
pub use store::{LogStore, MemoryLog, SledLog};

pub const TOPIC_GROUP: &str = "group_msg";
pub const TOPIC_OFFLINE: &str = "offline_msg";
pub const TOPIC_MEMBERSHIP: &str = "membership_change";

/// 日志中的一条记录 / One record in the log
#[derive(Clone, Debug)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Record {
    pub fn decode<T: DeserializeOwned>(&self) -> ImResult<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            ImError::PermanentReject(format!(
                "undecodable record {}/{}@{}: {}",
                self.topic, self.partition, self.offset, e
            ))
        })
    }
}

/// 新消费组的起始位置 / Where a brand-new consumer group starts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartFrom {
    Earliest,
    Latest,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 按键哈希分区追加，返回 (分区, 位点) / Append by key hash, returns (partition, offset)
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> ImResult<(u32, u64)>;

    /// 以 `member_id` 身份加入消费组 / Join a consumer group as `member_id`
    async fn subscribe(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
        start: StartFrom,
    ) -> ImResult<Box<dyn Consumer>>;
}

/// 消费组成员；drop 即离组 / Consumer group member, dropping it leaves the group
#[async_trait]
pub trait Consumer: Send {
    /// 最多等待 `wait`，超时返回空批次 / Waits up to `wait`, empty batch on timeout
    async fn poll(&mut self, max: usize, wait: Duration) -> ImResult<Vec<Record>>;

    /// 提交位点（只前进）/ Commit an offset, never moves backwards
    async fn commit(&mut self, record: &Record) -> ImResult<()>;

    /// 回到已提交位点，未提交记录将重投 / Go back to committed offsets so uncommitted records repeat
    async fn rewind(&mut self) -> ImResult<()>;

    /// 当前分配到的分区 / Partitions currently assigned
    fn assignment(&self) -> Vec<u32>;
}

pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    key: &str,
    value: &T,
) -> ImResult<(u32, u64)> {
    let bytes = serde_json::to_vec(value)?;
    bus.publish(topic, key, bytes).await
}
