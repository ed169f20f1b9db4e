//! 总线日志存储 / Bus log storage
//!
//! `LogBus` 只负责消费组与分配；记录与已提交位点落在 `LogStore` 上。
//! `LogBus` owns consumer groups and assignment; records and committed offsets live in a `LogStore`.

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::collections::{HashMap, VecDeque};

use super::Record;
use crate::error::{ImError, ImResult};

const RECORDS_TREE_PREFIX: &str = "bus_records/";
const HEADS_TREE: &str = "bus_heads";
const OFFSETS_TREE: &str = "bus_offsets";

#[async_trait]
pub trait LogStore: Send + Sync {
    /// 追加并返回位点；返回即已落盘 / Append and return the offset, durable once this returns
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        value: Vec<u8>,
        timestamp: i64,
    ) -> ImResult<u64>;

    /// 从 `from` 起读取至多 `max` 条；已裁剪部分跳过 / Read up to `max` from `from`, trimmed ranges are skipped
    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> ImResult<Vec<Record>>;

    /// 下一个待写位点 / Next offset to be written
    fn end_offset(&self, topic: &str, partition: u32) -> ImResult<u64>;

    fn load_offsets(&self, group: &str, topic: &str) -> ImResult<HashMap<u32, u64>>;

    fn save_offset(&self, group: &str, topic: &str, partition: u32, next: u64) -> ImResult<()>;

    /// 某主题下所有持久消费组的位点 / Committed offsets of every durable group on a topic
    fn group_offsets(&self, topic: &str) -> ImResult<HashMap<String, HashMap<u32, u64>>>;

    fn topics(&self) -> ImResult<Vec<String>>;

    /// 删除 `below` 之前的记录，返回删除条数 / Drop records before `below`, returns how many went
    fn trim(&self, topic: &str, partition: u32, below: u64) -> ImResult<usize>;
}

#[derive(Default)]
struct MemoryPartition {
    base: u64,
    records: VecDeque<Record>,
}

impl MemoryPartition {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

/// 进程内日志，测试与单机调试用 / In-process log for tests and single-node debugging
#[derive(Default)]
pub struct MemoryLog {
    partitions: RwLock<HashMap<(String, u32), MemoryPartition>>,
    offsets: RwLock<HashMap<(String, String), HashMap<u32, u64>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        value: Vec<u8>,
        timestamp: i64,
    ) -> ImResult<u64> {
        let mut parts = self.partitions.write();
        let log = parts.entry((topic.to_string(), partition)).or_default();
        let offset = log.end();
        log.records.push_back(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            value,
            timestamp,
        });
        Ok(offset)
    }

    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> ImResult<Vec<Record>> {
        let parts = self.partitions.read();
        let Some(log) = parts.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };
        let skip = from.saturating_sub(log.base) as usize;
        Ok(log.records.iter().skip(skip).take(max).cloned().collect())
    }

    fn end_offset(&self, topic: &str, partition: u32) -> ImResult<u64> {
        Ok(self
            .partitions
            .read()
            .get(&(topic.to_string(), partition))
            .map(MemoryPartition::end)
            .unwrap_or(0))
    }

    fn load_offsets(&self, group: &str, topic: &str) -> ImResult<HashMap<u32, u64>> {
        Ok(self
            .offsets
            .read()
            .get(&(group.to_string(), topic.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn save_offset(&self, group: &str, topic: &str, partition: u32, next: u64) -> ImResult<()> {
        self.offsets
            .write()
            .entry((group.to_string(), topic.to_string()))
            .or_default()
            .insert(partition, next);
        Ok(())
    }

    fn group_offsets(&self, topic: &str) -> ImResult<HashMap<String, HashMap<u32, u64>>> {
        Ok(self
            .offsets
            .read()
            .iter()
            .filter(|((_, t), _)| t == topic)
            .map(|((g, _), offsets)| (g.clone(), offsets.clone()))
            .collect())
    }

    fn topics(&self) -> ImResult<Vec<String>> {
        let mut topics: Vec<String> = self
            .partitions
            .read()
            .keys()
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    fn trim(&self, topic: &str, partition: u32, below: u64) -> ImResult<usize> {
        let mut parts = self.partitions.write();
        let Some(log) = parts.get_mut(&(topic.to_string(), partition)) else {
            return Ok(0);
        };
        let mut dropped = 0;
        while log.base < below && log.records.pop_front().is_some() {
            log.base += 1;
            dropped += 1;
        }
        Ok(dropped)
    }
}

/// 基于 sled 的持久日志 / Durable log on sled
///
/// 每个 (主题, 分区) 一棵记录树，键为大端位点；`bus_heads` 记下一个位点，
/// `bus_offsets` 记各消费组已提交位点。
/// One records tree per (topic, partition) keyed by big-endian offset; `bus_heads` holds the
/// next offset and `bus_offsets` the committed offsets of each group.
pub struct SledLog {
    db: sled::Db,
    heads: sled::Tree,
    offsets: sled::Tree,
    trees: RwLock<HashMap<(String, u32), sled::Tree>>,
}

impl SledLog {
    pub fn open(db: &sled::Db) -> ImResult<Self> {
        Ok(Self {
            db: db.clone(),
            heads: db.open_tree(HEADS_TREE)?,
            offsets: db.open_tree(OFFSETS_TREE)?,
            trees: RwLock::new(HashMap::new()),
        })
    }

    fn records(&self, topic: &str, partition: u32) -> ImResult<sled::Tree> {
        let key = (topic.to_string(), partition);
        if let Some(tree) = self.trees.read().get(&key) {
            return Ok(tree.clone());
        }
        let tree = self
            .db
            .open_tree(format!("{}{}/{}", RECORDS_TREE_PREFIX, topic, partition))?;
        self.trees.write().insert(key, tree.clone());
        Ok(tree)
    }
}

fn head_key(topic: &str, partition: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + 5);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(&partition.to_be_bytes());
    key
}

fn offset_prefix(topic: &str, group: Option<&str>) -> Vec<u8> {
    let mut key = Vec::new();
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    if let Some(group) = group {
        key.extend_from_slice(group.as_bytes());
        key.push(0);
    }
    key
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

// 帧格式 / frame: [key_len u32][key][timestamp i64][payload]
fn encode_frame(key: &str, timestamp: i64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_frame(topic: &str, partition: u32, offset: u64, raw: &[u8]) -> ImResult<Record> {
    let corrupt = || ImError::Storage(format!("corrupt bus frame {}/{}@{}", topic, partition, offset));
    let key_len = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(corrupt)? as usize;
    let key = raw.get(4..4 + key_len).ok_or_else(corrupt)?;
    let ts: [u8; 8] = raw
        .get(4 + key_len..12 + key_len)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(corrupt)?;
    Ok(Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: String::from_utf8_lossy(key).into_owned(),
        value: raw[12 + key_len..].to_vec(),
        timestamp: i64::from_be_bytes(ts),
    })
}

#[async_trait]
impl LogStore for SledLog {
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        value: Vec<u8>,
        timestamp: i64,
    ) -> ImResult<u64> {
        let records = self.records(topic, partition)?;
        let head = head_key(topic, partition);
        let frame = encode_frame(key, timestamp, &value);
        let offset = (&records, &self.heads)
            .transaction(|(records, heads)| -> ConflictableTransactionResult<u64, ()> {
                let next = heads.get(head.as_slice())?.map(|v| read_u64(&v)).unwrap_or(0);
                records.insert(next.to_be_bytes().to_vec(), frame.as_slice())?;
                heads.insert(head.as_slice(), (next + 1).to_be_bytes().to_vec())?;
                Ok(next)
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => ImError::from(e),
                TransactionError::Abort(()) => ImError::Storage("bus append aborted".into()),
            })?;
        self.db.flush_async().await?;
        Ok(offset)
    }

    fn read(&self, topic: &str, partition: u32, from: u64, max: usize) -> ImResult<Vec<Record>> {
        let records = self.records(topic, partition)?;
        let mut out = Vec::new();
        for item in records.range(from.to_be_bytes()..).take(max) {
            let (k, v) = item?;
            out.push(decode_frame(topic, partition, read_u64(&k), &v)?);
        }
        Ok(out)
    }

    fn end_offset(&self, topic: &str, partition: u32) -> ImResult<u64> {
        Ok(self
            .heads
            .get(head_key(topic, partition))?
            .map(|v| read_u64(&v))
            .unwrap_or(0))
    }

    fn load_offsets(&self, group: &str, topic: &str) -> ImResult<HashMap<u32, u64>> {
        let prefix = offset_prefix(topic, Some(group));
        let mut out = HashMap::new();
        for item in self.offsets.scan_prefix(&prefix) {
            let (k, v) = item?;
            out.insert(read_u64(&k[prefix.len()..]) as u32, read_u64(&v));
        }
        Ok(out)
    }

    fn save_offset(&self, group: &str, topic: &str, partition: u32, next: u64) -> ImResult<()> {
        let mut key = offset_prefix(topic, Some(group));
        key.extend_from_slice(&partition.to_be_bytes());
        // 只前进 / forward only
        self.offsets.fetch_and_update(key, |old| {
            let current = old.map(read_u64).unwrap_or(0);
            Some(current.max(next).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    fn group_offsets(&self, topic: &str) -> ImResult<HashMap<String, HashMap<u32, u64>>> {
        let prefix = offset_prefix(topic, None);
        let mut out: HashMap<String, HashMap<u32, u64>> = HashMap::new();
        for item in self.offsets.scan_prefix(&prefix) {
            let (k, v) = item?;
            let rest = &k[prefix.len()..];
            let Some(split) = rest.iter().position(|b| *b == 0) else {
                continue;
            };
            let group = String::from_utf8_lossy(&rest[..split]).into_owned();
            let partition = read_u64(&rest[split + 1..]) as u32;
            out.entry(group).or_default().insert(partition, read_u64(&v));
        }
        Ok(out)
    }

    fn topics(&self) -> ImResult<Vec<String>> {
        let mut topics = Vec::new();
        for item in self.heads.iter() {
            let (k, _) = item?;
            if let Some(split) = k.iter().position(|b| *b == 0) {
                topics.push(String::from_utf8_lossy(&k[..split]).into_owned());
            }
        }
        topics.dedup();
        Ok(topics)
    }

    fn trim(&self, topic: &str, partition: u32, below: u64) -> ImResult<usize> {
        let records = self.records(topic, partition)?;
        let mut dropped = 0;
        for item in records.range(..below.to_be_bytes()) {
            let (k, _) = item?;
            records.remove(k)?;
            dropped += 1;
        }
        Ok(dropped)
    }
}
