use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::store::{LogStore, MemoryLog, SledLog};
use super::{Consumer, MessageBus, Record, StartFrom};
use crate::cluster::placement::{hrw_select, partition_for};
use crate::error::{ImError, ImResult};

struct GroupState {
    members: BTreeSet<String>,
    // partition -> next offset to consume
    committed: HashMap<u32, u64>,
    generation: u64,
    // Earliest 组的位点落盘，Latest 组只跟随实时尾部 / Earliest groups persist offsets, Latest groups only tail
    durable: bool,
}

struct Inner {
    partitions: u32,
    store: Arc<dyn LogStore>,
    // (group, topic) -> state
    groups: Mutex<HashMap<(String, String), GroupState>>,
    notify: Notify,
}

impl Inner {
    fn end_offsets(&self, topic: &str) -> ImResult<Vec<u64>> {
        (0..self.partitions)
            .map(|p| self.store.end_offset(topic, p))
            .collect()
    }
}

/// 分区追加日志上的消费组 / Consumer groups over a partitioned append-only log
///
/// 分区按消费组成员做 HRW 分配，成员变化即重平衡。
/// 持久组（`StartFrom::Earliest`）的位点随提交写入存储，重启后从已提交位点继续，
/// 未提交的记录会被重放。
/// Partitions are spread over group members with HRW; any membership change rebalances.
/// Durable groups (`StartFrom::Earliest`) write offsets through on commit, so after a
/// restart they resume from the committed offset and uncommitted records replay.
#[derive(Clone)]
pub struct LogBus {
    inner: Arc<Inner>,
}

impl LogBus {
    pub fn with_store(store: Arc<dyn LogStore>, partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                store,
                groups: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn in_memory(partitions: u32) -> Self {
        Self::with_store(Arc::new(MemoryLog::new()), partitions)
    }

    /// 记录与位点写入给定的 sled 库 / Records and offsets go to the given sled database
    pub fn persistent(db: &sled::Db, partitions: u32) -> ImResult<Self> {
        Ok(Self::with_store(Arc::new(SledLog::open(db)?), partitions))
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    pub fn end_offsets(&self, topic: &str) -> ImResult<Vec<u64>> {
        self.inner.end_offsets(topic)
    }

    /// 消费组尚未提交的记录数 / Records the group has not committed yet
    pub fn lag(&self, group: &str, topic: &str) -> ImResult<u64> {
        let ends = self.inner.end_offsets(topic)?;
        let committed = {
            let groups = self.inner.groups.lock();
            groups
                .get(&(group.to_string(), topic.to_string()))
                .map(|g| g.committed.clone())
        };
        let committed = match committed {
            Some(c) => c,
            None => self.inner.store.load_offsets(group, topic)?,
        };
        Ok(ends
            .iter()
            .enumerate()
            .map(|(p, end)| end - committed.get(&(p as u32)).copied().unwrap_or(0).min(*end))
            .sum())
    }

    /// 裁掉所有消费组都已提交的记录 / Drop records every consumer group has committed
    ///
    /// 某分区的下界取持久组（含当前未在线的）与在线的实时组已提交位点的最小值；
    /// 主题上没有任何组时不裁剪。
    /// The floor of a partition is the minimum committed offset across durable groups
    /// (offline ones included) and live tailing groups; topics with no group are left alone.
    pub fn trim(&self) -> ImResult<usize> {
        let mut dropped = 0;
        for topic in self.inner.store.topics()? {
            let mut floors: Vec<HashMap<u32, u64>> = self
                .inner
                .store
                .group_offsets(&topic)?
                .into_values()
                .collect();
            {
                let groups = self.inner.groups.lock();
                for ((_, t), state) in groups.iter() {
                    if t == &topic && (state.durable || !state.members.is_empty()) {
                        floors.push(state.committed.clone());
                    }
                }
            }
            if floors.is_empty() {
                continue;
            }
            for p in 0..self.inner.partitions {
                let below = floors
                    .iter()
                    .map(|c| c.get(&p).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                if below > 0 {
                    dropped += self.inner.store.trim(&topic, p, below)?;
                }
            }
        }
        if dropped > 0 {
            debug!(dropped, "🧹 trimmed committed bus records");
        }
        Ok(dropped)
    }
}

#[async_trait]
impl MessageBus for LogBus {
    async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> ImResult<(u32, u64)> {
        let partition = partition_for(key, self.inner.partitions);
        let offset = self
            .inner
            .store
            .append(
                topic,
                partition,
                key,
                value,
                chrono::Utc::now().timestamp_millis(),
            )
            .await
            .map_err(|e| ImError::transient("bus", e))?;
        self.inner.notify.notify_waiters();
        debug!(topic, partition, offset, key, "📮 published");
        Ok((partition, offset))
    }

    async fn subscribe(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
        start: StartFrom,
    ) -> ImResult<Box<dyn Consumer>> {
        let key = (group.to_string(), topic.to_string());
        let known = self.inner.groups.lock().contains_key(&key);
        // 存储读取放在锁外 / store reads happen outside the lock
        let initial = if known {
            HashMap::new()
        } else {
            match start {
                StartFrom::Earliest => self.inner.store.load_offsets(group, topic)?,
                StartFrom::Latest => self
                    .inner
                    .end_offsets(topic)?
                    .into_iter()
                    .enumerate()
                    .map(|(p, end)| (p as u32, end))
                    .collect(),
            }
        };
        {
            let mut groups = self.inner.groups.lock();
            let state = groups.entry(key.clone()).or_insert_with(|| GroupState {
                members: BTreeSet::new(),
                committed: initial,
                generation: 0,
                durable: start == StartFrom::Earliest,
            });
            state.members.insert(member_id.to_string());
            state.generation += 1;
            info!(
                member_id,
                group,
                topic,
                members = state.members.len(),
                "🤝 joined consumer group"
            );
        }
        self.inner.notify.notify_waiters();
        Ok(Box::new(LogConsumer {
            inner: self.inner.clone(),
            key,
            member_id: member_id.to_string(),
            generation: 0,
            assigned: Vec::new(),
            positions: HashMap::new(),
        }))
    }
}

struct LogConsumer {
    inner: Arc<Inner>,
    key: (String, String),
    member_id: String,
    generation: u64,
    assigned: Vec<u32>,
    positions: HashMap<u32, u64>,
}

impl LogConsumer {
    fn rebalance_if_needed(&mut self) {
        let groups = self.inner.groups.lock();
        let Some(state) = groups.get(&self.key) else {
            return;
        };
        if state.generation == self.generation {
            return;
        }
        self.generation = state.generation;
        let topic = &self.key.1;
        self.assigned = (0..self.inner.partitions)
            .filter(|p| {
                let label = format!("{}-{}", topic, p);
                hrw_select(&label, state.members.iter().map(String::as_str))
                    == Some(self.member_id.as_str())
            })
            .collect();
        self.positions = self
            .assigned
            .iter()
            .map(|p| (*p, state.committed.get(p).copied().unwrap_or(0)))
            .collect();
        info!(
            member_id = %self.member_id,
            group = %self.key.0,
            partitions = ?self.assigned,
            "⚖️ partitions reassigned"
        );
    }

    fn fetch(&mut self, max: usize) -> ImResult<Vec<Record>> {
        self.rebalance_if_needed();
        let mut out = Vec::new();
        for p in &self.assigned {
            let pos = self.positions.entry(*p).or_insert(0);
            let batch = self
                .inner
                .store
                .read(&self.key.1, *p, *pos, max - out.len())
                .map_err(|e| ImError::transient("bus", e))?;
            if let Some(last) = batch.last() {
                *pos = last.offset + 1;
            }
            out.extend(batch);
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Consumer for LogConsumer {
    async fn poll(&mut self, max: usize, wait: Duration) -> ImResult<Vec<Record>> {
        let deadline = Instant::now() + wait;
        let inner = self.inner.clone();
        loop {
            // 先登记等待再检查，避免漏掉唤醒 / Register interest before checking to avoid lost wakeups
            let notified = inner.notify.notified();
            let batch = self.fetch(max.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, record: &Record) -> ImResult<()> {
        let mut groups = self.inner.groups.lock();
        let state = groups
            .get_mut(&self.key)
            .ok_or_else(|| ImError::transient("bus", "consumer group vanished"))?;
        let next = record.offset + 1;
        let committed = state.committed.entry(record.partition).or_insert(0);
        if next > *committed {
            *committed = next;
            if state.durable {
                self.inner
                    .store
                    .save_offset(&self.key.0, &self.key.1, record.partition, next)
                    .map_err(|e| ImError::transient("bus", e))?;
            }
        }
        Ok(())
    }

    async fn rewind(&mut self) -> ImResult<()> {
        let groups = self.inner.groups.lock();
        if let Some(state) = groups.get(&self.key) {
            for p in &self.assigned {
                self.positions
                    .insert(*p, state.committed.get(p).copied().unwrap_or(0));
            }
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<u32> {
        self.assigned.clone()
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        {
            let mut groups = self.inner.groups.lock();
            if let Some(state) = groups.get_mut(&self.key) {
                state.members.remove(&self.member_id);
                state.generation += 1;
                // 实时组无人即散 / a tailing group with nobody left is gone
                if !state.durable && state.members.is_empty() {
                    groups.remove(&self.key);
                }
            }
        }
        info!(member_id = %self.member_id, group = %self.key.0, "👋 left consumer group");
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    async fn fill(bus: &LogBus, topic: &str, keys: &[&str]) {
        for (i, k) in keys.iter().enumerate() {
            bus.publish(topic, k, format!("{}", i).into_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn same_key_keeps_order() {
        let bus = LogBus::in_memory(8);
        fill(&bus, "t", &["bob", "bob", "bob"]).await;
        let mut c = bus.subscribe("g", "t", "m1", StartFrom::Earliest).await.unwrap();
        let batch = c.poll(10, WAIT).await.unwrap();
        let values: Vec<String> = batch
            .iter()
            .map(|r| String::from_utf8(r.value.clone()).unwrap())
            .collect();
        assert_eq!(values, vec!["0", "1", "2"]);
        assert!(batch.iter().all(|r| r.partition == batch[0].partition));
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered() {
        let bus = LogBus::in_memory(4);
        fill(&bus, "t", &["a", "a"]).await;
        let mut c = bus.subscribe("g", "t", "m1", StartFrom::Earliest).await.unwrap();
        let batch = c.poll(10, WAIT).await.unwrap();
        c.commit(&batch[0]).await.unwrap();
        c.rewind().await.unwrap();
        let again = c.poll(10, WAIT).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].offset, batch[1].offset);
        assert_eq!(bus.lag("g", "t").unwrap(), 1);
    }

    #[tokio::test]
    async fn departed_member_partitions_move_to_survivor() {
        let bus = LogBus::in_memory(8);
        let keys: Vec<String> = (0..40).map(|i| format!("user-{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        fill(&bus, "t", &refs).await;

        let mut a = bus.subscribe("g", "t", "a", StartFrom::Earliest).await.unwrap();
        let b = bus.subscribe("g", "t", "b", StartFrom::Earliest).await.unwrap();
        let first = a.poll(100, WAIT).await.unwrap();
        for r in &first {
            a.commit(r).await.unwrap();
        }

        drop(b);
        let rest = a.poll(100, WAIT).await.unwrap();
        assert_eq!(first.len() + rest.len(), 40);
        assert_eq!(a.assignment().len(), 8);
    }

    #[tokio::test]
    async fn latest_start_skips_history_and_groups_are_independent() {
        let bus = LogBus::in_memory(2);
        fill(&bus, "t", &["x", "y"]).await;
        let mut late = bus.subscribe("gw", "t", "gw-1", StartFrom::Latest).await.unwrap();
        let mut archive = bus.subscribe("arch", "t", "a1", StartFrom::Earliest).await.unwrap();
        assert!(late.poll(10, WAIT).await.unwrap().is_empty());
        assert_eq!(archive.poll(10, WAIT).await.unwrap().len(), 2);

        bus.publish("t", "x", b"new".to_vec()).await.unwrap();
        let got = late.poll(10, WAIT).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, b"new".to_vec());
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let bus = LogBus::in_memory(1);
        let mut c = bus.subscribe("g", "t", "m", StartFrom::Earliest).await.unwrap();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", "k", vec![1]).await.unwrap();
        });
        let got = c.poll(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    // sled 在所有句柄释放后才解锁目录 / sled unlocks the directory once every handle is gone
    async fn reopen(path: &std::path::Path) -> sled::Db {
        for _ in 0..50 {
            if let Ok(db) = sled::open(path) {
                return db;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("sled directory stayed locked");
    }

    #[tokio::test]
    async fn uncommitted_records_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.sled");
        {
            let db = sled::open(&path).unwrap();
            let bus = LogBus::persistent(&db, 4).unwrap();
            fill(&bus, "offline_msg", &["bob", "bob"]).await;
            let mut c = bus
                .subscribe("offline-worker", "offline_msg", "w1", StartFrom::Earliest)
                .await
                .unwrap();
            let batch = c.poll(10, WAIT).await.unwrap();
            assert_eq!(batch.len(), 2);
            // 只提交第一条就"崩溃" / commit the first one only, then go away
            c.commit(&batch[0]).await.unwrap();
            db.flush_async().await.unwrap();
        }

        let db = reopen(&path).await;
        let bus = LogBus::persistent(&db, 4).unwrap();
        let mut c = bus
            .subscribe("offline-worker", "offline_msg", "w1", StartFrom::Earliest)
            .await
            .unwrap();
        let replay = c.poll(10, WAIT).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].value, b"1".to_vec());
        c.commit(&replay[0]).await.unwrap();
        assert_eq!(bus.lag("offline-worker", "offline_msg").unwrap(), 0);

        drop(c);
        drop(bus);
        db.flush_async().await.unwrap();
        drop(db);
        let db = reopen(&path).await;
        let bus = LogBus::persistent(&db, 4).unwrap();
        let mut c = bus
            .subscribe("offline-worker", "offline_msg", "w1", StartFrom::Earliest)
            .await
            .unwrap();
        assert!(c.poll(10, WAIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trim_stops_at_the_slowest_group() {
        let bus = LogBus::in_memory(1);
        fill(&bus, "t", &["k", "k", "k"]).await;
        let mut fast = bus.subscribe("fast", "t", "f", StartFrom::Earliest).await.unwrap();
        let mut slow = bus.subscribe("slow", "t", "s", StartFrom::Earliest).await.unwrap();
        for r in fast.poll(10, WAIT).await.unwrap() {
            fast.commit(&r).await.unwrap();
        }
        let first = slow.poll(1, WAIT).await.unwrap();
        slow.commit(&first[0]).await.unwrap();

        assert_eq!(bus.trim().unwrap(), 1);
        assert_eq!(bus.end_offsets("t").unwrap(), vec![3]);

        // 慢组离线后依然约束下界 / an offline durable group still holds the floor
        drop(slow);
        assert_eq!(bus.trim().unwrap(), 0);
        let mut slow = bus.subscribe("slow", "t", "s", StartFrom::Earliest).await.unwrap();
        let rest = slow.poll(10, WAIT).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].offset, 1);
    }
}
