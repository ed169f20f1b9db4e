//! 存储模块：离线消息与群历史归档
//! Storage module: offline messages and group history archive
//!
//! 键为 `owner 0x00 seq(大端)`，按序列号天然有序。
//! Keys are `owner 0x00 seq(big-endian)`, so scans come back in sequence order.

use sled::transaction::{ConflictableTransactionResult, TransactionError, Transactional};
use sled::{Db, Tree};
use tracing::{debug, info};

use crate::domain::{Message, OfflineMessage};
use crate::error::{ImError, ImResult};

pub struct Storage {
    db: Db,
    offline: Tree,
    offline_index: Tree,
    archive: Tree,
    archive_index: Tree,
}

fn owner_prefix(owner: &str) -> Vec<u8> {
    let mut key = owner.as_bytes().to_vec();
    key.push(0);
    key
}

fn row_key(owner: &str, seq: u64) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn index_key(owner: &str, message_id: &str) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(message_id.as_bytes());
    key
}

fn tx_error(e: TransactionError<()>) -> ImError {
    ImError::Storage(format!("transaction failed: {:?}", e))
}

fn parse_cursor(cursor: Option<&str>) -> ImResult<u64> {
    match cursor {
        None | Some("") => Ok(0),
        Some(c) => c
            .parse::<u64>()
            .map_err(|_| ImError::PermanentReject(format!("invalid cursor '{}'", c))),
    }
}

impl Storage {
    pub fn open(path: &str) -> ImResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    pub fn open_temporary() -> ImResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: Db) -> ImResult<Self> {
        let offline = db.open_tree("offline")?;
        let offline_index = db.open_tree("offline_index")?;
        let archive = db.open_tree("group_archive")?;
        let archive_index = db.open_tree("group_archive_index")?;
        Ok(Self {
            db,
            offline,
            offline_index,
            archive,
            archive_index,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// 幂等写入离线消息，返回是否新插入（已存在不覆盖）
    /// Idempotent offline write, true when newly inserted; an existing row is never overwritten
    pub fn upsert_offline(&self, message: &Message) -> ImResult<bool> {
        let uid = message.recipient().ok_or_else(|| {
            ImError::PermanentReject(format!(
                "message {} has no direct recipient",
                message.message_id
            ))
        })?;
        let row = serde_json::to_vec(&OfflineMessage {
            message: message.clone(),
            delivered: false,
            delivered_to: Default::default(),
            stored_at: chrono::Utc::now().timestamp_millis(),
        })?;
        let key = row_key(uid, message.sequence_number);
        let idx = index_key(uid, &message.message_id);
        let inserted = (&self.offline, &self.offline_index)
            .transaction(|(rows, index)| -> ConflictableTransactionResult<bool, ()> {
                if index.get(idx.as_slice())?.is_some() {
                    return Ok(false);
                }
                rows.insert(key.as_slice(), row.as_slice())?;
                index.insert(idx.as_slice(), key.as_slice())?;
                Ok(true)
            })
            .map_err(tx_error)?;
        self.db.flush()?;
        if inserted {
            debug!(
                user_id = uid,
                seq = message.sequence_number,
                message_id = %message.message_id,
                "💾 offline stored"
            );
        }
        Ok(inserted)
    }

    /// 按序列号游标分页拉取某设备尚未确认的消息 / Cursor-paginated pull of what a device has not acked
    ///
    /// 游标是上一页最后一条的序列号；`next_cursor` 为 `None` 表示已到末尾。
    /// `device_id` 为 `None` 时只排除整户确认过的消息。
    /// The cursor is the last sequence number of the previous page; `None` means the end.
    /// Without a `device_id` only user-wide acks are filtered out.
    pub fn pull_offline(
        &self,
        uid: &str,
        device_id: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> ImResult<(Vec<OfflineMessage>, Option<String>)> {
        let after = parse_cursor(cursor)?;
        let prefix = owner_prefix(uid);
        let start = row_key(uid, after.saturating_add(1));
        let mut items = Vec::new();
        let mut next_cursor = None;
        for item in self.offline.range(start..) {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            if items.len() >= limit {
                next_cursor = items
                    .last()
                    .map(|m: &OfflineMessage| m.message.sequence_number.to_string());
                break;
            }
            let rec: OfflineMessage = serde_json::from_slice(&v)?;
            if rec.pending_for(device_id) {
                items.push(rec);
            }
        }
        Ok((items, next_cursor))
    }

    /// 记录设备确认，返回更新条数 / Record device acks, returns how many rows changed
    ///
    /// 不带设备的确认对该用户全部设备生效。
    /// An ack without a device counts for every device of the user.
    pub fn ack_offline(&self, uid: &str, device_id: Option<&str>, ids: &[String]) -> ImResult<usize> {
        let mut updated = 0;
        for id in ids {
            let Some(key) = self.offline_index.get(index_key(uid, id))? else {
                continue;
            };
            let Some(raw) = self.offline.get(&key)? else {
                continue;
            };
            let mut rec: OfflineMessage = serde_json::from_slice(&raw)?;
            if !rec.pending_for(device_id) {
                continue;
            }
            match device_id {
                Some(device) => {
                    rec.delivered_to.insert(device.to_string());
                }
                None => rec.delivered = true,
            }
            self.offline.insert(&key, serde_json::to_vec(&rec)?)?;
            updated += 1;
        }
        if updated > 0 {
            self.offline.flush()?;
        }
        Ok(updated)
    }

    /// 删除整户确认或早于 `cutoff_ms` 的离线消息；只有部分设备确认的保留到期满
    /// Remove rows acked user-wide or stored before `cutoff_ms`; rows only some devices acked stay until retention
    pub fn purge_offline(&self, cutoff_ms: i64) -> ImResult<usize> {
        let mut doomed = Vec::new();
        for item in self.offline.iter() {
            let (k, v) = item?;
            let rec: OfflineMessage = serde_json::from_slice(&v)?;
            if rec.delivered || rec.stored_at < cutoff_ms {
                if let Some(uid) = rec.message.recipient() {
                    doomed.push((k, index_key(uid, &rec.message.message_id)));
                }
            }
        }
        for (row, idx) in &doomed {
            self.offline.remove(row)?;
            self.offline_index.remove(idx.as_slice())?;
        }
        if !doomed.is_empty() {
            self.offline.flush()?;
            info!(purged = doomed.len(), "🧹 offline messages purged");
        }
        Ok(doomed.len())
    }

    pub fn offline_count(&self, uid: &str) -> usize {
        self.offline.scan_prefix(owner_prefix(uid)).count()
    }

    /// 归档群消息（幂等）/ Archive a group message, idempotent
    pub fn archive_group(&self, message: &Message) -> ImResult<bool> {
        let group_id = match &message.target {
            crate::domain::Target::Group(g) => g.as_str(),
            crate::domain::Target::User(_) => {
                return Err(ImError::PermanentReject(format!(
                    "message {} is not a group message",
                    message.message_id
                )))
            }
        };
        let row = serde_json::to_vec(message)?;
        let key = row_key(group_id, message.sequence_number);
        let idx = index_key(group_id, &message.message_id);
        let inserted = (&self.archive, &self.archive_index)
            .transaction(|(rows, index)| -> ConflictableTransactionResult<bool, ()> {
                if index.get(idx.as_slice())?.is_some() {
                    return Ok(false);
                }
                rows.insert(key.as_slice(), row.as_slice())?;
                index.insert(idx.as_slice(), key.as_slice())?;
                Ok(true)
            })
            .map_err(tx_error)?;
        Ok(inserted)
    }

    /// 序列号大于 `after` 的群历史 / Group history with sequence numbers above `after`
    pub fn group_history(&self, group_id: &str, after: u64, limit: usize) -> ImResult<Vec<Message>> {
        let prefix = owner_prefix(group_id);
        let mut out = Vec::new();
        for item in self.archive.range(row_key(group_id, after.saturating_add(1))..) {
            let (k, v) = item?;
            if !k.starts_with(&prefix) || out.len() >= limit {
                break;
            }
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}
