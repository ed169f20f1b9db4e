use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::bus::{publish_json, MessageBus, TOPIC_MEMBERSHIP};
use crate::domain::MembershipChange;
use crate::error::{ImError, ImResult};

/// 群成员权威来源 / Authoritative group membership source
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn members(&self, group_id: &str) -> ImResult<HashSet<String>>;
}

/// 进程内成员表，变更写入 `membership_change` 主题
/// In-process membership table, changes are published to `membership_change`
pub struct LocalMembership {
    groups: DashMap<String, HashSet<String>>,
    bus: Arc<dyn MessageBus>,
}

impl LocalMembership {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            groups: DashMap::new(),
            bus,
        }
    }

    pub async fn join(&self, group_id: &str, user_id: &str) -> ImResult<()> {
        let added = self
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        if added {
            self.announce(group_id, user_id, true).await?;
        }
        Ok(())
    }

    pub async fn leave(&self, group_id: &str, user_id: &str) -> ImResult<()> {
        let removed = self
            .groups
            .get_mut(group_id)
            .map(|mut set| set.remove(user_id))
            .unwrap_or(false);
        if removed {
            self.announce(group_id, user_id, false).await?;
        }
        Ok(())
    }

    async fn announce(&self, group_id: &str, user_id: &str, joined: bool) -> ImResult<()> {
        info!(
            "👥 {} {} group {}",
            user_id,
            if joined { "joined" } else { "left" },
            group_id
        );
        let change = MembershipChange {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            joined,
        };
        publish_json(self.bus.as_ref(), TOPIC_MEMBERSHIP, group_id, &change).await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipService for LocalMembership {
    async fn members(&self, group_id: &str) -> ImResult<HashSet<String>> {
        Ok(self
            .groups
            .get(group_id)
            .map(|set| set.clone())
            .unwrap_or_default())
    }
}

#[derive(Deserialize)]
struct MembersReply {
    members: Vec<String>,
}

/// 外部成员服务 `GET {base}/v1/groups/{id}/members` / External membership service
pub struct HttpMembershipService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMembershipService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ImResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImError::transient("membership", e))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MembershipService for HttpMembershipService {
    async fn members(&self, group_id: &str) -> ImResult<HashSet<String>> {
        let resp = self
            .client
            .get(format!("{}/v1/groups/{}/members", self.base_url, group_id))
            .send()
            .await
            .map_err(|e| ImError::transient("membership", e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(HashSet::new());
        }
        if !resp.status().is_success() {
            return Err(ImError::transient(
                "membership",
                format!("status {}", resp.status()),
            ));
        }
        let reply: MembersReply = resp
            .json()
            .await
            .map_err(|e| ImError::transient("membership", e))?;
        Ok(reply.members.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LogBus, StartFrom};

    #[tokio::test]
    async fn join_and_leave_publish_changes_once() {
        let bus = Arc::new(LogBus::in_memory(4));
        let svc = LocalMembership::new(bus.clone());
        svc.join("g1", "alice").await.unwrap();
        svc.join("g1", "alice").await.unwrap();
        svc.join("g1", "bob").await.unwrap();
        svc.leave("g1", "alice").await.unwrap();
        svc.leave("g1", "nobody").await.unwrap();

        let members = svc.members("g1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains("bob"));

        let mut c = bus
            .subscribe("t", TOPIC_MEMBERSHIP, "m", StartFrom::Earliest)
            .await
            .unwrap();
        let records = c.poll(10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(records.len(), 3);
        let last: MembershipChange = records[2].decode().unwrap();
        assert!(!last.joined);
    }
}
