use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ImResult;
use crate::service::membership::MembershipService;

struct CachedGroup {
    members: Arc<HashSet<String>>,
    fetched_at: Instant,
}

/// 网关本地群成员缓存，TTL 兜底，变更事件主动失效
/// Per-gateway membership cache: TTL as the backstop, change events invalidate eagerly
pub struct GroupMembershipCache {
    source: Arc<dyn MembershipService>,
    ttl: Duration,
    entries: DashMap<String, CachedGroup>,
}

impl GroupMembershipCache {
    pub fn new(source: Arc<dyn MembershipService>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn members(&self, group_id: &str) -> ImResult<Arc<HashSet<String>>> {
        if let Some(cached) = self.entries.get(group_id) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.members.clone());
            }
        }
        let members = Arc::new(self.source.members(group_id).await?);
        debug!("👥 cached {} members of {}", members.len(), group_id);
        self.entries.insert(
            group_id.to_string(),
            CachedGroup {
                members: members.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(members)
    }

    pub fn invalidate(&self, group_id: &str) {
        self.entries.remove(group_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
