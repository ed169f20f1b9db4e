use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::domain::Payload;
use crate::error::ImResult;

/// 过滤结论 / Filter verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass(Payload),
    Reject(String),
}

/// 负载过滤器，在分配序列号之前执行 / Payload filter, runs before sequencing
#[async_trait]
pub trait PayloadFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, sender_id: &str, payload: Payload) -> ImResult<FilterVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveMode {
    /// 用 `*` 替换 / Replace with `*`
    Mask,
    Reject,
}

/// 敏感词过滤；非 UTF-8（如端到端加密）负载原样放行
/// Sensitive-word filter; non UTF-8 payloads (e.g. end-to-end encrypted) pass untouched
pub struct SensitiveWordFilter {
    words: RwLock<Vec<String>>,
    mode: SensitiveMode,
}

impl SensitiveWordFilter {
    pub fn new(words: Vec<String>, mode: SensitiveMode) -> Self {
        Self {
            words: RwLock::new(words.into_iter().filter(|w| !w.is_empty()).collect()),
            mode,
        }
    }

    pub fn update_words(&self, words: Vec<String>) {
        *self.words.write() = words.into_iter().filter(|w| !w.is_empty()).collect();
    }

    fn mask(&self, text: &str) -> (String, bool) {
        let words = self.words.read();
        let mut output = text.to_string();
        let mut hit = false;
        for word in words.iter() {
            if output.contains(word.as_str()) {
                hit = true;
                let replace = "*".repeat(word.chars().count());
                output = output.replace(word.as_str(), &replace);
            }
        }
        (output, hit)
    }
}

#[async_trait]
impl PayloadFilter for SensitiveWordFilter {
    fn name(&self) -> &'static str {
        "sensitive"
    }

    async fn apply(&self, sender_id: &str, payload: Payload) -> ImResult<FilterVerdict> {
        let Ok(text) = std::str::from_utf8(payload.as_bytes()) else {
            return Ok(FilterVerdict::Pass(payload));
        };
        let (masked, hit) = self.mask(text);
        if !hit {
            return Ok(FilterVerdict::Pass(payload));
        }
        debug!("🚫 sensitive content from {}", sender_id);
        Ok(match self.mode {
            SensitiveMode::Mask => FilterVerdict::Pass(Payload(masked.into_bytes())),
            SensitiveMode::Reject => FilterVerdict::Reject("sensitive content".to_string()),
        })
    }
}

/// 过滤链，按注册顺序执行，遇到拒绝即停止
/// Filter chain, runs in registration order and stops at the first rejection
#[derive(Default)]
pub struct FilterChain {
    filters: RwLock<Vec<Arc<dyn PayloadFilter>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filter: Arc<dyn PayloadFilter>) {
        self.filters.write().push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn apply(&self, sender_id: &str, payload: Payload) -> ImResult<FilterVerdict> {
        let filters: Vec<Arc<dyn PayloadFilter>> = self.filters.read().clone();
        let mut current = payload;
        for filter in filters {
            match filter.apply(sender_id, current).await? {
                FilterVerdict::Pass(next) => current = next,
                FilterVerdict::Reject(reason) => {
                    return Ok(FilterVerdict::Reject(format!("{}: {}", filter.name(), reason)))
                }
            }
        }
        Ok(FilterVerdict::Pass(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mask_mode_replaces_words() {
        let chain = FilterChain::new();
        chain.register(Arc::new(SensitiveWordFilter::new(
            vec!["bad".into()],
            SensitiveMode::Mask,
        )));
        let out = chain.apply("alice", Payload::from("bad text")).await.unwrap();
        assert_eq!(out, FilterVerdict::Pass(Payload::from("*** text")));
    }

    #[tokio::test]
    async fn reject_mode_names_the_filter() {
        let filter = Arc::new(SensitiveWordFilter::new(vec![], SensitiveMode::Reject));
        let chain = FilterChain::new();
        chain.register(filter.clone());
        assert!(matches!(
            chain.apply("a", Payload::from("spam")).await.unwrap(),
            FilterVerdict::Pass(_)
        ));
        filter.update_words(vec!["spam".into()]);
        match chain.apply("a", Payload::from("spam")).await.unwrap() {
            FilterVerdict::Reject(reason) => assert!(reason.starts_with("sensitive")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn binary_payloads_pass() {
        let filter = SensitiveWordFilter::new(vec!["a".into()], SensitiveMode::Reject);
        let raw = Payload(vec![0xff, 0xfe, b'a']);
        assert_eq!(
            filter.apply("a", raw.clone()).await.unwrap(),
            FilterVerdict::Pass(raw)
        );
    }
}
