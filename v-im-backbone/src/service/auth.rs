use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ImError, ImResult};

/// 令牌校验 / Token validation
///
/// `Ok(None)` 表示令牌无效；`Err` 表示鉴权中心不可达。
/// `Ok(None)` means the token is invalid; `Err` means the auth center is unreachable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> ImResult<Option<String>>;
}

/// 鉴权关闭时的信任模式：令牌即用户ID / Trust mode when auth is disabled: the token is the user id
pub struct TrustAuthenticator;

#[async_trait]
impl Authenticator for TrustAuthenticator {
    async fn authenticate(&self, token: &str) -> ImResult<Option<String>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(token.trim().to_string()))
    }
}

/// 固定令牌表 / Fixed token table
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, uid: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), uid.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> ImResult<Option<String>> {
        Ok(self.tokens.get(token).cloned())
    }
}

#[derive(Deserialize)]
struct AuthCenterReply {
    uid: String,
}

/// 调用鉴权中心 `GET {center}/v1/sso/auth?token=` / Calls the auth center
pub struct HttpAuthenticator {
    client: reqwest::Client,
    center_url: String,
}

impl HttpAuthenticator {
    pub fn new(center_url: impl Into<String>, timeout: Duration) -> ImResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImError::transient("auth", e))?;
        Ok(Self {
            client,
            center_url: center_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, token: &str) -> ImResult<Option<String>> {
        if token.is_empty() {
            return Ok(None);
        }
        let resp = self
            .client
            .get(format!("{}/v1/sso/auth", self.center_url))
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| ImError::transient("auth", e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            debug!("🔐 auth center rejected token");
            return Ok(None);
        }
        if !status.is_success() {
            warn!("🔐 auth center answered {}", status);
            return Err(ImError::transient("auth", format!("status {}", status)));
        }
        let reply: AuthCenterReply = resp
            .json()
            .await
            .map_err(|e| ImError::transient("auth", e))?;
        Ok(Some(reply.uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trust_mode_uses_token_as_uid() {
        let auth = TrustAuthenticator;
        assert_eq!(auth.authenticate(" bob ").await.unwrap().as_deref(), Some("bob"));
        assert!(auth.authenticate("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn static_table_rejects_unknown_tokens() {
        let auth = StaticTokenAuthenticator::new().with_token("t-1", "alice");
        assert_eq!(auth.authenticate("t-1").await.unwrap().as_deref(), Some("alice"));
        assert!(auth.authenticate("t-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_center_is_transient() {
        let auth = HttpAuthenticator::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            auth.authenticate("t").await,
            Err(ImError::TransientInfra { component: "auth", .. })
        ));
    }
}
