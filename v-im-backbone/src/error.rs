use thiserror::Error;

use crate::gateway::session::ConnState;

/// 路由与投递错误分类 / Error taxonomy for routing and delivery
///
/// `NotFound` 不在此列：注册中心查无此人是慢路径的正常结果。
/// `NotFound` is not here: an empty registry lookup is the normal slow-path outcome.
#[derive(Debug, Clone, Error)]
pub enum ImError {
    /// 注册中心/总线/存储暂时不可达，调用方退避重试
    /// Registry/bus/store temporarily unreachable, caller retries with backoff
    #[error("{component} unavailable: {message}")]
    TransientInfra {
        component: &'static str,
        message: String,
    },
    /// 格式错误或内容被过滤，直接告知发送方，不重试
    /// Malformed or filtered content, surfaced to the sender and never retried
    #[error("rejected: {0}")]
    PermanentReject(String),
    /// 序列号生成器不可用，整条消息以相同 message_id 重试
    /// Sequence generator unavailable, the whole message is retried with the same message_id
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("lease {0} expired or unknown")]
    LeaseExpired(u64),
    #[error("invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ConnState, to: ConnState },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type ImResult<T> = Result<T, ImError>;

impl ImError {
    pub fn transient(component: &'static str, err: impl std::fmt::Display) -> Self {
        ImError::TransientInfra {
            component,
            message: err.to_string(),
        }
    }

    /// 客户端能否用同一 message_id 重发 / Whether the client may resend with the same message_id
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImError::PermanentReject(_) | ImError::InvalidTransition { .. }
        )
    }
}

impl From<sled::Error> for ImError {
    fn from(e: sled::Error) -> Self {
        ImError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ImError {
    fn from(e: serde_json::Error) -> Self {
        ImError::Serialization(e.to_string())
    }
}
