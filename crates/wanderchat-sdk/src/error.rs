use std::time::Duration;

use serde::{Deserialize, Serialize};

/// SDK 错误类型
///
/// 分类与实时层的失败场景一一对应：
/// - `Connection` / `NotConnected`：传输层不可用（发送走 REST 回退，接收靠轮询）
/// - `SendFailed`：发送失败，携带原始输入内容，调用方可恢复到输入框重试
/// - `AuthExpired`：鉴权失效，交由上层认证模块处理
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed ({reason:?}): {message}")]
    SendFailed {
        /// 用户输入的原文，用于恢复输入框
        content: String,
        reason: SendFailureReason,
        message: String,
    },

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server error [{status}]: {message}")]
    ServerError { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Surface is not mounted")]
    NotMounted,

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for SdkError {
    fn from(error: serde_json::Error) -> Self {
        SdkError::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            if status.as_u16() == 401 {
                return SdkError::AuthExpired(error.to_string());
            }
            return SdkError::ServerError {
                status: status.as_u16(),
                message: error.to_string(),
            };
        }
        SdkError::Http(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SdkError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match error {
            WsError::Http(ref response) if response.status().as_u16() == 401 => {
                SdkError::AuthExpired("socket handshake rejected".to_string())
            }
            other => SdkError::Connection(other.to_string()),
        }
    }
}

impl From<url::ParseError> for SdkError {
    fn from(error: url::ParseError) -> Self {
        SdkError::Config(format!("invalid url: {}", error))
    }
}

impl SdkError {
    /// 是否为传输层错误（被动操作不应向用户展示）
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SdkError::Connection(_) | SdkError::NotConnected)
    }

    /// 是否为鉴权失效
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SdkError::AuthExpired(_))
    }

    /// 将任意错误包装为发送失败，带回原文
    pub fn into_send_failure(self, content: impl Into<String>) -> Self {
        let reason = SendFailureReason::classify(&self);
        SdkError::SendFailed {
            content: content.into(),
            reason,
            message: self.to_string(),
        }
    }

    /// 发送失败时取回原文
    pub fn restored_content(&self) -> Option<&str> {
        match self {
            SdkError::SendFailed { content, .. } => Some(content.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

/// 发送失败原因分类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendFailureReason {
    /// 网络不可用（socket 断开且 REST 也失败）
    NetworkUnavailable,
    /// 服务端拒绝
    Rejected(String),
    /// 服务端错误
    ServerError(u16),
    /// 认证失败 - 需要重新登录
    AuthFailure,
    /// 本地限流
    RateLimited,
    /// 未知错误
    Unknown,
}

impl SendFailureReason {
    /// 从错误推断失败原因
    pub fn classify(error: &SdkError) -> Self {
        match error {
            SdkError::Connection(_) | SdkError::NotConnected | SdkError::Http(_) => {
                SendFailureReason::NetworkUnavailable
            }
            SdkError::AuthExpired(_) => SendFailureReason::AuthFailure,
            SdkError::ServerError { status, .. } if *status >= 500 => {
                SendFailureReason::ServerError(*status)
            }
            SdkError::ServerError { message, .. } => SendFailureReason::Rejected(message.clone()),
            SdkError::RateLimited(_) => SendFailureReason::RateLimited,
            SdkError::SendFailed { reason, .. } => reason.clone(),
            _ => SendFailureReason::Unknown,
        }
    }

    /// 判断用户重试是否有意义
    pub fn is_retryable(&self) -> bool {
        match self {
            SendFailureReason::NetworkUnavailable => true,
            SendFailureReason::ServerError(_) => true,
            SendFailureReason::RateLimited => true,
            SendFailureReason::Unknown => true,
            SendFailureReason::Rejected(_) => false,
            SendFailureReason::AuthFailure => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failure_keeps_content() {
        let err = SdkError::NotConnected.into_send_failure("Hola");
        assert_eq!(err.restored_content(), Some("Hola"));
        match err {
            SdkError::SendFailed { reason, .. } => {
                assert_eq!(reason, SendFailureReason::NetworkUnavailable);
                assert!(reason.is_retryable());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_errors() {
        let server = SdkError::ServerError { status: 503, message: "down".into() };
        assert_eq!(SendFailureReason::classify(&server), SendFailureReason::ServerError(503));

        let rejected = SdkError::ServerError { status: 400, message: "too long".into() };
        let reason = SendFailureReason::classify(&rejected);
        assert!(matches!(reason, SendFailureReason::Rejected(_)));
        assert!(!reason.is_retryable());

        let auth = SdkError::AuthExpired("401".into());
        assert!(auth.is_auth_expired());
        assert_eq!(SendFailureReason::classify(&auth), SendFailureReason::AuthFailure);
    }
}
