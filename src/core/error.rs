//! 错误类型
//!
//! - `RemoteError`：出站 HTTP / 令牌交换失败，按值向上传播，只有并发拉取器会对 429 重试一次
//! - `ProtocolError`：流式事件或持久化消息形态错误，解码时一律拒绝（fail closed）
//! - `StoreError`：会话日志存储失败
//! - `AgentError`：一次 Agent 运行中的错误，汇总以上各类

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 远端错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    HttpStatus,
    Timeout,
    ConnectionFailure,
    MalformedResponse,
    Internal,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::HttpStatus => write!(f, "http_status"),
            RemoteErrorKind::Timeout => write!(f, "timeout"),
            RemoteErrorKind::ConnectionFailure => write!(f, "connection_failure"),
            RemoteErrorKind::MalformedResponse => write!(f, "malformed_response"),
            RemoteErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// 传输层 / 远端 API 错误（结构化，可直接序列化给前端）
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind}: {detail}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// 响应头（小写键）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl RemoteError {
    fn new(kind: RemoteErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            headers: None,
            detail: detail.into(),
            raw_body: None,
        }
    }

    /// 非 2xx 响应：保留状态码、响应头与原始响应体
    pub fn http_status(
        status: u16,
        headers: HashMap<String, String>,
        raw_body: impl Into<String>,
    ) -> Self {
        Self {
            kind: RemoteErrorKind::HttpStatus,
            status_code: Some(status),
            headers: Some(headers),
            detail: format!("remote returned HTTP {status}"),
            raw_body: Some(raw_body.into()),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, detail)
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::ConnectionFailure, detail)
    }

    /// 2xx 但响应体无法解析；raw 为未解析的原文，便于排查
    pub fn malformed(detail: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            raw_body: Some(raw.into()),
            ..Self::new(RemoteErrorKind::MalformedResponse, detail)
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Internal, detail)
    }

    /// 按 reqwest 错误性质分类：超时 / 连接失败 / 其它请求失败
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::new(RemoteErrorKind::MalformedResponse, format!("decode failed: {err}"))
        } else if err.is_builder() {
            Self::internal(format!("invalid request: {err}"))
        } else {
            Self::connection(format!("request failed: {err}"))
        }
    }

    /// 是否为限流响应（HTTP 429）
    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(429)
    }

    /// 解析 Retry-After（仅支持秒数形式）
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .as_ref()?
            .get("retry-after")?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

/// 响应头转为小写键的普通映射（HeaderName 本身即小写），非 UTF-8 的值丢弃
pub(crate) fn header_pairs(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// 事件协议 / 消息记录违规
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown part kind: {0}")]
    UnknownPartKind(String),

    #[error("part delta references unopened index {0}")]
    UnopenedPart(usize),

    #[error("part index {0} opened twice in one turn")]
    DuplicatePart(usize),

    #[error("part delta kind does not match the part opened at index {0}")]
    DeltaKindMismatch(usize),

    #[error("tool result has neither content nor retry_prompt")]
    UnknownToolResult,

    #[error("unknown part record type: {0}")]
    UnknownPartType(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("{part} part cannot appear in a {message} message")]
    MisplacedPart {
        part: &'static str,
        message: &'static str,
    },

    #[error("duplicate tool call id in one message: {0}")]
    DuplicateCallId(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}

/// 会话日志存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt message #{sequence_no}: {reason}")]
    Corrupt { sequence_no: u64, reason: String },

    #[error("conversation not found: {0}")]
    NotFound(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Conversation {0} belongs to another subject")]
    ConversationForbidden(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Step limit reached after {0} model turns")]
    StepLimit(usize),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 前端错误帧里的 kind 字段
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Remote(_) => "remote",
            AgentError::Protocol(_) => "protocol",
            AgentError::Store(_) => "store",
            AgentError::LlmError(_) => "llm",
            AgentError::ConversationForbidden(_) => "forbidden",
            AgentError::ToolTimeout(_) => "tool_timeout",
            AgentError::HallucinatedTool(_) => "unknown_tool",
            AgentError::StepLimit(_) => "step_limit",
            AgentError::ConfigError(_) => "config",
        }
    }

    /// 展示给前端的说明：远端错误只暴露 detail，不带原始响应体
    pub fn user_detail(&self) -> String {
        match self {
            AgentError::Remote(e) => e.detail.clone(),
            other => other.to_string(),
        }
    }
}
