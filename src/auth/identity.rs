//! 入站调用方身份
//!
//! 令牌校验与声明检查由外部身份提供方负责，这里只消费其结果：
//! `authenticate(token) -> Identity { subject_id, authorized }`。
//! 服务端据此区分 401（未认证）与 403（已认证但无权限）。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ServerSection;

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    /// 是否具备使用本服务的权限
    pub authorized: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// 静态令牌表：token -> subject，可选 subject 白名单
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
    allowed: HashSet<String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens,
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn from_config(server: &ServerSection) -> Self {
        Self::new(
            server.access_tokens.clone(),
            server.allowed_subjects.iter().cloned(),
        )
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let subject = self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        let authorized = self.allowed.is_empty() || self.allowed.contains(subject);
        if !authorized {
            tracing::warn!(subject = %subject, "Authenticated subject is not on the allow list");
        }
        Ok(Identity {
            subject_id: subject.clone(),
            authorized,
        })
    }
}
