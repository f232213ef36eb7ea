//! 目录 API 传输层
//!
//! 每次请求都先向 [`TokenManager`] 取请求头，再以固定超时发出调用，并把结果归一化为
//! [`ApiReply`] 或结构化的 [`RemoteError`]。本层从不重试，分页也由调用方处理。

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

use crate::auth::TokenManager;
use crate::config::GraphSection;
use crate::core::error::header_pairs;
use crate::core::RemoteError;

/// 成功响应：带 JSON 体，或 2xx 空体（如 204）
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    Json(Value),
    Empty,
}

impl ApiReply {
    /// 空响应视为 `Value::Null`
    pub fn into_json(self) -> Value {
        match self {
            ApiReply::Json(v) => v,
            ApiReply::Empty => Value::Null,
        }
    }
}

/// 出站网关：共享 reqwest 客户端 + 令牌管理器
#[derive(Clone)]
pub struct GraphTransport {
    client: reqwest::Client,
    tokens: TokenManager,
    base_url: String,
}

impl GraphTransport {
    pub fn new(
        tokens: TokenManager,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(tokens: TokenManager, graph: &GraphSection) -> Result<Self, RemoteError> {
        Self::new(tokens, graph.base_url.clone(), graph.request_timeout())
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// 相对路径拼到 base_url 后；绝对 URL（如 `@odata.nextLink`）原样使用
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    /// 发出一次请求；extra_headers 覆盖令牌头中的同名项
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        extra_headers: Option<&[(&str, &str)]>,
        json_body: Option<&Value>,
    ) -> Result<ApiReply, RemoteError> {
        let mut headers = self.tokens.get_valid_headers().await?;
        if let Some(extra) = extra_headers {
            merge_headers(&mut headers, extra)?;
        }

        let url = self.resolve(url);
        let mut builder = self.client.request(method.clone(), &url).headers(headers);
        if let Some(body) = json_body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            let err = RemoteError::from_reqwest(&e);
            tracing::error!(method = %method, url = %url, "Request failed: {}", err);
            err
        })?;

        let status = resp.status();
        let resp_headers = header_pairs(resp.headers());
        let text = resp
            .text()
            .await
            .map_err(|e| RemoteError::from_reqwest(&e))?;

        if status.is_client_error() {
            tracing::warn!(method = %method, url = %url, status = status.as_u16(), "Remote API rejected request");
            return Err(RemoteError::http_status(status.as_u16(), resp_headers, text));
        }
        if !status.is_success() {
            tracing::error!(method = %method, url = %url, status = status.as_u16(), "Remote API server error");
            return Err(RemoteError::http_status(status.as_u16(), resp_headers, text));
        }

        if text.trim().is_empty() {
            return Ok(ApiReply::Empty);
        }
        serde_json::from_str(&text).map(ApiReply::Json).map_err(|e| {
            tracing::warn!(url = %url, "Unparseable success body: {}", e);
            RemoteError::malformed(format!("response body is not json: {e}"), text)
        })
    }

    pub async fn get(&self, url: &str) -> Result<ApiReply, RemoteError> {
        self.request(Method::GET, url, None, None).await
    }

    pub async fn post(&self, url: &str, body: &Value) -> Result<ApiReply, RemoteError> {
        self.request(Method::POST, url, None, Some(body)).await
    }

    pub async fn patch(&self, url: &str, body: &Value) -> Result<ApiReply, RemoteError> {
        self.request(Method::PATCH, url, None, Some(body)).await
    }

    pub async fn delete(&self, url: &str) -> Result<ApiReply, RemoteError> {
        self.request(Method::DELETE, url, None, None).await
    }
}

fn merge_headers(headers: &mut HeaderMap, extra: &[(&str, &str)]) -> Result<(), RemoteError> {
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RemoteError::internal(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RemoteError::internal(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(())
}
