//! 出站令牌生命周期管理
//!
//! 所有出站调用共用一个 client-credentials 令牌：
//! - 读路径只读取当前凭据快照（整体替换的 `Arc`，不会读到写了一半的头）
//! - 过期或缺失时进入独占锁并二次检查，保证并发下只发生一次令牌交换
//! - 交换成功后由管理器自己持有的后台任务在过期前 `refresh_margin` 主动刷新并重新排期
//! - 交换失败时保留旧凭据、不重新排期，错误返回给当前以及在锁上等待的所有调用方

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GraphSection;
use crate::core::error::header_pairs;
use crate::core::RemoteError;

/// 一次成功交换得到的令牌与有效期（秒）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
}

/// 令牌交换：生产实现走身份提供方的 token 端点，测试可替换为计数桩
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant, RemoteError>;
}

/// OAuth2 client-credentials 交换：表单 POST 到 `<identity-host>/<tenant>/oauth2/v2.0/token`
pub struct ClientCredentialsExchanger {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    /// 部分端点以字符串返回秒数
    expires_in: Option<serde_json::Value>,
}

impl ClientCredentialsExchanger {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::internal(format!("failed to build token client: {e}")))?;
        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
        })
    }

    pub fn from_config(graph: &GraphSection) -> Result<Self, RemoteError> {
        Self::new(
            graph.token_endpoint(),
            graph.client_id.clone(),
            graph.client_secret.clone(),
            graph.scope.clone(),
            graph.request_timeout(),
        )
    }
}

#[async_trait]
impl TokenExchanger for ClientCredentialsExchanger {
    async fn exchange(&self) -> Result<TokenGrant, RemoteError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let resp = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(&e))?;

        let status = resp.status();
        let headers = header_pairs(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| RemoteError::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(RemoteError::http_status(status.as_u16(), headers, body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RemoteError::malformed(format!("token response is not json: {e}"), &body))?;
        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::malformed("token response missing access_token", &body))?;
        let expires_in = parsed
            .expires_in
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| RemoteError::malformed("token response missing expires_in", &body))?;

        Ok(TokenGrant {
            access_token,
            expires_in,
        })
    }
}

/// 当前凭据；只在刷新锁内整体替换，从不原地修改
struct Credential {
    token: String,
    expires_at: Instant,
    headers: Arc<HeaderMap>,
}

impl Credential {
    fn issue(grant: TokenGrant, issued_at: Instant) -> Result<Self, RemoteError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", grant.access_token))
            .map_err(|_| RemoteError::malformed("access_token is not a valid header value", ""))?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            token: grant.access_token,
            expires_at: issued_at + Duration::from_secs(grant.expires_in),
            headers: Arc::new(headers),
        })
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

struct Inner {
    exchanger: Arc<dyn TokenExchanger>,
    current: RwLock<Option<Arc<Credential>>>,
    /// 串行化所有交换；凭据与 last_failure 只在持有此锁时写入
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_margin: Duration,
    /// 已完成的交换次数（含失败），在持有 refresh_lock 时、结果写入之后递增
    attempts: AtomicU64,
    last_failure: Mutex<Option<RemoteError>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn snapshot(&self) -> Option<Arc<Credential>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn fresh_headers(&self) -> Option<HeaderMap> {
        self.snapshot()
            .filter(|c| c.is_fresh(Instant::now()))
            .map(|c| (*c.headers).clone())
    }

    /// 在我们开始等锁之后，是否已有一次交换失败（等待者共享该结果，不再各自重试）
    fn failure_since(&self, observed_attempts: u64) -> Option<RemoteError> {
        if self.attempts.load(Ordering::SeqCst) <= observed_attempts {
            return None;
        }
        match self.last_failure.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_failure(&self, failure: Option<RemoteError>) {
        match self.last_failure.lock() {
            Ok(mut guard) => *guard = failure,
            Err(poisoned) => *poisoned.into_inner() = failure,
        }
    }

    /// 执行一次交换并替换凭据。调用方必须持有 refresh_lock
    async fn exchange_and_store(&self) -> Result<Arc<Credential>, RemoteError> {
        let issued_at = Instant::now();
        let outcome = match self.exchanger.exchange().await {
            Ok(grant) => Credential::issue(grant, issued_at),
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(credential) => {
                let credential = Arc::new(credential);
                match self.current.write() {
                    Ok(mut guard) => *guard = Some(Arc::clone(&credential)),
                    Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&credential)),
                }
                self.set_failure(None);
                tracing::info!(
                    expires_in_secs = credential.expires_at.saturating_duration_since(issued_at).as_secs(),
                    "Token refreshed successfully"
                );
                Ok(credential)
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.set_failure(Some(e.clone()));
                Err(e)
            }
        };
        // 等待者在等锁前取的快照必然早于这次递增
        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// 下一次主动刷新的时间点：过期前 margin；寿命不足 margin 时取剩余寿命的一半（至少 1 秒）
    fn next_refresh_at(&self, credential: &Credential) -> Instant {
        let now = Instant::now();
        match credential.expires_at.checked_sub(self.refresh_margin) {
            Some(at) if at > now => at,
            _ => {
                let half = credential.expires_at.saturating_duration_since(now) / 2;
                now + half.max(Duration::from_secs(1))
            }
        }
    }

    fn clear_scheduler(&self) {
        match self.scheduler.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// 启动主动刷新任务（已在运行或已关闭时不做任何事）
    fn arm_scheduler(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut slot = match self.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        *slot = Some(tokio::spawn(proactive_refresh_loop(weak, cancel)));
    }
}

/// 主动刷新循环：只持有弱引用，管理器被释放或关闭后退出
async fn proactive_refresh_loop(weak: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let deadline = {
            let Some(inner) = weak.upgrade() else { return };
            let Some(credential) = inner.snapshot() else { return };
            inner.next_refresh_at(&credential)
        };
        tracing::debug!(
            in_secs = deadline.saturating_duration_since(Instant::now()).as_secs(),
            "Scheduled proactive token refresh"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let Some(inner) = weak.upgrade() else { return };
        let _guard = inner.refresh_lock.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = inner.exchange_and_store().await {
            tracing::warn!(
                "Proactive token refresh failed, next on-demand refresh will re-arm: {}",
                e
            );
            inner.clear_scheduler();
            return;
        }
    }
}

/// 令牌生命周期管理器（可克隆，克隆共享同一凭据）
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(exchanger: Arc<dyn TokenExchanger>, refresh_margin: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchanger,
                current: RwLock::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_margin,
                attempts: AtomicU64::new(0),
                last_failure: Mutex::new(None),
                scheduler: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(graph: &GraphSection) -> Result<Self, RemoteError> {
        let exchanger = ClientCredentialsExchanger::from_config(graph)?;
        Ok(Self::new(Arc::new(exchanger), graph.refresh_margin()))
    }

    /// 返回带 Bearer 令牌的请求头；必要时刷新
    pub async fn get_valid_headers(&self) -> Result<HeaderMap, RemoteError> {
        if let Some(headers) = self.inner.fresh_headers() {
            return Ok(headers);
        }

        let observed = self.inner.attempts.load(Ordering::SeqCst);
        let _guard = self.inner.refresh_lock.lock().await;

        if let Some(headers) = self.inner.fresh_headers() {
            return Ok(headers);
        }
        if let Some(err) = self.inner.failure_since(observed) {
            return Err(err);
        }

        tracing::info!("Token expired or missing, refreshing");
        let credential = self.inner.exchange_and_store().await?;
        self.inner.arm_scheduler();
        Ok((*credential.headers).clone())
    }

    /// 无视有效期强制交换一次
    pub async fn force_refresh(&self) -> Result<HeaderMap, RemoteError> {
        let _guard = self.inner.refresh_lock.lock().await;
        let credential = self.inner.exchange_and_store().await?;
        self.inner.arm_scheduler();
        Ok((*credential.headers).clone())
    }

    /// 当前凭据的过期时间点
    pub fn expires_at(&self) -> Option<Instant> {
        self.inner.snapshot().map(|c| c.expires_at)
    }

    /// 已完成的交换次数（含失败）
    pub fn exchange_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// 停止主动刷新任务；之后仍可按需刷新，但不再排期
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = match self.inner.scheduler.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
