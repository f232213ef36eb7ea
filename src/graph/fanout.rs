//! 并发拉取：把多个集合的分页拉取分发到有界工作池
//!
//! - 池大小为 `min(max_workers, ids.len())`，每个单元开始前等待固定节奏 + 随机抖动
//! - 单元遇到 429 时按 [`RetryPolicy`] 退避后重试（默认一次）；再次失败或任何非 429 失败
//!   都会取消其余在途单元并丢弃已得的部分结果
//! - 集合之间不保证顺序，集合内部保持分页顺序

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::paging::collect_pages;
use super::transport::GraphTransport;
use crate::config::{FetchSection, RetrySection};
use crate::core::RemoteError;

/// 拉取单个集合的完整（已分页）结果
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    async fn fetch_collection(&self, id: &str) -> Result<Vec<Value>, RemoteError>;
}

/// 通过 URL 模板拉取子集合，如 `teams/{id}/channels`
pub struct PagedCollectionFetcher {
    transport: GraphTransport,
    template: String,
}

impl PagedCollectionFetcher {
    pub fn new(transport: GraphTransport, template: impl Into<String>) -> Self {
        Self {
            transport,
            template: template.into(),
        }
    }

    fn url_for(&self, id: &str) -> String {
        self.template.replace("{id}", id)
    }
}

#[async_trait]
impl CollectionFetcher for PagedCollectionFetcher {
    async fn fetch_collection(&self, id: &str) -> Result<Vec<Value>, RemoteError> {
        collect_pages(&self.transport, &self.url_for(id)).await
    }
}

/// 退避增长方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// 限流重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub strategy: BackoffStrategy,
    pub jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_secs(2),
            strategy: BackoffStrategy::Fixed,
            jitter: Duration::ZERO,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &RetrySection) -> Self {
        let strategy = match retry.strategy.to_ascii_lowercase().as_str() {
            "exponential" => BackoffStrategy::Exponential,
            "fixed" => BackoffStrategy::Fixed,
            other => {
                tracing::warn!(strategy = %other, "Unknown backoff strategy, using fixed");
                BackoffStrategy::Fixed
            }
        };
        Self {
            max_retries: retry.max_retries,
            backoff: Duration::from_millis(retry.backoff_ms),
            strategy,
            jitter: Duration::from_millis(retry.jitter_ms),
            max_delay: Duration::from_millis(retry.max_backoff_ms),
        }
    }

    /// 第 `retry`（从 1 开始）次重试前的等待；Retry-After 作为下限，结果不超过 `max_delay`
    pub fn delay_for(&self, retry: u32, err: &RemoteError) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.backoff.saturating_mul(factor)
            }
        };
        let delay = base + random_jitter(self.jitter);
        let delay = match err.retry_after() {
            Some(hint) if hint > delay => hint,
            _ => delay,
        };
        delay.min(self.max_delay)
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// 有界并发的多集合拉取器
pub struct FetchOrchestrator {
    fetcher: Arc<dyn CollectionFetcher>,
    max_workers: usize,
    pacing: Duration,
    pacing_jitter: Duration,
    retry: RetryPolicy,
}

impl FetchOrchestrator {
    pub fn new(fetcher: Arc<dyn CollectionFetcher>, max_workers: usize) -> Self {
        Self {
            fetcher,
            max_workers: max_workers.max(1),
            pacing: Duration::from_millis(500),
            pacing_jitter: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(fetcher: Arc<dyn CollectionFetcher>, fetch: &FetchSection) -> Self {
        Self::new(fetcher, fetch.max_workers)
            .with_pacing(
                Duration::from_millis(fetch.pacing_ms),
                Duration::from_millis(fetch.pacing_jitter_ms),
            )
            .with_retry(RetryPolicy::from_config(&fetch.retry))
    }

    pub fn with_pacing(mut self, pacing: Duration, jitter: Duration) -> Self {
        self.pacing = pacing;
        self.pacing_jitter = jitter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 并发拉取每个 id 的集合；全部成功才返回映射
    pub async fn fetch_many(
        &self,
        ids: &HashSet<String>,
    ) -> Result<HashMap<String, Vec<Value>>, RemoteError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let workers = self.max_workers.min(ids.len());
        let permits = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();

        tracing::info!(collections = ids.len(), workers, "Starting concurrent fetch");

        for id in ids {
            let id = id.clone();
            let permits = Arc::clone(&permits);
            let fetcher = Arc::clone(&self.fetcher);
            let pacing = self.pacing + random_jitter(self.pacing_jitter);
            let retry = self.retry.clone();

            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| RemoteError::internal("worker pool closed"))?;
                tokio::time::sleep(pacing).await;
                let items = fetch_with_retry(fetcher.as_ref(), &id, &retry).await?;
                Ok::<_, RemoteError>((id, items))
            });
        }

        let mut results = HashMap::with_capacity(ids.len());
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| RemoteError::internal(format!("fetch worker panicked: {e}")))
                .and_then(|r| r);
            match outcome {
                Ok((id, items)) => {
                    results.insert(id, items);
                }
                Err(e) => {
                    tracing::error!("Concurrent fetch aborted: {}", e);
                    set.abort_all();
                    return Err(e);
                }
            }
        }

        tracing::info!(collections = results.len(), "Concurrent fetch completed");
        Ok(results)
    }
}

async fn fetch_with_retry(
    fetcher: &dyn CollectionFetcher,
    id: &str,
    policy: &RetryPolicy,
) -> Result<Vec<Value>, RemoteError> {
    let mut retries = 0u32;
    loop {
        match fetcher.fetch_collection(id).await {
            Ok(items) => return Ok(items),
            Err(e) if e.is_rate_limited() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries, &e);
                tracing::warn!(
                    collection = %id,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
