//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DESKPILOT__*` 覆盖（双下划线表示嵌套，如 `DESKPILOT__GRAPH__TENANT_ID=...`）。
//! 密钥（client_secret、api_key）建议只通过环境变量提供。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// [app] 段：应用名、系统提示词文件、单次运行的模型轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统提示词文件，未设置或读取失败时用内置的一句话提示
    pub system_prompt_path: Option<PathBuf>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt_path: None,
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize {
    8
}

/// [graph] 段：身份提供方与目录 API
#[derive(Debug, Clone, Deserialize)]
pub struct GraphSection {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// 身份提供方主机（不含租户路径）
    #[serde(default = "default_identity_host")]
    pub identity_host: String,
    /// 显式指定 token 端点时覆盖 identity_host/tenant 拼接结果（测试用）
    pub token_url: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单次出站请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 过期前多少秒主动刷新令牌
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: default_scope(),
            identity_host: default_identity_host(),
            token_url: None,
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl GraphSection {
    /// `https://<identity-host>/<tenant>/oauth2/v2.0/token`
    pub fn token_endpoint(&self) -> String {
        match &self.token_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/{}/oauth2/v2.0/token",
                self.identity_host.trim_end_matches('/'),
                self.tenant_id
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

fn default_scope() -> String {
    "https://graph.microsoft.com/.default".to_string()
}

fn default_identity_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_margin() -> u64 {
    300
}

/// [fetch] 段：并发拉取的工作者上限、节奏与限流退避
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 每个任务开始前的固定间隔（毫秒）
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// 在固定间隔上叠加的随机抖动上限（毫秒）
    #[serde(default = "default_pacing_jitter_ms")]
    pub pacing_jitter_ms: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            pacing_ms: default_pacing_ms(),
            pacing_jitter_ms: default_pacing_jitter_ms(),
            retry: RetrySection::default(),
        }
    }
}

fn default_max_workers() -> usize {
    5
}

fn default_pacing_ms() -> u64 {
    500
}

fn default_pacing_jitter_ms() -> u64 {
    100
}

/// [fetch.retry] 段：429 退避策略
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// fixed / exponential
    #[serde(default = "default_backoff_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub jitter_ms: u64,
    /// 单次等待上限，Retry-After 也不超过它
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            strategy: default_backoff_strategy(),
            jitter_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_backoff_strategy() -> String {
    "fixed".to_string()
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_model(),
            api_key: None,
            stream_timeout_secs: default_stream_timeout(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "deepseek-r1-distill-llama-70b".to_string()
}

fn default_stream_timeout() -> u64 {
    120
}

fn default_tool_timeout_secs() -> u64 {
    60
}

/// [server] 段：监听地址、数据库与访问令牌
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// SQLite 文件；未设置或未启用 async-sqlite 时使用内存存储
    pub db_path: Option<PathBuf>,
    /// 静态访问令牌表（token -> subject）
    #[serde(default)]
    pub access_tokens: std::collections::HashMap<String, String>,
    /// 允许使用的 subject 白名单；为空表示所有已认证 subject 都允许
    #[serde(default)]
    pub allowed_subjects: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            db_path: None,
            access_tokens: Default::default(),
            allowed_subjects: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// 从 config 目录加载配置，环境变量 DESKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DESKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DESKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fetch.max_workers, 5);
        assert_eq!(cfg.fetch.retry.max_retries, 1);
        assert_eq!(cfg.graph.refresh_margin(), Duration::from_secs(300));
        assert_eq!(cfg.app.max_steps, 8);
    }

    #[test]
    fn test_token_endpoint() {
        let mut graph = GraphSection {
            tenant_id: "contoso".to_string(),
            ..GraphSection::default()
        };
        assert_eq!(
            graph.token_endpoint(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        graph.token_url = Some("http://127.0.0.1:9/token".to_string());
        assert_eq!(graph.token_endpoint(), "http://127.0.0.1:9/token");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(
            &path,
            "[fetch]\nmax_workers = 2\n[fetch.retry]\nstrategy = \"exponential\"\n[graph]\ntenant_id = \"t1\"\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.fetch.max_workers, 2);
        assert_eq!(cfg.fetch.retry.strategy, "exponential");
        assert_eq!(cfg.fetch.retry.backoff_ms, 2000);
        assert_eq!(cfg.graph.tenant_id, "t1");
    }
}
