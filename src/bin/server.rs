//! deskpilot 服务
//!
//! 启动: cargo run --bin deskpilot-server --features web,async-sqlite [-- path/to/config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use deskpilot::agent::{AgentRunner, OpenAiModel};
use deskpilot::auth::{StaticTokenAuthenticator, TokenManager};
use deskpilot::config::{load_config, AppConfig};
use deskpilot::core::{ShutdownCoordinator, ShutdownManager, StoreCleanup, TokenRefreshCleanup};
use deskpilot::graph::{FetchOrchestrator, GraphTransport, PagedCollectionFetcher};
use deskpilot::server::{router, AppState};
use deskpilot::session::create_message_store;
use deskpilot::tools::{ListChannelsTool, SearchTeamsTool, ToolExecutor, ToolRegistry};

const FALLBACK_SYSTEM_PROMPT: &str =
    "You are an assistant that manages a Microsoft Teams tenant. Use the provided tools to look up teams and channels.";

fn system_prompt(cfg: &AppConfig) -> String {
    cfg.app
        .system_prompt_path
        .as_ref()
        .and_then(|p| match std::fs::read_to_string(p) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("Failed to read system prompt {:?}: {}", p, e);
                None
            }
        })
        .unwrap_or_else(|| FALLBACK_SYSTEM_PROMPT.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deskpilot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let tokens = TokenManager::from_config(&cfg.graph).context("Failed to build token manager")?;
    let transport =
        GraphTransport::from_config(tokens.clone(), &cfg.graph).context("Failed to build transport")?;

    let channels = Arc::new(PagedCollectionFetcher::new(transport.clone(), "teams/{id}/channels"));
    let orchestrator = Arc::new(FetchOrchestrator::from_config(channels, &cfg.fetch));

    let mut registry = ToolRegistry::new();
    registry.register(SearchTeamsTool::new(transport));
    registry.register(ListChannelsTool::new(orchestrator));
    let executor = Arc::new(ToolExecutor::new(registry, cfg.llm.tool_timeout_secs));

    let model = Arc::new(OpenAiModel::from_config(&cfg.llm).context("Failed to build model client")?);
    let store = create_message_store(cfg.server.db_path.as_deref()).await;

    let runner = AgentRunner::new(model, executor, Arc::clone(&store))
        .with_system_prompt(system_prompt(&cfg))
        .with_max_steps(cfg.app.max_steps);
    let state = Arc::new(AppState {
        runner: Arc::new(runner),
        authenticator: Arc::new(StaticTokenAuthenticator::from_config(&cfg.server)),
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(TokenRefreshCleanup::new(tokens));
    coordinator.register(StoreCleanup::new(store));

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;
    tracing::info!(
        "{} listening on http://{}",
        cfg.app.name.as_deref().unwrap_or("deskpilot"),
        cfg.server.bind
    );

    let token = shutdown.token();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Server error")?;

    coordinator.run_cleanup().await;
    Ok(())
}
