//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.execute：
//! 参数错误与未知工具转为重试提示交还给模型，远端失败与超时转为 AgentError 终止运行；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::session::ToolOutcome;
use crate::tools::{ToolError, ToolRegistry, ToolSpec};

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolOutcome / AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<ToolOutcome, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(ToolError::InvalidArgs(_))) => (false, "retry"),
            Ok(Err(ToolError::UnknownTool(_))) => (false, "unknown_tool"),
            Ok(Err(ToolError::Remote(_))) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(ToolOutcome::Return(content)),
            Ok(Err(ToolError::InvalidArgs(reason))) => Ok(ToolOutcome::Retry(reason)),
            Ok(Err(ToolError::UnknownTool(name))) => {
                tracing::warn!("{}", AgentError::HallucinatedTool(name.clone()));
                let available = self.registry.tool_names().join(", ");
                Ok(ToolOutcome::Retry(format!(
                    "Unknown tool name: {name}. Available tools: {available}"
                )))
            }
            Ok(Err(ToolError::Remote(e))) => Err(AgentError::Remote(e)),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
