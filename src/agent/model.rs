//! 模型客户端抽象
//!
//! 一次调用对应一个模型轮次：给定类型化历史与可用工具，返回增量流。
//! 增量为文本、推理或完整的工具调用（参数已拼装完毕）。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde_json::Value;

use crate::core::AgentError;
use crate::session::ModelMessage;
use crate::tools::ToolSpec;

/// 模型输出的一个增量
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    Reasoning(String),
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, AgentError>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn stream_turn(&self, history: &[ModelMessage], tools: &[ToolSpec]) -> Result<ModelStream, AgentError>;
}

/// 脚本化模型（用于测试，无需 API）：每次调用按顺序吐出预设的一轮增量，并记录收到的历史
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<Result<ModelChunk, AgentError>>>>,
    seen: Mutex<Vec<Vec<ModelMessage>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Vec<ModelChunk>>) -> Self {
        Self {
            turns: Mutex::new(
                turns
                    .into_iter()
                    .map(|t| t.into_iter().map(Ok).collect())
                    .collect(),
            ),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 追加一轮可能中途出错的增量
    pub fn push_turn(&self, turn: Vec<Result<ModelChunk, AgentError>>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    /// 每次调用时收到的历史
    pub fn seen_histories(&self) -> Vec<Vec<ModelMessage>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(&self, history: &[ModelMessage], _tools: &[ToolSpec]) -> Result<ModelStream, AgentError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(history.to_vec());
        }
        let turn = self
            .turns
            .lock()
            .ok()
            .and_then(|mut t| t.pop_front())
            .ok_or_else(|| AgentError::LlmError("scripted model has no more turns".to_string()))?;
        Ok(Box::pin(stream::iter(turn)))
    }
}
