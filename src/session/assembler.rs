//! 响应组装与历史回放
//!
//! [`ResponseBuilder`] 把一轮模型输出的增量拼成片段，同时产出对应的流式事件；
//! [`ReplayAssembler`] 把存储中的有序日志重建为喂给模型的类型化历史。

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;

use super::event::{PartContent, PartKind, StreamEvent};
use super::message::{ModelMessage, ModelResponse, PersistedMessage, RequestPart, ResponsePart};
use super::store::StoredMessage;

/// 一轮模型输出的组装器
///
/// 连续同类增量合并到同一片段（`part_delta`），种类切换或工具调用之后的增量打开新片段（`part_start`）。
/// 工具调用占用一个片段位置，但不在本轮发出事件，它在工具轮次以 `tool_call` 事件出现。
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    parts: Vec<ResponsePart>,
    /// 当前可续写的文本片段 (index, kind)
    open: Option<(usize, PartKind)>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, delta: &str) -> Option<StreamEvent> {
        self.push(PartContent::Text(delta.to_string()))
    }

    pub fn push_reasoning(&mut self, delta: &str) -> Option<StreamEvent> {
        self.push(PartContent::Reasoning(delta.to_string()))
    }

    fn push(&mut self, content: PartContent) -> Option<StreamEvent> {
        if content.as_str().is_empty() {
            return None;
        }
        let kind = content.kind();
        if let Some((index, open_kind)) = self.open {
            if open_kind == kind {
                match &mut self.parts[index] {
                    ResponsePart::Text(s) | ResponsePart::Reasoning(s) => s.push_str(content.as_str()),
                    ResponsePart::ToolCall { .. } => {}
                }
                return Some(StreamEvent::PartDelta {
                    index,
                    delta: content,
                });
            }
        }

        let index = self.parts.len();
        self.parts.push(match &content {
            PartContent::Text(s) => ResponsePart::Text(s.clone()),
            PartContent::Reasoning(s) => ResponsePart::Reasoning(s.clone()),
        });
        self.open = Some((index, kind));
        Some(StreamEvent::PartStart {
            index,
            part: content,
        })
    }

    pub fn push_tool_call(&mut self, name: impl Into<String>, args: Value, call_id: impl Into<String>) {
        self.parts.push(ResponsePart::ToolCall {
            name: name.into(),
            args,
            call_id: call_id.into(),
        });
        self.open = None;
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// 结束本轮，得到带模型名与时间戳的响应
    pub fn finish(self, model_name: &str) -> ModelResponse {
        ModelResponse {
            parts: self.parts,
            model_name: Some(model_name.to_string()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// 历史回放：解析日志、刷新系统提示词、处理孤立的工具调用
pub struct ReplayAssembler {
    system_prompt: Option<String>,
}

impl ReplayAssembler {
    /// system_prompt：当前系统提示词，回放时替换日志开头的旧版本
    pub fn new(system_prompt: Option<String>) -> Self {
        Self { system_prompt }
    }

    pub fn rebuild(&self, log: &[StoredMessage]) -> Vec<ModelMessage> {
        let mut messages: Vec<ModelMessage> = log
            .iter()
            .filter_map(|row| {
                match PersistedMessage::decode(&row.content).and_then(PersistedMessage::into_model) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        tracing::warn!(sequence_no = row.sequence_no, "Dropping unreadable message: {}", e);
                        None
                    }
                }
            })
            .collect();

        self.refresh_system_prompt(&mut messages);
        close_orphans(messages)
    }

    fn refresh_system_prompt(&self, messages: &mut [ModelMessage]) {
        let Some(current) = &self.system_prompt else {
            return;
        };
        if let Some(ModelMessage::Request(first)) = messages.first_mut() {
            if let Some(RequestPart::System(prompt)) = first.parts.first_mut() {
                if prompt != current {
                    *prompt = current.clone();
                }
            }
        }
    }
}

/// 丢弃没有配对的工具调用 / 返回，以及因此变空的消息
fn close_orphans(messages: Vec<ModelMessage>) -> Vec<ModelMessage> {
    // 某个调用之后出现的所有返回/重试的 call_id
    let mut answered = HashSet::new();
    for m in &messages {
        if let ModelMessage::Request(req) = m {
            for p in &req.parts {
                match p {
                    RequestPart::ToolReturn { call_id, .. } => {
                        answered.insert(call_id.clone());
                    }
                    RequestPart::RetryPrompt {
                        call_id: Some(call_id),
                        ..
                    } => {
                        answered.insert(call_id.clone());
                    }
                    _ => {}
                }
            }
        }
    }

    let mut issued = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let message = match message {
            ModelMessage::Response(mut resp) => {
                resp.parts.retain(|p| match p {
                    ResponsePart::ToolCall { call_id, name, .. } => {
                        if answered.contains(call_id) {
                            issued.insert(call_id.clone());
                            true
                        } else {
                            tracing::warn!(call_id = %call_id, tool = %name, "Dropping tool call without a result");
                            false
                        }
                    }
                    _ => true,
                });
                ModelMessage::Response(resp)
            }
            ModelMessage::Request(mut req) => {
                req.parts.retain(|p| {
                    let call_id = match p {
                        RequestPart::ToolReturn { call_id, .. } => call_id,
                        RequestPart::RetryPrompt {
                            call_id: Some(call_id),
                            ..
                        } => call_id,
                        _ => return true,
                    };
                    let keep = issued.contains(call_id);
                    if !keep {
                        tracing::warn!(call_id = %call_id, "Dropping tool result without a matching call");
                    }
                    keep
                });
                ModelMessage::Request(req)
            }
        };
        if message.is_empty() {
            continue;
        }
        out.push(message);
    }
    out
}
