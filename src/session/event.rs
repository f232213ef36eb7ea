//! 会话事件协议：流式 Agent 运行中的子事件及其线上形态
//!
//! 每个事件编码为一个 JSON 文档 `{"type": ..., "data": ...}`，按产生顺序经 SSE 推送：
//!
//! | type          | data                                                                 |
//! |---------------|----------------------------------------------------------------------|
//! | `part_start`  | `{index, part: {part_kind, content\|reasoning}, event_kind}`        |
//! | `part_delta`  | `{index, delta: {part_kind, content\|reasoning}, event_kind}`       |
//! | `tool_call`   | `{tool_call: {name, args, tool_call_id}, call_id, event_kind}`      |
//! | `tool_result` | `{tool_result: {name, content\|retry_prompt, tool_call_id}, ...}`   |
//!
//! 同一模型轮次内，`part_delta` 只能引用已由 `part_start` 打开的 index。
//! 解码对未知 type / part_kind 以及形态不明的工具结果一律拒绝，不产生事件。
//! 错误帧 `{"type":"error"}` 不是事件，见 [`encode_error_frame`]。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::ProtocolError;

/// 文本片段种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Reasoning,
}

/// 一段文本或推理内容（`part_start` 的初始内容，或 `part_delta` 的增量）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartContent {
    Text(String),
    Reasoning(String),
}

impl PartContent {
    pub fn kind(&self) -> PartKind {
        match self {
            PartContent::Text(_) => PartKind::Text,
            PartContent::Reasoning(_) => PartKind::Reasoning,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PartContent::Text(s) | PartContent::Reasoning(s) => s,
        }
    }
}

/// 工具调用的结果：正常返回，或要求模型重试的提示
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Return(Value),
    Retry(String),
}

/// 流式运行中的单个子事件（闭合和类型）
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    PartStart { index: usize, part: PartContent },
    PartDelta { index: usize, delta: PartContent },
    ToolCall { name: String, arguments: Value, call_id: String },
    ToolResult { name: String, outcome: ToolOutcome, call_id: String },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "lowercase")]
enum WirePart {
    Text { content: String },
    Reasoning { reasoning: String },
}

impl From<&PartContent> for WirePart {
    fn from(p: &PartContent) -> Self {
        match p {
            PartContent::Text(s) => WirePart::Text { content: s.clone() },
            PartContent::Reasoning(s) => WirePart::Reasoning { reasoning: s.clone() },
        }
    }
}

impl From<WirePart> for PartContent {
    fn from(p: WirePart) -> Self {
        match p {
            WirePart::Text { content } => PartContent::Text(content),
            WirePart::Reasoning { reasoning } => PartContent::Reasoning(reasoning),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PartStartData {
    index: usize,
    part: Value,
}

#[derive(Deserialize)]
struct PartDeltaData {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ToolCallBody {
    name: String,
    #[serde(default)]
    args: Value,
    tool_call_id: String,
}

#[derive(Deserialize)]
struct ToolCallData {
    tool_call: ToolCallBody,
}

#[derive(Deserialize)]
struct ToolResultBody {
    name: String,
    tool_call_id: String,
}

#[derive(Deserialize)]
struct ToolResultData {
    tool_result: serde_json::Map<String, Value>,
}

fn decode_part(value: Value) -> Result<PartContent, ProtocolError> {
    let kind = value
        .get("part_kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if kind != "text" && kind != "reasoning" {
        return Err(ProtocolError::UnknownPartKind(kind));
    }
    let part: WirePart = serde_json::from_value(value)?;
    Ok(part.into())
}

impl StreamEvent {
    /// 线上 type 字段
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::PartStart { .. } => "part_start",
            StreamEvent::PartDelta { .. } => "part_delta",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResult { .. } => "tool_result",
        }
    }

    /// `{type, data}` 文档
    pub fn to_wire(&self) -> Value {
        let data = match self {
            StreamEvent::PartStart { index, part } => json!({
                "index": index,
                "part": WirePart::from(part),
                "event_kind": "part_start",
            }),
            StreamEvent::PartDelta { index, delta } => json!({
                "index": index,
                "delta": WirePart::from(delta),
                "event_kind": "part_delta",
            }),
            StreamEvent::ToolCall { name, arguments, call_id } => json!({
                "tool_call": {"name": name, "args": arguments, "tool_call_id": call_id},
                "call_id": call_id,
                "event_kind": "function_tool_call",
            }),
            StreamEvent::ToolResult { name, outcome, call_id } => {
                let body = match outcome {
                    ToolOutcome::Return(content) => {
                        json!({"name": name, "content": content, "tool_call_id": call_id})
                    }
                    ToolOutcome::Retry(prompt) => {
                        json!({"name": name, "retry_prompt": prompt, "tool_call_id": call_id})
                    }
                };
                json!({
                    "tool_result": body,
                    "tool_call_id": call_id,
                    "event_kind": "function_tool_result",
                })
            }
        };
        json!({"type": self.event_type(), "data": data})
    }

    /// 单个事件的形态解码（不做轮次内 index 校验，见 [`EventDecoder`]）
    pub fn from_wire(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "part_start" => {
                let d: PartStartData = serde_json::from_value(envelope.data)?;
                Ok(StreamEvent::PartStart {
                    index: d.index,
                    part: decode_part(d.part)?,
                })
            }
            "part_delta" => {
                let d: PartDeltaData = serde_json::from_value(envelope.data)?;
                Ok(StreamEvent::PartDelta {
                    index: d.index,
                    delta: decode_part(d.delta)?,
                })
            }
            "tool_call" => {
                let d: ToolCallData = serde_json::from_value(envelope.data)?;
                Ok(StreamEvent::ToolCall {
                    name: d.tool_call.name,
                    arguments: d.tool_call.args,
                    call_id: d.tool_call.tool_call_id,
                })
            }
            "tool_result" => {
                let d: ToolResultData = serde_json::from_value(envelope.data)?;
                // content 可以是 null，按键是否存在区分两种结果
                let outcome = if let Some(content) = d.tool_result.get("content") {
                    ToolOutcome::Return(content.clone())
                } else if let Some(prompt) = d.tool_result.get("retry_prompt").and_then(Value::as_str) {
                    ToolOutcome::Retry(prompt.to_string())
                } else {
                    return Err(ProtocolError::UnknownToolResult);
                };
                let body: ToolResultBody = serde_json::from_value(Value::Object(d.tool_result))?;
                Ok(StreamEvent::ToolResult {
                    name: body.name,
                    outcome,
                    call_id: body.tool_call_id,
                })
            }
            other => Err(ProtocolError::UnknownEventType(other.to_string())),
        }
    }
}

/// 一个模型轮次内已打开的 index 及其种类；工具事件结束当前轮次
#[derive(Debug, Default)]
struct TurnState {
    opened: HashMap<usize, PartKind>,
}

impl TurnState {
    fn reset(&mut self) {
        self.opened.clear();
    }

    fn check(&mut self, event: &StreamEvent) -> Result<(), ProtocolError> {
        match event {
            StreamEvent::PartStart { index, part } => {
                if self.opened.contains_key(index) {
                    return Err(ProtocolError::DuplicatePart(*index));
                }
                self.opened.insert(*index, part.kind());
            }
            StreamEvent::PartDelta { index, delta } => match self.opened.get(index) {
                None => return Err(ProtocolError::UnopenedPart(*index)),
                Some(kind) if *kind != delta.kind() => {
                    return Err(ProtocolError::DeltaKindMismatch(*index))
                }
                Some(_) => {}
            },
            StreamEvent::ToolCall { .. } | StreamEvent::ToolResult { .. } => self.reset(),
        }
        Ok(())
    }
}

/// 有状态编码器：校验轮次内 index 规则后输出 JSON 文本
#[derive(Debug, Default)]
pub struct EventEncoder {
    turn: TurnState,
}

impl EventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新的模型轮次开始，index 重新计数
    pub fn begin_turn(&mut self) {
        self.turn.reset();
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Result<String, ProtocolError> {
        self.turn.check(event)?;
        Ok(event.to_wire().to_string())
    }
}

/// 有状态解码器：与编码器执行相同的轮次内 index 规则
#[derive(Debug, Default)]
pub struct EventDecoder {
    turn: TurnState,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_turn(&mut self) {
        self.turn.reset();
    }

    pub fn decode(&mut self, text: &str) -> Result<StreamEvent, ProtocolError> {
        let event = StreamEvent::from_wire(text)?;
        self.turn.check(&event)?;
        Ok(event)
    }
}

/// 错误帧 `{"type":"error","data":{"kind","detail"}}`
pub fn encode_error_frame(kind: &str, detail: &str) -> String {
    json!({"type": "error", "data": {"kind": kind, "detail": detail}}).to_string()
}
