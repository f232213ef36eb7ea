//! 持久化消息记录与类型化会话历史
//!
//! 存储列 `content` 中的 JSON 形态：
//!
//! ```json
//! {"type":"model_request","kind":"request","sequence_no":1,
//!  "parts":[{"type":"UserPromptPart","part_kind":"user-prompt","content":"..."}]}
//! ```
//!
//! [`PersistedMessage`] 是日志里的一行，[`ModelMessage`] 是喂给模型的类型化历史；
//! 两者互转无损，请求/响应各自只接受属于自己的片段种类。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::ProtocolError;

/// 日志中的一个片段
#[derive(Debug, Clone, PartialEq)]
pub enum PartRecord {
    System(String),
    UserPrompt(String),
    Text(String),
    Reasoning(String),
    ToolCall {
        name: String,
        args: Value,
        call_id: String,
    },
    ToolReturn {
        name: String,
        content: Value,
        call_id: String,
    },
    RetryPrompt {
        content: String,
        tool_name: Option<String>,
        call_id: Option<String>,
    },
}

impl PartRecord {
    /// (type, part_kind)
    fn tags(&self) -> (&'static str, &'static str) {
        match self {
            PartRecord::System(_) => ("SystemPromptPart", "system-prompt"),
            PartRecord::UserPrompt(_) => ("UserPromptPart", "user-prompt"),
            PartRecord::Text(_) => ("TextPart", "text"),
            PartRecord::Reasoning(_) => ("ReasoningPart", "reasoning"),
            PartRecord::ToolCall { .. } => ("ToolCallPart", "tool-call"),
            PartRecord::ToolReturn { .. } => ("ToolReturnPart", "tool-return"),
            PartRecord::RetryPrompt { .. } => ("RetryPromptPart", "retry-prompt"),
        }
    }

    fn type_name(&self) -> &'static str {
        self.tags().0
    }

    fn to_json(&self) -> Value {
        let (ty, part_kind) = self.tags();
        let content = match self {
            PartRecord::System(s)
            | PartRecord::UserPrompt(s)
            | PartRecord::Text(s)
            | PartRecord::Reasoning(s) => Value::String(s.clone()),
            PartRecord::ToolCall { name, args, call_id } => {
                json!({"name": name, "args": args, "tool_call_id": call_id})
            }
            PartRecord::ToolReturn {
                name,
                content,
                call_id,
            } => json!({"name": name, "content": content, "tool_call_id": call_id}),
            PartRecord::RetryPrompt {
                content,
                tool_name,
                call_id,
            } => {
                let mut body = Map::new();
                body.insert("content".to_string(), Value::String(content.clone()));
                if let Some(name) = tool_name {
                    body.insert("tool_name".to_string(), Value::String(name.clone()));
                }
                if let Some(id) = call_id {
                    body.insert("tool_call_id".to_string(), Value::String(id.clone()));
                }
                Value::Object(body)
            }
        };
        json!({"type": ty, "part_kind": part_kind, "content": content})
    }

    fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let ty = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let content = value.get("content").cloned().unwrap_or(Value::Null);

        let text = |v: &Value| -> Result<String, ProtocolError> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::Json(format!("{ty} content must be a string")))
        };
        let field = |v: &Value, key: &str| -> Result<String, ProtocolError> {
            v.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::Json(format!("{ty} content missing `{key}`")))
        };
        let optional = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

        let part = match ty {
            "SystemPromptPart" => PartRecord::System(text(&content)?),
            "UserPromptPart" => PartRecord::UserPrompt(text(&content)?),
            "TextPart" => PartRecord::Text(text(&content)?),
            "ReasoningPart" => PartRecord::Reasoning(text(&content)?),
            "ToolCallPart" => PartRecord::ToolCall {
                name: field(&content, "name")?,
                args: content.get("args").cloned().unwrap_or_else(|| json!({})),
                call_id: field(&content, "tool_call_id")?,
            },
            "ToolReturnPart" => PartRecord::ToolReturn {
                name: field(&content, "name")?,
                content: content.get("content").cloned().unwrap_or(Value::Null),
                call_id: field(&content, "tool_call_id")?,
            },
            "RetryPromptPart" => PartRecord::RetryPrompt {
                content: field(&content, "content")?,
                tool_name: optional(&content, "tool_name"),
                call_id: optional(&content, "tool_call_id"),
            },
            other => return Err(ProtocolError::UnknownPartType(other.to_string())),
        };

        if let Some(kind) = value.get("part_kind").and_then(Value::as_str) {
            if kind != part.tags().1 {
                return Err(ProtocolError::UnknownPartKind(kind.to_string()));
            }
        }
        Ok(part)
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    fn type_tag(self) -> &'static str {
        match self {
            MessageKind::Request => "model_request",
            MessageKind::Response => "model_response",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }
}

/// 日志中的一条消息（只追加，不修改）
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMessage {
    pub kind: MessageKind,
    pub parts: Vec<PartRecord>,
    pub model_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// 由存储在追加时分配
    pub sequence_no: u64,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    sequence_no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    parts: Vec<Value>,
}

impl PersistedMessage {
    pub fn request(parts: Vec<PartRecord>) -> Self {
        Self {
            kind: MessageKind::Request,
            parts,
            model_name: None,
            timestamp: None,
            sequence_no: 0,
        }
    }

    pub fn to_json(&self) -> Value {
        let wire = WireMessage {
            ty: self.kind.type_tag().to_string(),
            kind: Some(self.kind.as_str().to_string()),
            sequence_no: self.sequence_no,
            model_name: self.model_name.clone(),
            timestamp: self.timestamp,
            parts: self.parts.iter().map(PartRecord::to_json).collect(),
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    pub fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_value(value)?;
        let kind = match wire.ty.as_str() {
            "model_request" => MessageKind::Request,
            "model_response" => MessageKind::Response,
            other => return Err(ProtocolError::UnknownMessageType(other.to_string())),
        };
        let parts = wire
            .parts
            .iter()
            .map(PartRecord::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind,
            parts,
            model_name: wire.model_name,
            timestamp: wire.timestamp,
            sequence_no: wire.sequence_no,
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_json(serde_json::from_str(text)?)
    }

    /// 转为类型化历史；片段放错方向或同一响应内 call_id 重复时拒绝
    pub fn into_model(self) -> Result<ModelMessage, ProtocolError> {
        match self.kind {
            MessageKind::Request => {
                let parts = self
                    .parts
                    .into_iter()
                    .map(|p| match p {
                        PartRecord::System(s) => Ok(RequestPart::System(s)),
                        PartRecord::UserPrompt(s) => Ok(RequestPart::UserPrompt(s)),
                        PartRecord::ToolReturn {
                            name,
                            content,
                            call_id,
                        } => Ok(RequestPart::ToolReturn {
                            name,
                            content,
                            call_id,
                        }),
                        PartRecord::RetryPrompt {
                            content,
                            tool_name,
                            call_id,
                        } => Ok(RequestPart::RetryPrompt {
                            content,
                            tool_name,
                            call_id,
                        }),
                        other => Err(ProtocolError::MisplacedPart {
                            part: other.type_name(),
                            message: "request",
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ModelMessage::Request(ModelRequest { parts }))
            }
            MessageKind::Response => {
                let mut seen = HashSet::new();
                let mut parts = Vec::with_capacity(self.parts.len());
                for p in self.parts {
                    let part = match p {
                        PartRecord::Text(s) => ResponsePart::Text(s),
                        PartRecord::Reasoning(s) => ResponsePart::Reasoning(s),
                        PartRecord::ToolCall { name, args, call_id } => {
                            if !seen.insert(call_id.clone()) {
                                return Err(ProtocolError::DuplicateCallId(call_id));
                            }
                            ResponsePart::ToolCall { name, args, call_id }
                        }
                        other => {
                            return Err(ProtocolError::MisplacedPart {
                                part: other.type_name(),
                                message: "response",
                            })
                        }
                    };
                    parts.push(part);
                }
                Ok(ModelMessage::Response(ModelResponse {
                    parts,
                    model_name: self.model_name,
                    timestamp: self.timestamp,
                }))
            }
        }
    }

    pub fn from_model(message: &ModelMessage) -> Self {
        match message {
            ModelMessage::Request(req) => Self::request(
                req.parts
                    .iter()
                    .map(|p| match p.clone() {
                        RequestPart::System(s) => PartRecord::System(s),
                        RequestPart::UserPrompt(s) => PartRecord::UserPrompt(s),
                        RequestPart::ToolReturn {
                            name,
                            content,
                            call_id,
                        } => PartRecord::ToolReturn {
                            name,
                            content,
                            call_id,
                        },
                        RequestPart::RetryPrompt {
                            content,
                            tool_name,
                            call_id,
                        } => PartRecord::RetryPrompt {
                            content,
                            tool_name,
                            call_id,
                        },
                    })
                    .collect(),
            ),
            ModelMessage::Response(resp) => Self {
                kind: MessageKind::Response,
                parts: resp
                    .parts
                    .iter()
                    .map(|p| match p.clone() {
                        ResponsePart::Text(s) => PartRecord::Text(s),
                        ResponsePart::Reasoning(s) => PartRecord::Reasoning(s),
                        ResponsePart::ToolCall { name, args, call_id } => {
                            PartRecord::ToolCall { name, args, call_id }
                        }
                    })
                    .collect(),
                model_name: resp.model_name.clone(),
                timestamp: resp.timestamp,
                sequence_no: 0,
            },
        }
    }
}

/// 请求方向片段
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart {
    System(String),
    UserPrompt(String),
    ToolReturn {
        name: String,
        content: Value,
        call_id: String,
    },
    RetryPrompt {
        content: String,
        tool_name: Option<String>,
        call_id: Option<String>,
    },
}

/// 响应方向片段
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    Reasoning(String),
    ToolCall {
        name: String,
        args: Value,
        call_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    pub model_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ModelResponse {
    /// 本响应中的工具调用 (name, args, call_id)
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &Value, &str)> {
        self.parts.iter().filter_map(|p| match p {
            ResponsePart::ToolCall { name, args, call_id } => {
                Some((name.as_str(), args, call_id.as_str()))
            }
            _ => None,
        })
    }

    /// 所有文本片段拼接
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ResponsePart::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// 喂给模型的类型化历史消息
#[derive(Debug, Clone, PartialEq)]
pub enum ModelMessage {
    Request(ModelRequest),
    Response(ModelResponse),
}

impl ModelMessage {
    pub fn is_empty(&self) -> bool {
        match self {
            ModelMessage::Request(r) => r.parts.is_empty(),
            ModelMessage::Response(r) => r.parts.is_empty(),
        }
    }
}
