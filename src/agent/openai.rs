//! OpenAI 兼容的流式模型客户端（Groq / DeepSeek / OpenAI 等）
//!
//! `POST {base_url}/chat/completions`，`stream: true`，逐行解析 SSE：
//! `delta.content` 为文本，`delta.reasoning_content`（或 `delta.reasoning`）为推理，
//! `delta.tool_calls` 按 index 累积，流结束时输出完整的工具调用。

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::model::{ModelChunk, ModelClient, ModelStream};
use crate::config::LlmSection;
use crate::core::error::header_pairs;
use crate::core::{AgentError, RemoteError};
use crate::session::{ModelMessage, RequestPart, ResponsePart};
use crate::tools::ToolSpec;

/// 重试提示后附加给模型的指引
const RETRY_SUFFIX: &str = "Fix the errors and try again.";

pub struct OpenAiModel {
    client: reqwest::Client,
    chat_url: String,
    api_key: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::ConfigError(format!("failed to build llm client: {e}")))?;
        Ok(Self {
            client,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// api_key 未配置时读取 OPENAI_API_KEY
    pub fn from_config(llm: &LlmSection) -> Result<Self, AgentError> {
        let api_key = llm
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| AgentError::ConfigError("llm.api_key / OPENAI_API_KEY not set".to_string()))?;
        Self::new(
            &llm.base_url,
            api_key,
            llm.model.clone(),
            Duration::from_secs(llm.stream_timeout_secs),
        )
    }

    fn build_body(&self, history: &[ModelMessage], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": to_wire_messages(history),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

/// 类型化历史 -> chat/completions messages
fn to_wire_messages(history: &[ModelMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in history {
        match message {
            ModelMessage::Request(req) => {
                for part in &req.parts {
                    out.push(match part {
                        RequestPart::System(s) => json!({"role": "system", "content": s}),
                        RequestPart::UserPrompt(s) => json!({"role": "user", "content": s}),
                        RequestPart::ToolReturn { content, call_id, .. } => {
                            let text = match content {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            json!({"role": "tool", "tool_call_id": call_id, "content": text})
                        }
                        RequestPart::RetryPrompt {
                            content,
                            call_id: Some(call_id),
                            ..
                        } => json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": format!("{content}\n\n{RETRY_SUFFIX}"),
                        }),
                        RequestPart::RetryPrompt { content, call_id: None, .. } => {
                            json!({"role": "user", "content": format!("{content}\n\n{RETRY_SUFFIX}")})
                        }
                    });
                }
            }
            ModelMessage::Response(resp) => {
                let text: String = resp
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ResponsePart::Text(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                let calls: Vec<Value> = resp
                    .tool_calls()
                    .map(|(name, args, call_id)| {
                        json!({
                            "id": call_id,
                            "type": "function",
                            "function": {"name": name, "arguments": args.to_string()},
                        })
                    })
                    .collect();
                if text.is_empty() && calls.is_empty() {
                    continue;
                }
                let mut msg = json!({"role": "assistant", "content": text});
                if !calls.is_empty() {
                    msg["tool_calls"] = Value::Array(calls);
                }
                out.push(msg);
            }
        }
    }
    out
}

#[derive(Deserialize, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCallDelta>,
}

#[derive(Deserialize, Default)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Default)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments_buf: String,
}

impl ToolCallState {
    fn apply(&mut self, delta: &StreamToolCallDelta) {
        if let Some(id) = delta.id.as_ref() {
            if self.id.is_none() {
                self.id = Some(id.clone());
            }
        }
        if let Some(func) = delta.function.as_ref() {
            if let Some(name) = func.name.as_ref() {
                if self.name.is_none() {
                    self.name = Some(name.clone());
                }
            }
            if let Some(arguments) = func.arguments.as_ref() {
                self.arguments_buf.push_str(arguments);
            }
        }
    }

    /// 参数无法解析时原样作为字符串交给工具，由工具给出重试提示
    fn into_chunk(self) -> Option<ModelChunk> {
        let name = self.name?;
        let arguments = if self.arguments_buf.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.arguments_buf).unwrap_or(Value::String(self.arguments_buf))
        };
        Some(ModelChunk::ToolCall {
            call_id: self
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
            name,
            arguments,
        })
    }
}

/// SSE 行解析：按字节缓冲，遇空行产出一个完整的 data 负载
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    data_buf: String,
}

impl SseParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start_matches(' ');
                if !self.data_buf.is_empty() {
                    self.data_buf.push('\n');
                }
                self.data_buf.push_str(data);
            } else if line.is_empty() && !self.data_buf.is_empty() {
                payloads.push(std::mem::take(&mut self.data_buf));
            }
        }
        payloads
    }

    /// 流结束时未以空行收尾的负载
    fn flush(&mut self) -> Option<String> {
        if self.data_buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_buf))
        }
    }
}

struct StreamState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    parser: SseParser,
    tools: BTreeMap<u32, ToolCallState>,
    /// 已解析但尚未产出的块；出错时错误排在它们之后
    pending: VecDeque<Result<ModelChunk, AgentError>>,
    finished: bool,
}

impl StreamState {
    fn handle_payload(&mut self, data: &str) -> Result<(), AgentError> {
        let data = data.trim();
        if data == "[DONE]" {
            self.finish();
            return Ok(());
        }
        let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
            AgentError::Remote(RemoteError::malformed(format!("stream decode error: {e}"), data))
        })?;
        for choice in chunk.choices {
            if choice.index != 0 {
                continue;
            }
            let delta = choice.delta;
            if let Some(r) = delta.reasoning_content.or(delta.reasoning) {
                if !r.is_empty() {
                    self.pending.push_back(Ok(ModelChunk::Reasoning(r)));
                }
            }
            if let Some(c) = delta.content {
                if !c.is_empty() {
                    self.pending.push_back(Ok(ModelChunk::Text(c)));
                }
            }
            for tool_delta in &delta.tool_calls {
                let index = tool_delta.index.unwrap_or(0);
                self.tools.entry(index).or_default().apply(tool_delta);
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        for (_, state) in std::mem::take(&mut self.tools) {
            if let Some(chunk) = state.into_chunk() {
                self.pending.push_back(Ok(chunk));
            }
        }
    }

    /// 以错误结束：未完成的工具调用丢弃，已解析的块仍先产出
    fn fail(&mut self, err: AgentError) {
        self.finished = true;
        self.tools.clear();
        self.pending.push_back(Err(err));
    }
}

fn into_model_stream(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> ModelStream {
    let state = StreamState {
        body,
        parser: SseParser::default(),
        tools: BTreeMap::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for data in st.parser.feed(&bytes) {
                        if let Err(e) = st.handle_payload(&data) {
                            st.fail(e);
                        }
                        if st.finished {
                            break;
                        }
                    }
                }
                Some(Err(e)) => st.fail(AgentError::Remote(RemoteError::from_reqwest(&e))),
                None => {
                    match st.parser.flush().map(|data| st.handle_payload(&data)) {
                        Some(Err(e)) => st.fail(e),
                        _ => st.finish(),
                    }
                }
            }
        }
    }))
}

#[async_trait]
impl ModelClient for OpenAiModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_turn(&self, history: &[ModelMessage], tools: &[ToolSpec]) -> Result<ModelStream, AgentError> {
        let body = self.build_body(history, tools);
        tracing::debug!(model = %self.model, messages = history.len(), "Starting model turn");

        let resp = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Remote(RemoteError::from_reqwest(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            let headers = header_pairs(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "Model endpoint rejected request");
            return Err(AgentError::Remote(RemoteError::http_status(status.as_u16(), headers, text)));
        }

        let bytes = resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(into_model_stream(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ModelRequest, ModelResponse};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(server: &MockServer) -> OpenAiModel {
        OpenAiModel::new(&server.uri(), "key", "test-model", Duration::from_secs(5)).unwrap()
    }

    async fn collect(stream: ModelStream) -> Vec<Result<ModelChunk, AgentError>> {
        stream.collect().await
    }

    #[test]
    fn test_sse_parser_handles_split_lines() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"a\"").is_empty());
        assert!(parser.feed(b":1}\n").is_empty());
        assert_eq!(parser.feed(b"\ndata: [DONE]\n\n"), vec!["{\"a\":1}", "[DONE]"]);
        assert_eq!(parser.flush(), None);
    }

    #[test]
    fn test_history_to_wire_messages() {
        let history = vec![
            ModelMessage::Request(ModelRequest {
                parts: vec![
                    RequestPart::System("sys".to_string()),
                    RequestPart::UserPrompt("hi".to_string()),
                ],
            }),
            ModelMessage::Response(ModelResponse {
                parts: vec![
                    ResponsePart::Reasoning("hidden".to_string()),
                    ResponsePart::ToolCall {
                        name: "search_teams".to_string(),
                        args: json!({"search_string": "X"}),
                        call_id: "c1".to_string(),
                    },
                ],
                model_name: None,
                timestamp: None,
            }),
            ModelMessage::Request(ModelRequest {
                parts: vec![RequestPart::ToolReturn {
                    name: "search_teams".to_string(),
                    content: json!([]),
                    call_id: "c1".to_string(),
                }],
            }),
            ModelMessage::Response(ModelResponse {
                parts: vec![ResponsePart::Reasoning("only thinking".to_string())],
                model_name: None,
                timestamp: None,
            }),
        ];
        let wire = to_wire_messages(&history);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["role"], "assistant");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], "{\"search_string\":\"X\"}");
        assert_eq!(wire[3], json!({"role": "tool", "tool_call_id": "c1", "content": "[]"}));
    }

    #[tokio::test]
    async fn test_stream_text_reasoning_and_tool_calls() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning\":\"let me \"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\"search\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Looking\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"search_teams\",\"arguments\":\"{\\\"search_\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"string\\\":\\\"X\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(json!({"stream": true, "model": "test-model"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let chunks = collect(model(&server).stream_turn(&[], &[]).await.unwrap()).await;
        let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![
                ModelChunk::Reasoning("let me ".to_string()),
                ModelChunk::Reasoning("search".to_string()),
                ModelChunk::Text("Looking".to_string()),
                ModelChunk::ToolCall {
                    call_id: "call_1".to_string(),
                    name: "search_teams".to_string(),
                    arguments: json!({"search_string": "X"}),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_tools_are_declared() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"tools": [{"type": "function", "function": {"name": "search_teams"}}]})))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: [DONE]\n\n"))
            .expect(1)
            .mount(&server)
            .await;

        let spec = ToolSpec {
            name: "search_teams".to_string(),
            description: "d".to_string(),
            parameters: json!({"type": "object"}),
        };
        let chunks = collect(model(&server).stream_turn(&[], &[spec]).await.unwrap()).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_http_error_is_remote() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        match model(&server).stream_turn(&[], &[]).await {
            Err(AgentError::Remote(e)) => assert!(e.is_rate_limited()),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_malformed_chunk_ends_stream_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: {broken\n\n",
            ))
            .mount(&server)
            .await;

        let chunks = collect(model(&server).stream_turn(&[], &[]).await.unwrap()).await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], Ok(ModelChunk::Text(t)) if t == "ok"));
        assert!(matches!(&chunks[1], Err(AgentError::Remote(e)) if e.kind == crate::core::RemoteErrorKind::MalformedResponse));
    }
}
