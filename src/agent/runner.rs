//! 会话运行器：一次请求 = 回放历史 + 若干模型轮次 / 工具轮次
//!
//! 每个子事件经 [`EventEncoder`] 编码后按产生顺序发给调用方，
//! 每轮结束时把组装好的消息追加到会话日志。同一会话同一时刻只运行一个请求。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::model::{ModelChunk, ModelClient};
use crate::core::AgentError;
use crate::session::{
    encode_error_frame, ConversationAccess, EventEncoder, MessageStore, ModelMessage, ModelRequest,
    PersistedMessage, ReplayAssembler, RequestPart, ResponseBuilder, StreamEvent, ToolOutcome,
};
use crate::tools::ToolExecutor;

/// 客户端断开后关闭未完成调用的提示
const CANCELLED_ON_DISCONNECT: &str = "tool call cancelled: client disconnected";
/// 前一个工具失败后，同轮剩余调用的提示
const CANCELLED_ON_ABORT: &str = "tool call cancelled: run aborted";

/// 一次运行的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 模型给出最终回答
    Completed,
    /// 客户端断开，已持久化当前轮次并关闭未完成的调用
    Disconnected,
}

pub struct AgentRunner {
    model: Arc<dyn ModelClient>,
    executor: Arc<ToolExecutor>,
    store: Arc<dyn MessageStore>,
    system_prompt: Option<String>,
    max_steps: usize,
    /// 只保存正在运行或等待的会话锁，运行结束后无人持有即移除
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// 发送端：编码事件并推给调用方，发送失败即视为断开
struct Emitter<'a> {
    encoder: EventEncoder,
    tx: &'a mpsc::UnboundedSender<String>,
    disconnected: bool,
}

impl Emitter<'_> {
    fn emit(&mut self, event: &StreamEvent) -> Result<(), AgentError> {
        let frame = self.encoder.encode(event)?;
        if !self.disconnected && self.tx.send(frame).is_err() {
            tracing::info!("Client disconnected, finishing current turn");
            self.disconnected = true;
        }
        Ok(())
    }
}

impl AgentRunner {
    pub fn new(model: Arc<dyn ModelClient>, executor: Arc<ToolExecutor>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            model,
            executor,
            store,
            system_prompt: None,
            max_steps: 8,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 单次请求最多的模型轮次
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 调用方已释放 guard；map 与 `lock` 之外没有其他持有者时移除
    fn release_lock(&self, conversation_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(conversation_id);
        }
    }

    /// 运行一次请求；会话不存在时以 `owner` 创建。
    /// 失败时先向调用方发送错误帧再返回错误
    pub async fn run(
        &self,
        conversation_id: &str,
        owner: &str,
        prompt: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<RunOutcome, AgentError> {
        let lock = self.conversation_lock(conversation_id);
        let guard = lock.lock().await;
        let result = self.run_locked(conversation_id, owner, prompt, &tx).await;
        drop(guard);
        self.release_lock(conversation_id, lock);

        match result {
            Ok(outcome) => {
                tracing::info!(conversation = %conversation_id, ?outcome, "Run finished");
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(conversation = %conversation_id, kind = e.kind(), "Run failed: {}", e);
                let _ = tx.send(encode_error_frame(e.kind(), &e.user_detail()));
                Err(e)
            }
        }
    }

    async fn append(&self, conversation_id: &str, message: &ModelMessage) -> Result<(), AgentError> {
        self.store
            .append_message(conversation_id, &PersistedMessage::from_model(message))
            .await?;
        Ok(())
    }

    async fn run_locked(
        &self,
        conversation_id: &str,
        owner: &str,
        prompt: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<RunOutcome, AgentError> {
        match self.store.ensure_conversation(conversation_id, owner).await? {
            ConversationAccess::Foreign => {
                return Err(AgentError::ConversationForbidden(conversation_id.to_string()));
            }
            ConversationAccess::Created => {
                tracing::info!(conversation = %conversation_id, owner = %owner, "Created conversation");
            }
            ConversationAccess::Owned => {}
        }

        let log = self.store.load_ordered_messages(conversation_id).await?;
        let mut history = ReplayAssembler::new(self.system_prompt.clone()).rebuild(&log);

        let mut parts = Vec::new();
        if history.is_empty() {
            if let Some(system) = &self.system_prompt {
                parts.push(RequestPart::System(system.clone()));
            }
        }
        parts.push(RequestPart::UserPrompt(prompt.to_string()));
        let request = ModelMessage::Request(ModelRequest { parts });
        self.append(conversation_id, &request).await?;
        history.push(request);

        let specs = self.executor.specs();
        let mut emitter = Emitter {
            encoder: EventEncoder::new(),
            tx,
            disconnected: false,
        };

        for step in 0..self.max_steps {
            tracing::debug!(conversation = %conversation_id, step, "Model turn");
            emitter.encoder.begin_turn();
            let mut builder = ResponseBuilder::new();
            let mut stream = self.model.stream_turn(&history, &specs).await?;
            let mut stream_error = None;

            while let Some(chunk) = stream.next().await {
                let event = match chunk {
                    Ok(ModelChunk::Text(t)) => builder.push_text(&t),
                    Ok(ModelChunk::Reasoning(r)) => builder.push_reasoning(&r),
                    Ok(ModelChunk::ToolCall {
                        call_id,
                        name,
                        arguments,
                    }) => {
                        builder.push_tool_call(name, arguments, call_id);
                        None
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                };
                if let Some(event) = event {
                    emitter.emit(&event)?;
                }
                if emitter.disconnected {
                    break;
                }
            }
            drop(stream);

            let response = builder.finish(self.model.model_name());
            let calls: Vec<(String, Value, String)> = response
                .tool_calls()
                .map(|(name, args, id)| (name.to_string(), args.clone(), id.to_string()))
                .collect();
            if !response.parts.is_empty() {
                let message = ModelMessage::Response(response);
                self.append(conversation_id, &message).await?;
                history.push(message);
            }

            if let Some(e) = stream_error {
                self.close_pending(conversation_id, &calls, CANCELLED_ON_ABORT).await?;
                return Err(e);
            }
            if emitter.disconnected {
                self.close_pending(conversation_id, &calls, CANCELLED_ON_DISCONNECT).await?;
                return Ok(RunOutcome::Disconnected);
            }
            if calls.is_empty() {
                return Ok(RunOutcome::Completed);
            }

            let results = self.tool_turn(&calls, &mut emitter).await;
            let (parts, failure) = match results {
                Ok(parts) => (parts, None),
                Err((parts, e)) => (parts, Some(e)),
            };
            let message = ModelMessage::Request(ModelRequest { parts });
            self.append(conversation_id, &message).await?;
            history.push(message);

            if let Some(e) = failure {
                return Err(e);
            }
            if emitter.disconnected {
                return Ok(RunOutcome::Disconnected);
            }
        }

        Err(AgentError::StepLimit(self.max_steps))
    }

    /// 工具轮次：依次执行调用，返回要持久化的请求片段。
    /// 失败时同样返回片段，保证每个调用都有对应的返回或重试提示。
    async fn tool_turn(
        &self,
        calls: &[(String, Value, String)],
        emitter: &mut Emitter<'_>,
    ) -> Result<Vec<RequestPart>, (Vec<RequestPart>, AgentError)> {
        let mut parts = Vec::with_capacity(calls.len());
        let mut remaining = calls.iter();

        while let Some((name, args, call_id)) = remaining.next() {
            if emitter.disconnected {
                parts.push(retry_part(name, call_id, CANCELLED_ON_DISCONNECT.to_string()));
                continue;
            }

            let call_event = StreamEvent::ToolCall {
                name: name.clone(),
                arguments: args.clone(),
                call_id: call_id.clone(),
            };
            if let Err(e) = emitter.emit(&call_event) {
                return Err((close_rest(parts, name, call_id, remaining), e));
            }
            if emitter.disconnected {
                parts.push(retry_part(name, call_id, CANCELLED_ON_DISCONNECT.to_string()));
                continue;
            }

            let outcome = match self.executor.execute(name, args.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let mut parts = parts;
                    parts.push(retry_part(name, call_id, format!("tool call failed: {}", e.user_detail())));
                    for (n, _, id) in remaining {
                        parts.push(retry_part(n, id, CANCELLED_ON_ABORT.to_string()));
                    }
                    return Err((parts, e));
                }
            };

            let result_event = StreamEvent::ToolResult {
                name: name.clone(),
                outcome: outcome.clone(),
                call_id: call_id.clone(),
            };
            parts.push(match outcome {
                ToolOutcome::Return(content) => RequestPart::ToolReturn {
                    name: name.clone(),
                    content,
                    call_id: call_id.clone(),
                },
                ToolOutcome::Retry(reason) => retry_part(name, call_id, reason),
            });
            if let Err(e) = emitter.emit(&result_event) {
                let rest: Vec<RequestPart> = remaining
                    .map(|(n, _, id)| retry_part(n, id, CANCELLED_ON_ABORT.to_string()))
                    .collect();
                parts.extend(rest);
                return Err((parts, e));
            }
        }
        Ok(parts)
    }

    /// 持久化关闭未完成调用的请求
    async fn close_pending(
        &self,
        conversation_id: &str,
        calls: &[(String, Value, String)],
        reason: &str,
    ) -> Result<(), AgentError> {
        if calls.is_empty() {
            return Ok(());
        }
        let parts = calls
            .iter()
            .map(|(name, _, id)| retry_part(name, id, reason.to_string()))
            .collect();
        tracing::warn!(conversation = %conversation_id, pending = calls.len(), "Closing pending tool calls: {}", reason);
        self.append(conversation_id, &ModelMessage::Request(ModelRequest { parts }))
            .await
    }
}

fn retry_part(name: &str, call_id: &str, content: String) -> RequestPart {
    RequestPart::RetryPrompt {
        content,
        tool_name: Some(name.to_string()),
        call_id: Some(call_id.to_string()),
    }
}

fn close_rest<'a>(
    mut parts: Vec<RequestPart>,
    name: &str,
    call_id: &str,
    remaining: impl Iterator<Item = &'a (String, Value, String)>,
) -> Vec<RequestPart> {
    parts.push(retry_part(name, call_id, CANCELLED_ON_ABORT.to_string()));
    for (n, _, id) in remaining {
        parts.push(retry_part(n, id, CANCELLED_ON_ABORT.to_string()));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::model::ScriptedModel;
    use crate::core::RemoteError;
    use crate::session::{EventDecoder, MemoryMessageStore, ResponsePart};
    use crate::tools::{Tool, ToolError, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "Looks a key up"
        }

        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            match args["key"].as_str() {
                Some("down") => Err(RemoteError::http_status(503, HashMap::new(), "down").into()),
                Some(k) => Ok(json!({"key": k, "found": true})),
                None => Err(ToolError::InvalidArgs("key is required".to_string())),
            }
        }
    }

    fn call(id: &str, args: Value) -> ModelChunk {
        ModelChunk::ToolCall {
            call_id: id.to_string(),
            name: "lookup".to_string(),
            arguments: args,
        }
    }

    fn runner(model: Arc<ScriptedModel>, store: Arc<MemoryMessageStore>) -> AgentRunner {
        let mut registry = ToolRegistry::new();
        registry.register(Lookup);
        AgentRunner::new(model, Arc::new(ToolExecutor::new(registry, 5)), store).with_system_prompt("sys")
    }

    async fn log(store: &MemoryMessageStore, id: &str) -> Vec<ModelMessage> {
        store
            .load_ordered_messages(id)
            .await
            .unwrap()
            .iter()
            .map(|row| PersistedMessage::decode(&row.content).unwrap().into_model().unwrap())
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn test_text_only_run() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            ModelChunk::Reasoning("thinking".to_string()),
            ModelChunk::Text("Hel".to_string()),
            ModelChunk::Text("lo".to_string()),
        ]]));
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = runner(model, store.clone()).run("c1", "alice", "hi", tx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let mut decoder = EventDecoder::new();
        let events: Vec<_> = drain(&mut rx).iter().map(|f| decoder.decode(f).unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StreamEvent::PartDelta { index: 1, .. }));

        let messages = log(&store, "c1").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0],
            ModelMessage::Request(ModelRequest {
                parts: vec![
                    RequestPart::System("sys".to_string()),
                    RequestPart::UserPrompt("hi".to_string())
                ]
            })
        );
        match &messages[1] {
            ModelMessage::Response(r) => {
                assert_eq!(r.text(), "Hello");
                assert_eq!(r.model_name.as_deref(), Some("scripted"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_turn_and_second_request_replays_history() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![call("a", json!({"key": "x"})), call("b", json!({}))],
            vec![ModelChunk::Text("done".to_string())],
            vec![ModelChunk::Text("again".to_string())],
        ]));
        let store = Arc::new(MemoryMessageStore::new());
        let r = runner(model.clone(), store.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(r.run("c1", "alice", "go", tx).await.unwrap(), RunOutcome::Completed);
        let types: Vec<String> = drain(&mut rx)
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, ["tool_call", "tool_result", "tool_call", "tool_result", "part_start"]);

        let messages = log(&store, "c1").await;
        assert_eq!(messages.len(), 4);
        match &messages[2] {
            ModelMessage::Request(req) => {
                assert!(matches!(&req.parts[0], RequestPart::ToolReturn { call_id, .. } if call_id == "a"));
                assert!(matches!(&req.parts[1], RequestPart::RetryPrompt { call_id: Some(id), .. } if id == "b"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        r.run("c1", "alice", "more", tx).await.unwrap();
        let seen = model.seen_histories();
        assert_eq!(seen[2].len(), 5);
        match &seen[2][4] {
            ModelMessage::Request(req) => assert_eq!(req.parts, vec![RequestPart::UserPrompt("more".to_string())]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_tool_failure_sends_error_frame_and_closes_calls() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            call("a", json!({"key": "down"})),
            call("b", json!({"key": "y"})),
        ]]));
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = runner(model, store.clone()).run("c1", "alice", "go", tx).await.unwrap_err();
        assert_eq!(err.kind(), "remote");

        let frames = drain(&mut rx);
        let last: Value = serde_json::from_str(frames.last().unwrap()).unwrap();
        assert_eq!(last["type"], "error");
        assert_eq!(last["data"]["kind"], "remote");

        let messages = log(&store, "c1").await;
        match messages.last().unwrap() {
            ModelMessage::Request(req) => {
                assert_eq!(req.parts.len(), 2);
                assert!(req.parts.iter().all(|p| matches!(p, RequestPart::RetryPrompt { .. })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_persists_turn_and_cancels_pending_calls() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            call("a", json!({"key": "x"})),
            ModelChunk::Text("working".to_string()),
        ]]));
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let outcome = runner(model.clone(), store.clone()).run("c1", "alice", "go", tx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Disconnected);

        let messages = log(&store, "c1").await;
        assert_eq!(messages.len(), 3);
        match &messages[2] {
            ModelMessage::Request(req) => assert_eq!(
                req.parts,
                vec![retry_part("lookup", "a", CANCELLED_ON_DISCONNECT.to_string())]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(model.seen_histories().len(), 1);
    }

    #[tokio::test]
    async fn test_step_limit() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![call("a", json!({"key": "x"}))],
            vec![call("b", json!({"key": "y"}))],
        ]));
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = runner(model, store.clone())
            .with_max_steps(2)
            .run("c1", "alice", "loop", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StepLimit(2)));
        assert_eq!(log(&store, "c1").await.len(), 5);
    }

    #[tokio::test]
    async fn test_model_stream_error_keeps_partial_text() {
        let model = Arc::new(ScriptedModel::default());
        model.push_turn(vec![
            Ok(ModelChunk::Text("partial".to_string())),
            Err(AgentError::LlmError("stream dropped".to_string())),
        ]);
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = runner(model, store.clone()).run("c1", "alice", "go", tx).await.unwrap_err();
        assert_eq!(err.kind(), "llm");
        let messages = log(&store, "c1").await;
        match &messages[1] {
            ModelMessage::Response(r) => assert_eq!(r.parts, vec![ResponsePart::Text("partial".to_string())]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_run_creates_conversation_for_owner() {
        let model = Arc::new(ScriptedModel::new(vec![vec![ModelChunk::Text("hi".to_string())]]));
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = runner(model, store.clone()).run("new-conv", "alice", "hello", tx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(store.conversation_owner("new-conv").await.unwrap().as_deref(), Some("alice"));
        assert_eq!(log(&store, "new-conv").await.len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_conversation_is_rejected_without_writes() {
        let model = Arc::new(ScriptedModel::new(vec![vec![ModelChunk::Text("hi".to_string())]]));
        let store = Arc::new(MemoryMessageStore::new());
        store.ensure_conversation("c1", "alice").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = runner(model.clone(), store.clone()).run("c1", "bob", "hello", tx).await.unwrap_err();
        assert!(matches!(&err, AgentError::ConversationForbidden(id) if id == "c1"));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["data"]["kind"], "forbidden");
        assert!(log(&store, "c1").await.is_empty());
        assert!(model.seen_histories().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_locks_are_released_after_runs() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![ModelChunk::Text("one".to_string())],
            vec![ModelChunk::Text("two".to_string())],
            vec![ModelChunk::Text("three".to_string())],
        ]));
        let store = Arc::new(MemoryMessageStore::new());
        let r = runner(model, store.clone());

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (a, b) = tokio::join!(r.run("c1", "alice", "first", tx1), r.run("c1", "alice", "second", tx2));
        assert_eq!(a.unwrap(), RunOutcome::Completed);
        assert_eq!(b.unwrap(), RunOutcome::Completed);

        let (tx3, _rx3) = mpsc::unbounded_channel();
        r.run("c2", "alice", "other", tx3).await.unwrap();

        assert!(r.locks.lock().unwrap().is_empty());
        // 两个请求串行执行，各自的请求与响应相邻
        let kinds: Vec<bool> = log(&store, "c1")
            .await
            .iter()
            .map(|m| matches!(m, ModelMessage::Request(_)))
            .collect();
        assert_eq!(kinds, [true, false, true, false]);
    }

    struct Tally {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn description(&self) -> &str {
            "Counts invocations"
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_disconnect_on_tool_call_frame_skips_execution() {
        let tally_call = |id: &str| ModelChunk::ToolCall {
            call_id: id.to_string(),
            name: "tally".to_string(),
            arguments: json!({}),
        };
        let model = Arc::new(ScriptedModel::new(vec![vec![tally_call("a"), tally_call("b")]]));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Tally { calls: calls.clone() });
        let store = Arc::new(MemoryMessageStore::new());
        let r = AgentRunner::new(model.clone(), Arc::new(ToolExecutor::new(registry, 5)), store.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outcome = r.run("c1", "alice", "go", tx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let messages = log(&store, "c1").await;
        assert_eq!(messages.len(), 3);
        match &messages[2] {
            ModelMessage::Request(req) => assert_eq!(
                req.parts,
                vec![
                    retry_part("tally", "a", CANCELLED_ON_DISCONNECT.to_string()),
                    retry_part("tally", "b", CANCELLED_ON_DISCONNECT.to_string()),
                ]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(model.seen_histories().len(), 1);
    }
}
