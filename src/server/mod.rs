//! HTTP / SSE 接口
//!
//! - `POST /chats/chat`：`{prompt, conversation_id?}`，返回 SSE，每个 data 是一个会话事件或错误帧
//! - `GET /chats/users/:user_id/conversations`：该用户的会话列表，新建的在前（仅本人）
//! - `GET /chats/conversations/:id`：会话摘要（仅所有者）
//! - `GET /chats/conversations/:id/messages`：会话日志（仅所有者）
//! - `GET /api/health`
//!
//! 未认证返回 401，已认证但无权限或访问他人会话返回 403。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentRunner;
use crate::auth::{AuthError, Authenticator, Identity};
use crate::session::{ConversationAccess, ConversationSummary};

pub struct AppState {
    pub runner: Arc<AgentRunner>,
    pub authenticator: Arc<dyn Authenticator>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    prompt: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

const CONVERSATION_HEADER: &str = "x-conversation-id";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chats/chat", post(chat))
        .route("/chats/users/:user_id/conversations", get(user_conversations))
        .route("/chats/conversations/:id", get(conversation_summary))
        .route("/chats/conversations/:id/messages", get(conversation_messages))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// 401：缺少或无效令牌；403：subject 不在允许范围
async fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<Identity> {
    let token = bearer_token(headers).ok_or((StatusCode::UNAUTHORIZED, AuthError::MissingToken.to_string()))?;
    let identity = state
        .authenticator
        .authenticate(token)
        .await
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;
    if !identity.authorized {
        return Err((StatusCode::FORBIDDEN, "subject is not authorized".to_string()));
    }
    Ok(identity)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let identity = authorize(&state, &headers).await?;
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt is required".to_string()));
    }
    let conversation_id = req
        .conversation_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let id_header = HeaderValue::from_str(&conversation_id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid conversation_id".to_string()))?;

    let access = state
        .runner
        .store()
        .ensure_conversation(&conversation_id, &identity.subject_id)
        .await
        .map_err(internal)?;
    if access == ConversationAccess::Foreign {
        tracing::warn!(subject = %identity.subject_id, conversation = %conversation_id, "Rejected access to foreign conversation");
        return Err(forbidden_conversation());
    }

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let runner = Arc::clone(&state.runner);
    let id = conversation_id.clone();
    let owner = identity.subject_id;
    tokio::spawn(async move {
        // 错误已作为错误帧发给客户端
        let _ = runner.run(&id, &owner, &prompt, tx).await;
    });

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Event::default().data(frame)), rx))
    });
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    response
        .headers_mut()
        .insert(HeaderName::from_static(CONVERSATION_HEADER), id_header);
    Ok(response)
}

fn forbidden_conversation() -> (StatusCode, String) {
    (StatusCode::FORBIDDEN, "conversation belongs to another subject".to_string())
}

async fn user_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let identity = authorize(&state, &headers).await?;
    if user_id != identity.subject_id {
        tracing::warn!(subject = %identity.subject_id, requested = %user_id, "Rejected listing of another subject's conversations");
        return Err((StatusCode::FORBIDDEN, "cannot list another subject's conversations".to_string()));
    }
    let conversations = state
        .runner
        .store()
        .list_conversations(&user_id)
        .await
        .map_err(internal)?;
    Ok(Json(conversations))
}

async fn conversation_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ConversationSummary>> {
    let identity = authorize(&state, &headers).await?;
    match state.runner.store().conversation(&id).await.map_err(internal)? {
        None => Err((StatusCode::NOT_FOUND, "conversation not found".to_string())),
        Some(summary) if summary.owner != identity.subject_id => Err(forbidden_conversation()),
        Some(summary) => Ok(Json(summary)),
    }
}

async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Value>>> {
    let identity = authorize(&state, &headers).await?;
    let store = state.runner.store();
    match store.conversation_owner(&id).await.map_err(internal)? {
        None => return Err((StatusCode::NOT_FOUND, "conversation not found".to_string())),
        Some(owner) if owner != identity.subject_id => return Err(forbidden_conversation()),
        Some(_) => {}
    }

    let rows = store.load_ordered_messages(&id).await.map_err(internal)?;
    let messages = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_str::<Value>(&row.content) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(sequence_no = row.sequence_no, "Skipping unreadable stored message: {}", e);
                None
            }
        })
        .collect();
    Ok(Json(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ModelChunk, ScriptedModel};
    use crate::auth::StaticTokenAuthenticator;
    use crate::session::{MemoryMessageStore, MessageStore};
    use crate::tools::{ToolExecutor, ToolRegistry};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app(turns: Vec<Vec<ModelChunk>>) -> (Router, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new());
        let runner = AgentRunner::new(
            Arc::new(ScriptedModel::new(turns)),
            Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
            store.clone(),
        );
        let tokens = HashMap::from([
            ("alice-token".to_string(), "alice".to_string()),
            ("bob-token".to_string(), "bob".to_string()),
            ("eve-token".to_string(), "eve".to_string()),
        ]);
        let authenticator = StaticTokenAuthenticator::new(tokens, ["alice".to_string(), "bob".to_string()]);
        let state = Arc::new(AppState {
            runner: Arc::new(runner),
            authenticator: Arc::new(authenticator),
        });
        (router(state), store)
    }

    fn chat_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/chats/chat")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(token: &str, uri: String) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn messages_request(token: &str, id: &str) -> Request<Body> {
        get_request(token, format!("/chats/conversations/{id}/messages"))
    }

    async fn json_body(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(vec![]);
        let resp = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_streams_events_and_persists() {
        let (app, store) = app(vec![vec![ModelChunk::Text("hello there".to_string())]]);
        let resp = app
            .clone()
            .oneshot(chat_request(Some("alice-token"), json!({"prompt": "hi", "conversation_id": "c1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONVERSATION_HEADER], "c1");

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let frames: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "part_start");
        assert_eq!(frames[0]["data"]["part"]["content"], "hello there");

        assert_eq!(store.load_ordered_messages("c1").await.unwrap().len(), 2);

        let resp = app.oneshot(messages_request("alice-token", "c1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let log: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(log[0]["kind"], "request");
        assert_eq!(log[1]["kind"], "response");
    }

    #[tokio::test]
    async fn test_auth_status_codes() {
        let (app, store) = app(vec![]);
        store.ensure_conversation("c1", "alice").await.unwrap();

        let cases = [
            (chat_request(None, json!({"prompt": "hi"})), StatusCode::UNAUTHORIZED),
            (chat_request(Some("nope"), json!({"prompt": "hi"})), StatusCode::UNAUTHORIZED),
            (chat_request(Some("eve-token"), json!({"prompt": "hi"})), StatusCode::FORBIDDEN),
            (
                chat_request(Some("bob-token"), json!({"prompt": "hi", "conversation_id": "c1"})),
                StatusCode::FORBIDDEN,
            ),
            (chat_request(Some("bob-token"), json!({"prompt": "  "})), StatusCode::BAD_REQUEST),
            (messages_request("bob-token", "c1"), StatusCode::FORBIDDEN),
            (messages_request("alice-token", "missing"), StatusCode::NOT_FOUND),
        ];
        for (req, expected) in cases {
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), expected);
        }
        assert!(store.load_ordered_messages("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_listing_and_summary() {
        let (app, store) = app(vec![vec![ModelChunk::Text("hello".to_string())]]);
        store.ensure_conversation("c-old", "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.ensure_conversation("c-bob", "bob").await.unwrap();

        let resp = app
            .clone()
            .oneshot(chat_request(Some("alice-token"), json!({"prompt": "hi", "conversation_id": "c-new"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        to_bytes(resp.into_body(), usize::MAX).await.unwrap();

        let resp = app
            .clone()
            .oneshot(get_request("alice-token", "/chats/users/alice/conversations".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = json_body(resp).await;
        let ids: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["c-new", "c-old"]);
        assert_eq!(listed[0]["message_count"], 2);
        assert_eq!(listed[0]["owner"], "alice");

        let resp = app
            .clone()
            .oneshot(get_request("alice-token", "/chats/conversations/c-new".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = json_body(resp).await;
        assert_eq!(summary["id"], "c-new");
        assert_eq!(summary["message_count"], 2);

        let cases = [
            (get_request("bob-token", "/chats/users/alice/conversations".to_string()), StatusCode::FORBIDDEN),
            (get_request("alice-token", "/chats/conversations/c-bob".to_string()), StatusCode::FORBIDDEN),
            (get_request("alice-token", "/chats/conversations/missing".to_string()), StatusCode::NOT_FOUND),
            (get_request("nope", "/chats/users/alice/conversations".to_string()), StatusCode::UNAUTHORIZED),
        ];
        for (req, expected) in cases {
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), expected);
        }

        let resp = app
            .oneshot(get_request("bob-token", "/chats/users/bob/conversations".to_string()))
            .await
            .unwrap();
        let listed = json_body(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["message_count"], 0);
    }
}
