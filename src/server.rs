use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::agent::engine::{AgentEngine, BlockingReply};
use crate::conversation::StoreStats;
use crate::error::AgentError;
use crate::store::ConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AgentEngine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    message: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/chat/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/api/chat/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/chat/message", post(send_message))
        .route("/api/chat/stream", post(stream_message))
        .route("/api/chat/stats", get(stats))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Hourly retention sweep. Expiry is also enforced lazily on read, so this
/// only reclaims storage for conversations nobody touches again.
pub fn spawn_cleanup(store: Arc<dyn ConversationStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.tick().await;
        loop {
            tick.tick().await;
            match store.cleanup().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(swept = n, "expired conversations removed"),
                Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
            }
        }
    })
}

async fn create_conversation(
    State(state): State<AppState>,
) -> Result<Json<Value>, AgentError> {
    let conv = state.engine.store().create().await?;
    Ok(Json(json!({ "conversationId": conv.id })))
}

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<Value>, AgentError> {
    let summaries = state.engine.store().summaries().await?;
    Ok(Json(json!({ "conversations": summaries })))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AgentError> {
    let conv = state
        .engine
        .store()
        .get(id)
        .await?
        .ok_or_else(|| AgentError::NotFound(format!("conversation {id} not found")))?;
    Ok(Json(json!({ "conversation": conv })))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AgentError> {
    if state.engine.store().delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AgentError::NotFound(format!("conversation {id} not found")))
    }
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<BlockingReply>, AgentError> {
    Ok(Json(
        state
            .engine
            .run_turn(req.conversation_id, &req.message)
            .await?,
    ))
}

async fn stream_message(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, AgentError> {
    let events = Arc::clone(&state.engine)
        .stream_turn(req.conversation_id, req.message)
        .await?;
    let sse = Sse::new(events.map(|ev| Event::default().json_data(&ev)))
        .keep_alive(KeepAlive::default());
    Ok(([(header::CACHE_CONTROL, "no-cache")], sse))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AgentError> {
    Ok(Json(state.engine.store().stats().await?))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{ToolContext, ToolDefinition, ToolRegistry, WordPressClient};
    use crate::provider::{
        ChatTurn, ContentBlock, ModelProvider, ModelReply, ProviderEvent, ProviderStream,
        StopReason,
    };
    use crate::store::SqliteConversationStore;
    use crate::workspace::{NullNotifier, Workspace};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    struct ScriptedProvider {
        replies: Mutex<VecDeque<ModelReply>>,
    }

    impl ScriptedProvider {
        fn pop(&self) -> Result<ModelReply, AgentError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Upstream("script exhausted".into()))
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn complete(
            &self,
            _system: &str,
            _tools: &[ToolDefinition],
            _turns: &[ChatTurn],
        ) -> Result<ModelReply, AgentError> {
            self.pop()
        }

        async fn complete_stream(
            &self,
            _system: &str,
            _tools: &[ToolDefinition],
            _turns: &[ChatTurn],
        ) -> Result<ProviderStream, AgentError> {
            let reply = self.pop()?;
            let mut events = Vec::new();
            for block in &reply.blocks {
                match block {
                    ContentBlock::Text(t) => events.push(Ok(ProviderEvent::TextDelta(t.clone()))),
                    ContentBlock::ToolUse { id, name, .. } => {
                        events.push(Ok(ProviderEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        }));
                    }
                }
            }
            events.push(Ok(ProviderEvent::Completed(reply)));
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    fn text_reply(text: &str) -> ModelReply {
        ModelReply {
            blocks: vec![ContentBlock::Text(text.into())],
            stop_reason: StopReason::EndTurn,
        }
    }

    async fn spawn_server(dir: &TempDir, replies: Vec<ModelReply>) -> SocketAddr {
        let url = format!("sqlite://{}", dir.path().join("test.db").to_string_lossy());
        let store = SqliteConversationStore::open(Some(url), 24).await.unwrap();
        let ctx = ToolContext {
            workspace: Arc::new(Workspace::new(dir.path(), Arc::new(NullNotifier)).unwrap()),
            wordpress: Arc::new(WordPressClient::unconfigured()),
            notify_watcher: false,
        };
        let engine = Arc::new(AgentEngine::new(
            Arc::new(store),
            Arc::new(ScriptedProvider {
                replies: Mutex::new(replies.into()),
            }),
            Arc::new(ToolRegistry::with_default_tools()),
            ctx,
            10,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(AppState { engine })).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn conversation_crud_over_http() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(&dir, vec![]).await;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}/api/chat/conversations");

        let created: Value = client
            .post(&base)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["conversationId"].as_str().unwrap().to_string();

        let got = client.get(format!("{base}/{id}")).send().await.unwrap();
        assert_eq!(got.status(), 200);
        let body: Value = got.json().await.unwrap();
        assert_eq!(body["conversation"]["id"], id.as_str());
        assert_eq!(body["conversation"]["turns"].as_array().unwrap().len(), 0);

        let listed: Value = client.get(&base).send().await.unwrap().json().await.unwrap();
        let conversations = listed["conversations"].as_array().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0]["id"], id.as_str());

        let deleted = client.delete(format!("{base}/{id}")).send().await.unwrap();
        assert_eq!(deleted.status(), 204);

        let gone = client.get(format!("{base}/{id}")).send().await.unwrap();
        assert_eq!(gone.status(), 404);
        let body: Value = gone.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn blocking_message_round_trip() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(&dir, vec![text_reply("hello there")]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/api/chat/message"))
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["message"], "hello there");
        assert_eq!(body["toolsUsed"].as_array().unwrap().len(), 0);
        let id = body["conversationId"].as_str().unwrap();

        let conv: Value = client
            .get(format!("http://{addr}/api/chat/conversations/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            conv["conversation"]["turns"].as_array().unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn empty_message_is_a_bad_request() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(&dir, vec![]).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/api/chat/message"))
            .json(&json!({"message": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn stream_endpoint_emits_sse_frames() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(&dir, vec![text_reply("streamed answer")]).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/api/chat/stream"))
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(
            resp.headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        // the stream is finite, so the whole body can be collected
        let body = resp.text().await.unwrap();
        let frames: Vec<Value> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(frames[0]["type"], "conversation_id");
        assert!(frames[0]["conversationId"].as_str().is_some());
        assert!(
            frames
                .iter()
                .any(|f| f["type"] == "content" && f["text"] == "streamed answer")
        );
        assert_eq!(frames.last().unwrap()["type"], "done");
    }

    #[tokio::test]
    async fn stats_reports_counts() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(&dir, vec![]).await;
        let client = reqwest::Client::new();
        client
            .post(format!("http://{addr}/api/chat/conversations"))
            .send()
            .await
            .unwrap();

        let body: Value = client
            .get(format!("http://{addr}/api/chat/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["conversationCount"], 1);
        assert_eq!(body["turnCount"], 0);
        assert!(body["storageBytes"].as_u64().unwrap() > 0);
    }
}
