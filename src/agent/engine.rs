use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::Stream;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::events::StreamEvent;
use super::tools::{DispatchResult, ToolContext, ToolRegistry};
use crate::conversation::{Conversation, Role};
use crate::error::AgentError;
use crate::provider::{
    ChatRole, ChatTurn, ContentBlock, ModelProvider, ModelReply, ProviderEvent, ToolCall,
    TurnBlock,
};
use crate::store::ConversationStore;

pub const SYSTEM_PROMPT: &str = "You are the coding assistant inside a browser-based workspace \
editor. You can read and modify files in the user's workspace and manage content on their \
connected WordPress site through the provided tools. Paths are relative to the workspace root. \
Prefer reading a file before editing it, keep answers concise, and describe any changes you made.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingReply {
    pub conversation_id: Uuid,
    pub message: String,
    pub tools_used: Vec<String>,
}

/// Serializes turns per conversation id. The store itself does not lock, so
/// two concurrent requests against one conversation would otherwise
/// interleave their appends.
#[derive(Default)]
struct TurnGates {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TurnGates {
    async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let gate = {
            let mut map = self.inner.lock().await;
            // a strong count of 1 means no guard is held and nobody is
            // waiting, so the entry can go; the map stays bounded by the
            // number of in-flight turns
            map.retain(|gate_id, gate| *gate_id == id || Arc::strong_count(gate) > 1);
            map.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        gate.lock_owned().await
    }
}

/// Drives one agent turn: rounds of model calls with tool execution between
/// them, until the model answers in plain text or the round cap trips.
pub struct AgentEngine {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    tool_ctx: ToolContext,
    max_rounds: usize,
    gates: TurnGates,
}

impl AgentEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        tool_ctx: ToolContext,
        max_rounds: usize,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            tool_ctx,
            max_rounds,
            gates: TurnGates::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    fn validate(message: &str) -> Result<&str, AgentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::Validation("message is required".into()));
        }
        Ok(message)
    }

    async fn resolve_conversation(&self, id: Option<Uuid>) -> Result<Uuid, AgentError> {
        match id {
            Some(id) => Ok(id),
            None => Ok(self.store.create().await?.id),
        }
    }

    /// Blocking mode: returns the final answer and the ordered list of tool
    /// names invoked across all rounds.
    pub async fn run_turn(
        &self,
        conversation_id: Option<Uuid>,
        message: &str,
    ) -> Result<BlockingReply, AgentError> {
        let message = Self::validate(message)?;
        self.provider.ready()?;
        let id = self.resolve_conversation(conversation_id).await?;
        let _gate = self.gates.acquire(id).await;

        let conv = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("conversation {id} not found")))?;
        let mut turns = history_turns(&conv);
        turns.push(ChatTurn::user_text(message));
        self.store.add_turn(id, Role::User, message).await?;

        let defs = self.registry.definitions();
        let mut tools_used = Vec::new();
        for round in 0..self.max_rounds {
            let reply = self.provider.complete(SYSTEM_PROMPT, &defs, &turns).await?;
            let calls = reply.tool_calls();
            if calls.is_empty() {
                let text = reply.text();
                self.store.add_turn(id, Role::Assistant, &text).await?;
                return Ok(BlockingReply {
                    conversation_id: id,
                    message: text,
                    tools_used,
                });
            }
            tracing::debug!(round, calls = calls.len(), "executing tool round");
            tools_used.extend(calls.iter().map(|c| c.name.clone()));
            let results = self.execute_round(&calls).await;
            turns.push(assistant_turn(&reply));
            turns.push(results_turn(&calls, &results));
        }
        Err(AgentError::MaxRoundsExceeded(self.max_rounds))
    }

    /// Incremental mode: a finite, single-consumption event stream. The
    /// conversation id always arrives first; dropping the stream stops
    /// further model rounds.
    pub async fn stream_turn(
        self: Arc<Self>,
        conversation_id: Option<Uuid>,
        message: String,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static, AgentError> {
        let message = Self::validate(&message)?.to_string();
        self.provider.ready()?;
        let id = self.resolve_conversation(conversation_id).await?;
        let engine = self;

        Ok(async_stream::stream! {
            yield StreamEvent::ConversationId { conversation_id: id };
            let _gate = engine.gates.acquire(id).await;

            let conv = match engine.store.get(id).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    yield StreamEvent::Error {
                        message: format!("conversation {id} not found"),
                    };
                    return;
                }
                Err(e) => {
                    yield StreamEvent::Error { message: e.to_string() };
                    return;
                }
            };
            let mut turns = history_turns(&conv);
            turns.push(ChatTurn::user_text(message.clone()));
            if let Err(e) = engine.store.add_turn(id, Role::User, &message).await {
                yield StreamEvent::Error { message: e.to_string() };
                return;
            }

            let defs = engine.registry.definitions();
            for round in 0..engine.max_rounds {
                let mut model_events = match engine
                    .provider
                    .complete_stream(SYSTEM_PROMPT, &defs, &turns)
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        yield StreamEvent::Error { message: e.to_string() };
                        return;
                    }
                };
                let mut reply: Option<ModelReply> = None;
                while let Some(ev) = model_events.next().await {
                    match ev {
                        Ok(ProviderEvent::TextDelta(text)) => {
                            yield StreamEvent::Content { text };
                        }
                        Ok(ProviderEvent::ToolUseStart { name, .. }) => {
                            yield StreamEvent::ToolUse { tool: name };
                        }
                        Ok(ProviderEvent::Completed(r)) => reply = Some(r),
                        Err(e) => {
                            yield StreamEvent::Error { message: e.to_string() };
                            return;
                        }
                    }
                }
                let Some(reply) = reply else {
                    yield StreamEvent::Error {
                        message: "model stream ended without a reply".into(),
                    };
                    return;
                };

                let calls = reply.tool_calls();
                if calls.is_empty() {
                    let text = reply.text();
                    match engine.store.add_turn(id, Role::Assistant, &text).await {
                        Ok(()) => yield StreamEvent::Done,
                        Err(e) => yield StreamEvent::Error { message: e.to_string() },
                    }
                    return;
                }

                tracing::debug!(round, calls = calls.len(), "executing tool round");
                for call in &calls {
                    yield StreamEvent::ToolExecuting { tool: call.name.clone() };
                }
                let results = engine.execute_round(&calls).await;
                for (call, res) in calls.iter().zip(&results) {
                    yield StreamEvent::ToolResult {
                        tool: call.name.clone(),
                        is_error: res.is_error,
                    };
                }
                turns.push(assistant_turn(&reply));
                turns.push(results_turn(&calls, &results));
            }
            yield StreamEvent::Error {
                message: AgentError::MaxRoundsExceeded(engine.max_rounds).to_string(),
            };
        })
    }

    /// All calls of one round run concurrently; the result vector keeps the
    /// request order so correlation ids line up.
    async fn execute_round(&self, calls: &[ToolCall]) -> Vec<DispatchResult> {
        let futs = calls.iter().map(|call| {
            let ctx = self.tool_ctx.clone();
            let registry = Arc::clone(&self.registry);
            async move { registry.dispatch(&call.name, call.input.clone(), &ctx).await }
        });
        join_all(futs).await
    }
}

fn history_turns(conv: &Conversation) -> Vec<ChatTurn> {
    conv.turns
        .iter()
        .map(|t| match t.role {
            Role::User => ChatTurn::user_text(t.content.clone()),
            Role::Assistant => ChatTurn::assistant_text(t.content.clone()),
        })
        .collect()
}

fn assistant_turn(reply: &ModelReply) -> ChatTurn {
    ChatTurn {
        role: ChatRole::Assistant,
        blocks: reply
            .blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text(t) => TurnBlock::Text(t.clone()),
                ContentBlock::ToolUse { id, name, input } => TurnBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
            })
            .collect(),
    }
}

fn results_turn(calls: &[ToolCall], results: &[DispatchResult]) -> ChatTurn {
    ChatTurn {
        role: ChatRole::User,
        blocks: calls
            .iter()
            .zip(results)
            .map(|(call, res)| TurnBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: res.wire.clone(),
                is_error: res.is_error,
            })
            .collect(),
    }
}
