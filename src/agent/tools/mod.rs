use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::workspace::Workspace;

pub mod wordpress;
pub mod workspace_tools;

pub use wordpress::WordPressClient;

/// Static catalog entry, exposed verbatim to the model on every round.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<Workspace>,
    pub wordpress: Arc<WordPressClient>,
    pub notify_watcher: bool,
}

/// Internal tool result. Serialized to a single string only at the model
/// boundary; failures are data the model can react to, never control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok(Value),
    Err {
        message: String,
        status: Option<u16>,
        data: Option<Value>,
    },
}

impl ToolOutcome {
    pub fn err(message: impl Into<String>) -> Self {
        Self::Err {
            message: message.into(),
            status: None,
            data: None,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err { .. })
    }

    pub fn into_wire(self) -> String {
        match self {
            Self::Ok(value) => value.to_string(),
            Self::Err {
                message,
                status,
                data,
            } => {
                let mut envelope = json!({ "error": message });
                if let Some(status) = status {
                    envelope["status"] = json!(status);
                }
                if let Some(data) = data {
                    envelope["data"] = data;
                }
                envelope.to_string()
            }
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome;
}

/// What the dispatcher hands back to the orchestrator: the model-facing
/// string plus whether the outcome was an error envelope.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub wire: String,
    pub is_error: bool,
}

/// Fixed registry of tools, keyed by name. Dispatch is a table lookup and
/// never lets an error escape to the orchestrator.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn with_default_tools() -> Self {
        let mut r = Self::new();
        r.register(Box::new(workspace_tools::ReadFileTool));
        r.register(Box::new(workspace_tools::WriteFileTool));
        r.register(Box::new(workspace_tools::ListFilesTool));
        r.register(Box::new(workspace_tools::SearchFilesTool));
        r.register(Box::new(workspace_tools::DeleteFileTool));
        r.register(Box::new(wordpress::WpListPostsTool));
        r.register(Box::new(wordpress::WpGetPostTool));
        r.register(Box::new(wordpress::WpCreatePostTool));
        r.register(Box::new(wordpress::WpUpdatePostTool));
        r.register(Box::new(wordpress::WpDeletePostTool));
        r
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.definition().name;
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.by_name.get(name).map(|&i| self.tools[i].as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub async fn dispatch(&self, name: &str, input: Value, ctx: &ToolContext) -> DispatchResult {
        let outcome = match self.get(name) {
            Some(tool) => tool.run(ctx, input).await,
            None => ToolOutcome::err(format!("Unknown tool: {name}")),
        };
        if let ToolOutcome::Err { message, .. } = &outcome {
            tracing::warn!(tool = name, error = %message, "tool call failed");
        } else {
            tracing::debug!(tool = name, "tool call ok");
        }
        let is_error = outcome.is_err();
        DispatchResult {
            wire: outcome.into_wire(),
            is_error,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_default_tools()
    }
}

pub(crate) fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolOutcome> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutcome::err(format!("Missing required field: {key}")))
}

pub(crate) fn opt_u64(input: &Value, key: &str, default: u64) -> u64 {
    input.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::NullNotifier;
    use tempfile::tempdir;

    fn context(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext {
            workspace: Arc::new(Workspace::new(dir.path(), Arc::new(NullNotifier)).unwrap()),
            wordpress: Arc::new(WordPressClient::unconfigured()),
            notify_watcher: false,
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_envelope() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let registry = ToolRegistry::with_default_tools();
        let res = registry.dispatch("launch_missiles", json!({}), &ctx).await;
        assert!(res.is_error);
        let v: Value = serde_json::from_str(&res.wire).unwrap();
        assert_eq!(v["error"], "Unknown tool: launch_missiles");
    }

    #[tokio::test]
    async fn catalog_lists_every_registered_tool_once() {
        let registry = ToolRegistry::with_default_tools();
        let defs = registry.definitions();
        let mut names: Vec<&str> = defs.iter().map(|d| d.name).collect();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"wp_create_post"));
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(before, names.len());
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn access_denied_is_data_not_an_exception() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let registry = ToolRegistry::with_default_tools();
        let res = registry
            .dispatch(
                "write_file",
                json!({"path": "../outside.txt", "content": "x"}),
                &ctx,
            )
            .await;
        assert!(res.is_error);
        let v: Value = serde_json::from_str(&res.wire).unwrap();
        assert_eq!(v["error"], "Access denied: path outside workspace");
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn one_failing_call_does_not_abort_the_round() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), b"fine").unwrap();
        let ctx = context(&dir);
        let registry = ToolRegistry::with_default_tools();

        let denied = registry.dispatch(
            "write_file",
            json!({"path": ".git/config", "content": "x"}),
            &ctx,
        );
        let read = registry.dispatch("read_file", json!({"path": "ok.txt"}), &ctx);
        let (denied, read) = tokio::join!(denied, read);

        assert!(denied.is_error);
        assert!(!read.is_error);
        let v: Value = serde_json::from_str(&read.wire).unwrap();
        assert_eq!(v["content"], "fine");
    }
}
