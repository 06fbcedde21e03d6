use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolContext, ToolDefinition, ToolOutcome, opt_u64, require_str};

const DEFAULT_READ_BYTES: u64 = 65_536;
const DEFAULT_LIST_MAX: u64 = 500;
const DEFAULT_SEARCH_MAX: u64 = 100;

pub struct ReadFileTool;
pub struct WriteFileTool;
pub struct ListFilesTool;
pub struct SearchFilesTool;
pub struct DeleteFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file",
            description: "Read a text file from the workspace. Returns up to max_bytes of content.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace root"},
                    "max_bytes": {"type": "integer"}
                },
                "required": ["path"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let max_bytes = opt_u64(&input, "max_bytes", DEFAULT_READ_BYTES) as usize;
        match ctx.workspace.read(path, max_bytes) {
            Ok(content) => ToolOutcome::Ok(json!({
                "path": path,
                "content": content,
                "bytes": content.len(),
            })),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file",
            description: "Write content to a file in the workspace, creating it and any parent directories if needed.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace root"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let content = match require_str(&input, "content") {
            Ok(c) => c,
            Err(e) => return e,
        };
        match ctx.workspace.write(path, content, ctx.notify_watcher) {
            Ok(()) => ToolOutcome::Ok(json!({
                "path": path,
                "bytes": content.len(),
                "written": true,
            })),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files",
            description: "List files and directories under a workspace path. Restricted directories are omitted.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory relative to the workspace root; empty for the root"},
                    "max": {"type": "integer"}
                }
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let max = opt_u64(&input, "max", DEFAULT_LIST_MAX) as usize;
        match ctx.workspace.list(path, max) {
            Ok(entries) => match serde_json::to_value(entries) {
                Ok(v) => ToolOutcome::Ok(json!({ "entries": v })),
                Err(e) => ToolOutcome::err(e.to_string()),
            },
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_files",
            description: "Search workspace file contents for a pattern. Returns matching files with line numbers, capped.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Regex or literal text to find"},
                    "max": {"type": "integer"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let query = match require_str(&input, "query") {
            Ok(q) => q,
            Err(e) => return e,
        };
        let max = opt_u64(&input, "max", DEFAULT_SEARCH_MAX) as usize;
        match ctx.workspace.search(query, max) {
            Ok(matches) => match serde_json::to_value(matches) {
                Ok(v) => ToolOutcome::Ok(json!({ "matches": v })),
                Err(e) => ToolOutcome::err(e.to_string()),
            },
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_file",
            description: "Delete a file or directory from the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace root"}
                },
                "required": ["path"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        match ctx.workspace.delete(path, ctx.notify_watcher) {
            Ok(()) => ToolOutcome::Ok(json!({ "path": path, "deleted": true })),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }
}
