use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};

use super::{Tool, ToolContext, ToolDefinition, ToolOutcome, opt_u64};
use crate::config::AgentConfig;

/// Thin client for the WordPress REST API. Configuration gaps are reported
/// as tool-result data before any network call is attempted.
pub struct WordPressClient {
    client: reqwest::Client,
    base_url: Option<String>,
    username: Option<String>,
    app_password: Option<String>,
}

impl WordPressClient {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.wordpress_base_url.clone(),
            username: config.wordpress_username.clone(),
            app_password: config.wordpress_app_password.clone(),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
            username: None,
            app_password: None,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Some(base_url.into()),
            username: None,
            app_password: None,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.app_password.as_deref()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }

    /// Generic REST call. Mutating requests must set `auth` and therefore
    /// require credentials; upstream HTTP failures come back as
    /// `{error, status, data}` so the model can see what went wrong.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        auth: bool,
    ) -> ToolOutcome {
        let Some(base) = self.base_url.as_deref() else {
            return ToolOutcome::err("WordPress base URL is not configured");
        };
        let creds = if auth {
            match self.credentials() {
                Some(c) => Some(c),
                None => return ToolOutcome::err("WordPress credentials are not configured"),
            }
        } else {
            None
        };

        let url = match url::Url::parse(&format!(
            "{}/wp-json/wp/v2/{}",
            base.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )) {
            Ok(u) => u,
            Err(e) => return ToolOutcome::err(format!("invalid WordPress URL: {e}")),
        };
        let mut req = self.client.request(method, url).query(query);
        if let Some((user, pass)) = creds {
            req = req.basic_auth(user, Some(pass));
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return ToolOutcome::err(format!("WordPress request failed: {e}")),
        };
        let status = resp.status();
        let data: Value = resp.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            ToolOutcome::Ok(data)
        } else {
            ToolOutcome::Err {
                message: format!("WordPress API error: {status}"),
                status: Some(status.as_u16()),
                data: Some(data),
            }
        }
    }
}

pub struct WpListPostsTool;
pub struct WpGetPostTool;
pub struct WpCreatePostTool;
pub struct WpUpdatePostTool;
pub struct WpDeletePostTool;

#[async_trait]
impl Tool for WpListPostsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wp_list_posts",
            description: "List posts from the connected WordPress site, optionally filtered by a search term.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "search": {"type": "string"},
                    "page": {"type": "integer"},
                    "per_page": {"type": "integer"}
                }
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let mut query = vec![
            ("page", opt_u64(&input, "page", 1).to_string()),
            ("per_page", opt_u64(&input, "per_page", 10).to_string()),
        ];
        if let Some(search) = input.get("search").and_then(|v| v.as_str()) {
            query.push(("search", search.to_string()));
        }
        ctx.wordpress
            .request(Method::GET, "posts", &query, None, false)
            .await
    }
}

#[async_trait]
impl Tool for WpGetPostTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wp_get_post",
            description: "Fetch a single WordPress post by id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"}
                },
                "required": ["id"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(id) = input.get("id").and_then(|v| v.as_u64()) else {
            return ToolOutcome::err("Missing required field: id");
        };
        ctx.wordpress
            .request(Method::GET, &format!("posts/{id}"), &[], None, false)
            .await
    }
}

#[async_trait]
impl Tool for WpCreatePostTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wp_create_post",
            description: "Create a WordPress post. Status defaults to draft.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "status": {"type": "string", "enum": ["draft", "publish", "private"]}
                },
                "required": ["title", "content"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(title) = input.get("title").and_then(|v| v.as_str()) else {
            return ToolOutcome::err("Missing required field: title");
        };
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolOutcome::err("Missing required field: content");
        };
        let status = input
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("draft");
        let body = json!({ "title": title, "content": content, "status": status });
        ctx.wordpress
            .request(Method::POST, "posts", &[], Some(body), true)
            .await
    }
}

#[async_trait]
impl Tool for WpUpdatePostTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wp_update_post",
            description: "Update fields of an existing WordPress post.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "status": {"type": "string"}
                },
                "required": ["id"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(id) = input.get("id").and_then(|v| v.as_u64()) else {
            return ToolOutcome::err("Missing required field: id");
        };
        let mut body = serde_json::Map::new();
        for key in ["title", "content", "status"] {
            if let Some(v) = input.get(key) {
                body.insert(key.to_string(), v.clone());
            }
        }
        ctx.wordpress
            .request(
                Method::POST,
                &format!("posts/{id}"),
                &[],
                Some(Value::Object(body)),
                true,
            )
            .await
    }
}

#[async_trait]
impl Tool for WpDeletePostTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wp_delete_post",
            description: "Delete a WordPress post by id. Set force to skip the trash.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "force": {"type": "boolean"}
                },
                "required": ["id"]
            }),
        }
    }

    async fn run(&self, ctx: &ToolContext, input: Value) -> ToolOutcome {
        let Some(id) = input.get("id").and_then(|v| v.as_u64()) else {
            return ToolOutcome::err("Missing required field: id");
        };
        let force = input
            .get("force")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        ctx.wordpress
            .request(
                Method::DELETE,
                &format!("posts/{id}"),
                &[("force", force.to_string())],
                None,
                true,
            )
            .await
    }
}
