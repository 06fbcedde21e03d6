use std::path::PathBuf;

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Everything the server reads from the environment, resolved once at startup
/// and passed down explicitly.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub anthropic_model: String,
    pub anthropic_max_tokens: u32,
    pub wordpress_base_url: Option<String>,
    pub wordpress_username: Option<String>,
    pub wordpress_app_password: Option<String>,
    pub workspace_root: PathBuf,
    pub database_url: Option<String>,
    pub retention_hours: i64,
    pub max_rounds: usize,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            anthropic_base_url: env_opt("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            anthropic_model: env_opt("ANTHROPIC_MODEL")
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".into()),
            anthropic_max_tokens: env_opt("ANTHROPIC_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            wordpress_base_url: env_opt("WORDPRESS_BASE_URL"),
            wordpress_username: env_opt("WORDPRESS_USERNAME"),
            wordpress_app_password: env_opt("WORDPRESS_APP_PASSWORD"),
            workspace_root: env_opt("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            database_url: env_opt("DESKHAND_DB_URL"),
            retention_hours: env_opt("CONVERSATION_TTL_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            max_rounds: env_opt("MAX_TOOL_ROUNDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".into(),
            anthropic_model: "claude-3-5-sonnet-latest".into(),
            anthropic_max_tokens: 4096,
            wordpress_base_url: None,
            wordpress_username: None,
            wordpress_app_password: None,
            workspace_root: PathBuf::from("."),
            database_url: None,
            retention_hours: 24,
            max_rounds: 10,
        }
    }
}

pub fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
    let dir = base.join("deskhand");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("deskhand.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}
