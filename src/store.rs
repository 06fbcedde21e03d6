use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::config::resolve_default_db_url;
use crate::conversation::{Conversation, ConversationSummary, Role, StoreStats, Turn};
use crate::error::AgentError;

/// Durable conversation persistence. Operations on distinct ids are
/// independent; the orchestrator serializes turns within one id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self) -> Result<Conversation, AgentError>;
    /// Returns `None` for absent ids. An expired conversation is hard-deleted
    /// on read and reported as absent.
    async fn get(&self, id: Uuid) -> Result<Option<Conversation>, AgentError>;
    /// Appends a turn and bumps `updated_at`. Fails with `NotFound` when the
    /// conversation does not exist.
    async fn add_turn(&self, id: Uuid, role: Role, content: &str) -> Result<(), AgentError>;
    async fn delete(&self, id: Uuid) -> Result<bool, AgentError>;
    async fn list(&self) -> Result<Vec<Uuid>, AgentError>;
    async fn summaries(&self) -> Result<Vec<ConversationSummary>, AgentError>;
    /// Deletes every conversation whose `updated_at` is older than the
    /// retention window. Returns the number deleted.
    async fn cleanup(&self) -> Result<u64, AgentError>;
    async fn stats(&self) -> Result<StoreStats, AgentError>;
}

#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: Pool<Sqlite>,
    retention: Duration,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteConversationStore {
    pub async fn open(
        database_url: Option<String>,
        retention_hours: i64,
    ) -> Result<Self, AgentError> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AgentError::Internal(e.into()))?;
        Ok(Self {
            pool,
            retention: Duration::hours(retention_hours),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn expired(&self, updated_at: DateTime<Utc>) -> bool {
        Utc::now() - updated_at > self.retention
    }

    async fn load_turns(&self, id: Uuid) -> Result<Vec<Turn>, AgentError> {
        // rowid preserves append order even when timestamps collide
        let rows =
            sqlx::query("SELECT role, content, created_at FROM turns WHERE conversation_id = ?1 ORDER BY rowid ASC")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let role: String = r.get("role");
                let content: String = r.get("content");
                let created_at: String = r.get("created_at");
                Role::parse(&role).map(|role| Turn {
                    role,
                    content,
                    created_at: parse_ts(&created_at),
                })
            })
            .collect())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create(&self) -> Result<Conversation, AgentError> {
        // v7 ids sort by creation time
        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query("INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?3)")
            .bind(id.to_string())
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(Conversation {
            id,
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Conversation>, AgentError> {
        let row =
            sqlx::query("SELECT id, created_at, updated_at FROM conversations WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let Some(r) = row else { return Ok(None) };
        let created_at = parse_ts(&r.get::<String, _>("created_at"));
        let updated_at = parse_ts(&r.get::<String, _>("updated_at"));
        if self.expired(updated_at) {
            self.delete(id).await?;
            return Ok(None);
        }
        let turns = self.load_turns(id).await?;
        Ok(Some(Conversation {
            id,
            turns,
            created_at,
            updated_at,
        }))
    }

    async fn add_turn(&self, id: Uuid, role: Role, content: &str) -> Result<(), AgentError> {
        let now = Utc::now();
        // the bump and the insert must land together or a concurrent delete
        // could separate them
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(now.to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AgentError::NotFound(format!("conversation {id} not found")));
        }
        sqlx::query(
            "INSERT INTO turns (id, conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(id.to_string())
        .bind(role.as_str())
        .bind(content)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AgentError> {
        let res = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Uuid>, AgentError> {
        let rows = sqlx::query("SELECT id FROM conversations ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| Uuid::parse_str(&r.get::<String, _>("id")).ok())
            .collect())
    }

    async fn summaries(&self) -> Result<Vec<ConversationSummary>, AgentError> {
        let rows = sqlx::query(
            "SELECT c.id, c.created_at, c.updated_at, \
             (SELECT count(*) FROM turns t WHERE t.conversation_id = c.id) AS turn_count, \
             (SELECT content FROM turns t WHERE t.conversation_id = c.id ORDER BY rowid ASC LIMIT 1) AS preview \
             FROM conversations c ORDER BY c.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id = Uuid::parse_str(&r.get::<String, _>("id")).ok()?;
                let preview: Option<String> = r.try_get("preview").ok();
                Some(ConversationSummary {
                    id,
                    created_at: parse_ts(&r.get::<String, _>("created_at")),
                    updated_at: parse_ts(&r.get::<String, _>("updated_at")),
                    turn_count: r.get::<i64, _>("turn_count"),
                    preview: preview.map(|p| p.chars().take(120).collect()),
                })
            })
            .collect())
    }

    async fn cleanup(&self) -> Result<u64, AgentError> {
        let cutoff = (Utc::now() - self.retention).to_rfc3339();
        let res = sqlx::query("DELETE FROM conversations WHERE updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats, AgentError> {
        let conversations: i64 = sqlx::query("SELECT count(*) AS c FROM conversations")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let turns: i64 = sqlx::query("SELECT count(*) AS c FROM turns")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let page_count: i64 = sqlx::query("PRAGMA page_count;")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let page_size: i64 = sqlx::query("PRAGMA page_size;")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(StoreStats {
            conversation_count: conversations,
            turn_count: turns,
            storage_bytes: page_count * page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteConversationStore {
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        SqliteConversationStore::open(Some(url), 24).await.unwrap()
    }

    async fn backdate(store: &SqliteConversationStore, id: Uuid, hours: i64) {
        let past = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(past)
            .bind(id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_append_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let conv = store.create().await.unwrap();
        store.add_turn(conv.id, Role::User, "hello").await.unwrap();
        store
            .add_turn(conv.id, Role::Assistant, "hi there")
            .await
            .unwrap();

        let got = store.get(conv.id).await.unwrap().unwrap();
        assert_eq!(got.turns.len(), 2);
        assert_eq!(got.turns[0].role, Role::User);
        assert_eq!(got.turns[0].content, "hello");
        assert_eq!(got.turns[1].role, Role::Assistant);
        assert!(got.updated_at >= got.created_at);
    }

    #[tokio::test]
    async fn add_turn_on_missing_conversation_fails() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let err = store
            .add_turn(Uuid::new_v4(), Role::User, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn lazy_expiry_is_idempotent_and_leaves_no_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let conv = store.create().await.unwrap();
        store.add_turn(conv.id, Role::User, "old").await.unwrap();
        backdate(&store, conv.id, 25).await;

        assert!(store.get(conv.id).await.unwrap().is_none());
        assert!(store.get(conv.id).await.unwrap().is_none());

        let orphans: i64 = sqlx::query("SELECT count(*) AS c FROM turns")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("c");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn append_racing_a_delete_never_leaves_orphan_turns() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        for _ in 0..20 {
            let conv = store.create().await.unwrap();
            let id = conv.id;
            let (added, deleted) = tokio::join!(
                store.add_turn(id, Role::User, "racing"),
                store.delete(id),
            );
            deleted.unwrap();
            // whichever side wins, the append is atomic: it either lands
            // before the delete or reports the conversation as gone
            assert!(matches!(added, Ok(()) | Err(AgentError::NotFound(_))));
        }
        let orphans: i64 = sqlx::query(
            "SELECT count(*) AS c FROM turns t \
             LEFT JOIN conversations c2 ON c2.id = t.conversation_id \
             WHERE c2.id IS NULL",
        )
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get("c");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_expired() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let stale = store.create().await.unwrap();
        let fresh = store.create().await.unwrap();
        backdate(&store, stale.id, 25).await;

        let removed = store.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![fresh.id]);
    }

    #[tokio::test]
    async fn summaries_and_stats() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let conv = store.create().await.unwrap();
        store
            .add_turn(conv.id, Role::User, "first message preview")
            .await
            .unwrap();
        store.add_turn(conv.id, Role::Assistant, "reply").await.unwrap();

        let summaries = store.summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].turn_count, 2);
        assert_eq!(summaries[0].preview.as_deref(), Some("first message preview"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.conversation_count, 1);
        assert_eq!(stats.turn_count, 2);
        assert!(stats.storage_bytes > 0);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        let store = SqliteConversationStore::open(Some(url.clone()), 24)
            .await
            .unwrap();
        let conv = store.create().await.unwrap();
        store.add_turn(conv.id, Role::User, "persisted").await.unwrap();
        store.close().await;

        let reopened = SqliteConversationStore::open(Some(url), 24).await.unwrap();
        let got = reopened.get(conv.id).await.unwrap().unwrap();
        assert_eq!(got.turns.len(), 1);
        assert_eq!(got.turns[0].content, "persisted");
    }
}
