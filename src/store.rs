use crate::messages::{Conversation, Message, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, sqlite::SqlitePoolOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sqlite file setup failed: {0}")]
    Setup(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ownership predicate: a conversation matches when its user link equals
/// `user_id` OR its session tag equals `session_id`. An empty filter matches
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerFilter {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl OwnerFilter {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.session_id.is_none()
    }

    pub fn matches(&self, conversation: &Conversation) -> bool {
        let by_user = match (&self.user_id, &conversation.user_id) {
            (Some(want), Some(have)) => want == have,
            _ => false,
        };
        let by_session = match (&self.session_id, &conversation.session_id) {
            (Some(want), Some(have)) => want == have,
            _ => false,
        };
        by_user || by_session
    }
}

/// Durable conversation store. Every call is atomic on its own; nothing is
/// transactional across calls.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn count_messages(&self, owner: &OwnerFilter) -> StoreResult<u64>;
    /// Creating an id that already exists is a no-op.
    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    /// Inserting an id that already exists is a no-op.
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>>;
    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>>;
    async fn list_conversations(&self, owner: &OwnerFilter) -> StoreResult<Vec<Conversation>>;
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>>;
}

#[derive(Clone, Default)]
pub struct MemoryChatStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn count_messages(&self, owner: &OwnerFilter) -> StoreResult<u64> {
        if owner.is_empty() {
            return Ok(0);
        }
        let conversations = self.conversations.read().await;
        let messages = self.messages.read().await;
        let count = messages
            .values()
            .filter(|m| {
                conversations
                    .get(&m.conversation_id)
                    .map(|c| owner.matches(c))
                    .unwrap_or(false)
            })
            .count();
        Ok(count as u64)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut guard = self.conversations.write().await;
        guard
            .entry(conversation.id.clone())
            .or_insert_with(|| conversation.clone());
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut guard = self.messages.write().await;
        guard
            .entry(message.id.clone())
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let guard = self.conversations.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let guard = self.messages.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn list_conversations(&self, owner: &OwnerFilter) -> StoreResult<Vec<Conversation>> {
        let guard = self.conversations.read().await;
        let mut out: Vec<Conversation> = guard
            .values()
            .filter(|c| owner.matches(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let guard = self.messages.read().await;
        let mut out: Vec<Message> = guard
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteChatStore {
    pool: Pool<Sqlite>,
}

impl SqliteChatStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        ensure_sqlite_file(dsn).map_err(StoreError::Setup)?;
        let options = dsn
            .parse::<sqlx::sqlite::SqliteConnectOptions>()?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        // A pool of in-memory connections would give each connection its own
        // database.
        let max_connections = if dsn.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    pub async fn new(pool: Pool<Sqlite>) -> StoreResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (\
             id TEXT PRIMARY KEY,\
             name TEXT NOT NULL,\
             created_at TEXT NOT NULL,\
             user_id TEXT,\
             session_id TEXT\
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (\
             id TEXT PRIMARY KEY,\
             conversation_id TEXT NOT NULL REFERENCES conversations(id),\
             role TEXT NOT NULL,\
             content TEXT NOT NULL,\
             model TEXT NOT NULL DEFAULT '',\
             created_at TEXT NOT NULL\
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {raw}: {err}")))
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Conversation> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: parse_ts(&created_at)?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Message> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: Role::from_str(&role).ok_or_else(|| StoreError::Corrupt(format!("role {role}")))?,
        content: row.try_get("content")?,
        model: row.try_get("model")?,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn count_messages(&self, owner: &OwnerFilter) -> StoreResult<u64> {
        if owner.is_empty() {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m JOIN conversations c ON m.conversation_id = c.id \
             WHERE (?1 IS NOT NULL AND c.user_id = ?1) OR (?2 IS NOT NULL AND c.session_id = ?2)",
        )
        .bind(owner.user_id.as_deref())
        .bind(owner.session_id.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO conversations (id, name, created_at, user_id, session_id) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&conversation.id)
        .bind(&conversation.name)
        .bind(conversation.created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .bind(conversation.user_id.as_deref())
        .bind(conversation.session_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, model, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.model)
        .bind(message.created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, name, created_at, user_id, session_id FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, role, content, model, created_at FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_conversations(&self, owner: &OwnerFilter) -> StoreResult<Vec<Conversation>> {
        if owner.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, name, created_at, user_id, session_id FROM conversations \
             WHERE (?1 IS NOT NULL AND user_id = ?1) OR (?2 IS NOT NULL AND session_id = ?2) \
             ORDER BY created_at DESC",
        )
        .bind(owner.user_id.as_deref())
        .bind(owner.session_id.as_deref())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, model, created_at FROM messages \
             WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}
