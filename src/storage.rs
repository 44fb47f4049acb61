use crate::models::{Message, Sender, Session, SessionWithMessages, SystemConfig, UserConfig};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

// Schema applied at startup. UUIDs are stored as TEXT, timestamps as unix
// milliseconds. Message rows cascade with their session.
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    sender TEXT NOT NULL, -- 'user' or 'ai'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

-- Singleton per-installation overrides.
CREATE TABLE IF NOT EXISTS user_config (
    id TEXT PRIMARY KEY NOT NULL,
    openai_key TEXT,
    language TEXT NOT NULL DEFAULT 'zh',
    use_streaming INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Singleton operator-level defaults.
CREATE TABLE IF NOT EXISTS system_config (
    id TEXT PRIMARY KEY NOT NULL,
    openai_key TEXT,
    system_prompt TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens the database at `db_path`, creating the file and parent
    /// directories if necessary, and applies migrations.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }
        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        Self::connect(&db_url).await
    }

    /// Connects to an arbitrary SQLite URL (tests use `sqlite::memory:`)
    /// and applies migrations.
    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        log::info!("Connecting to database: {}", db_url);
        let options = SqliteConnectOptions::from_str(db_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .foreign_keys(true);

        // A single connection serializes SQLite writers and keeps
        // `sqlite::memory:` databases coherent across queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Seeds the singleton config rows on first startup. The system config
    /// takes its key and prompt from the environment values passed in; the
    /// user config starts empty with the default language.
    pub async fn seed_defaults(
        &self,
        env_key: Option<&str>,
        env_prompt: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.get_system_config().await?.is_none() {
            let key = non_blank(env_key);
            let prompt = non_blank(env_prompt).unwrap_or(crate::config::DEFAULT_SYSTEM_PROMPT);
            let now = Utc::now().timestamp_millis();
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO system_config (id, openai_key, system_prompt, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(key)
            .bind(prompt)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to seed system config")?;
            log::info!("Created default system config (api key present: {})", key.is_some());
        }
        if self.get_user_config().await?.is_none() {
            self.ensure_user_config().await?;
            log::info!("Created default user config");
        }
        Ok(())
    }

    // --- Sessions ---

    /// Creates a session with the given title.
    pub async fn create_session(&self, title: &str) -> anyhow::Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        log::info!("Creating session {} ({})", session.id, session.title);

        sqlx::query("INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(&session.title)
            .bind(session.created_at.timestamp_millis())
            .bind(session.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to insert new session")?;
        Ok(session)
    }

    /// All sessions, most recently updated first, each carrying its latest
    /// message as a preview.
    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionWithMessages>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at
             FROM sessions
             ORDER BY updated_at DESC, created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch sessions")?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let session = session_from_row(&row)?;
            let messages = match self.latest_message(session.id).await? {
                Some(m) => vec![m],
                None => Vec::new(),
            };
            sessions.push(SessionWithMessages { session, messages });
        }
        log::debug!("Fetched {} sessions", sessions.len());
        Ok(sessions)
    }

    pub async fn get_session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query("SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch session")?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn get_session_with_messages(
        &self,
        id: Uuid,
    ) -> anyhow::Result<Option<SessionWithMessages>> {
        let Some(session) = self.get_session(id).await? else {
            return Ok(None);
        };
        let messages = self.list_messages(id).await?;
        Ok(Some(SessionWithMessages { session, messages }))
    }

    /// Updates a session's title. Returns `false` when the session does not
    /// exist.
    pub async fn update_session_title(&self, id: Uuid, title: &str) -> anyhow::Result<bool> {
        log::info!("Renaming session {} to: {}", id, title);
        let result = sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now().timestamp_millis())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update session title")?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a session; its messages cascade. Returns `false` when the
    /// session does not exist.
    pub async fn delete_session(&self, id: Uuid) -> anyhow::Result<bool> {
        log::warn!("Deleting session {}", id);
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    // --- Messages ---

    /// All messages of a session in conversation order.
    pub async fn list_messages(&self, session_id: Uuid) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, session_id, sender, content, timestamp
             FROM messages
             WHERE session_id = ?
             ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn latest_message(&self, session_id: Uuid) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, session_id, sender, content, timestamp
             FROM messages
             WHERE session_id = ?
             ORDER BY timestamp DESC, rowid DESC
             LIMIT 1",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest message")?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Inserts a message and bumps the owning session's `updated_at`.
    pub async fn save_message(&self, message: &Message) -> anyhow::Result<()> {
        log::debug!("Saving message {} to session {}", message.id, message.session_id);
        sqlx::query(
            "INSERT INTO messages (id, session_id, sender, content, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.sender.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(message.timestamp.timestamp_millis())
            .bind(message.session_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to bump session updated_at")?;
        Ok(())
    }

    // --- Config singletons ---

    pub async fn get_user_config(&self) -> anyhow::Result<Option<UserConfig>> {
        let row = sqlx::query(
            "SELECT id, openai_key, language, use_streaming, created_at, updated_at
             FROM user_config LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user config")?;
        row.map(|r| user_config_from_row(&r)).transpose()
    }

    pub async fn get_system_config(&self) -> anyhow::Result<Option<SystemConfig>> {
        let row = sqlx::query(
            "SELECT id, openai_key, system_prompt, created_at, updated_at
             FROM system_config LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch system config")?;
        row.map(|r| system_config_from_row(&r)).transpose()
    }

    // Check-then-insert; a concurrent race producing two rows is an accepted
    // limitation at this call volume.
    async fn ensure_user_config(&self) -> anyhow::Result<UserConfig> {
        if let Some(config) = self.get_user_config().await? {
            return Ok(config);
        }
        let now = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO user_config (id, openai_key, language, use_streaming, created_at, updated_at)
             VALUES (?, NULL, 'zh', 1, ?, ?)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create user config")?;
        self.get_user_config()
            .await?
            .context("User config missing immediately after creation")
    }

    pub async fn set_openai_key(&self, key: Option<&str>) -> anyhow::Result<UserConfig> {
        let config = self.ensure_user_config().await?;
        sqlx::query("UPDATE user_config SET openai_key = ?, updated_at = ? WHERE id = ?")
            .bind(key)
            .bind(Utc::now().timestamp_millis())
            .bind(config.id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update user API key")?;
        self.get_user_config()
            .await?
            .context("User config missing after update")
    }

    pub async fn set_language(&self, language: &str) -> anyhow::Result<UserConfig> {
        let config = self.ensure_user_config().await?;
        sqlx::query("UPDATE user_config SET language = ?, updated_at = ? WHERE id = ?")
            .bind(language)
            .bind(Utc::now().timestamp_millis())
            .bind(config.id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update language preference")?;
        self.get_user_config()
            .await?
            .context("User config missing after update")
    }

    pub async fn set_use_streaming(&self, use_streaming: bool) -> anyhow::Result<UserConfig> {
        let config = self.ensure_user_config().await?;
        sqlx::query("UPDATE user_config SET use_streaming = ?, updated_at = ? WHERE id = ?")
            .bind(use_streaming as i64)
            .bind(Utc::now().timestamp_millis())
            .bind(config.id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update streaming preference")?;
        self.get_user_config()
            .await?
            .context("User config missing after update")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_timestamp(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).context("Invalid timestamp in database")
}

fn session_from_row(row: &SqliteRow) -> anyhow::Result<Session> {
    Ok(Session {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse session ID")?,
        title: row.try_get("title")?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> anyhow::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse message ID")?,
        session_id: Uuid::parse_str(row.try_get("session_id")?)
            .context("Failed to parse session ID for message")?,
        sender: Sender::parse(row.try_get("sender")?)?,
        content: row.try_get("content")?,
        timestamp: parse_timestamp(row.try_get("timestamp")?)?,
    })
}

fn user_config_from_row(row: &SqliteRow) -> anyhow::Result<UserConfig> {
    Ok(UserConfig {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse user config ID")?,
        openai_key: row.try_get("openai_key")?,
        language: row.try_get("language")?,
        use_streaming: row.try_get::<i64, _>("use_streaming")? != 0,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
    })
}

fn system_config_from_row(row: &SqliteRow) -> anyhow::Result<SystemConfig> {
    Ok(SystemConfig {
        id: Uuid::parse_str(row.try_get("id")?).context("Failed to parse system config ID")?,
        openai_key: row.try_get("openai_key")?,
        system_prompt: row.try_get("system_prompt")?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
    })
}
