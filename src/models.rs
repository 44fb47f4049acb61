use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a message: the human or the assistant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "user" => Ok(Sender::User),
            "ai" => Ok(Sender::Ai),
            other => Err(anyhow::anyhow!("unknown sender value in database: {}", other)),
        }
    }

    /// Role name expected by the chat-completion API.
    pub fn api_role(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "assistant",
        }
    }
}

// One turn in a conversation. Messages are append-only: created once,
// never edited, deleted only when their session is deleted.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "chatSessionId")]
    pub session_id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: Uuid, sender: Sender, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            sender,
            content,
            timestamp: Utc::now(),
        }
    }
}

// One conversation thread. Ordered for display by most-recent update.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A session together with some of its messages: the full thread for the
/// detail endpoint, or just the latest message as a preview in listings.
#[derive(Serialize, Clone, Debug)]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Per-installation override record. At most one row exists; it is created
/// lazily on first write and updated in place afterwards.
#[derive(Clone, Debug)]
pub struct UserConfig {
    pub id: Uuid,
    pub openai_key: Option<String>,
    pub language: String,
    pub use_streaming: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-level defaults. Same at-most-one-row lifecycle as `UserConfig`.
#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub id: Uuid,
    pub openai_key: Option<String>,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
