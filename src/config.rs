//! Three-tier resolution of the API credential and the system prompt.
//!
//! Every call re-reads the backing store; there is one resolution per chat
//! turn, so correctness wins over latency. Environment values are captured
//! once at construction and injected explicitly, which keeps the fallback
//! chain testable without touching process-global state.

use crate::error::{ChatError, Result};
use crate::storage::StorageManager;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Prompt used when neither the system config nor the environment provides
/// one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "你是一位编程学习助手，请用简明易懂的方式帮助用户学习编程。";

pub const DEFAULT_LANGUAGE: &str = "zh";

/// Directive appended to the resolved base prompt; closed set keyed by the
/// user's language preference.
fn language_directive(language: &str) -> &'static str {
    match language {
        "en" => "Always respond in English.",
        _ => "请始终使用中文回复。",
    }
}

#[derive(Clone)]
pub struct ConfigResolver {
    storage: Arc<Mutex<StorageManager>>,
    env_api_key: Option<String>,
    env_system_prompt: Option<String>,
}

impl ConfigResolver {
    pub fn new(
        storage: Arc<Mutex<StorageManager>>,
        env_api_key: Option<String>,
        env_system_prompt: Option<String>,
    ) -> Self {
        Self {
            storage,
            env_api_key,
            env_system_prompt,
        }
    }

    /// Captures `OPENAI_API_KEY` and `DEFAULT_SYSTEM_PROMPT` from the
    /// process environment.
    pub fn from_env(storage: Arc<Mutex<StorageManager>>) -> Self {
        Self::new(
            storage,
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("DEFAULT_SYSTEM_PROMPT").ok(),
        )
    }

    /// API key precedence: user config, then system config, then the
    /// environment. Blank values are treated as unset.
    pub async fn resolve_credential(&self) -> Result<String> {
        let storage = self.storage.lock().await;

        let user = storage.get_user_config().await?;
        if let Some(key) = user.and_then(|c| non_blank(c.openai_key)) {
            log::debug!("Using API key from user config");
            return Ok(key);
        }

        let system = storage.get_system_config().await?;
        if let Some(key) = system.and_then(|c| non_blank(c.openai_key)) {
            log::debug!("Using API key from system config");
            return Ok(key);
        }

        if let Some(key) = non_blank(self.env_api_key.clone()) {
            log::debug!("Using API key from environment");
            return Ok(key);
        }

        Err(ChatError::CredentialMissing)
    }

    /// Base prompt precedence: system config, then the environment default,
    /// then the built-in literal. A language directive is appended to
    /// whichever base wins.
    pub async fn resolve_system_prompt(&self, language: &str) -> Result<String> {
        let system = { self.storage.lock().await.get_system_config().await? };

        let base = system
            .and_then(|c| non_blank(c.system_prompt))
            .or_else(|| non_blank(self.env_system_prompt.clone()))
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        Ok(format!("{}\n\n{}", base, language_directive(language)))
    }

    /// The user's language preference, defaulting when no config row exists.
    pub async fn resolve_language(&self) -> Result<String> {
        let user = { self.storage.lock().await.get_user_config().await? };
        Ok(user
            .map(|c| c.language)
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
