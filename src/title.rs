//! Best-effort title generation for a session's first real exchange.
//! Failures never propagate: the caller always gets a usable label.

use crate::api::{ApiMessage, CompletionProvider};
use crate::config::{ConfigResolver, DEFAULT_LANGUAGE};
use crate::error::Result;
use crate::models::Sender;
use serde::Deserialize;

pub const TITLE_MAX_CHARS: usize = 15;

const TITLE_INSTRUCTION: &str = "Generate a title for the following conversation: a bare label \
of at most 15 characters. No punctuation, no quotes, no explanation - output the title only.";

/// One turn of the exchange submitted for titling.
#[derive(Deserialize, Clone, Debug)]
pub struct ExchangeMessage {
    pub content: String,
    pub sender: Sender,
}

/// Reduces a short exchange to a display label. Any failure (credential,
/// upstream, empty result) yields the fallback label for the user's language
/// instead of an error.
pub async fn generate_title(
    provider: &dyn CompletionProvider,
    resolver: &ConfigResolver,
    exchange: &[ExchangeMessage],
) -> String {
    let language = resolver
        .resolve_language()
        .await
        .unwrap_or_else(|_| DEFAULT_LANGUAGE.to_string());

    match try_generate(provider, resolver, exchange).await {
        Ok(title) if !title.is_empty() => title,
        Ok(_) => {
            log::warn!("Title generation returned an empty label, using fallback");
            fallback_title(&language).to_string()
        }
        Err(e) => {
            log::warn!("Title generation failed ({:#}), using fallback", e);
            fallback_title(&language).to_string()
        }
    }
}

async fn try_generate(
    provider: &dyn CompletionProvider,
    resolver: &ConfigResolver,
    exchange: &[ExchangeMessage],
) -> Result<String> {
    let api_key = resolver.resolve_credential().await?;

    let transcript = exchange
        .iter()
        .map(|m| format!("{}: {}", m.sender.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = vec![
        ApiMessage::system(TITLE_INSTRUCTION),
        ApiMessage::user(transcript),
    ];

    let raw = provider.complete(&api_key, &messages).await?;
    Ok(clean_title(&raw))
}

pub fn fallback_title(language: &str) -> &'static str {
    match language {
        "en" => "New Conversation",
        _ => "新对话",
    }
}

/// Strips quote characters, trims whitespace, and hard-truncates to the
/// label length. Models do not reliably follow the instruction.
fn clean_title(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '「' | '」'))
        .collect();
    stripped.trim().chars().take(TITLE_MAX_CHARS).collect()
}
