pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod relay;
pub mod routes;
pub mod state;
pub mod storage;
pub mod title;

use crate::api::{CompletionProvider, OpenAiProvider};
use crate::state::AppState;
use crate::storage::StorageManager;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

/// Builds the shared state and serves the HTTP API until shutdown.
pub async fn run() -> anyhow::Result<()> {
    let db_path = std::env::var("MINICHAT_DB").unwrap_or_else(|_| "minichat.sqlite".to_string());
    let addr = std::env::var("MINICHAT_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let env_api_key = std::env::var("OPENAI_API_KEY").ok();
    let env_system_prompt = std::env::var("DEFAULT_SYSTEM_PROMPT").ok();

    let storage = StorageManager::new(Path::new(&db_path)).await?;
    storage
        .seed_defaults(env_api_key.as_deref(), env_system_prompt.as_deref())
        .await?;

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiProvider::from_env());
    let state = AppState::new(storage, provider, env_api_key, env_system_prompt);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Listening on http://{}", addr);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
