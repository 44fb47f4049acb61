//! HTTP surface: chat endpoints, session CRUD, and the config endpoints
//! backing the settings UI.

use crate::error::{ChatError, Result};
use crate::models::{Session, SessionWithMessages};
use crate::relay::{self, ChatRequest, ChatResponse};
use crate::state::AppState;
use crate::title::{self, ExchangeMessage};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .route("/api/sessions/:id/generate-title", post(generate_session_title))
        .route("/api/config", get(get_key_config).post(set_key_config))
        .route("/api/config/language", get(get_language).post(set_language))
        .route("/api/config/streaming", get(get_streaming).post(set_streaming))
        .with_state(state)
}

// An id that does not parse cannot name any session, so it reads as absent.
fn parse_session_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| ChatError::NotFound("chat session not found".to_string()))
}

fn session_not_found() -> ChatError {
    ChatError::NotFound("chat session not found".to_string())
}

// --- Chat ---

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    Ok(Json(relay::send_chat(&state, request).await?))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let frames = relay::stream_chat(&state, request).await?;
    let events = frames.map(|frame| Event::default().json_data(&frame));
    Ok(Sse::new(events))
}

// --- Sessions ---

#[derive(Deserialize, Debug)]
pub struct TitleBody {
    #[serde(default)]
    pub title: String,
}

#[derive(Serialize, Debug)]
pub struct DeleteResponse {
    pub success: bool,
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionWithMessages>>> {
    let sessions = state.storage.lock().await.list_sessions().await?;
    Ok(Json(sessions))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<TitleBody>,
) -> Result<Json<Session>> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ChatError::Validation("title must not be empty".to_string()));
    }
    let session = state.storage.lock().await.create_session(title).await?;
    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionWithMessages>> {
    let id = parse_session_id(&id)?;
    state
        .storage
        .lock()
        .await
        .get_session_with_messages(id)
        .await?
        .map(Json)
        .ok_or_else(session_not_found)
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TitleBody>,
) -> Result<Json<Session>> {
    let id = parse_session_id(&id)?;
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ChatError::Validation("title must not be empty".to_string()));
    }

    let storage = state.storage.lock().await;
    if !storage.update_session_title(id, title).await? {
        return Err(session_not_found());
    }
    let session = storage.get_session(id).await?.ok_or_else(session_not_found)?;
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let id = parse_session_id(&id)?;
    if !state.storage.lock().await.delete_session(id).await? {
        return Err(session_not_found());
    }
    Ok(Json(DeleteResponse { success: true }))
}

// --- Title generation ---

#[derive(Deserialize, Debug)]
pub struct GenerateTitleBody {
    #[serde(default)]
    pub messages: Vec<ExchangeMessage>,
}

#[derive(Serialize, Debug)]
pub struct GenerateTitleResponse {
    pub success: bool,
    pub title: String,
}

async fn generate_session_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GenerateTitleBody>,
) -> Result<Json<GenerateTitleResponse>> {
    let id = parse_session_id(&id)?;
    if body.messages.is_empty() {
        return Err(ChatError::Validation("messages must not be empty".to_string()));
    }
    {
        let storage = state.storage.lock().await;
        storage
            .get_session(id)
            .await?
            .ok_or_else(session_not_found)?;
    }

    // Never fails; worst case this is the fallback label.
    let title = title::generate_title(state.provider.as_ref(), &state.resolver, &body.messages).await;

    if !state
        .storage
        .lock()
        .await
        .update_session_title(id, &title)
        .await?
    {
        return Err(session_not_found());
    }
    Ok(Json(GenerateTitleResponse { success: true, title }))
}

// --- Config ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfigBody {
    pub openai_key: Option<String>,
}

/// Reports only whether a key is set; the raw secret is never echoed back.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfigResponse {
    pub has_api_key: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LanguageBody {
    #[serde(default)]
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StreamingBody {
    pub use_streaming: bool,
}

fn has_key(key: Option<&str>) -> bool {
    key.map(|k| !k.trim().is_empty()).unwrap_or(false)
}

async fn get_key_config(State(state): State<AppState>) -> Result<Json<KeyConfigResponse>> {
    let config = state.storage.lock().await.get_user_config().await?;
    Ok(Json(KeyConfigResponse {
        has_api_key: has_key(config.and_then(|c| c.openai_key).as_deref()),
    }))
}

async fn set_key_config(
    State(state): State<AppState>,
    Json(body): Json<KeyConfigBody>,
) -> Result<Json<KeyConfigResponse>> {
    let config = state
        .storage
        .lock()
        .await
        .set_openai_key(body.openai_key.as_deref())
        .await?;
    Ok(Json(KeyConfigResponse {
        has_api_key: has_key(config.openai_key.as_deref()),
    }))
}

async fn get_language(State(state): State<AppState>) -> Result<Json<LanguageBody>> {
    let language = state.resolver.resolve_language().await?;
    Ok(Json(LanguageBody { language }))
}

async fn set_language(
    State(state): State<AppState>,
    Json(body): Json<LanguageBody>,
) -> Result<Json<LanguageBody>> {
    if body.language != "zh" && body.language != "en" {
        return Err(ChatError::Validation("invalid language setting".to_string()));
    }
    let config = state.storage.lock().await.set_language(&body.language).await?;
    Ok(Json(LanguageBody {
        language: config.language,
    }))
}

async fn get_streaming(State(state): State<AppState>) -> Result<Json<StreamingBody>> {
    let config = state.storage.lock().await.get_user_config().await?;
    Ok(Json(StreamingBody {
        // Streaming is on until explicitly disabled.
        use_streaming: config.map(|c| c.use_streaming).unwrap_or(true),
    }))
}

async fn set_streaming(
    State(state): State<AppState>,
    Json(body): Json<StreamingBody>,
) -> Result<Json<StreamingBody>> {
    let config = state
        .storage
        .lock()
        .await
        .set_use_streaming(body.use_streaming)
        .await?;
    Ok(Json(StreamingBody {
        use_streaming: config.use_streaming,
    }))
}
