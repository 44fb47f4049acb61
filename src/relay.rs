//! The streaming chat relay: persist the user's turn, load history, open an
//! upstream token stream, re-emit fragments, persist the accumulated reply.

use crate::api::{build_messages, ApiMessage};
use crate::error::{ChatError, Result};
use crate::models::{Message, Sender};
use crate::state::AppState;
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chat_session_id: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub user_message: Message,
    pub ai_response: String,
}

/// One SSE frame of the chat stream. Any number of `Content` frames followed
/// by exactly one terminal `Done` or `Error` frame.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum StreamFrame {
    Content { content: String },
    Done { done: bool, id: Uuid },
    Error { error: String, id: Uuid },
}

impl StreamFrame {
    fn content(content: String) -> Self {
        StreamFrame::Content { content }
    }

    fn done() -> Self {
        StreamFrame::Done {
            done: true,
            id: Uuid::new_v4(),
        }
    }

    fn error(error: impl Into<String>) -> Self {
        StreamFrame::Error {
            error: error.into(),
            id: Uuid::new_v4(),
        }
    }
}

struct PreparedChat {
    session_id: Uuid,
    user_message: Message,
    api_key: String,
    messages: Vec<ApiMessage>,
}

/// Shared setup for both chat paths: validation and session lookup happen
/// before any write; persisting the user message is the point of no return
/// and is never rolled back by later failures.
async fn prepare(state: &AppState, request: &ChatRequest) -> Result<PreparedChat> {
    if request.content.trim().is_empty() || request.chat_session_id.trim().is_empty() {
        return Err(ChatError::Validation(
            "content and chatSessionId are required".to_string(),
        ));
    }
    let session_id = Uuid::parse_str(request.chat_session_id.trim())
        .map_err(|_| ChatError::Validation("chatSessionId is not a valid id".to_string()))?;

    {
        let storage = state.storage.lock().await;
        storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("chat session not found".to_string()))?;
    }

    let user_message = Message::new(session_id, Sender::User, request.content.clone());
    let history = {
        let storage = state.storage.lock().await;
        storage.save_message(&user_message).await?;
        storage.list_messages(session_id).await?
    };

    let language = state.resolver.resolve_language().await?;
    let system_prompt = state.resolver.resolve_system_prompt(&language).await?;
    let api_key = state.resolver.resolve_credential().await?;

    Ok(PreparedChat {
        session_id,
        user_message,
        api_key,
        messages: build_messages(&system_prompt, &history),
    })
}

/// Non-streaming chat: one upstream round trip, then persist the reply.
pub async fn send_chat(state: &AppState, request: ChatRequest) -> Result<ChatResponse> {
    let prepared = prepare(state, &request).await?;
    let reply = state
        .provider
        .complete(&prepared.api_key, &prepared.messages)
        .await?;

    let assistant = Message::new(prepared.session_id, Sender::Ai, reply.clone());
    state.storage.lock().await.save_message(&assistant).await?;

    Ok(ChatResponse {
        user_message: prepared.user_message,
        ai_response: reply,
    })
}

/// Streaming chat. Failures during setup (validation, lookup, credential
/// resolution, opening the upstream stream) are returned as plain errors
/// before any frame is emitted; once streaming has begun, failures are
/// reported in-band and the stream always ends with exactly one terminal
/// frame.
pub async fn stream_chat(
    state: &AppState,
    request: ChatRequest,
) -> Result<UnboundedReceiver<StreamFrame>> {
    let prepared = prepare(state, &request).await?;
    let mut deltas = state
        .provider
        .complete_stream(&prepared.api_key, &prepared.messages)
        .await?;

    let (tx, rx) = mpsc::unbounded();
    let storage = state.storage.clone();
    let session_id = prepared.session_id;

    tokio::spawn(async move {
        let mut full_response = String::new();
        let mut failure: Option<ChatError> = None;

        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    full_response.push_str(&fragment);
                    // A closed receiver means the client disconnected; keep
                    // consuming so a finished response is still persisted.
                    if tx.unbounded_send(StreamFrame::content(fragment)).is_err() {
                        log::debug!("Client disconnected; continuing to accumulate response");
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let terminal = match failure {
            // Partial output accumulated before a failure is discarded; the
            // user message persisted during setup remains.
            Some(e) => {
                log::error!("Stream failed for session {}: {:#}", session_id, e);
                StreamFrame::error(e.to_string())
            }
            None => {
                let assistant = Message::new(session_id, Sender::Ai, full_response);
                match storage.lock().await.save_message(&assistant).await {
                    Ok(()) => StreamFrame::done(),
                    Err(e) => {
                        log::error!(
                            "Failed to persist assistant message for session {}: {:#}",
                            session_id,
                            e
                        );
                        StreamFrame::error(format!("failed to persist assistant response: {}", e))
                    }
                }
            }
        };
        let _ = tx.unbounded_send(terminal);
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OpenAiProvider;
    use crate::storage::StorageManager;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_state(base_url: &str) -> AppState {
        let storage = StorageManager::connect("sqlite::memory:").await.unwrap();
        AppState::new(
            storage,
            Arc::new(OpenAiProvider::new(base_url)),
            Some("sk-env".to_string()),
            None,
        )
    }

    fn request(content: &str, session_id: &str) -> ChatRequest {
        ChatRequest {
            content: content.to_string(),
            chat_session_id: session_id.to_string(),
        }
    }

    fn sse_chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    async fn mount_stream_body(server: &MockServer, body: String) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn streamed_fragments_concatenate_to_the_persisted_reply() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            sse_chunk("Use "),
            sse_chunk("`let x "),
            sse_chunk("= 5`."),
        );
        mount_stream_body(&server, body).await;

        let state = test_state(&server.uri()).await;
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let frames: Vec<StreamFrame> =
            stream_chat(&state, request("how do I declare a variable?", &session.id.to_string()))
                .await
                .unwrap()
                .collect()
                .await;

        // Content frames in order, then exactly one terminal frame, last.
        let (terminal, content) = frames.split_last().unwrap();
        assert!(matches!(terminal, StreamFrame::Done { done: true, .. }));
        let streamed: String = content
            .iter()
            .map(|frame| match frame {
                StreamFrame::Content { content } => content.as_str(),
                other => panic!("unexpected non-content frame before terminal: {:?}", other),
            })
            .collect();
        assert_eq!(streamed, "Use `let x = 5`.");

        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[1].sender, Sender::Ai);
        assert_eq!(messages[1].content, streamed);
    }

    #[tokio::test]
    async fn upstream_failure_keeps_the_user_message_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "boom" })))
            .mount(&server)
            .await;

        let state = test_state(&server.uri()).await;
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let err = stream_chat(&state, request("hello?", &session.id.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Upstream(_)));

        // The user message survives the failed upstream call; no assistant
        // message is persisted.
        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].content, "hello?");
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_frame_and_discards_partial_text() {
        let server = MockServer::start().await;
        let body = format!("{}data: {{\"not\":\"a chunk\"}}\n\n", sse_chunk("partial "));
        mount_stream_body(&server, body).await;

        let state = test_state(&server.uri()).await;
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let frames: Vec<StreamFrame> =
            stream_chat(&state, request("hello?", &session.id.to_string()))
                .await
                .unwrap()
                .collect()
                .await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], StreamFrame::Content { content } if content == "partial "));
        assert!(matches!(&frames[1], StreamFrame::Error { .. }));

        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert_eq!(messages.len(), 1, "partial assistant output must not be persisted");
        assert_eq!(messages[0].sender, Sender::User);
    }

    #[tokio::test]
    async fn validation_failures_have_no_side_effects() {
        let server = MockServer::start().await;
        let state = test_state(&server.uri()).await;
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let err = stream_chat(&state, request("   ", &session.id.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = stream_chat(&state, request("hi", "")).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_with_no_side_effects() {
        let server = MockServer::start().await;
        let state = test_state(&server.uri()).await;

        let err = stream_chat(&state, request("hi", &Uuid::new_v4().to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn send_chat_persists_both_turns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Use `let`." } }]
            })))
            .mount(&server)
            .await;

        let state = test_state(&server.uri()).await;
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let response = send_chat(&state, request("variables?", &session.id.to_string()))
            .await
            .unwrap();
        assert_eq!(response.ai_response, "Use `let`.");
        assert_eq!(response.user_message.content, "variables?");

        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Use `let`.");
    }

    #[tokio::test]
    async fn missing_credential_fails_after_the_user_message_is_kept() {
        let server = MockServer::start().await;
        let storage = StorageManager::connect("sqlite::memory:").await.unwrap();
        // No user key, no system key, no environment key.
        let state = AppState::new(
            storage,
            Arc::new(OpenAiProvider::new(server.uri())),
            None,
            None,
        );
        let session = {
            let storage = state.storage.lock().await;
            storage.create_session("rust").await.unwrap()
        };

        let err = stream_chat(&state, request("hi", &session.id.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::CredentialMissing));

        let messages = {
            let storage = state.storage.lock().await;
            storage.list_messages(session.id).await.unwrap()
        };
        assert_eq!(messages.len(), 1);
    }
}
