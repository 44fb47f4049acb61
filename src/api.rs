use crate::error::{ChatError, Result};
use crate::models::Message;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const MODEL: &str = "gpt-3.5-turbo";
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 1000;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Lazy sequence of text fragments from the streaming completion endpoint.
/// Finite and non-restartable; dropping it closes the upstream connection.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Interface to the upstream chat-completion API, in whole-response and
/// incremental-stream flavors.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Single round trip; returns the full text of the first choice.
    async fn complete(&self, api_key: &str, messages: &[ApiMessage]) -> Result<String>;

    /// Requests incremental delivery. Fragments arrive in order; a failure
    /// mid-sequence surfaces as an `Err` item at the point of failure and
    /// already-delivered fragments are not retracted.
    async fn complete_stream(&self, api_key: &str, messages: &[ApiMessage]) -> Result<DeltaStream>;
}

/// Role-tagged message in the wire format of the completion API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

impl ApiMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Assembles the message list sent upstream: the system prompt first, then
/// the history in conversation order with senders mapped to API roles.
pub fn build_messages(system_prompt: &str, history: &[Message]) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ApiMessage::system(system_prompt));
    for message in history {
        messages.push(ApiMessage {
            role: message.sender.api_role().to_string(),
            content: message.content.clone(),
        });
    }
    messages
}

#[derive(Serialize, Debug)]
struct CompletionRequest<'a> {
    model: &'static str,
    messages: &'a [ApiMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: ApiMessage,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Base URL from `OPENAI_BASE_URL`, defaulting to the official endpoint.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post_completion(
        &self,
        api_key: &str,
        messages: &[ApiMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = CompletionRequest {
            model: MODEL,
            messages,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            stream: stream.then_some(true),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            log::error!("Completion request failed with status {}: {}", status, error_body);
            return Err(ChatError::Upstream(format!("{}: {}", status, error_body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, api_key: &str, messages: &[ApiMessage]) -> Result<String> {
        log::info!("Sending completion request ({} messages)", messages.len());
        let response = self.post_completion(api_key, messages, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Upstream(format!("invalid completion response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(content)
    }

    async fn complete_stream(&self, api_key: &str, messages: &[ApiMessage]) -> Result<DeltaStream> {
        log::info!("Sending streaming completion request ({} messages)", messages.len());
        let response = self.post_completion(api_key, messages, true).await?;

        let event_stream = response.bytes_stream().eventsource();
        let delta_stream = event_stream
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result
                    .map_err(|e| ChatError::Upstream(format!("error reading stream: {}", e)))?;
                let data = event.data.trim();

                // The provider terminates the stream with a literal sentinel.
                if data == "[DONE]" {
                    return Ok(None);
                }

                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => Ok(chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)),
                    Err(e) => {
                        // Some providers interleave ping events; skip those,
                        // fail on anything else unparseable.
                        if serde_json::from_str::<serde_json::Value>(data)
                            .ok()
                            .and_then(|v| v.get("type").cloned())
                            == Some(serde_json::Value::String("ping".to_string()))
                        {
                            log::debug!("Skipping stream ping event");
                            Ok(None)
                        } else {
                            log::warn!("Unparseable stream chunk: {} - data: {}", e, data);
                            Err(ChatError::Upstream(format!("unparseable stream chunk: {}", e)))
                        }
                    }
                }
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(delta_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn history(turns: &[(Sender, &str)]) -> Vec<Message> {
        let session_id = Uuid::new_v4();
        turns
            .iter()
            .map(|(sender, content)| Message::new(session_id, *sender, content.to_string()))
            .collect()
    }

    #[test]
    fn message_assembly_maps_roles() {
        let history = history(&[(Sender::User, "hi"), (Sender::Ai, "hello"), (Sender::User, "?")]);
        let messages = build_messages("be brief", &history);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(messages[0].content, "be brief");
    }

    #[tokio::test]
    async fn complete_returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "gpt-3.5-turbo", "max_tokens": 1000 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Use `let x = 5`." } }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri());
        let reply = provider
            .complete("sk-test", &[ApiMessage::user("how do I declare a variable?")])
            .await
            .unwrap();
        assert_eq!(reply, "Use `let x = 5`.");
    }

    #[tokio::test]
    async fn complete_wraps_provider_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({ "error": "rate limited" })),
            )
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri());
        let err = provider
            .complete("sk-test", &[ApiMessage::user("hi")])
            .await
            .unwrap_err();
        match err {
            ChatError::Upstream(message) => assert!(message.contains("429")),
            other => panic!("expected Upstream error, got {:?}", other),
        }
    }

    fn sse_chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    #[tokio::test]
    async fn complete_stream_yields_fragments_in_order() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            sse_chunk("Hel"),
            sse_chunk("lo"),
            // Empty deltas are filtered out before reaching the consumer.
            "data: {\"choices\":[{\"delta\":{}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri());
        let stream = provider
            .complete_stream("sk-test", &[ApiMessage::user("hi")])
            .await
            .unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, ["Hel", "lo"]);
    }

    #[tokio::test]
    async fn complete_stream_surfaces_mid_stream_errors() {
        let server = MockServer::start().await;
        let body = format!("{}data: {{\"not\":\"a chunk\"}}\n\n", sse_chunk("partial"));
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri());
        let mut stream = provider
            .complete_stream("sk-test", &[ApiMessage::user("hi")])
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(stream.next().await.unwrap().is_err());
    }
}
