//! Collaborator seams for prompt lookup, similarity search, and generation.
//!
//! The engine only sees these traits. [`ApiClient`] implements all three
//! against the chat server's JSON endpoints using `reqwest`; tests substitute
//! in-memory fakes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::EndpointConfig;
use crate::error::TurnError;
use crate::types::{ChatMessage, RetrievedDocument};

/// Response body of a generation request: raw bytes of incremental text.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TurnError>> + Send>>;

/// Body of a similarity search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub message: String,
    pub similarity: f64,
    pub limit: usize,
}

/// Looks up a named prompt (a few-shot message sequence).
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn fetch_prompt(&self, name: &str) -> Result<Vec<ChatMessage>, TurnError>;
}

/// Returns documents ranked by similarity to the query, most relevant first.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RetrievedDocument>, TurnError>;
}

/// Starts a streaming completion and hands back the response body.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<ByteStream, TurnError>;
}

/// HTTP client for the chat server's `/api/prompt`, `/api/search` and
/// `/api/generate` endpoints.
pub struct ApiClient {
    client: Client,
    endpoint: EndpointConfig,
}

impl ApiClient {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<String, TurnError> {
        let url = self.url(path);
        let started = std::time::Instant::now();
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(
            url = %url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collaborator request finished"
        );
        if !status.is_success() {
            return Err(error_from_response(status, &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl PromptSource for ApiClient {
    async fn fetch_prompt(&self, name: &str) -> Result<Vec<ChatMessage>, TurnError> {
        let body = self
            .post_json(&self.endpoint.prompt_path, &json!({ "name": name }))
            .await?;
        parse_prompt_payload(&body)
    }
}

#[async_trait]
impl DocumentSearch for ApiClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RetrievedDocument>, TurnError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| TurnError::transport(format!("Failed to encode search request: {e}")))?;
        let body = self.post_json(&self.endpoint.search_path, &payload).await?;
        parse_search_payload(&body)
    }
}

#[async_trait]
impl CompletionBackend for ApiClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<ByteStream, TurnError> {
        let url = self.url(&self.endpoint.generate_path);
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&json!({ "messages": messages }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &text));
        }
        debug!(
            url = %url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation stream opened"
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TurnError::from));
        Ok(Box::pin(stream))
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Map a non-success response to a collaborator error.
///
/// Uses the `{ error: { code?, message } }` envelope when present, otherwise
/// falls back to the status line and raw body.
pub fn error_from_response(status: StatusCode, body: &str) -> TurnError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => TurnError::Collaborator {
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Err(_) => TurnError::Collaborator {
            code: Some(status.as_u16().to_string()),
            message: if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {}", body.trim())
            },
        },
    }
}

/// Decode `{ prompt: { prompt: "<JSON message array>" } }`.
///
/// The inner field is normally a JSON-encoded string; an inline array is
/// accepted as well.
pub fn parse_prompt_payload(body: &str) -> Result<Vec<ChatMessage>, TurnError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TurnError::transport(format!("Invalid prompt response: {e}")))?;
    let inner = value
        .get("prompt")
        .and_then(|p| p.get("prompt"))
        .ok_or_else(|| TurnError::collaborator("Prompt not found."))?;

    let messages = match inner {
        Value::String(encoded) => serde_json::from_str::<Vec<ChatMessage>>(encoded),
        other => serde_json::from_value::<Vec<ChatMessage>>(other.clone()),
    };
    messages.map_err(|e| TurnError::transport(format!("Invalid prompt messages: {e}")))
}

/// Decode `{ documents: [...] }`; a missing or null list means no matches.
pub fn parse_search_payload(body: &str) -> Result<Vec<RetrievedDocument>, TurnError> {
    #[derive(Deserialize)]
    struct SearchResponse {
        #[serde(default)]
        documents: Option<Vec<RetrievedDocument>>,
    }

    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|e| TurnError::transport(format!("Invalid search response: {e}")))?;
    Ok(parsed.documents.unwrap_or_default())
}
