//! Gemini Backend Implementation
//!
//! Chat backend for Google's Generative Language API.
//!
//! # Gemini API
//!
//! The API is stateless: every request carries the full conversation.
//! This implementation keeps the history client-side and uses
//! `models/{model}:streamGenerateContent?alt=sse`, which answers with a
//! server-sent event stream of `GenerateContentResponse` chunks:
//!
//! ```text
//! data: {"candidates":[{"content":{"parts":[{"text":"Hel"}],"role":"model"}}]}
//!
//! data: {"candidates":[{"content":{"parts":[{"text":"lo"}],"role":"model"},"finishReason":"STOP"}]}
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::traits::{
    ChatBackend, Conversation, ConversationConfig, Role, StreamingToken, Turn,
    TOKEN_CHANNEL_CAPACITY,
};
use crate::config::BackendSettings;

/// Public endpoint of the Generative Language API
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Model used when a request does not name one
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Gemini backend client
#[derive(Clone)]
pub struct GeminiBackend {
    /// API key sent as `x-goog-api-key`
    api_key: Option<String>,
    /// Base URL (scheme + host, no trailing slash)
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl GeminiBackend {
    /// Create a new Gemini backend
    ///
    /// A missing API key is accepted here; conversation creation fails later.
    /// `read_timeout` bounds the silence between two reads of a response, so
    /// a stream that keeps producing is never cut off.
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Create from the `[backend]` configuration section
    pub fn from_settings(settings: &BackendSettings) -> anyhow::Result<Self> {
        Self::new(
            settings.api_key.clone(),
            settings.base_url.clone(),
            settings.connect_timeout(),
            settings.read_timeout(),
        )
    }

    /// Whether an API key is configured
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl std::fmt::Debug for GeminiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiBackend")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "Gemini"
    }

    async fn create_conversation(
        &self,
        config: ConversationConfig,
    ) -> anyhow::Result<Arc<dyn Conversation>> {
        let Some(api_key) = self.api_key.clone() else {
            anyhow::bail!("Gemini API key is not configured (set GEMINI_API_KEY)");
        };
        if config.model.trim().is_empty() {
            anyhow::bail!("model name must not be empty");
        }

        tracing::debug!(model = %config.model, "Creating Gemini conversation");

        Ok(Arc::new(GeminiConversation {
            api_key,
            stream_url: format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, config.model
            ),
            http_client: self.http_client.clone(),
            model: config.model,
            system_instruction: config.system_instruction,
            history: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

/// A conversation held against the Gemini API
pub struct GeminiConversation {
    api_key: String,
    stream_url: String,
    http_client: reqwest::Client,
    model: String,
    system_instruction: String,
    /// Completed turns, replayed on every request
    history: Arc<Mutex<Vec<Turn>>>,
}

impl std::fmt::Debug for GeminiConversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConversation")
            .field("model", &self.model)
            .field("turns", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl GeminiConversation {
    /// Build the request body: history snapshot plus the new user turn
    fn build_request(&self, message: &str) -> GenerateContentRequest {
        let mut contents: Vec<Content> = self.history.lock().iter().map(Content::from).collect();
        contents.push(Content::from(&Turn::user(message)));

        GenerateContentRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(&self.system_instruction)],
            },
            contents,
        }
    }
}

#[async_trait]
impl Conversation for GeminiConversation {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send_streaming(
        &self,
        message: &str,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let body = self.build_request(message);

        let response = self
            .http_client
            .post(&self.stream_url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()
            .await
            .context("Failed to reach Gemini")?;

        // Check for HTTP errors
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini returned {status}: {}", api_error_message(&body));
        }

        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };

                for payload in decoder.push(&bytes) {
                    match parse_chunk(&payload) {
                        Ok(Some(text)) => {
                            full_response.push_str(&text);
                            if tx.send(StreamingToken::fragment(text)).await.is_err() {
                                // Receiver dropped, stop streaming
                                return;
                            }
                        }
                        Ok(None) => {
                            if tx.send(StreamingToken::Fragment { text: None }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(StreamingToken::Error(e)).await;
                            return;
                        }
                    }
                }
            }

            for payload in decoder.finish() {
                match parse_chunk(&payload) {
                    Ok(text) => {
                        let text = text.unwrap_or_default();
                        full_response.push_str(&text);
                        if tx.send(StreamingToken::fragment(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e)).await;
                        return;
                    }
                }
            }

            let _ = tx
                .send(StreamingToken::Complete {
                    message: full_response,
                })
                .await;
        });

        Ok(rx)
    }

    fn record_exchange(&self, user_message: &str, reply: &str) {
        // An empty model turn is rejected by the API on every later request
        if reply.is_empty() {
            tracing::debug!(model = %self.model, "Skipping exchange without answer text");
            return;
        }
        let mut history = self.history.lock();
        history.push(Turn::user(user_message));
        history.push(Turn::model(reply));
    }

    fn history(&self) -> Vec<Turn> {
        self.history.lock().clone()
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Content,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        Self {
            role: Some(turn.role),
            parts: vec![Part::text(&turn.text)],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    /// Thought summaries are not part of the answer text
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            thought: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

/// Extract the answer text of one streamed chunk
///
/// Returns `Ok(None)` for chunks without text and `Err` when the chunk is an
/// in-band API error or not valid JSON.
fn parse_chunk(payload: &str) -> Result<Option<String>, String> {
    let chunk: GenerateContentChunk =
        serde_json::from_str(payload).map_err(|e| format!("Malformed stream chunk: {e}"))?;

    if let Some(error) = chunk.error {
        return Err(format!("Gemini error {}: {}", error.code, error.message));
    }

    let text: String = chunk
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}

/// Best-effort extraction of `error.message` from an error response body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

/// Incremental decoder for `text/event-stream` bodies
///
/// Collects `data:` lines into events and yields each event's payload once
/// its terminating blank line arrives. Bytes are buffered until a full line
/// is available, so multi-byte characters split across network chunks are
/// decoded intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    /// Feed bytes and return every event payload they complete
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Comments (":") and other fields are ignored
        }

        events
    }

    /// Flush an event left unterminated at end of stream
    fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            if let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        if let Some(event) = self.take_event() {
            events.push(event);
        }
        events
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let event = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn backend() -> GeminiBackend {
        GeminiBackend::new(
            Some("test-key".to_string()),
            "http://localhost:9/",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_backend_creation() {
        let backend = backend();
        assert_eq!(backend.base_url(), "http://localhost:9");
        assert!(backend.has_api_key());

        let keyless = GeminiBackend::new(
            Some("  ".to_string()),
            DEFAULT_BASE_URL,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!keyless.has_api_key());
    }

    #[tokio::test]
    async fn test_create_conversation_requires_api_key() {
        let backend = GeminiBackend::new(
            None,
            DEFAULT_BASE_URL,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = backend
            .create_conversation(ConversationConfig::new(DEFAULT_MODEL, "Be terse"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn test_create_conversation_rejects_empty_model() {
        let result = backend()
            .create_conversation(ConversationConfig::new(" ", "Be terse"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_conversation_reports_model() {
        let conversation = backend()
            .create_conversation(ConversationConfig::new("gemini-2.0-flash", "Be terse"))
            .await
            .unwrap();
        assert_eq!(conversation.model(), "gemini-2.0-flash");
        assert!(conversation.history().is_empty());
    }

    #[test]
    fn test_build_request_replays_history() {
        let conversation = GeminiConversation {
            api_key: "k".to_string(),
            stream_url: String::new(),
            http_client: reqwest::Client::new(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: "You are terse.".to_string(),
            history: Arc::new(Mutex::new(vec![Turn::user("Hi"), Turn::model("Hello.")])),
        };

        let body = serde_json::to_value(conversation.build_request("Again")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "systemInstruction": {"parts": [{"text": "You are terse."}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "Hi"}]},
                    {"role": "model", "parts": [{"text": "Hello."}]},
                    {"role": "user", "parts": [{"text": "Again"}]},
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_record_exchange_skips_empty_replies() {
        let conversation = backend()
            .create_conversation(ConversationConfig::new(DEFAULT_MODEL, "Be terse"))
            .await
            .unwrap();

        conversation.record_exchange("Blocked prompt", "");
        assert!(conversation.history().is_empty());

        conversation.record_exchange("Hi", "Hello.");
        assert_eq!(
            conversation.history(),
            vec![Turn::user("Hi"), Turn::model("Hello.")]
        );
    }

    #[test]
    fn test_parse_chunk_concatenates_parts() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(parse_chunk(payload), Ok(Some("Hello".to_string())));
    }

    #[test]
    fn test_parse_chunk_skips_thoughts_and_empty() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true}]}}]}"#;
        assert_eq!(parse_chunk(payload), Ok(None));

        let finish = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":3}}"#;
        assert_eq!(parse_chunk(finish), Ok(None));
    }

    #[test]
    fn test_parse_chunk_reports_errors() {
        let payload = r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            parse_chunk(payload),
            Err("Gemini error 429: Resource exhausted".to_string())
        );
        assert!(parse_chunk("not json").is_err());
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(api_error_message(body), "API key not valid.");
        assert_eq!(api_error_message(" upstream down \n"), "upstream down");
    }

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert!(decoder.push(b"1}\r\n").is_empty());
        assert_eq!(decoder.push(b"\r\ndata: {\"b\":2}\n\n"), vec![
            "{\"a\":1}".to_string(),
            "{\"b\":2}".to_string(),
        ]);
    }

    #[test]
    fn test_sse_decoder_keeps_multibyte_characters() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = bytes.len() - 3;

        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn test_sse_decoder_joins_multiline_data_and_ignores_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\ndata: one\ndata: two\nevent: x\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn test_sse_decoder_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: first\n").is_empty());
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec!["first\ntail".to_string()]);
        assert!(decoder.finish().is_empty());
    }
}
