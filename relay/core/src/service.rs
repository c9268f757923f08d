//! Request Handlers
//!
//! Framework-agnostic implementation of the three relay operations. The
//! HTTP layer only translates between wire types and these calls.
//!
//! | Operation | Blocks on                  | Spawns   |
//! |-----------|----------------------------|----------|
//! | `start`   | conversation + stream open | ingestor |
//! | `send`    | stream open                | ingestor |
//! | `poll`    | nothing                    | -        |

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::backend::{ChatBackend, ConversationConfig, DEFAULT_MODEL};
use crate::error::RelayError;
use crate::ingest::{spawn_ingestor, IngestReport, PendingExchange};
use crate::session::{DrainResult, SessionId, SessionStore};

/// Input of [`ChatService::start`]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChat {
    /// System instruction for the new conversation
    #[serde(default)]
    pub system_instruction: Option<String>,
    /// First user message
    #[serde(default)]
    pub user_message: Option<String>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
}

/// Input of [`ChatService::send`]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target session
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Follow-up user message
    #[serde(default)]
    pub user_message: Option<String>,
}

/// A message accepted for streaming
#[derive(Debug)]
pub struct Accepted {
    /// Session the message streams into
    pub chat_id: SessionId,
    /// Detached ingestor task
    pub ingestor: JoinHandle<IngestReport>,
}

/// The relay's request handlers
#[derive(Clone)]
pub struct ChatService {
    backend: Arc<dyn ChatBackend>,
    store: SessionStore,
    default_model: String,
}

impl ChatService {
    /// Create a service over a backend and store
    pub fn new(backend: Arc<dyn ChatBackend>, store: SessionStore) -> Self {
        Self {
            backend,
            store,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Override the model used when a start request names none
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Model used when a start request names none
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// The session store
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start a new chat
    ///
    /// Returns as soon as the backend has accepted the first message; the
    /// response streams into the new session in the background.
    pub async fn start(&self, request: StartChat) -> Result<Accepted, RelayError> {
        let (Some(system_instruction), Some(user_message)) = (
            non_empty(request.system_instruction),
            non_empty(request.user_message),
        ) else {
            return Err(RelayError::bad_request(
                "systemInstruction and userMessage required",
            ));
        };
        let model = non_empty(request.model).unwrap_or_else(|| self.default_model.clone());

        let conversation = self
            .backend
            .create_conversation(ConversationConfig::new(model.clone(), system_instruction))
            .await
            .map_err(|e| upstream_failure("Failed to start chat", e))?;

        let tokens = conversation
            .send_streaming(&user_message)
            .await
            .map_err(|e| upstream_failure("Failed to start chat", e))?;

        let exchange = PendingExchange::new(Arc::clone(&conversation), user_message);
        let (chat_id, generation) = self.store.create(conversation, model);
        let ingestor = spawn_ingestor(
            self.store.clone(),
            chat_id.clone(),
            generation,
            tokens,
            exchange,
        );

        Ok(Accepted { chat_id, ingestor })
    }

    /// Send a follow-up message in an existing chat
    ///
    /// A run still streaming for the previous message is superseded: its
    /// remaining output is discarded.
    pub async fn send(&self, request: SendMessage) -> Result<Accepted, RelayError> {
        let chat_id = SessionId::from(request.chat_id.unwrap_or_default());
        let conversation = self.store.conversation(&chat_id)?;
        let user_message = non_empty(request.user_message)
            .ok_or_else(|| RelayError::bad_request("userMessage required"))?;

        let tokens = conversation
            .send_streaming(&user_message)
            .await
            .map_err(|e| upstream_failure("Failed to send message", e))?;

        let generation = self.store.reset_for_new_message(&chat_id)?;
        let ingestor = spawn_ingestor(
            self.store.clone(),
            chat_id.clone(),
            generation,
            tokens,
            PendingExchange::new(conversation, user_message),
        );

        Ok(Accepted { chat_id, ingestor })
    }

    /// Drain the fragments accumulated since the last poll
    pub fn poll(&self, chat_id: &str) -> Result<DrainResult, RelayError> {
        Ok(self.store.drain(&SessionId::from(chat_id))?)
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("backend", &self.backend.name())
            .field("store", &self.store)
            .field("default_model", &self.default_model)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn upstream_failure(context: &'static str, error: anyhow::Error) -> RelayError {
    tracing::error!(error = %format!("{error:#}"), "{context}");
    RelayError::upstream(context, error)
}
