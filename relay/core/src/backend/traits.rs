//! Chat Backend Traits
//!
//! Trait definitions for generative-language backends. The relay only needs
//! two capabilities from a provider:
//!
//! - Create a conversation configured with a system instruction and model
//! - Send a message through that conversation and receive streamed fragments
//!
//! Implementations handle provider-specific details (API formats, auth,
//! history storage). The conversation handle they return is opaque to
//! the rest of the crate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of the per-message token channel
pub const TOKEN_CHANNEL_CAPACITY: usize = 100;

/// Token stream events from chat backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// One streamed chunk of the response
    ///
    /// Backends forward every chunk they receive. Chunks that carry no text
    /// (finish markers, safety metadata) arrive with `text: None`.
    Fragment {
        /// Text carried by this chunk, if any
        text: Option<String>,
    },
    /// Response completed successfully
    Complete {
        /// The complete message (concatenation of all fragment text)
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

impl StreamingToken {
    /// Build a fragment token from text, mapping empty text to `None`
    pub fn fragment(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Fragment {
            text: (!text.is_empty()).then_some(text),
        }
    }

    /// Non-empty text carried by this token
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Fragment { text } => text.as_deref().filter(|t| !t.is_empty()),
            _ => None,
        }
    }
}

/// Who authored a turn of the conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The relay's client
    User,
    /// The generative model
    Model,
}

/// One completed turn of conversation history
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    /// Author of the turn
    pub role: Role,
    /// Turn text
    pub text: String,
}

impl Turn {
    /// A user turn
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// A model turn
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Settings used to open a conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationConfig {
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// System instruction applied to every turn
    pub system_instruction: String,
}

impl ConversationConfig {
    /// Create a new conversation config
    pub fn new(model: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: system_instruction.into(),
        }
    }
}

/// Handle to backend-side conversation state
///
/// A handle is shared between the session that owns it and the ingestor
/// runs it spawns, so implementations keep their mutable state behind
/// interior locks.
#[async_trait]
pub trait Conversation: Send + Sync + fmt::Debug {
    /// Model this conversation was created with
    fn model(&self) -> &str;

    /// Send a message and get a streaming response
    ///
    /// Resolves once the backend has accepted the request. Errors returned
    /// here are synchronous upstream failures. Failures after that point are
    /// delivered in-band as [`StreamingToken::Error`]. The channel closes when
    /// the response ends.
    async fn send_streaming(&self, message: &str)
        -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// Record a finished exchange in the conversation history
    ///
    /// Backends never record on their own: a response only becomes history
    /// once the relay has accepted it as the current run's answer.
    fn record_exchange(&self, user_message: &str, reply: &str);

    /// Completed turns recorded so far
    fn history(&self) -> Vec<Turn>;
}

/// Chat backend trait
///
/// Implement this trait to add support for different providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "Gemini")
    fn name(&self) -> &str;

    /// Establish a conversation configured with a system instruction and model
    async fn create_conversation(
        &self,
        config: ConversationConfig,
    ) -> anyhow::Result<Arc<dyn Conversation>>;
}
