//! Chat Backend Integration
//!
//! This module provides abstracted access to generative-language backends
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **Gemini**: Google Generative Language API (default)
//! - **Scripted**: in-memory replies for tests (`test-util` feature)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{ChatBackend, ConversationConfig, GeminiBackend};
//!
//! let backend = GeminiBackend::from_settings(&config.backend)?;
//! let conversation = backend
//!     .create_conversation(ConversationConfig::new("gemini-2.5-flash", "You are terse."))
//!     .await?;
//! let rx = conversation.send_streaming("Hi").await?;
//! ```

mod gemini;
#[cfg(any(test, feature = "test-util"))]
mod scripted;
mod traits;

pub use gemini::{GeminiBackend, GeminiConversation, DEFAULT_BASE_URL, DEFAULT_MODEL};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptStep, ScriptedBackend, ScriptedConversation, ScriptedReply};
pub use traits::{
    ChatBackend, Conversation, ConversationConfig, Role, StreamingToken, Turn,
    TOKEN_CHANNEL_CAPACITY,
};
