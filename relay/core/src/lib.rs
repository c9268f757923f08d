//! Relay Core - Polling Proxy for Streaming Chat Backends
//!
//! This crate turns a streaming generative-language backend into something a
//! client without streaming support can consume: responses are buffered per
//! session and handed out in pieces on every poll.
//!
//! # Architecture
//!
//! ```text
//!   start / send                     poll
//!        │                             │
//! ┌──────▼─────────────────────────────▼──────┐
//! │               ChatService                  │
//! │  validate ─► backend ─► store ◄── drain    │
//! └──────┬──────────────────────▲──────────────┘
//!        │ spawn                │ append / mark_complete
//! ┌──────▼──────────┐    ┌──────┴──────────────┐
//! │ Stream Ingestor │───►│    SessionStore     │
//! │ (one per send)  │    │ id ─► buffer, done, │
//! └──────▲──────────┘    │       generation    │
//!        │ tokens        └─────────────────────┘
//! ┌──────┴──────────┐
//! │  ChatBackend    │  Gemini (reqwest + SSE)
//! └─────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatService`]: the three request handlers (`start`, `send`, `poll`)
//! - [`SessionStore`]: keyed session buffers with generation tagging
//! - [`ChatBackend`] / [`Conversation`]: the backend adapter seam
//! - [`GeminiBackend`]: the production backend
//! - [`RelayConfig`]: layered configuration
//!
//! # Module Overview
//!
//! - [`backend`]: backend traits and implementations
//! - [`config`]: configuration loading
//! - [`error`]: error kinds
//! - [`ingest`]: stream ingestion tasks
//! - [`service`]: request handlers
//! - [`session`]: session store

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod ingest;
pub mod service;
pub mod session;

// Re-exports for convenience
pub use backend::{
    ChatBackend, Conversation, ConversationConfig, GeminiBackend, StreamingToken, Turn,
    DEFAULT_MODEL,
};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig,
};
pub use error::{RelayError, StoreError};
pub use ingest::{spawn_ingestor, IngestOutcome, IngestReport, PendingExchange};
pub use service::{Accepted, ChatService, SendMessage, StartChat};
pub use session::{DrainResult, Generation, SessionId, SessionSnapshot, SessionStore, WriteOutcome};
