//! Error types
//!
//! Synchronous failures of the request handlers. Mid-stream failures never
//! surface here: they are logged by the ingestor and end the run early.

use thiserror::Error;

use crate::session::SessionId;

/// Errors returned by [`ChatService`](crate::service::ChatService) operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Required input missing or empty
    #[error("{0}")]
    BadRequest(String),

    /// No live session under the given id
    #[error("Chat not found")]
    NotFound,

    /// The backend call failed before streaming started
    #[error("{context}")]
    Upstream {
        /// Short client-facing description
        context: &'static str,
        /// Underlying backend error
        #[source]
        source: anyhow::Error,
    },
}

impl RelayError {
    /// Build a bad-request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Wrap a backend error with a client-facing context
    #[must_use]
    pub fn upstream(context: &'static str, source: anyhow::Error) -> Self {
        Self::Upstream { context, source }
    }
}

/// Errors returned by [`SessionStore`](crate::session::SessionStore)
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The session does not exist (never created, or evicted)
    #[error("session {0} not found")]
    NotFound(SessionId),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound,
        }
    }
}
