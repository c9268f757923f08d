//! Stream Ingestor
//!
//! Pulls fragments for one outgoing message from a backend token channel
//! into the session store. An ingestor run:
//!
//! - appends every fragment with non-empty text, in arrival order
//! - ends on completion, error, or channel close
//! - marks its generation complete exactly once on every exit path
//! - records the exchange in conversation history only when it completes
//!   while still the session's current generation
//! - stops early when superseded by a newer message or when the session
//!   is gone, dropping its receiver so the backend task winds down
//!
//! Errors never propagate: the request that launched the run has already
//! been answered. The session is left complete with whatever partial output
//! was buffered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::{Conversation, StreamingToken};
use crate::session::{Generation, SessionId, SessionStore, WriteOutcome};

/// How an ingestor run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The backend reported a complete response
    Completed,
    /// The token channel closed without a completion marker
    Closed,
    /// The backend failed mid-stream
    Failed(String),
    /// A newer message superseded this run
    Superseded,
    /// The session was removed while streaming
    SessionGone,
}

/// Summary of a finished ingestor run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestReport {
    /// Session the run wrote to
    pub chat_id: SessionId,
    /// Generation the run wrote under
    pub generation: Generation,
    /// Fragments appended to the session
    pub fragments: usize,
    /// How the run ended
    pub outcome: IngestOutcome,
}

/// The outgoing message an ingestor run answers
#[derive(Clone, Debug)]
pub struct PendingExchange {
    conversation: Arc<dyn Conversation>,
    user_message: String,
}

impl PendingExchange {
    /// Pair a conversation with the message just sent through it
    pub fn new(conversation: Arc<dyn Conversation>, user_message: impl Into<String>) -> Self {
        Self {
            conversation,
            user_message: user_message.into(),
        }
    }

    fn commit(self, reply: &str) {
        self.conversation.record_exchange(&self.user_message, reply);
    }
}

/// Marks the run complete when dropped, whatever path the run exits through
struct CompletionGuard<'a> {
    store: &'a SessionStore,
    chat_id: &'a SessionId,
    generation: Generation,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.store.mark_complete(self.chat_id, self.generation);
    }
}

/// Consume `tokens` into the session until the stream ends
pub async fn ingest(
    store: &SessionStore,
    chat_id: &SessionId,
    generation: Generation,
    mut tokens: mpsc::Receiver<StreamingToken>,
    exchange: PendingExchange,
) -> IngestReport {
    let _guard = CompletionGuard {
        store,
        chat_id,
        generation,
    };
    let mut fragments = 0;

    let outcome = loop {
        let Some(token) = tokens.recv().await else {
            break IngestOutcome::Closed;
        };

        match token {
            StreamingToken::Fragment { .. } => {
                let Some(text) = token.text() else {
                    continue;
                };
                match store.append_fragment(chat_id, generation, text) {
                    WriteOutcome::Applied => fragments += 1,
                    WriteOutcome::Stale => break IngestOutcome::Superseded,
                    WriteOutcome::Missing => break IngestOutcome::SessionGone,
                }
            }
            StreamingToken::Complete { message } => {
                // Only the current run may extend the history
                break match store.mark_complete(chat_id, generation) {
                    WriteOutcome::Applied => {
                        exchange.commit(&message);
                        IngestOutcome::Completed
                    }
                    WriteOutcome::Stale => IngestOutcome::Superseded,
                    WriteOutcome::Missing => IngestOutcome::SessionGone,
                };
            }
            StreamingToken::Error(error) => break IngestOutcome::Failed(error),
        }
    };

    match &outcome {
        IngestOutcome::Failed(error) => {
            tracing::warn!(fragments, error = %error, "Streaming error, keeping partial output");
        }
        IngestOutcome::Superseded | IngestOutcome::SessionGone => {
            tracing::debug!(fragments, outcome = ?outcome, "Ingestion abandoned");
        }
        IngestOutcome::Completed | IngestOutcome::Closed => {
            tracing::info!(fragments, outcome = ?outcome, "Ingestion finished");
        }
    }

    IngestReport {
        chat_id: chat_id.clone(),
        generation,
        fragments,
        outcome,
    }
}

/// Run [`ingest`] as a detached task
///
/// Request handlers do not await the handle; it is returned so callers that
/// care (tests, shutdown) can observe the report.
pub fn spawn_ingestor(
    store: SessionStore,
    chat_id: SessionId,
    generation: Generation,
    tokens: mpsc::Receiver<StreamingToken>,
    exchange: PendingExchange,
) -> JoinHandle<IngestReport> {
    let span = tracing::info_span!("ingest", chat_id = %chat_id, generation = %generation);
    tokio::spawn(
        async move { ingest(&store, &chat_id, generation, tokens, exchange).await }
            .instrument(span),
    )
}
