//! Scripted in-memory backend for tests
//!
//! Replies are queued up front and handed out in order, one per
//! `send_streaming` call across all conversations of the backend.
//! `ScriptStep::WaitFor` parks a reply until the test releases it, which
//! makes ingestion interleavings reproducible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::traits::{
    ChatBackend, Conversation, ConversationConfig, StreamingToken, Turn, TOKEN_CHANNEL_CAPACITY,
};

/// One step of a scripted reply
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit a fragment carrying this text
    Text(String),
    /// Emit a fragment without text
    Empty,
    /// Fail mid-stream with this message
    Fail(String),
    /// Pause until the notify is triggered
    WaitFor(Arc<Notify>),
}

/// A scripted response to one message
#[derive(Clone, Debug, Default)]
pub struct ScriptedReply {
    /// Steps emitted in order
    pub steps: Vec<ScriptStep>,
    /// Reject the send synchronously with this message
    pub reject: Option<String>,
}

impl ScriptedReply {
    /// A reply that streams the given fragments and completes
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: fragments
                .into_iter()
                .map(|f| ScriptStep::Text(f.into()))
                .collect(),
            reject: None,
        }
    }

    /// A reply whose send fails before any streaming starts
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            reject: Some(message.into()),
        }
    }

    /// Append a step
    #[must_use]
    pub fn then(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    create_error: Option<String>,
    configs: Vec<ConversationConfig>,
    sent: Vec<String>,
}

/// In-memory backend driven by queued replies
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
    conversations: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Create a backend with no queued replies
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next send
    pub fn push_reply(&self, reply: ScriptedReply) -> &Self {
        self.state.lock().replies.push_back(reply);
        self
    }

    /// Make every subsequent `create_conversation` fail
    pub fn fail_create(&self, message: impl Into<String>) {
        self.state.lock().create_error = Some(message.into());
    }

    /// Number of conversations created
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.load(Ordering::SeqCst)
    }

    /// Configs passed to `create_conversation`, in call order
    #[must_use]
    pub fn configs(&self) -> Vec<ConversationConfig> {
        self.state.lock().configs.clone()
    }

    /// Messages sent through any conversation, in call order
    #[must_use]
    pub fn sent_messages(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn create_conversation(
        &self,
        config: ConversationConfig,
    ) -> anyhow::Result<Arc<dyn Conversation>> {
        {
            let mut state = self.state.lock();
            if let Some(message) = &state.create_error {
                anyhow::bail!("{message}");
            }
            state.configs.push(config.clone());
        }
        self.conversations.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(ScriptedConversation {
            model: config.model,
            state: Arc::clone(&self.state),
            history: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

/// Conversation handle of [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedConversation {
    model: String,
    state: Arc<Mutex<ScriptState>>,
    history: Arc<Mutex<Vec<Turn>>>,
}

#[async_trait]
impl Conversation for ScriptedConversation {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send_streaming(
        &self,
        message: &str,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let reply = {
            let mut state = self.state.lock();
            state.sent.push(message.to_string());
            state.replies.pop_front()
        };
        let Some(reply) = reply else {
            anyhow::bail!("no scripted reply queued");
        };
        if let Some(reject) = reply.reject {
            anyhow::bail!("{reject}");
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut full_response = String::new();
            for step in reply.steps {
                let token = match step {
                    ScriptStep::Text(text) => {
                        full_response.push_str(&text);
                        StreamingToken::fragment(text)
                    }
                    ScriptStep::Empty => StreamingToken::Fragment { text: None },
                    ScriptStep::Fail(error) => {
                        let _ = tx.send(StreamingToken::Error(error)).await;
                        return;
                    }
                    ScriptStep::WaitFor(notify) => {
                        notify.notified().await;
                        continue;
                    }
                };
                if tx.send(token).await.is_err() {
                    return;
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
        if reply.is_empty() {
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
