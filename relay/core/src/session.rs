//! Session Store
//!
//! Keyed, in-memory lifecycle management for relay sessions. A session pairs
//! a backend conversation handle with the buffer of fragments that have not
//! been polled yet.
//!
//! # Generations
//!
//! Every ingestor run is tagged with the session's generation at launch.
//! `reset_for_new_message` bumps the generation, so writes from a run that
//! was superseded by a newer message are discarded instead of interleaving
//! with the new run's output:
//!
//! ```text
//!   /start ──► gen 0 ──append──append──┐
//!   /send  ──► gen 1 ──append──────────┼──append──► complete
//!                                      └── gen 0 append: Stale (dropped)
//! ```
//!
//! # Thread Safety
//!
//! Sessions live in a `DashMap`. Each operation runs inside a single
//! shard lock, so `drain` is atomic with respect to concurrent appends.
//!
//! # Eviction
//!
//! Sessions are never removed implicitly. The daemon may run a sweeper that
//! calls [`SessionStore::evict_idle`] when an idle timeout is configured.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backend::Conversation;
use crate::error::StoreError;

/// Number of random bytes in a session id
const SESSION_ID_BYTES: usize = 12;

/// Opaque, externally visible session identifier (`chatId`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session id (96 bits, lowercase hex)
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; SESSION_ID_BYTES] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one ingestor run of a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Get the raw counter value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a write attempted by an ingestor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied
    Applied,
    /// The writer's generation has been superseded; the write was dropped
    Stale,
    /// The session no longer exists; the write was dropped
    Missing,
}

/// Fragments taken by a poll
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainResult {
    /// Fragments accumulated since the previous drain, in arrival order
    pub chunks: Vec<String>,
    /// Whether the current ingestor run has terminated
    pub done: bool,
}

/// Read-only view of a session
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Conversation handle
    pub conversation: Arc<dyn Conversation>,
    /// Model the conversation was created with
    pub model: String,
    /// Whether the current ingestor run has terminated
    pub complete: bool,
    /// Fragments waiting for the next poll
    pub pending_fragments: usize,
    /// Current generation
    pub generation: Generation,
    /// When the session was created
    pub created_at: Instant,
    /// Last client activity (create, send, reset, poll)
    pub last_active: Instant,
}

/// A live session
struct Session {
    conversation: Arc<dyn Conversation>,
    model: String,
    pending: Vec<String>,
    complete: bool,
    generation: Generation,
    created_at: Instant,
    last_active: Instant,
}

impl Session {
    fn new(conversation: Arc<dyn Conversation>, model: String) -> Self {
        let now = Instant::now();
        Self {
            conversation,
            model,
            pending: Vec::new(),
            complete: false,
            generation: Generation::default(),
            created_at: now,
            last_active: now,
        }
    }

    fn snapshot(&self, id: &SessionId) -> SessionSnapshot {
        SessionSnapshot {
            id: id.clone(),
            conversation: Arc::clone(&self.conversation),
            model: self.model.clone(),
            complete: self.complete,
            pending_fragments: self.pending.len(),
            generation: self.generation,
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Process-scoped session store
///
/// Cloning is cheap and every clone refers to the same sessions.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<SessionId, Session>>,
}

impl SessionStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session and return its id and initial generation
    ///
    /// The id is re-rolled if it collides with a live session.
    pub fn create(
        &self,
        conversation: Arc<dyn Conversation>,
        model: impl Into<String>,
    ) -> (SessionId, Generation) {
        let session = Session::new(conversation, model.into());
        let generation = session.generation;

        let id = loop {
            let id = SessionId::generate();
            match self.inner.entry(id.clone()) {
                Entry::Occupied(_) => {
                    tracing::debug!(chat_id = %id, "Session id collision, regenerating");
                }
                Entry::Vacant(slot) => {
                    slot.insert(session);
                    break id;
                }
            }
        };

        // len() locks every shard, so only call it once the entry is released
        tracing::info!(chat_id = %id, sessions = self.inner.len(), "Session created");
        (id, generation)
    }

    /// Read a session
    pub fn get(&self, id: &SessionId) -> Result<SessionSnapshot, StoreError> {
        self.inner
            .get(id)
            .map(|s| s.snapshot(id))
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Get the conversation handle of a session
    ///
    /// Counts as client activity, so the idle sweeper cannot evict the
    /// session while a follow-up message is being sent upstream.
    pub fn conversation(&self, id: &SessionId) -> Result<Arc<dyn Conversation>, StoreError> {
        let mut session = self
            .inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        session.touch();
        Ok(Arc::clone(&session.conversation))
    }

    /// Prepare a session for a new outgoing message
    ///
    /// Clears pending fragments, clears the complete flag and starts a new
    /// generation. Returns the generation the next ingestor must write under.
    pub fn reset_for_new_message(&self, id: &SessionId) -> Result<Generation, StoreError> {
        let mut session = self
            .inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let discarded = session.pending.len();
        session.pending.clear();
        session.complete = false;
        session.generation = session.generation.next();
        session.touch();

        tracing::debug!(
            chat_id = %id,
            generation = %session.generation,
            discarded,
            "Session reset for new message"
        );
        Ok(session.generation)
    }

    /// Append a fragment on behalf of the ingestor of `generation`
    pub fn append_fragment(
        &self,
        id: &SessionId,
        generation: Generation,
        text: impl Into<String>,
    ) -> WriteOutcome {
        let Some(mut session) = self.inner.get_mut(id) else {
            tracing::debug!(chat_id = %id, "Dropping fragment for removed session");
            return WriteOutcome::Missing;
        };
        if session.generation != generation {
            tracing::debug!(
                chat_id = %id,
                stale = %generation,
                current = %session.generation,
                "Dropping fragment from superseded run"
            );
            return WriteOutcome::Stale;
        }
        session.pending.push(text.into());
        WriteOutcome::Applied
    }

    /// Mark the run of `generation` as terminated
    pub fn mark_complete(&self, id: &SessionId, generation: Generation) -> WriteOutcome {
        let Some(mut session) = self.inner.get_mut(id) else {
            return WriteOutcome::Missing;
        };
        if session.generation != generation {
            return WriteOutcome::Stale;
        }
        session.complete = true;
        WriteOutcome::Applied
    }

    /// Take the pending fragments and read the complete flag
    ///
    /// The complete flag itself is left untouched.
    pub fn drain(&self, id: &SessionId) -> Result<DrainResult, StoreError> {
        let mut session = self
            .inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        session.touch();
        Ok(DrainResult {
            chunks: std::mem::take(&mut session.pending),
            done: session.complete,
        })
    }

    /// Remove a session
    pub fn remove(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.remove(id).map(|(id, s)| s.snapshot(&id))
    }

    /// Check if a session exists
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.contains_key(id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store holds no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove completed sessions idle for at least `max_idle`
    ///
    /// Sessions with an ingestor still in flight are kept regardless of age.
    /// Returns the number of sessions removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.len();

        self.inner.retain(|id, session| {
            let idle = now.saturating_duration_since(session.last_active);
            let expired = session.complete && idle >= max_idle;
            if expired {
                tracing::info!(
                    chat_id = %id,
                    idle_secs = idle.as_secs(),
                    "Evicting idle session"
                );
            }
            !expired
        });

        let removed = before.saturating_sub(self.inner.len());
        if removed > 0 {
            tracing::info!(
                removed,
                remaining = self.inner.len(),
                "Evicted idle sessions"
            );
        }
        removed
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_count", &self.inner.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatBackend, ConversationConfig, ScriptedBackend};
    use pretty_assertions::assert_eq;

    async fn conversation() -> Arc<dyn Conversation> {
        ScriptedBackend::new()
            .create_conversation(ConversationConfig::new("test-model", "sys"))
            .await
            .unwrap()
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_BYTES * 2);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(SessionId::generate(), id);
        assert_eq!(format!("{}", SessionId::from("abc123")), "abc123");
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SessionStore::new();
        let (id, generation) = store.create(conversation().await, "test-model");

        assert_eq!(store.len(), 1);
        assert!(store.contains(&id));

        let snapshot = store.get(&id).unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.model, "test-model");
        assert_eq!(snapshot.conversation.model(), "test-model");
        assert_eq!(snapshot.generation, generation);
        assert!(!snapshot.complete);
        assert_eq!(snapshot.pending_fragments, 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let store = SessionStore::new();
        let missing = SessionId::from("nope");

        assert_eq!(
            store.get(&missing).unwrap_err(),
            StoreError::NotFound(missing.clone())
        );
        assert!(store.drain(&missing).is_err());
        assert!(store.reset_for_new_message(&missing).is_err());
        assert!(store.conversation(&missing).is_err());
        assert_eq!(
            store.append_fragment(&missing, Generation::default(), "x"),
            WriteOutcome::Missing
        );
        assert_eq!(
            store.mark_complete(&missing, Generation::default()),
            WriteOutcome::Missing
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_drain_is_destructive_and_keeps_done() {
        let store = SessionStore::new();
        let (id, generation) = store.create(conversation().await, "m");

        store.append_fragment(&id, generation, "Hel");
        assert_eq!(
            store.drain(&id).unwrap(),
            DrainResult {
                chunks: vec!["Hel".to_string()],
                done: false
            }
        );
        assert_eq!(store.drain(&id).unwrap(), DrainResult::default());

        store.append_fragment(&id, generation, "lo");
        assert_eq!(
            store.mark_complete(&id, generation),
            WriteOutcome::Applied
        );
        assert_eq!(
            store.drain(&id).unwrap(),
            DrainResult {
                chunks: vec!["lo".to_string()],
                done: true
            }
        );

        // done stays true across drains
        for _ in 0..3 {
            assert_eq!(
                store.drain(&id).unwrap(),
                DrainResult {
                    chunks: vec![],
                    done: true
                }
            );
        }
    }

    #[tokio::test]
    async fn test_reset_starts_new_generation() {
        let store = SessionStore::new();
        let (id, first) = store.create(conversation().await, "m");

        store.append_fragment(&id, first, "old");
        store.mark_complete(&id, first);

        let second = store.reset_for_new_message(&id).unwrap();
        assert!(second > first);

        let snapshot = store.get(&id).unwrap();
        assert!(!snapshot.complete);
        assert_eq!(snapshot.pending_fragments, 0);
        assert_eq!(snapshot.generation, second);
    }

    #[tokio::test]
    async fn test_stale_writes_are_discarded() {
        let store = SessionStore::new();
        let (id, first) = store.create(conversation().await, "m");
        let second = store.reset_for_new_message(&id).unwrap();

        assert_eq!(store.append_fragment(&id, first, "late"), WriteOutcome::Stale);
        assert_eq!(store.append_fragment(&id, second, "new"), WriteOutcome::Applied);
        assert_eq!(store.mark_complete(&id, first), WriteOutcome::Stale);

        assert_eq!(
            store.drain(&id).unwrap(),
            DrainResult {
                chunks: vec!["new".to_string()],
                done: false
            }
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let store = SessionStore::new();
        let (id, generation) = store.create(conversation().await, "m");

        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert_eq!(store.append_fragment(&id, generation, "x"), WriteOutcome::Missing);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_in_flight_sessions() {
        let store = SessionStore::new();
        let (done_id, done_gen) = store.create(conversation().await, "m");
        let (busy_id, _) = store.create(conversation().await, "m");
        store.mark_complete(&done_id, done_gen);

        // Nothing is old enough for a long timeout
        assert_eq!(store.evict_idle(Duration::from_secs(3600)), 0);

        assert_eq!(store.evict_idle(Duration::ZERO), 1);
        assert!(!store.contains(&done_id));
        assert!(store.contains(&busy_id));
    }

    #[tokio::test]
    async fn test_conversation_lookup_defers_eviction() {
        let store = SessionStore::new();
        let (id, generation) = store.create(conversation().await, "m");
        store.mark_complete(&id, generation);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let before = store.get(&id).unwrap().last_active;
        store.conversation(&id).unwrap();
        assert!(store.get(&id).unwrap().last_active > before);

        assert_eq!(store.evict_idle(Duration::from_millis(50)), 0);
        assert!(store.contains(&id));
    }

    #[tokio::test]
    async fn test_concurrent_create_yields_unique_ids() {
        use tokio::task::JoinSet;

        let store = SessionStore::new();
        let conversation = conversation().await;
        let mut join_set = JoinSet::new();

        for _ in 0..32 {
            let store = store.clone();
            let conversation = Arc::clone(&conversation);
            join_set.spawn(async move { store.create(conversation, "m").0 });
        }

        let mut ids = Vec::new();
        while let Some(result) = join_set.join_next().await {
            ids.push(result.unwrap());
        }

        assert_eq!(store.len(), 32);
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }
}
