use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::event::Event;
use crate::assembly::ConnectionKey;
use crate::stream::{ReaderRelease, StreamReader};

/// Default number of events buffered per conversation before a flush.
pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// Stable identifier of a conversation, used for shard affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId(pub u64);

impl ConversationId {
    /// Derives the id from the canonical (server to client) connection key.
    pub fn from_key(key: &ConnectionKey) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Rejection reasons for an event batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("event queue full")]
    QueueFull,

    #[error("event consumer closed")]
    Closed,
}

/// Downstream consumer of event batches. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn submit_events(&self, conversation: ConversationId, events: Vec<Event>)
        -> Result<(), SubmitError>;
}

/// One client/server exchange stream under analysis.
///
/// Owns both direction readers exclusively and is driven by exactly one task.
pub struct Conversation {
    id: ConversationId,
    key: ConnectionKey,
    client: StreamReader,
    server: StreamReader,
    sink: Arc<dyn EventSink>,
    events: Vec<Event>,
    capacity: usize,
    release: Option<ReaderRelease>,
}

impl Conversation {
    /// `key` must be the canonical server to client key.
    pub fn new(
        key: ConnectionKey,
        client: StreamReader,
        server: StreamReader,
        sink: Arc<dyn EventSink>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: ConversationId::from_key(&key),
            key,
            client,
            server,
            sink,
            events: Vec::with_capacity(capacity),
            capacity,
            release: None,
        }
    }

    /// Returns readers to `release` when the conversation finishes.
    pub fn with_release(mut self, release: ReaderRelease) -> Self {
        self.release = Some(release);
        self
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn client(&mut self) -> &mut StreamReader {
        &mut self.client
    }

    pub fn server(&mut self) -> &mut StreamReader {
        &mut self.server
    }

    /// Number of events waiting for the next flush.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Buffers an event, flushing when the buffer is full.
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
        if self.events.len() >= self.capacity {
            self.flush_events();
        }
    }

    /// Submits buffered events as one batch. A rejected batch is dropped.
    pub fn flush_events(&mut self) {
        if self.events.is_empty() {
            return;
        }

        let batch = std::mem::replace(&mut self.events, Vec::with_capacity(self.capacity));
        let len = batch.len();
        if let Err(e) = self.sink.submit_events(self.id, batch) {
            debug!(conversation = %self.key, events = len, error = %e, "dropping event batch");
        }
    }

    /// Flushes outstanding events and hands both readers back to the pool.
    pub fn finish(&mut self) {
        self.flush_events();

        let client = std::mem::replace(&mut self.client, StreamReader::closed());
        let server = std::mem::replace(&mut self.server, StreamReader::closed());
        if let Some(release) = self.release.take() {
            release.release(client);
            release.release(server);
        }
    }
}
