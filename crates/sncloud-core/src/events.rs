//! Note lifecycle events and the broadcast bus that carries them.
//!
//! Upload, move and delete handlers publish a [`NoteEvent`]; the processor
//! subscribes and enqueues work. Every emission is wrapped in an
//! [`EventEnvelope`] carrying a UUIDv7 id and the time it occurred.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Event Envelope
// ============================================================================

/// Metadata wrapper around a [`NoteEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g., `"note.updated"`).
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// VFS file id the event relates to.
    pub file_id: i64,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: NoteEvent,
}

impl EventEnvelope {
    pub fn new(event: NoteEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            file_id: event.file_id(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Note Event (domain payloads)
// ============================================================================

/// Change notifications for notebooks in the VFS.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"NoteUpdated","file_id":7,"file_path":"Note/a.note"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum NoteEvent {
    /// A notebook was uploaded, replaced or moved.
    NoteUpdated { file_id: i64, file_path: String },
    /// A notebook was deleted.
    NoteDeleted { file_id: i64 },
}

impl NoteEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            NoteEvent::NoteUpdated { .. } => "NoteUpdated",
            NoteEvent::NoteDeleted { .. } => "NoteDeleted",
        }
    }

    /// Namespaced event type for the envelope (e.g., `"note.updated"`).
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            NoteEvent::NoteUpdated { .. } => "note.updated",
            NoteEvent::NoteDeleted { .. } => "note.deleted",
        }
    }

    pub fn file_id(&self) -> i64 {
        match self {
            NoteEvent::NoteUpdated { file_id, .. } | NoteEvent::NoteDeleted { file_id } => {
                *file_id
            }
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for note events.
///
/// Uses `tokio::sync::broadcast` with a fixed buffer. Receivers that fall
/// behind get `Lagged` and miss events; the processor answers a lag by
/// re-queueing every active notebook.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: NoteEvent) {
        let envelope = EventEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            file_id = envelope.file_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
