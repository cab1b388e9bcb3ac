//! Observable key broker events
//!
//! Every stage reports to one [`EventBus`]. Hosts subscribe to it to mirror
//! session activity and to receive the normalized error sink.

use crate::error::{Error, ErrorReport};
use crate::types::{KeyStatus, MessageType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Status of one key as carried by a key statuses change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatusEntry {
    /// Key id as hex
    pub key_id: String,
    pub status: KeyStatus,
}

/// Event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EmeEvent {
    /// Native key session created
    KeySessionCreated {
        session_id: String,
        key_system: String,
    },

    /// Message received from a key session
    KeyMessage {
        session_id: String,
        message_type: MessageType,
    },

    /// A license function ran, successfully or not
    LicenseRequestAttempted {
        key_system: String,
        content_id: Option<String>,
        success: bool,
    },

    /// Status change of a single key
    KeyStatusChange {
        session_id: String,
        key_id: String,
        status: KeyStatus,
    },

    /// All key statuses of a session after a change
    KeyStatusesChange {
        session_id: String,
        statuses: Vec<KeyStatusEntry>,
    },

    /// Key session closed
    KeySessionClosed {
        session_id: String,
    },

    /// Host error sink
    Error(ErrorReport),
}

/// Event with metadata
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: EmeEvent,
}

/// Broadcast bus shared by every component of one orchestrator
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped silently when nobody is subscribed
    pub fn emit(&self, event: EmeEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(sequence, event = ?event, "EME event");

        let record = EventRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sequence,
            event,
        };
        let _ = self.tx.send(record);
    }

    /// Deliver an error to the host error sink
    pub fn error(&self, err: &Error) {
        error!(code = err.code(), kind = err.error_code(), error = %err, "EME error");
        self.emit(EmeEvent::Error(err.report()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
