//! Relay event bus.
//!
//! Everything that changes the shape of the relay (source state, fanout
//! clients, per-client relays, recordings) is published here. The SSE
//! endpoint and `/api/status` read from it; nothing in the streaming path
//! depends on anyone listening.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use nerdcam_common::{ClientId, LivenessState, RelayId, RelayProfile};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of recent events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RelayEvent {
    SourceStateChanged {
        from: LivenessState,
        to: LivenessState,
    },
    ClientAttached {
        client_id: ClientId,
    },
    ClientDetached {
        client_id: ClientId,
        frames_sent: u64,
    },
    RelayOpened {
        relay_id: RelayId,
        profile: RelayProfile,
    },
    RelayClosed {
        relay_id: RelayId,
        profile: RelayProfile,
        bytes_sent: u64,
    },
    RecordingStarted {
        filename: String,
    },
    RecordingStopped {
        filename: String,
        elapsed_secs: u64,
    },
}

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RelayEvent,
}

impl Event {
    pub fn new(payload: RelayEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size, not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn publish(&self, payload: RelayEvent) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
