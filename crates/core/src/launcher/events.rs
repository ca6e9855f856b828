//! # Launcher Events
//!
//! Timestamped envelopes for bus messages, for observers that outlive a
//! single `publish()` call (timelines, SSE streams, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use super::bus::{MessageBus, Msg};

/// A bus message as observed at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherEvent {
    /// Unique event ID
    pub id: String,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Run the message belongs to
    pub generation: u64,
    /// The message
    pub msg: Msg,
}

impl LauncherEvent {
    pub fn new(msg: Msg, generation: u64) -> Self {
        Self {
            id: event_id(),
            timestamp: Utc::now(),
            generation,
            msg,
        }
    }
}

/// Generate a time-ordered event id
fn event_id() -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("{:x}-{:x}", nanos, rand_u32())
}

/// Simple random number (not cryptographic)
fn rand_u32() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Catch-all subscriber that keeps every event it sees
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LauncherEvent>>>,
}

impl EventLog {
    /// Record every message published on `bus`, stamped with the run generation
    pub fn attach(bus: &MessageBus, generation: watch::Receiver<u64>) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        bus.subscribe_all(move |_, msg| {
            let event = LauncherEvent::new(msg, *generation.borrow());
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        });
        log
    }

    pub fn events(&self) -> Vec<LauncherEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<Msg> {
        self.events().into_iter().map(|event| event.msg).collect()
    }

    /// Messages recorded for one run
    pub fn messages_for(&self, generation: u64) -> Vec<Msg> {
        self.events()
            .into_iter()
            .filter(|event| event.generation == generation)
            .map(|event| event.msg)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
