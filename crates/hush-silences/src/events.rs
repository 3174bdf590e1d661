//! Lifecycle event fan-out.
//!
//! Events are published only after the change they describe has been
//! committed to both the durable store and the in-memory index. Publishing
//! never blocks: slow subscribers lose the oldest events and are told how
//! many they missed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{Silence, SilenceStatus};

/// What happened to a silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SilenceEventKind {
    /// A silence was created.
    #[serde(rename = "silence_created")]
    Created,
    /// A silence was updated.
    #[serde(rename = "silence_updated")]
    Updated,
    /// A silence was deleted.
    #[serde(rename = "silence_deleted")]
    Deleted,
    /// A silence reached its end time.
    #[serde(rename = "silence_expired")]
    Expired,
}

impl SilenceEventKind {
    /// Returns the wire name of the event.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "silence_created",
            Self::Updated => "silence_updated",
            Self::Deleted => "silence_deleted",
            Self::Expired => "silence_expired",
        }
    }
}

impl fmt::Display for SilenceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceEvent {
    /// The kind of event.
    pub kind: SilenceEventKind,
    /// The affected silence.
    pub silence_id: String,
    /// Status of the silence when the event was produced.
    pub status: SilenceStatus,
    /// Creator of the silence.
    pub created_by: String,
    /// Version of the silence after the change.
    pub version: u64,
    /// When the event was produced.
    pub at: DateTime<Utc>,
}

impl SilenceEvent {
    /// Builds an event describing `silence`.
    #[must_use]
    pub fn new(kind: SilenceEventKind, silence: &Silence, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            silence_id: silence.id.clone(),
            status: silence.status_at(at),
            created_by: silence.created_by.clone(),
            version: silence.version,
            at,
        }
    }
}

/// Destination for lifecycle events.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Publishes an event without blocking.
    ///
    /// Returns the number of subscribers the event was handed to.
    fn publish(&self, event: SilenceEvent) -> usize;
}

/// An [`EventSink`] that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: SilenceEvent) -> usize {
        0
    }
}

/// Fans events out to any number of subscribers over a bounded channel.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    tx: broadcast::Sender<SilenceEvent>,
}

impl BroadcastEmitter {
    /// Creates an emitter that buffers up to `capacity` events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new subscriber. It only sees events published after
    /// this call.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEmitter {
    fn publish(&self, event: SilenceEvent) -> usize {
        debug!(
            kind = %event.kind,
            silence_id = %event.silence_id,
            version = event.version,
            "Publishing silence event"
        );
        self.tx.send(event).unwrap_or(0)
    }
}

/// One subscriber's view of the event stream.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<SilenceEvent>,
    dropped: AtomicU64,
}

impl EventSubscription {
    /// Waits for the next event.
    ///
    /// If this subscriber fell behind, the missed events are skipped and
    /// counted in [`Self::dropped`]. Returns `None` once the emitter is gone.
    pub async fn recv(&mut self) -> Option<SilenceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(count = n, "Silence event subscriber lagged, dropped events");
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<SilenceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Total number of events this subscriber missed by lagging.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
