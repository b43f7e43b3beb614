//! Types exchanged with the hub loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// One opaque message relayed between the broker and streaming clients.
///
/// Cloning is cheap: the payload is reference counted and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event(Bytes);

impl Event {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 view, used for log lines.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Event {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<String> for Event {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<&'static str> for Event {
    fn from(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Event {
    fn from(payload: Vec<u8>) -> Self {
        Self(Bytes::from(payload))
    }
}

/// Identifies one registered subscriber inside the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Requests processed one at a time by the hub loop.
pub(crate) enum HubCommand {
    Add {
        id: SubscriberId,
        delivery: mpsc::Sender<Event>,
        applied: oneshot::Sender<()>,
    },
    Remove {
        id: SubscriberId,
    },
    Broadcast {
        event: Event,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Point-in-time view of the hub, taken inside the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub hub_id: Uuid,
    pub subscribers: usize,
    /// Broadcasts processed since start.
    pub broadcasts: u64,
    /// Individual deliveries accepted by subscriber buffers.
    pub delivered: u64,
    /// Individual deliveries dropped because a subscriber buffer was full.
    pub dropped: u64,
}
