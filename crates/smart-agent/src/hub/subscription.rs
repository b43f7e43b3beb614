//! Subscriber side of the hub: the delivery stream and its release guard.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use log::debug;
use tokio::sync::mpsc;

use super::Hub;
use super::types::{Event, SubscriberId};

/// A registered subscriber.
///
/// Yields every event the hub delivers to it. Dropping the subscription
/// unregisters it; so does [`ReleaseHandle::release`] from any other path.
/// Whichever fires first sends the single remove request.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<Event>,
    release: ReleaseHandle,
}

impl Subscription {
    pub(crate) fn new(hub: Hub, id: SubscriberId, events: mpsc::Receiver<Event>) -> Self {
        Self {
            id,
            events,
            release: ReleaseHandle {
                inner: Arc::new(ReleaseInner {
                    hub,
                    id,
                    released: AtomicBool::new(false),
                }),
            },
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next delivered event.
    ///
    /// Returns `None` once released and drained, or if the hub is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    /// A cloneable handle that can release this subscription from another task.
    pub fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    /// Unregister now. Returns `false` if another path already did.
    pub fn release(&self) -> bool {
        self.release.release()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.release.release() {
            debug!("Subscription {} released on drop", self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("released", &self.release.is_released())
            .finish()
    }
}

/// Close-once guard around [`Hub::unregister`].
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>,
}

struct ReleaseInner {
    hub: Hub,
    id: SubscriberId,
    released: AtomicBool,
}

impl ReleaseHandle {
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Send the remove request if nobody has yet.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.hub.unregister(self.inner.id);
        true
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}
