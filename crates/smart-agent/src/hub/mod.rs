//! In-process broadcast hub for streaming subscribers.
//!
//! The hub is an actor: [`Hub`] is a cheap cloneable handle that submits
//! requests over one queue, and a single spawned loop owns the subscriber
//! set. Registration, removal and fan-out are therefore totally ordered
//! without any lock over the set.
//!
//! Delivery is best-effort. Each subscriber has a small bounded buffer and
//! the loop never waits on it: when the buffer is full the event is dropped
//! for that subscriber only and a warning is logged.

mod actor;
mod subscription;
mod types;

pub use subscription::{ReleaseHandle, Subscription};
pub use types::{Event, HubStats, SubscriberId};

use log::{error, info};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::HubConfig;
use actor::HubActor;
use types::HubCommand;

/// Handle to the hub loop.
#[derive(Clone)]
pub struct Hub {
    id: Uuid,
    commands: mpsc::UnboundedSender<HubCommand>,
    subscriber_capacity: usize,
}

impl Hub {
    /// Start the hub loop on the current runtime.
    ///
    /// Returns the handle and the receiver for membership notices. The
    /// receiver yields nothing when notices are disabled.
    pub fn spawn(config: &HubConfig) -> (Self, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::channel(config.notice_capacity.max(1));
        let notices = config.membership_notices.then_some(notice_tx);

        tokio::spawn(HubActor::new(id, command_rx, notices).run());
        info!("Hub {} started", id);

        let hub = Self {
            id,
            commands,
            subscriber_capacity: config.subscriber_capacity.max(1),
        };
        (hub, notice_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register a new subscriber.
    ///
    /// Resolves once the loop has added it, so any broadcast submitted after
    /// this returns reaches the new subscriber.
    pub async fn register(&self) -> Subscription {
        let id = SubscriberId::next();
        let (delivery, events) = mpsc::channel(self.subscriber_capacity);
        let (applied, ack) = oneshot::channel();

        // The guard exists before the await, so a cancelled register still
        // queues its remove behind the add.
        let subscription = Subscription::new(self.clone(), id, events);

        let command = HubCommand::Add {
            id,
            delivery,
            applied,
        };
        if self.commands.send(command).is_err() {
            error!("Hub {} loop is gone; {} will receive nothing", self.id, id);
        } else if ack.await.is_err() {
            error!("Hub {} loop stopped before adding {}", self.id, id);
        }

        subscription
    }

    /// Queue removal of a subscriber. Unknown ids are ignored by the loop.
    pub fn unregister(&self, id: SubscriberId) {
        if self.commands.send(HubCommand::Remove { id }).is_err() {
            error!("Hub {} loop is gone; dropping remove for {}", self.id, id);
        }
    }

    /// Queue an event for fan-out and return immediately.
    pub fn broadcast(&self, event: impl Into<Event>) {
        let event = event.into();
        if self.commands.send(HubCommand::Broadcast { event }).is_err() {
            error!("Hub {} loop is gone; dropping broadcast", self.id);
        }
    }

    /// Snapshot taken inside the loop, ordered with every other request.
    pub async fn stats(&self) -> HubStats {
        let (reply, response) = oneshot::channel();
        if self.commands.send(HubCommand::Stats { reply }).is_ok() {
            if let Ok(stats) = response.await {
                return stats;
            }
        }
        error!("Hub {} loop is gone; reporting empty stats", self.id);
        HubStats {
            hub_id: self.id,
            subscribers: 0,
            broadcasts: 0,
            delivered: 0,
            dropped: 0,
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").field("id", &self.id).finish()
    }
}
