//! The coordinating loop that owns the subscriber set.

use std::collections::HashMap;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::types::{Event, HubCommand, HubStats, SubscriberId};

/// Sole owner and writer of the subscriber set.
///
/// Every add, remove and broadcast goes through [`HubActor::run`], which
/// handles exactly one request at a time. That single loop is what orders
/// membership changes against fan-out; no lock guards the map.
pub(crate) struct HubActor {
    id: Uuid,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    notices: Option<mpsc::Sender<Event>>,
    broadcasts: u64,
    delivered: u64,
    dropped: u64,
}

impl HubActor {
    pub(crate) fn new(
        id: Uuid,
        commands: mpsc::UnboundedReceiver<HubCommand>,
        notices: Option<mpsc::Sender<Event>>,
    ) -> Self {
        Self {
            id,
            subscribers: HashMap::new(),
            commands,
            notices,
            broadcasts: 0,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Process requests until every hub handle has been dropped.
    pub(crate) async fn run(mut self) {
        debug!("Hub {} loop started", self.id);
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(
            "Hub {} loop stopped with {} subscriber(s)",
            self.id,
            self.subscribers.len()
        );
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Add {
                id,
                delivery,
                applied,
            } => {
                self.subscribers.insert(id, delivery);
                let notice = format!(
                    "Client added to {}. Clients connected: {}",
                    self.id,
                    self.subscribers.len()
                );
                info!("{notice}");
                self.notify(notice);
                // The registering side may have given up waiting; the slot
                // is still released through its subscription guard.
                let _ = applied.send(());
            }
            HubCommand::Remove { id } => {
                if self.subscribers.remove(&id).is_none() {
                    debug!("Hub {} ignoring remove for unknown {}", self.id, id);
                    return;
                }
                let notice = format!(
                    "Removed client from {}. Clients connected: {}",
                    self.id,
                    self.subscribers.len()
                );
                info!("{notice}");
                self.notify(notice);
            }
            HubCommand::Broadcast { event } => self.fan_out(event),
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Offer the event to every current subscriber without waiting on any of them.
    fn fan_out(&mut self, event: Event) {
        self.broadcasts += 1;
        trace!(
            "Hub {} broadcasting {} byte(s) to {} subscriber(s)",
            self.id,
            event.len(),
            self.subscribers.len()
        );

        for (id, delivery) in &self.subscribers {
            match delivery.try_send(event.clone()) {
                Ok(()) => self.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    warn!(
                        "Hub {} dropped event for slow subscriber {} (buffer full)",
                        self.id, id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver already gone; its remove request is queued behind us.
                    trace!("Hub {} skipped closed subscriber {}", self.id, id);
                }
            }
        }
    }

    fn notify(&self, notice: String) {
        let Some(notices) = &self.notices else {
            return;
        };
        match notices.try_send(Event::from(notice)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Hub {} notice channel full, dropping notice: {}",
                    self.id,
                    event.text()
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Hub {} notice channel closed", self.id);
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            hub_id: self.id,
            subscribers: self.subscribers.len(),
            broadcasts: self.broadcasts,
            delivered: self.delivered,
            dropped: self.dropped,
        }
    }
}
