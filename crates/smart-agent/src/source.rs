//! Routing between the broker link and the hub.
//!
//! Inbound broker messages are broadcast to streaming clients. Local
//! notifications go to both the hub and the broker. Hub membership notices
//! go to the broker only.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerLink, BrokerMessage};
use crate::hub::{Event, Hub};

#[derive(Clone)]
pub struct EventSource {
    hub: Hub,
    link: Arc<dyn BrokerLink>,
}

impl EventSource {
    pub fn new(hub: Hub, link: Arc<dyn BrokerLink>) -> Self {
        Self { hub, link }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn link(&self) -> &Arc<dyn BrokerLink> {
        &self.link
    }

    /// Relay one inbound broker message to every streaming client.
    pub fn on_broker_message(&self, message: BrokerMessage) {
        debug!(
            "Relaying {} byte(s) from topic {} to the hub",
            message.payload.len(),
            message.topic
        );
        self.hub.broadcast(Event::from(message.payload));
    }

    /// Broadcast a locally generated event and mirror it to the broker.
    pub async fn notify(&self, event: impl Into<Event>) {
        let event = event.into();
        info!("{}", event.text());
        self.hub.broadcast(event.clone());
        self.publish(event.into_bytes()).await;
    }

    /// Publish to the broker, logging instead of failing.
    async fn publish(&self, payload: Bytes) {
        if let Err(err) = self.link.publish(payload).await {
            warn!(
                "Publish failed (link {}): {}",
                self.link.state(),
                err
            );
        }
    }

    /// Route broker messages and hub notices until both inputs close or shutdown.
    pub fn spawn(
        self,
        inbound: mpsc::Receiver<BrokerMessage>,
        notices: mpsc::Receiver<Event>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.route(inbound, notices, shutdown))
    }

    async fn route(
        self,
        mut inbound: mpsc::Receiver<BrokerMessage>,
        mut notices: mpsc::Receiver<Event>,
        shutdown: CancellationToken,
    ) {
        let mut inbound_open = true;
        let mut notices_open = true;

        while inbound_open || notices_open {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => self.on_broker_message(message),
                    None => {
                        debug!("Broker inbound channel closed");
                        inbound_open = false;
                    }
                },
                notice = notices.recv(), if notices_open => match notice {
                    Some(notice) => self.publish(notice.into_bytes()).await,
                    None => {
                        debug!("Hub notice channel closed");
                        notices_open = false;
                    }
                },
            }
        }
        debug!("Event routing stopped");
    }

    /// Emit a clock event every `every` until shutdown.
    pub fn spawn_clock(self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the start-up announcement covers it.
            interval.tick().await;

            let mut ticks = std::pin::pin!(IntervalStream::new(interval).take_until(shutdown.cancelled_owned()));
            while ticks.next().await.is_some() {
                self.notify(clock_event()).await;
            }
            debug!("Clock stopped");
        })
    }
}

/// The "The time is ..." event emitted at start-up and by the clock.
pub fn clock_event() -> String {
    format!("The time is {}", Local::now().format("%Y-%m-%d %H:%M:%S%.f %:z"))
}
