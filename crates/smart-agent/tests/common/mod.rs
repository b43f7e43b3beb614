//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use smart_agent::api::{self, AppState};
use smart_agent::broker::{BrokerError, BrokerLink, BrokerResult, LinkState};
use smart_agent::config::{HubConfig, ServerConfig};
use smart_agent::hub::Hub;
use smart_agent::source::EventSource;
use tokio_util::sync::CancellationToken;

/// Broker link that records what it publishes instead of talking to MQTT.
#[derive(Default)]
pub struct RecordingLink {
    published: Mutex<Vec<Bytes>>,
    offline: AtomicBool,
}

impl RecordingLink {
    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerLink for RecordingLink {
    async fn publish(&self, payload: Bytes) -> BrokerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        self.published.lock().unwrap().push(payload);
        Ok(())
    }

    fn state(&self) -> LinkState {
        if self.offline.load(Ordering::SeqCst) {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub hub: Hub,
    pub link: Arc<RecordingLink>,
    pub shutdown: CancellationToken,
}

/// Router wired to a fresh hub and a recording broker link.
///
/// Membership notices are disabled so the link only sees explicit notifications.
pub fn test_app() -> TestApp {
    let hub_config = HubConfig {
        membership_notices: false,
        ..HubConfig::default()
    };
    let (hub, _notices) = Hub::spawn(&hub_config);
    let link = Arc::new(RecordingLink::default());
    let shutdown = CancellationToken::new();

    let source = EventSource::new(hub.clone(), link.clone());
    let state = AppState::new(source, shutdown.clone());
    let router = api::create_router(state, &ServerConfig::default());

    TestApp {
        router,
        hub,
        link,
        shutdown,
    }
}

/// Wait until the hub reports `expected` subscribers.
pub async fn wait_for_subscribers(hub: &Hub, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while hub.stats().await.subscribers != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("hub never reached {expected} subscriber(s)"));
}
