//! Message broker boundary.
//!
//! The rest of the crate only sees [`BrokerLink`]: publish a payload on the
//! relay topic and report the connection state. Inbound messages arrive on
//! the channel returned when the link is created.

mod error;
mod mqtt;

pub use error::{BrokerError, BrokerResult};
pub use mqtt::MqttLink;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// Connection state of a broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Outbound side of a broker connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Publish a payload on the relay topic.
    ///
    /// Fails with [`BrokerError::Disconnected`] while the link is down; the
    /// caller logs and moves on.
    async fn publish(&self, payload: Bytes) -> BrokerResult<()>;

    /// Current connection state.
    fn state(&self) -> LinkState;
}
