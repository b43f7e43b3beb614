//! Broker error types.

use std::time::Duration;

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker at {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("timed out after {0:?} waiting for broker connection")]
    ConnectTimeout(Duration),

    #[error("broker link is disconnected")]
    Disconnected,

    #[error("broker client rejected request: {0}")]
    Client(#[from] rumqttc::ClientError),
}
