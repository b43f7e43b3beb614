//! Application state shared across handlers.

use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::source::EventSource;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub source: EventSource,
    /// Cancelled when the server shuts down; ends every open stream.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(source: EventSource, shutdown: CancellationToken) -> Self {
        Self {
            hub: source.hub().clone(),
            source,
            shutdown,
        }
    }
}
