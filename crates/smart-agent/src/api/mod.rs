//! HTTP surface: the event stream plus health and notify routes.

mod error;
mod handlers;
mod routes;
mod state;
mod stream;

pub use error::{ApiError, ApiResult};
pub use handlers::HealthResponse;
pub use routes::create_router;
pub use state::AppState;
pub use stream::{frame, stream_events};
