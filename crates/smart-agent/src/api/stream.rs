//! Server-Sent Events endpoint backed by the hub.
//!
//! Each request registers one subscriber and turns its deliveries into
//! `data: <payload>\n\n` frames, one body chunk per event. The subscriber is
//! released exactly once, by whichever comes first: the client going away
//! (the body is dropped), server shutdown, or the stream ending.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode, Version, header},
};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio_util::sync::DropGuard;
use tracing::{debug, info};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::hub::Event;

const DATA_PREFIX: &[u8] = b"data: ";
const FRAME_END: &[u8] = b"\n\n";

/// Encode one event as an SSE frame.
pub fn frame(event: &Event) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_PREFIX.len() + event.len() + FRAME_END.len());
    buf.extend_from_slice(DATA_PREFIX);
    buf.extend_from_slice(event.as_bytes());
    buf.extend_from_slice(FRAME_END);
    buf.freeze()
}

/// HTTP/1.0 and older cannot carry a chunked response.
fn supports_streaming(version: Version) -> bool {
    matches!(
        version,
        Version::HTTP_11 | Version::HTTP_2 | Version::HTTP_3
    )
}

/// Long-lived event stream.
///
/// GET {server.stream_path}
pub async fn stream_events(
    State(state): State<AppState>,
    version: Version,
) -> ApiResult<Response<Body>> {
    if !supports_streaming(version) {
        return Err(ApiError::internal("Streaming unsupported!"));
    }

    let subscription = state.hub.register().await;
    let id = subscription.id();
    info!(subscriber = %id, "Event stream opened");

    // Cancelled by server shutdown, or by the guard below when the body is dropped.
    let connection = state.shutdown.child_token();
    let watcher = connection.clone();
    let release = subscription.release_handle();
    tokio::spawn(async move {
        watcher.cancelled().await;
        if release.release() {
            debug!(subscriber = %release.id(), "Event stream released by cancellation");
        }
        info!(subscriber = %release.id(), "Event stream closed");
    });

    let frames = subscription
        .take_until(connection.clone().cancelled_owned())
        .map(|event| Ok::<_, Infallible>(frame(&event)))
        .boxed();
    let body = Body::from_stream(GuardedStream {
        frames,
        _cancel_on_drop: connection.drop_guard(),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("X-Accel-Buffering", "no") // Disable nginx buffering if present
        .body(body)
        .map_err(|e| ApiError::internal(format!("Failed to build SSE response: {e}")))
}

/// Frame stream that cancels its connection token when dropped.
struct GuardedStream {
    frames: BoxStream<'static, Result<Bytes, Infallible>>,
    _cancel_on_drop: DropGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_hello() {
        assert_eq!(frame(&Event::from("hello")), Bytes::from_static(b"data: hello\n\n"));
    }

    #[test]
    fn test_frame_keeps_raw_bytes() {
        let event = Event::from(vec![0xff, b'a', b'\n', b'b']);
        assert_eq!(
            frame(&event),
            Bytes::from_static(b"data: \xffa\nb\n\n")
        );
    }

    #[test]
    fn test_http_10_cannot_stream() {
        assert!(!supports_streaming(Version::HTTP_10));
        assert!(!supports_streaming(Version::HTTP_09));
        assert!(supports_streaming(Version::HTTP_11));
        assert!(supports_streaming(Version::HTTP_2));
    }
}
