//! Integration tests for the HTTP surface.

mod common;

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode, Version, header},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::{test_app, wait_for_subscribers};

fn stream_request() -> Request<Body> {
    Request::builder().uri("/").body(Body::empty()).unwrap()
}

/// Read the next data frame from a streaming body, failing after a timeout.
async fn next_frame(body: &mut Body) -> Option<String> {
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("timed out waiting for a frame")?
        .expect("body error");
    let data = frame.into_data().expect("expected a data frame");
    Some(String::from_utf8_lossy(&data).into_owned())
}

#[tokio::test]
async fn test_stream_sets_event_stream_headers() {
    let app = test_app();

    let response = app.router.oneshot(stream_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_stream_delivers_broadcast_as_data_frame() {
    let app = test_app();

    let response = app.router.oneshot(stream_request()).await.unwrap();
    assert_eq!(app.hub.stats().await.subscribers, 1);

    app.hub.broadcast("hello");
    app.hub.broadcast("world");

    let mut body = response.into_body();
    assert_eq!(next_frame(&mut body).await.as_deref(), Some("data: hello\n\n"));
    assert_eq!(next_frame(&mut body).await.as_deref(), Some("data: world\n\n"));
}

#[tokio::test]
async fn test_http_10_is_rejected_before_registering() {
    let app = test_app();

    let request = Request::builder()
        .uri("/")
        .version(Version::HTTP_10)
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Streaming unsupported!");
    assert_eq!(app.hub.stats().await.subscribers, 0);
}

#[tokio::test]
async fn test_client_disconnect_unregisters() {
    let app = test_app();

    let response = app.router.oneshot(stream_request()).await.unwrap();
    assert_eq!(app.hub.stats().await.subscribers, 1);

    drop(response);

    wait_for_subscribers(&app.hub, 0).await;
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let app = test_app();

    let response = app.router.oneshot(stream_request()).await.unwrap();
    let mut body = response.into_body();

    app.shutdown.cancel();

    assert_eq!(next_frame(&mut body).await, None);
    wait_for_subscribers(&app.hub, 0).await;
}

#[tokio::test]
async fn test_health_reports_hub_and_broker() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["subscribers"], 0);
    assert_eq!(json["broker"], "connected");
    assert_eq!(json["hub_id"], app.hub.id().to_string());
}

#[tokio::test]
async fn test_notify_reaches_streams_and_broker() {
    let app = test_app();

    let stream = app
        .router
        .clone()
        .oneshot(stream_request())
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/notify")
                .body(Body::from("door opened"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut body = stream.into_body();
    assert_eq!(
        next_frame(&mut body).await.as_deref(),
        Some("data: door opened\n\n")
    );
    assert_eq!(app.link.published(), vec!["door opened".to_string()]);
}

#[tokio::test]
async fn test_notify_while_broker_offline_still_streams() {
    let app = test_app();
    app.link.set_offline(true);

    let stream = app
        .router
        .clone()
        .oneshot(stream_request())
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/notify")
                .body(Body::from("offline"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut body = stream.into_body();
    assert_eq!(next_frame(&mut body).await.as_deref(), Some("data: offline\n\n"));
    assert!(app.link.published().is_empty());
}

#[tokio::test]
async fn test_notify_rejects_empty_body() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/notify")
                .body(Body::from("  \n"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
