// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HTTP surface tests driven through the router.

use axum::body::Body;
use axum::http::{Request, StatusCode, Version};
use axum::Router;
use futures::StreamExt;
use pushbroker::{
    AppState, BaseDelivery, DeliveryEngine, Frame, Registry, Store, TokenCodec,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::util::ServiceExt;

async fn make_app() -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path()).await.unwrap());
    let monitors = Arc::new(Registry::new("monitor"));
    let receipts = Arc::new(Registry::new("receipt"));
    let codec = TokenCodec::random(None);
    let engine = Arc::new(DeliveryEngine::new(
        store,
        monitors.clone(),
        receipts.clone(),
        codec.clone(),
    ));
    let state = AppState {
        engine: engine.clone(),
        pusher: Arc::new(BaseDelivery::new(engine)),
        codec,
        monitors,
        receipts,
    };
    (pushbroker::router(state), dir)
}

fn header_value<'a>(response: &'a axum::response::Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name} header"))
        .to_str()
        .unwrap()
}

/// Pull the push token out of the subscribe response's Link header.
fn push_token_from_link(link: &str) -> String {
    let start = link.find("</p/").expect("push relation present") + "</p/".len();
    let end = link[start..].find('>').unwrap() + start;
    link[start..end].to_string()
}

async fn subscribe(app: &Router) -> (String, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_value(&response, "cache-control"),
        "max-age=864000, private"
    );
    let location = header_value(&response, "location").to_string();
    let sub_id = location
        .strip_prefix("/s/")
        .expect("subscription location")
        .to_string();
    let push_token = push_token_from_link(header_value(&response, "link"));
    (sub_id, push_token)
}

/// Read every frame from a response that terminates (flush-only monitors).
async fn read_frames(response: axum::response::Response) -> Vec<Frame> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn monitor_request(sub_id: &str, wait: Option<i64>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/s/{sub_id}"))
        .version(Version::HTTP_2);
    if let Some(wait) = wait {
        builder = builder.header("prefer", format!("wait={wait}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _dir) = make_app().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_subscribe_returns_tokened_urls() {
    let (app, _dir) = make_app().await;
    let (sub_id, push_token) = subscribe(&app).await;
    assert!(!sub_id.is_empty());
    assert!(!push_token.is_empty());
    // The sealed token never leaks the raw subscription id.
    assert!(!push_token.contains(&sub_id));
}

#[tokio::test]
async fn test_store_deliver_flush_acknowledge_scenario() {
    let (app, _dir) = make_app().await;
    let (sub_id, push_token) = subscribe(&app).await;

    // Deliver while no monitor is open: stored, 201 with the update URL.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token}"))
                .header("content-type", "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let update_location = header_value(&response, "location").to_string();
    assert!(update_location.starts_with("/d/"));

    // Flush-only monitor: one push frame with the body, then a 204 close.
    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(0)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let frames = read_frames(response).await;
    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Frame::Push {
            path,
            status,
            headers,
            payload,
        } => {
            assert_eq!(path, &update_location);
            assert_eq!(*status, 200);
            assert_eq!(payload, b"hello");
            assert!(headers
                .iter()
                .any(|(name, value)| name == "content-type" && value == "text/plain"));
            assert!(headers.iter().any(|(name, _)| name == "last-modified"));
        }
        other => panic!("expected a push frame, got {other:?}"),
    }
    assert_eq!(frames[1], Frame::Close { status: Some(204) });

    // Acknowledge the update.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(&update_location)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Acknowledging again is a no-op success.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(&update_location)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A later flush replays nothing.
    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(0)))
        .await
        .unwrap();
    let frames = read_frames(response).await;
    assert_eq!(frames, vec![Frame::Close { status: Some(204) }]);
}

#[tokio::test]
async fn test_live_delivery_to_open_monitor() {
    let (app, _dir) = make_app().await;
    let (sub_id, push_token) = subscribe(&app).await;

    // Hold a monitor open (no Prefer header).
    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    // Deliver while the monitor is connected.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token}"))
                .body(Body::from("live"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .expect("timed out waiting for a live push frame")
        .expect("monitor body ended unexpectedly")
        .unwrap();
    let frame: Frame = serde_json::from_slice(&chunk).unwrap();
    match frame {
        Frame::Push { payload, .. } => assert_eq!(payload, b"live"),
        other => panic!("expected a push frame, got {other:?}"),
    }

    // Nothing was stored: a flush-only monitor sees only the close frame.
    drop(body);
    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(0)))
        .await
        .unwrap();
    let frames = read_frames(response).await;
    assert_eq!(frames, vec![Frame::Close { status: Some(204) }]);
}

#[tokio::test]
async fn test_put_update_delivers_by_sealed_token() {
    let (app, _dir) = make_app().await;
    let (sub_id, push_token) = subscribe(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token}"))
                .body(Body::from("first"))
                .unwrap(),
        )
        .await
        .unwrap();
    let update_location = header_value(&response, "location").to_string();
    let update_token = update_location.strip_prefix("/d/").unwrap().to_string();

    // Redeliver through the alternate endpoint.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/d/{update_token}"))
                .header("content-type", "text/plain")
                .body(Body::from("second"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(0)))
        .await
        .unwrap();
    let frames = read_frames(response).await;
    // Same update id: the second write replaced the first record.
    let pushes: Vec<_> = frames
        .iter()
        .filter(|frame| matches!(frame, Frame::Push { .. }))
        .collect();
    assert_eq!(pushes.len(), 1);
    match pushes[0] {
        Frame::Push { payload, .. } => assert_eq!(payload, b"second"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_monitor_requires_http2() {
    let (app, _dir) = make_app().await;
    let (sub_id, _push_token) = subscribe(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/s/{sub_id}"))
                .version(Version::HTTP_11)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
}

#[tokio::test]
async fn test_invalid_tokens_yield_not_found() {
    let (app, _dir) = make_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/p/forged-token")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/d/forged-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/r/forged-token")
                .version(Version::HTTP_2)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_receipt_flow_with_stored_ack() {
    let (app, _dir) = make_app().await;
    let (_sub_id, push_token) = subscribe(&app).await;

    // Create the receipt subscription.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/receipts/{push_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let receipt_location = header_value(&response, "location").to_string();
    assert!(receipt_location.starts_with("/r/"));

    // Deliver with a receipt attached.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token}"))
                .header("push-receipt", format!("https://push.example.org{receipt_location}"))
                .body(Body::from("receipted"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let update_location = header_value(&response, "location").to_string();

    // Acknowledge while no receipt channel is open: the ack is stored.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(&update_location)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Opening the receipt channel flushes the stored ack as a 410 push.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(&receipt_location)
                .version(Version::HTTP_2)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .expect("timed out waiting for the receipt frame")
        .expect("receipt body ended unexpectedly")
        .unwrap();
    let frame: Frame = serde_json::from_slice(&chunk).unwrap();
    match frame {
        Frame::Push { path, status, .. } => {
            assert_eq!(path, update_location);
            assert_eq!(status, 410);
        }
        other => panic!("expected a receipt frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mismatched_receipt_yields_conflict() {
    let (app, _dir) = make_app().await;
    let (_sub_a, push_token_a) = subscribe(&app).await;
    let (_sub_b, push_token_b) = subscribe(&app).await;

    // Receipt subscription for B.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/receipts/{push_token_b}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let receipt_location = header_value(&response, "location").to_string();

    // Using B's receipt URL on a delivery to A is a conflict.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token_a}"))
                .header("push-receipt", &receipt_location)
                .body(Body::from("x"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // A malformed receipt URL is not found.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token_a}"))
                .header("push-receipt", "/x/not-a-receipt")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_drop_subscription_clears_storage() {
    let (app, _dir) = make_app().await;
    let (sub_id, push_token) = subscribe(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/p/{push_token}"))
                .body(Body::from("pending"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/s/{sub_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(0)))
        .await
        .unwrap();
    let frames = read_frames(response).await;
    assert_eq!(frames, vec![Frame::Close { status: Some(204) }]);
}

#[tokio::test]
async fn test_monitor_auto_closes_after_wait() {
    let (app, _dir) = make_app().await;
    let (sub_id, _push_token) = subscribe(&app).await;

    let response = app
        .clone()
        .oneshot(monitor_request(&sub_id, Some(100)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The body terminates on its own once the wait elapses.
    let frames = tokio::time::timeout(Duration::from_secs(2), read_frames(response))
        .await
        .expect("monitor did not auto-close");
    assert_eq!(frames, vec![Frame::Close { status: Some(200) }]);
}
