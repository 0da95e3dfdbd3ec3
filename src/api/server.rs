use crate::api::errors::ApiError;
use crate::api::headers;
use crate::bridges::Pusher;
use crate::crypto::TokenCodec;
use crate::delivery::channel::{Channel, FrameReceiver};
use crate::delivery::engine::{parse_receipt_plain, parse_update_plain};
use crate::delivery::DeliveryEngine;
use crate::ids::{ReceiptId, SubId, UpdateId};
use crate::registry::{ChannelGuard, Registry};
use crate::storage::models::{Headers, Update};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Request headers copied onto an update unchanged, including the
/// encryption-encoding draft headers.
const FORWARDED_HEADERS: [&str; 4] = [
    "content-type",
    "content-encoding",
    "encryption",
    "encryption-key",
];

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeliveryEngine>,
    pub pusher: Arc<dyn Pusher>,
    pub codec: TokenCodec,
    pub monitors: Arc<Registry>,
    pub receipts: Arc<Registry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/subscribe", post(post_subscribe))
        .route("/s/:sub_id", get(get_monitor).delete(delete_subscription))
        .route("/p/:sub_token", post(post_update))
        .route("/d/:update_token", put(put_update).delete(delete_update))
        .route("/receipts/:sub_token", post(post_receipt_subscribe))
        .route("/r/:receipt_token", get(get_receipts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("push broker listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /subscribe: create a subscription and hand out its tokened URLs.
async fn post_subscribe(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<serde_json::Value>(&body).map_err(|err| {
            ApiError::BadRequest(format!("invalid subscribe payload: {err}"))
        })?)
    };

    let sub = SubId::generate();
    state.pusher.subscribe(&sub, params.as_ref()).await?;
    let sub_token = state.codec.seal(&sub.to_string())?;
    info!(%sub, "subscription created");

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::CACHE_CONTROL, "max-age=864000, private")
        .header(header::LOCATION, format!("/s/{sub}"))
        .header(header::LINK, headers::push_link_header(&sub_token))
        .body(Body::empty())
        .map_err(|err| ApiError::Internal(err.to_string()))
}

/// GET /s/{subId}: flush stored updates, then hold the monitor open per the
/// `Prefer: wait` preference.
async fn get_monitor(
    State(state): State<AppState>,
    Path(sub_id): Path<String>,
    version: Version,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_push_support(version, "message delivery requires push promises")?;
    let sub: SubId = sub_id
        .parse()
        .map_err(|_| ApiError::NotFound("nonexistent subscription".to_string()))?;
    let wait = headers::get_wait(
        request_headers
            .get("prefer")
            .and_then(|value| value.to_str().ok()),
    );

    let (channel, frames) = Channel::new();
    if wait == 0 {
        // Flush-only: replay stored updates and close without registering.
        state.engine.flush_updates(&sub, &channel).await?;
        channel.close(Some(204));
        return Ok(frame_response(frames, None));
    }

    state.engine.open_monitor(&sub, channel.clone()).await?;
    if wait > 0 {
        let auto_close = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
            auto_close.close(Some(200));
        });
    }
    let guard = ChannelGuard::new(state.monitors.clone(), sub.to_string(), channel);
    Ok(frame_response(frames, Some(guard)))
}

/// DELETE /s/{subId}: drop the subscription and its stored records.
async fn delete_subscription(
    State(state): State<AppState>,
    Path(sub_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let sub: SubId = sub_id
        .parse()
        .map_err(|_| ApiError::NotFound("nonexistent subscription".to_string()))?;
    state.engine.drop_subscription(&sub).await?;
    info!(%sub, "subscription dropped");
    Ok(StatusCode::OK)
}

/// POST /p/{subToken}: deliver an update, optionally attaching a delivery
/// receipt named by the `Push-Receipt` header.
async fn post_update(
    State(state): State<AppState>,
    Path(sub_token): Path<String>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let plain = state.codec.unseal(&sub_token)?;
    let sub: SubId = plain
        .parse()
        .map_err(|_| ApiError::NotFound("nonexistent subscription".to_string()))?;

    let receipt_id = match request_headers.get("push-receipt") {
        None => None,
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ApiError::NotFound("invalid receipt URL".to_string()))?;
            Some(resolve_receipt(&state, &sub, raw)?)
        }
    };

    let update_id = UpdateId::generate();
    let update_token = seal_update_token(&state.codec, &sub, &update_id, receipt_id.as_ref())?;
    let path = format!("/d/{update_token}");
    let update = Update::new(path.clone(), capture_headers(&request_headers), body.to_vec());

    state.pusher.push(&sub, &update_id, &update).await?;

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, path)
        .body(Body::empty())
        .map_err(|err| ApiError::Internal(err.to_string()))
}

/// PUT /d/{updateToken}: deliver an update addressed by an already-sealed
/// token.
async fn put_update(
    State(state): State<AppState>,
    Path(update_token): Path<String>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let plain = state.codec.unseal(&update_token)?;
    let (sub, update_id, _receipt_id) = parse_update_plain(&plain)?;
    let update = Update::new(
        format!("/d/{update_token}"),
        capture_headers(&request_headers),
        body.to_vec(),
    );
    state.pusher.push(&sub, &update_id, &update).await?;
    Ok(StatusCode::OK)
}

/// DELETE /d/{updateToken}: acknowledge an update, delivering or storing a
/// receipt when one was requested.
async fn delete_update(
    State(state): State<AppState>,
    Path(update_token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.acknowledge(&update_token).await?;
    Ok(StatusCode::OK)
}

/// POST /receipts/{subToken}: create a receipt subscription.
async fn post_receipt_subscribe(
    State(state): State<AppState>,
    Path(sub_token): Path<String>,
) -> Result<Response, ApiError> {
    let plain = state.codec.unseal(&sub_token)?;
    let sub: SubId = plain
        .parse()
        .map_err(|_| ApiError::NotFound("nonexistent subscription".to_string()))?;
    let receipt_id = ReceiptId::generate();
    let receipt_token = state.codec.seal(&format!("{sub}:{receipt_id}"))?;

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/r/{receipt_token}"))
        .body(Body::empty())
        .map_err(|err| ApiError::Internal(err.to_string()))
}

/// GET /r/{receiptToken}: flush stored receipts, then hold the receipt
/// channel open.
async fn get_receipts(
    State(state): State<AppState>,
    Path(receipt_token): Path<String>,
    version: Version,
) -> Result<Response, ApiError> {
    require_push_support(version, "message receipts require push promises")?;
    let plain = state.codec.unseal(&receipt_token)?;
    let (sub, receipt_id) = parse_receipt_plain(&plain)?;

    let (channel, frames) = Channel::new();
    state
        .engine
        .open_receipt(&sub, &receipt_id, channel.clone())
        .await?;
    let guard = ChannelGuard::new(state.receipts.clone(), receipt_id.to_string(), channel);
    Ok(frame_response(frames, Some(guard)))
}

fn require_push_support(version: Version, message: &str) -> Result<(), ApiError> {
    if version < Version::HTTP_2 {
        return Err(ApiError::UnsupportedTransport(message.to_string()));
    }
    Ok(())
}

/// Validate a `Push-Receipt` URL against the target subscription, yielding
/// the receipt id it names.
fn resolve_receipt(state: &AppState, sub: &SubId, raw: &str) -> Result<ReceiptId, ApiError> {
    let token = headers::receipt_token_from_url(raw)
        .ok_or_else(|| ApiError::NotFound("invalid receipt URL".to_string()))?;
    let plain = state.codec.unseal(token)?;
    let (receipt_sub, receipt_id) = parse_receipt_plain(&plain)?;
    if receipt_sub != *sub {
        // The receipt subscription belongs to a different subscription.
        return Err(ApiError::Conflict("mismatched receipt URL".to_string()));
    }
    Ok(receipt_id)
}

fn seal_update_token(
    codec: &TokenCodec,
    sub: &SubId,
    update_id: &UpdateId,
    receipt_id: Option<&ReceiptId>,
) -> Result<String, ApiError> {
    let plain = match receipt_id {
        None => format!("{sub}:{update_id}"),
        Some(receipt_id) => format!("{sub}:{update_id}:{receipt_id}"),
    };
    Ok(codec.seal(&plain)?)
}

fn capture_headers(request_headers: &HeaderMap) -> Headers {
    FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            request_headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Streaming response carrying push frames as newline-delimited JSON. A
/// fronting HTTP/2 terminator maps each frame to a push promise. The guard,
/// when present, deregisters the channel on any exit path.
fn frame_response(frames: FrameReceiver, guard: Option<ChannelGuard>) -> Response {
    let body = FrameBody {
        frames,
        _guard: guard,
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

struct FrameBody {
    frames: FrameReceiver,
    _guard: Option<ChannelGuard>,
}

impl Stream for FrameBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.frames).poll_next(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(Bytes::from(frame.to_line())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
