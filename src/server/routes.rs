//! HTTP routes served identically on every listener.
//!
//! - `GET /` viewer page (behind auth)
//! - `GET /stream` MJPEG stream (behind auth)
//! - `GET /status` JSON status endpoint

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::debug;

use super::listener::PeerAddr;
use super::stream::{frame_parts, ClientSession, ClientStats, BOUNDARY};
use crate::auth::AuthGate;
use crate::capture::CaptureStatus;
use crate::config::Transport;
use crate::error::AuthError;
use crate::frame::SharedFrameBuffer;

/// Handles shared by all listeners, plus which listener this router is for
#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<SharedFrameBuffer>,
    pub gate: Arc<AuthGate>,
    pub capture: Arc<CaptureStatus>,
    pub clients: Arc<ClientStats>,
    pub transport: Transport,
    pub port: u16,
    pub stream_poll: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .route("/status", get(status))
        .fallback(not_found)
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match state.gate.verify(request.method().as_str(), uri, authorization) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
            unauthorized(&state.gate, e == AuthError::StaleNonce)
        }
    }
}

fn unauthorized(gate: &AuthGate, stale: bool) -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "401 Unauthorized\n").into_response();
    if let Some(challenge) = gate.challenge(stale) {
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

async fn stream(State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<PeerAddr>) -> Response {
    let session = ClientSession::open(Arc::clone(&state.clients), peer.0, state.transport);
    let body = Body::from_stream(frame_parts(Arc::clone(&state.buffer), session, state.stream_poll));

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        body,
    )
        .into_response()
}

#[derive(Serialize)]
struct StatusReport {
    status: &'static str,
    sequence: u64,
    last_frame_at: Option<String>,
    source: String,
    degraded: bool,
    frames_captured: u64,
    capture_failures: u64,
    clients_active: usize,
    clients_total: u64,
    frames_sent: u64,
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let latest = state.buffer.latest();
    let status = match (&latest, state.buffer.is_closed()) {
        (_, true) => "stopping",
        (None, false) => "starting",
        (Some(_), false) if state.capture.degraded() => "degraded",
        (Some(_), false) => "streaming",
    };

    Json(StatusReport {
        status,
        sequence: latest.as_ref().map_or(0, |f| f.seq),
        last_frame_at: latest.as_ref().map(|f| f.captured_at.to_rfc3339()),
        source: state.capture.source(),
        degraded: state.capture.degraded(),
        frames_captured: state.capture.frames_captured(),
        capture_failures: state.capture.capture_failures(),
        clients_active: state.clients.active(),
        clients_total: state.clients.total(),
        frames_sent: state.clients.frames_sent(),
    })
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(index_page(state.transport, state.port))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 Not Found\n")
}

fn index_page(transport: Transport, port: u16) -> String {
    let protocol = transport.scheme().to_uppercase();
    let notice = match transport {
        Transport::Secure => {
            "<p class=\"note\">This server uses a self-signed certificate. \
             Your browser may ask you to accept it before the stream loads.</p>"
        }
        Transport::Plain => "",
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Virtual Security Camera</title>
<style>
body {{ font-family: sans-serif; background: #111; color: #eee; text-align: center; }}
img {{ max-width: 100%; border: 2px solid #444; }}
.note {{ color: #fc6; }}
</style>
</head>
<body>
<h1>Virtual Security Camera</h1>
<p>Live MJPEG stream over {protocol} on port {port}</p>
{notice}
<img src="/stream" alt="Live camera stream">
<p><a href="/status">Stream status</a></p>
</body>
</html>
"#
    )
}
