//! HTTP bridge using axum.
//!
//! `GET /?id=<id>` claims the tunnel with that id and streams the shell
//! client's bytes back as the response body. The body ends when the shell
//! side fires its completion signal; a failed tunnel aborts the body instead
//! of ending it cleanly, so the viewer can tell a truncated transfer apart.

use crate::relay::TunnelRegistry;
use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use shtun_core::{handoff, HandoffReceiver, TunnelError, TunnelId, TunnelOutcome, TunnelResult};
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const TUNNEL_NOT_FOUND: &str = "tunnel does not exist.";
pub const INVALID_TUNNEL_ID: &str = "invalid tunnel id.";

/// Shared state for the bridge handler.
#[derive(Clone)]
pub struct BridgeState {
    pub registry: Arc<TunnelRegistry>,
    pub buffer_chunks: usize,
}

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    id: Option<String>,
}

/// Build the bridge router.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/", get(open_tunnel))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the bridge on an already bound listener.
pub async fn serve(listener: TcpListener, state: BridgeState) -> TunnelResult<()> {
    axum::serve(listener, router(state))
        .await
        .map_err(|e| TunnelError::Transport(format!("HTTP server failed: {e}")))
}

fn parse_tunnel_id(raw: Option<&str>) -> TunnelResult<TunnelId> {
    match raw {
        Some(raw) => raw.parse(),
        None => Err(TunnelError::BadRequest("missing id parameter".into())),
    }
}

async fn open_tunnel(
    State(state): State<BridgeState>,
    query: Result<Query<TunnelQuery>, QueryRejection>,
) -> Response {
    let parsed = match query {
        Ok(Query(query)) => parse_tunnel_id(query.id.as_deref()),
        Err(e) => Err(TunnelError::BadRequest(e.body_text())),
    };
    let id = match parsed {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "rejecting tunnel request");
            return (StatusCode::BAD_REQUEST, INVALID_TUNNEL_ID).into_response();
        }
    };

    let slot = match state.registry.lookup_and_consume(id) {
        Ok(slot) => slot,
        Err(e) => {
            debug!(error = %e, "tunnel lookup failed");
            return (StatusCode::NOT_FOUND, TUNNEL_NOT_FOUND).into_response();
        }
    };

    let (handoff, receiver) = handoff::channel(state.buffer_chunks);
    if let Err(e) = slot.deliver(handoff) {
        info!(tunnel = %id, error = %e, "shell left before the viewer arrived");
        return (StatusCode::NOT_FOUND, TUNNEL_NOT_FOUND).into_response();
    }
    info!(tunnel = %id, "viewer connected");

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(tunnel_body(id, receiver)),
    )
        .into_response()
}

/// Chunks from the shell side, then the completion outcome.
fn tunnel_body(
    id: TunnelId,
    receiver: HandoffReceiver,
) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + 'static {
    stream::unfold(Some(receiver), move |receiver| async move {
        let mut receiver = receiver?;
        if let Some(chunk) = receiver.next_chunk().await {
            return Some((Ok(chunk), Some(receiver)));
        }
        match receiver.outcome().await {
            TunnelOutcome::Completed { bytes } => {
                info!(tunnel = %id, bytes, "viewer stream finished");
                None
            }
            TunnelOutcome::Failed(reason) => {
                warn!(tunnel = %id, reason = %reason, "aborting viewer stream");
                Some((Err(io::Error::other(reason)), None))
            }
            TunnelOutcome::Aborted => {
                warn!(tunnel = %id, "shell side vanished, aborting viewer stream");
                Some((Err(io::Error::other("tunnel aborted")), None))
            }
        }
    })
}
