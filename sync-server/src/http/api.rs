//! Sync API handlers: push, pull, status and the change stream.

use crate::auth::AuthUser;
use crate::error::{ApiError, HubError};
use crate::server::SyncServer;
use crate::session::Session;
use axum::body::Bytes;
use axum::extract::Query;
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use sync_types::{decode, encode, DeviceId, PullRequest, PushRequest, CONTENT_TYPE_MSGPACK};

/// `POST /v1/push`: MessagePack [`PushRequest`] in, `PushResponse` out.
pub async fn push_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Extension(user): Extension<AuthUser>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: PushRequest =
        decode(&body).map_err(|e| ApiError::BadRequest(format!("invalid push body: {e}")))?;

    let response = within_timeout(&server, server.accept_batch(&user, request)).await??;
    msgpack(&response)
}

/// `POST /v1/pull`: MessagePack [`PullRequest`] in, `PullResponse` out.
pub async fn pull_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Extension(user): Extension<AuthUser>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: PullRequest =
        decode(&body).map_err(|e| ApiError::BadRequest(format!("invalid pull body: {e}")))?;

    let response = within_timeout(&server, server.get_changes(&user.family_id, request)).await??;
    msgpack(&response)
}

/// `GET /v1/status`: JSON diagnostic snapshot of the caller's family.
pub async fn status_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    let status = within_timeout(&server, server.status(&user.family_id)).await??;
    Ok(Json(status).into_response())
}

/// Query parameters of the change stream.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Device opening the stream.
    pub device_id: DeviceId,
}

/// `GET /v1/stream`: server-sent change hints for the caller's family.
pub async fn stream_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    if server.hub().is_draining() {
        return Err(HubError::Draining.into());
    }

    let head = server.head(&user.family_id).await?;
    let mut session = Session::connect(Arc::clone(server.hub()), &user, params.device_id);
    session.open(head)?;
    server.session_opened();

    let keep_alive = KeepAlive::new()
        .interval(server.config().hub.keep_alive())
        .text("keep-alive");
    Ok(Sse::new(session.into_event_stream())
        .keep_alive(keep_alive)
        .into_response())
}

async fn within_timeout<F: Future>(server: &SyncServer, work: F) -> Result<F::Output, ApiError> {
    let timeout = server.config().server.request_timeout();
    tokio::time::timeout(timeout, work).await.map_err(|_| {
        tracing::warn!("Request exceeded {:?}", timeout);
        ApiError::Unavailable("request timed out".to_string())
    })
}

fn msgpack<T: Serialize>(message: &T) -> Result<Response, ApiError> {
    let bytes = encode(message).map_err(|e| {
        tracing::error!("Failed to encode response: {}", e);
        ApiError::Internal
    })?;
    Ok(([(CONTENT_TYPE, CONTENT_TYPE_MSGPACK)], bytes).into_response())
}
