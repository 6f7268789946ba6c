use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use responder_module::dispatcher::PullError;
use responder_module::notification_queue::EnqueueOutcome;
use responder_module::push_auth::decode_push_payload;

use super::state::{bearer_token, verify_service_token, GatewayState};

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Signed push notifications from the mail provider. Verification order
/// matters: auth, payload, user resolution, rate limit, dedupe, enqueue.
pub(super) async fn gmail_notifications(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "missing_token"})),
        );
    };
    if let Err(err) = state.verifier.verify(token).await {
        warn!("push token rejected: {}", err);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "auth_failed"})),
        );
    }

    let notification = match decode_push_payload(&body) {
        Ok(notification) => notification,
        Err(err) => {
            warn!("bad push payload: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "bad_payload"})),
            );
        }
    };

    let connection = match state
        .dispatcher
        .connections
        .find_by_mail_address(&notification.mail_address)
    {
        Ok(Some(connection)) => connection,
        Ok(None) => {
            // Unknown or already-disconnected mailbox. Acknowledge so the
            // sender does not retry-storm us.
            info!("no connection for {}, ignoring", notification.mail_address);
            return (StatusCode::OK, Json(json!({"status": "ignored"})));
        }
        Err(err) => {
            warn!("connection lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "lookup_failed"})),
            );
        }
    };

    if !state.limiter.allow(connection.user_id) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"status": "rate_limited"})),
        );
    }

    let outcome = state.dispatcher.queue.enqueue(
        connection.user_id,
        &notification.mail_address,
        notification.history_id as i64,
    );
    match outcome {
        Ok(EnqueueOutcome::Duplicate) => {
            (StatusCode::OK, Json(json!({"status": "duplicate"})))
        }
        Ok(EnqueueOutcome::Enqueued(entry_id)) => {
            state.dispatcher.dispatch_entry(entry_id);
            (StatusCode::OK, Json(json!({"status": "accepted"})))
        }
        Err(err) => {
            warn!("enqueue failed for {}: {}", notification.mail_address, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "enqueue_failed"})),
            )
        }
    }
}

pub(super) async fn sync_connection(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(reason) = verify_service_token(&headers, &state.config.service_api_token) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": reason})));
    }

    match state.dispatcher.pull_now(user_id).await {
        Ok(summary) => (StatusCode::OK, Json(json!(summary))),
        Err(PullError::NoConnection) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "unknown_user"})),
        ),
        Err(err) => {
            warn!("manual pull failed for {}: {}", user_id, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "sync_failed", "error": err.to_string()})),
            )
        }
    }
}

pub(super) async fn disconnect_connection(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(reason) = verify_service_token(&headers, &state.config.service_api_token) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": reason})));
    }

    match state.dispatcher.disconnect(user_id).await {
        Ok(()) => {
            state.limiter.reset(user_id);
            (StatusCode::OK, Json(json!({"status": "disconnected"})))
        }
        Err(PullError::NoConnection) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "unknown_user"})),
        ),
        Err(err) => {
            warn!("disconnect failed for {}: {}", user_id, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "disconnect_failed"})),
            )
        }
    }
}
