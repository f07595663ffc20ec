//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (signed delivery intake)
//! - Outbox (paginated collection)

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::Value;

use crate::AppState;
use crate::data::{EntityId, LocalUser};
use crate::error::AppError;
use crate::federation::{
    DeliveryEnvelope, OutboxQuery, SignatureParams, render_activity, render_person,
};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Content type of every federation response
pub const ACTIVITY_JSON: &str = "application/activity+json; charset=utf-8";

const OUTBOX_CACHE_CONTROL: &str = "private, max-age=0, must-revalidate";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:id - Actor document
/// - POST /users/:id/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:id/outbox - Outbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:id", get(actor))
        .route("/users/:id/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:id/outbox", get(outbox))
}

fn activity_json(status: StatusCode, body: Option<&Value>) -> Response {
    let content_type = HeaderValue::from_static(ACTIVITY_JSON);
    match body {
        Some(body) => (status, [(header::CONTENT_TYPE, content_type)], body.to_string()).into_response(),
        None => (status, [(header::CONTENT_TYPE, content_type)]).into_response(),
    }
}

async fn find_federated_user(state: &AppState, id: &str) -> Result<LocalUser, AppError> {
    let id = EntityId::parse(id).ok_or(AppError::NotFound)?;
    state
        .db
        .get_user(&id.0)
        .await?
        .filter(LocalUser::is_federated)
        .ok_or(AppError::NotFound)
}

/// GET /users/:id
///
/// Returns the ActivityPub actor document of a local user.
async fn actor(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:id"])
        .start_timer();

    match find_federated_user(&state, &id).await {
        Ok(user) => {
            let document = render_activity(render_person(&state.config.server.base_url(), &user));
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["GET", "/users/:id", "200"])
                .inc();
            activity_json(StatusCode::OK, Some(&document))
        }
        Err(e) => e.into_bodyless_response(),
    }
}

/// POST /users/:id/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    find_federated_user(&state, &id).await?;
    accept_delivery(&state, "/users/:id/inbox", &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    accept_delivery(&state, "/inbox", &uri, &headers, &body).await
}

/// Check the signature envelope of a delivery and queue it
///
/// # Steps
/// 1. Parse the Signature header and rebuild the signing string
/// 2. Check Date and Digest
/// 3. Parse the body as a JSON object
/// 4. Enqueue and answer 202 before the signature is verified
async fn accept_delivery(
    state: &AppState,
    endpoint: &str,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", endpoint])
        .start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let signature_params = match SignatureParams::from_request("POST", path_and_query, headers, body) {
        Ok(params) => params,
        Err(e) => {
            let status = if matches!(e, AppError::Unauthorized) {
                "unauthorized"
            } else {
                "invalid"
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            tracing::debug!(endpoint, error = %e, "Rejected inbox request");
            return Err(e);
        }
    };

    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    if !activity.is_object() {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "invalid"])
            .inc();
        return Err(AppError::Validation(
            "Activity must be a JSON object".to_string(),
        ));
    }

    state
        .inbox_queue
        .enqueue(DeliveryEnvelope {
            signature_params,
            activity,
        })
        .await?;

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "accepted"])
        .inc();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "202"])
        .inc();

    Ok(activity_json(StatusCode::ACCEPTED, None))
}

/// GET /users/:id/outbox
///
/// Without `page=true` returns the collection index; otherwise one page.
/// Client errors are answered without a body.
async fn outbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OutboxQuery>,
) -> Response {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:id/outbox"])
        .start_timer();

    match state.outbox.render(&id, &query).await {
        Ok(document) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["GET", "/users/:id/outbox", "200"])
                .inc();
            let mut response = activity_json(StatusCode::OK, Some(&document));
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(OUTBOX_CACHE_CONTROL),
            );
            response
        }
        Err(e) => {
            tracing::debug!(user_id = %id, error = %e, "Outbox request failed");
            e.into_bodyless_response()
        }
    }
}
