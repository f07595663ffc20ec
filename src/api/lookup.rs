//! Object lookup endpoint

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct ShowQuery {
    pub uri: String,
}

/// Create lookup router
///
/// Routes:
/// - GET /ap/show?uri=... - Resolve a URI to a user or note
pub fn lookup_router() -> Router<AppState> {
    Router::new().route("/ap/show", get(show))
}

/// GET /ap/show
///
/// Returns `{ type, object }` for a known or fetchable object, 404 otherwise.
async fn show(
    State(state): State<AppState>,
    Query(query): Query<ShowQuery>,
) -> Result<Json<Value>, AppError> {
    let uri = query.uri.trim();
    if uri.is_empty() {
        return Err(AppError::Validation("uri is required".to_string()));
    }

    let result = state.lookup.lookup(uri).await?.ok_or(AppError::NotFound)?;
    Ok(Json(result.to_json()))
}
