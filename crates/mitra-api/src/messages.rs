use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use mitra_gateway::Caller;
use mitra_types::api::{Claims, MessageQuery, PinRequest};
use mitra_types::rules::{MAX_PAGE_SIZE, PAGE_SIZE};

use crate::auth::AppState;
use crate::error::ApiError;

/// GET /api/chatbox/events/{event_id}/messages?limit=20&before=<message_id>
///
/// Cursor pagination on message ids. The page is ordered oldest to newest.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let messages = state.actions.history(event_id, query.before, limit).await?;
    Ok(Json(messages))
}

/// GET /api/chatbox/events/{event_id}/pinned
pub async fn get_pinned(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.actions.pinned(event_id).await?))
}

/// PATCH /api/chatbox/messages/{message_id}/pin
pub async fn pin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let message = state
        .actions
        .pin_message(&caller, req.event_id, message_id, req.pinned)
        .await?;
    Ok(Json(message))
}
