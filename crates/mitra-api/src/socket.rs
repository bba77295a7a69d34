use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use serde::Deserialize;

use mitra_gateway::connection;

use crate::auth::{AppState, verify_token};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// GET /socket?token=<jwt>. The token is checked before the upgrade, so an
/// unauthenticated client never gets a socket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let token = match (&query.token, &bearer) {
        (Some(token), _) => token.as_str(),
        (None, Some(TypedHeader(Authorization(bearer)))) => bearer.token(),
        (None, None) => return Err(ApiError::Unauthorized),
    };
    let claims = verify_token(&state.jwt_secret, token)?;

    let actions = state.actions.clone();
    let heartbeat = state.heartbeat;
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, actions, claims, heartbeat)
    }))
}
