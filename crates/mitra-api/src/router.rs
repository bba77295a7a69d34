use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use mitra_types::api::HealthResponse;
use mitra_types::rules::MAX_ATTACHMENT_BYTES;

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::{files, messages, registrations, socket};

/// Multipart framing on top of the largest accepted attachment.
const UPLOAD_BODY_LIMIT: usize = MAX_ATTACHMENT_BYTES as usize + 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/socket", get(socket::ws_upgrade))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/chatbox/events/{event_id}/messages", get(messages::get_messages))
        .route("/api/chatbox/events/{event_id}/pinned", get(messages::get_pinned))
        .route("/api/chatbox/messages/{message_id}/pin", patch(messages::pin_message))
        .route(
            "/api/chatbox/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/api/chatbox/files/{file_id}", get(files::download_file))
        .route("/api/registrations", post(registrations::create_registration))
        .route("/api/registrations/event/{event_id}", get(registrations::list_registrations))
        .route("/api/registrations/event/{event_id}/stats", get(registrations::stats))
        .route("/api/registrations/exit/{exit_qr_token}", post(registrations::exit))
        .route("/api/registrations/{registration_id}/exit-qr", get(registrations::exit_qr))
        .route("/api/registrations/{registration_id}/attendance", patch(registrations::set_attendance))
        .route("/api/registrations/{registration_id}/in-time", patch(registrations::set_in_time))
        .route("/api/registrations/{registration_id}/out-time", patch(registrations::set_out_time))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let dispatcher = state.actions.dispatcher();
    Json(HealthResponse {
        status: "ok".into(),
        connections: dispatcher.connection_count().await,
        rooms: dispatcher.room_count().await,
    })
}
