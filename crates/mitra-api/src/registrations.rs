use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use mitra_gateway::Caller;
use mitra_types::api::{
    AttendanceRequest, Claims, CreateRegistrationRequest, ExitQrResponse, ExitResponse,
    InTimeRequest, OutTimeRequest, RegistrationEnvelope,
};

use crate::auth::AppState;
use crate::error::ApiError;

// -- Registration --

/// POST /api/registrations (volunteer self-registration)
pub async fn create_registration(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRegistrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let registration = state.actions.register_for_event(&caller, req.event_id).await?;
    Ok((StatusCode::CREATED, Json(RegistrationEnvelope { registration })))
}

/// GET /api/registrations/event/{event_id}
pub async fn list_registrations(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    Ok(Json(state.actions.list_registrations(&caller, event_id).await?))
}

/// GET /api/registrations/{id}/exit-qr
pub async fn exit_qr(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let exit_qr_token = state.actions.exit_qr_token(&caller, registration_id).await?;
    Ok(Json(ExitQrResponse { exit_qr_token }))
}

// -- Attendance --

/// PATCH /api/registrations/{id}/attendance
pub async fn set_attendance(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AttendanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let registration = state
        .actions
        .mark_attendance(&caller, registration_id, req.has_attended)
        .await?;
    Ok(Json(RegistrationEnvelope { registration }))
}

/// POST /api/registrations/exit/{exit_qr_token}
pub async fn exit(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let registration = state.actions.scan_exit(&caller, token).await?;
    let out_time = registration.out_time.ok_or_else(|| {
        tracing::error!("Exit for {} recorded without out_time", registration.registration_id);
        ApiError::Internal
    })?;
    Ok(Json(ExitResponse {
        registration_id: registration.registration_id,
        out_time,
    }))
}

/// PATCH /api/registrations/{id}/in-time
pub async fn set_in_time(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InTimeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let registration = state
        .actions
        .set_in_time(&caller, registration_id, req.in_time)
        .await?;
    Ok(Json(RegistrationEnvelope { registration }))
}

/// PATCH /api/registrations/{id}/out-time
pub async fn set_out_time(
    State(state): State<AppState>,
    Path(registration_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OutTimeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    let registration = state
        .actions
        .set_out_time(&caller, registration_id, req.out_time)
        .await?;
    Ok(Json(RegistrationEnvelope { registration }))
}

/// GET /api/registrations/event/{event_id}/stats
pub async fn stats(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = Caller::from_claims(&claims, None);
    Ok(Json(state.actions.attendance_stats(&caller, event_id).await?))
}
