use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use mitra_db::StoreError;
use mitra_gateway::ActionError;
use mitra_types::api::ErrorBody;
use mitra_types::rules::MAX_ATTACHMENT_BYTES;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("missing or invalid token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("file is larger than the {} MB limit", MAX_ATTACHMENT_BYTES / (1024 * 1024))]
    PayloadTooLarge,

    #[error("file type {0} is not allowed")]
    UnsupportedType(String),

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Action(ActionError::Store(e))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Action(e) => action_status(e),
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::UnsupportedType(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Action(e) => e.code(),
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge => "too_large",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

fn action_status(e: &ActionError) -> StatusCode {
    match e {
        ActionError::NotJoined | ActionError::NotOrganizer | ActionError::NotOwner => {
            StatusCode::FORBIDDEN
        }
        ActionError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ActionError::Store(e) => match e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::NotSender => StatusCode::FORBIDDEN,
            StoreError::InvalidMessage(_) | StoreError::InvalidTimes => StatusCode::BAD_REQUEST,
            StoreError::EditWindowClosed
            | StoreError::AlreadyEdited
            | StoreError::PinConflict
            | StoreError::AlreadyRegistered
            | StoreError::AttendanceLocked
            | StoreError::NotCheckedIn
            | StoreError::AlreadyCheckedOut
            | StoreError::ExitTokenUsed => StatusCode::CONFLICT,
            StoreError::Poisoned | StoreError::Corrupt(_) | StoreError::Sqlite(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Action(e) => e.public_message(),
            Self::Internal => "something went wrong, please try again".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
