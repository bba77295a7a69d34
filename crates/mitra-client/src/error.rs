use thiserror::Error;

use mitra_types::api::ErrorBody;
use mitra_types::rules::MAX_ATTACHMENT_BYTES;

/// How a failure should be presented and whether trying again can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: wrong file type or size, empty message. Fix and resend.
    Validation,
    /// Token rejected or action not permitted.
    Auth,
    /// Network, timeout, server failure. Retry by hand.
    Transient,
    /// Too many requests. Wait, then retry.
    RateLimited,
    /// A business rule said no: pin conflict, window expired, bad QR.
    Domain,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),

    #[error("file is larger than the {} MB limit", MAX_ATTACHMENT_BYTES / (1024 * 1024))]
    FileTooLarge,

    #[error("file type {0} is not allowed")]
    UnsupportedType(String),

    #[error("not connected")]
    Disconnected,

    #[error("server returned {status}: {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("{message}")]
    Domain { code: String, message: String },

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn domain(code: &str, message: impl Into<String>) -> Self {
        Self::Domain {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Build from a non-success HTTP status and the `{error, message}` body, if any.
    pub fn from_status(status: u16, body: Option<ErrorBody>) -> Self {
        let (code, message) = match body {
            Some(body) => (body.error, body.message),
            None => (String::new(), format!("HTTP {status}")),
        };
        match (status, code.as_str()) {
            (413, _) | (_, "too_large") => Self::FileTooLarge,
            (400, "unsupported_type") => Self::UnsupportedType(message),
            _ => Self::Http {
                status,
                code,
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::FileTooLarge | Self::UnsupportedType(_) => {
                ErrorKind::Validation
            }
            Self::Disconnected | Self::Network(_) | Self::Decode(_) => ErrorKind::Transient,
            Self::Http { status, .. } => match *status {
                401 | 403 => ErrorKind::Auth,
                429 => ErrorKind::RateLimited,
                400 | 413 | 422 => ErrorKind::Validation,
                s if s >= 500 => ErrorKind::Transient,
                _ => ErrorKind::Domain,
            },
            Self::Domain { code, .. } => match code.as_str() {
                "unauthorized" | "forbidden" => ErrorKind::Auth,
                "invalid_message" => ErrorKind::Validation,
                "storage" | "internal" => ErrorKind::Transient,
                _ => ErrorKind::Domain,
            },
            Self::Cancelled => ErrorKind::Domain,
        }
    }

    /// Whether the same request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }

    /// Machine code, when the server supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Http { code, .. } | Self::Domain { code, .. } if !code.is_empty() => Some(code.as_str()),
            _ => None,
        }
    }

    /// Text for the notice shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::FileTooLarge => format!(
                "File is too large. Maximum size is {} MB.",
                MAX_ATTACHMENT_BYTES / (1024 * 1024)
            ),
            Self::UnsupportedType(_) => "This file type is not supported.".into(),
            Self::Validation(msg) => msg.clone(),
            Self::Disconnected => "You are offline. Reconnect and try again.".into(),
            Self::Network(_) => "Network error. Check your connection and try again.".into(),
            Self::Decode(_) => "Unexpected response from the server. Please try again.".into(),
            Self::Cancelled => "Upload cancelled.".into(),
            Self::Http {
                status, message, ..
            } => match *status {
                401 => "Your session has expired. Please log in again.".into(),
                403 => "You are not allowed to do this.".into(),
                429 => "Too many requests. Please wait a moment and try again.".into(),
                s if s >= 500 => "The server had a problem. Please try again.".into(),
                _ => message.clone(),
            },
            Self::Domain { message, .. } => message.clone(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: &str, message: &str) -> Option<ErrorBody> {
        Some(ErrorBody {
            error: code.into(),
            message: message.into(),
        })
    }

    #[test]
    fn upload_failures_are_classified() {
        let too_large = ClientError::from_status(413, None);
        assert_eq!(too_large.kind(), ErrorKind::Validation);
        assert!(!too_large.is_retryable());
        assert!(too_large.user_message().contains("10 MB"));

        let bad_type = ClientError::from_status(400, body("unsupported_type", "file type x"));
        assert!(matches!(bad_type, ClientError::UnsupportedType(_)));
        assert!(!bad_type.is_retryable());

        let auth = ClientError::from_status(401, None);
        assert_eq!(auth.kind(), ErrorKind::Auth);
        assert!(auth.user_message().contains("log in again"));

        let limited = ClientError::from_status(429, None);
        assert_eq!(limited.kind(), ErrorKind::RateLimited);
        assert!(limited.is_retryable());

        let server = ClientError::from_status(503, None);
        assert_eq!(server.kind(), ErrorKind::Transient);
        assert!(server.is_retryable());

        let network = ClientError::Network("connection reset".into());
        assert!(network.is_retryable());
        assert_ne!(network.user_message(), server.user_message());
    }

    #[test]
    fn conflicts_keep_the_server_message() {
        let conflict = ClientError::from_status(409, body("pin_conflict", "another message is already pinned"));
        assert_eq!(conflict.kind(), ErrorKind::Domain);
        assert_eq!(conflict.code(), Some("pin_conflict"));
        assert_eq!(conflict.user_message(), "another message is already pinned");
    }
}
