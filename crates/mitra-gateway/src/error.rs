use thiserror::Error;

use mitra_db::StoreError;

/// Failure of a chat or attendance action, whichever surface started it.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("join the event room first")]
    NotJoined,

    #[error("only organizers can do this")]
    NotOrganizer,

    #[error("this registration belongs to another volunteer")]
    NotOwner,

    #[error("internal error")]
    Internal,
}

impl ActionError {
    /// Machine-readable code for socket `error` events and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::NotJoined => "not_joined",
            Self::NotOrganizer | Self::NotOwner => "forbidden",
            Self::Internal => "internal",
        }
    }

    pub fn is_internal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_internal(),
            Self::Internal => true,
            _ => false,
        }
    }

    /// Text safe to show the user. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "something went wrong, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}
