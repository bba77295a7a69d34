use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("only the sender can change this message")]
    NotSender,

    #[error("messages can only be changed within 5 minutes of sending")]
    EditWindowClosed,

    #[error("this message was already edited")]
    AlreadyEdited,

    #[error("another message is already pinned in this event")]
    PinConflict,

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("volunteer is already registered for this event")]
    AlreadyRegistered,

    #[error("attendance cannot be cleared once an entry time is recorded")]
    AttendanceLocked,

    #[error("entry has not been recorded for this registration")]
    NotCheckedIn,

    #[error("volunteer has already checked out")]
    AlreadyCheckedOut,

    #[error("exit QR code was already used")]
    ExitTokenUsed,

    #[error("out time cannot be earlier than in time")]
    InvalidTimes,

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Stable machine-readable code, shared by HTTP bodies and socket `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotSender => "not_sender",
            Self::EditWindowClosed => "edit_window_closed",
            Self::AlreadyEdited => "already_edited",
            Self::PinConflict => "pin_conflict",
            Self::InvalidMessage(_) => "invalid_message",
            Self::AlreadyRegistered => "already_registered",
            Self::AttendanceLocked => "attendance_locked",
            Self::NotCheckedIn => "not_checked_in",
            Self::AlreadyCheckedOut => "already_checked_out",
            Self::ExitTokenUsed => "exit_token_used",
            Self::InvalidTimes => "invalid_times",
            Self::Poisoned | Self::Corrupt(_) | Self::Sqlite(_) => "storage",
        }
    }

    /// Storage failures as opposed to rule violations.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Poisoned | Self::Corrupt(_) | Self::Sqlite(_))
    }
}
