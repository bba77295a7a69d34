//! Chat and attendance rules shared by the store and the client.
//!
//! The store is the authority; the client evaluates the same predicates only
//! to hide or disable actions ahead of time.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::Message;

/// History page size, also the `hasMore` threshold.
pub const PAGE_SIZE: usize = 20;

/// Upper bound accepted for `limit` on the history endpoint.
pub const MAX_PAGE_SIZE: usize = 100;

/// Longest accepted message text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// 10 MB attachment limit.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Edits and unsends are allowed for five minutes after sending.
pub fn edit_window() -> Duration {
    Duration::minutes(5)
}

/// Maximum number of edits per message.
pub const MAX_EDITS: u8 = 1;

/// Mime types accepted as chat attachments. Entries ending in `/` are prefixes.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/",
    "video/mp4",
    "audio/mpeg",
    "application/pdf",
    "text/plain",
    "text/csv",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/zip",
];

pub fn is_allowed_mime(mime: &str) -> bool {
    let mime = mime.trim().to_ascii_lowercase();
    ALLOWED_MIME_TYPES.iter().any(|allowed| {
        if allowed.ends_with('/') {
            mime.starts_with(allowed)
        } else {
            mime == *allowed
        }
    })
}

/// True while `now` is no more than five minutes past `created_at`.
pub fn within_edit_window(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(created_at) <= edit_window()
}

/// Sender owns the message, is still an active account, and the window is open.
pub fn can_unsend_message(message: &Message, caller: Uuid, now: DateTime<Utc>) -> bool {
    message.sender.active_id() == Some(caller) && within_edit_window(message.created_at, now)
}

/// Unsend rules plus the single-edit limit. Attachment-only messages have no
/// text to edit.
pub fn can_edit_message(message: &Message, caller: Uuid, now: DateTime<Utc>) -> bool {
    can_unsend_message(message, caller, now)
        && message.edit_count < MAX_EDITS
        && message.text.is_some()
}
