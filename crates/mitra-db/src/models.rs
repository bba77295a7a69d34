//! Database row types. These map directly to SQLite rows and are converted
//! into mitra-types models at the edge of each query.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use mitra_types::models::{Attachment, DELETED_USER_NAME, Message, Reaction, Registration, User};

use crate::StoreError;

pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
}

pub fn parse_uuid(raw: &str, column: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("{column} '{raw}'")))
}

/// Column list matching [`MessageRow::from_row`]. Expects `messages m` joined
/// with `users u` on the sender.
pub const MESSAGE_COLUMNS: &str = "m.id, m.event_id, m.sender_id, m.sender_name, u.name, u.deleted_at, \
     m.text, m.created_at, m.edited_at, m.edit_count, m.is_pinned, m.reply_to, \
     m.attachment_url, m.attachment_name, m.attachment_mime, m.attachment_size";

pub struct MessageRow {
    pub id: String,
    pub event_id: String,
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub user_name: Option<String>,
    pub user_deleted_at: Option<i64>,
    pub text: Option<String>,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub edit_count: i64,
    pub is_pinned: bool,
    pub reply_to: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<i64>,
}

impl MessageRow {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            sender_id: row.get(2)?,
            sender_name: row.get(3)?,
            user_name: row.get(4)?,
            user_deleted_at: row.get(5)?,
            text: row.get(6)?,
            created_at: row.get(7)?,
            edited_at: row.get(8)?,
            edit_count: row.get(9)?,
            is_pinned: row.get(10)?,
            reply_to: row.get(11)?,
            attachment_url: row.get(12)?,
            attachment_name: row.get(13)?,
            attachment_mime: row.get(14)?,
            attachment_size: row.get(15)?,
        })
    }

    fn sender(&self) -> Result<User, StoreError> {
        let Some(raw) = self.sender_id.as_deref() else {
            let name = if self.sender_name.is_empty() {
                DELETED_USER_NAME.to_string()
            } else {
                self.sender_name.clone()
            };
            return Ok(User::Deleted {
                id: None,
                last_known_name: name,
            });
        };
        let id = parse_uuid(raw, "sender_id")?;
        match (&self.user_name, self.user_deleted_at) {
            (Some(name), None) => Ok(User::Active {
                id,
                name: name.clone(),
            }),
            (name, _) => Ok(User::Deleted {
                id: Some(id),
                last_known_name: name.clone().unwrap_or_else(|| self.sender_name.clone()),
            }),
        }
    }

    pub fn into_message(self, reactions: Vec<Reaction>) -> Result<Message, StoreError> {
        let sender = self.sender()?;
        let attachment = match (self.attachment_url, self.attachment_name) {
            (Some(url), Some(filename)) => Some(Attachment {
                url,
                filename,
                mime_type: self
                    .attachment_mime
                    .unwrap_or_else(|| "application/octet-stream".into()),
                size_bytes: self.attachment_size.unwrap_or(0).max(0) as u64,
            }),
            _ => None,
        };
        Ok(Message {
            id: parse_uuid(&self.id, "id")?,
            event_id: parse_uuid(&self.event_id, "event_id")?,
            sender,
            text: self.text,
            created_at: from_millis(self.created_at)?,
            edited_at: self.edited_at.map(from_millis).transpose()?,
            edit_count: self.edit_count.clamp(0, u8::MAX as i64) as u8,
            is_pinned: self.is_pinned,
            reply_to_message_id: self
                .reply_to
                .as_deref()
                .map(|r| parse_uuid(r, "reply_to"))
                .transpose()?,
            reactions,
            attachment,
        })
    }
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

impl ReactionRow {
    pub fn into_reaction(self) -> Result<Reaction, StoreError> {
        Ok(Reaction {
            user_id: parse_uuid(&self.user_id, "user_id")?,
            emoji: self.emoji,
        })
    }
}

pub struct UploadRow {
    pub id: String,
    pub uploader_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub created_at: i64,
}

pub const REGISTRATION_COLUMNS: &str =
    "id, event_id, volunteer_id, has_attended, in_time, out_time, exit_qr_token";

pub struct RegistrationRow {
    pub id: String,
    pub event_id: String,
    pub volunteer_id: String,
    pub has_attended: bool,
    pub in_time: Option<i64>,
    pub out_time: Option<i64>,
    pub exit_qr_token: Option<String>,
}

impl RegistrationRow {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            volunteer_id: row.get(2)?,
            has_attended: row.get(3)?,
            in_time: row.get(4)?,
            out_time: row.get(5)?,
            exit_qr_token: row.get(6)?,
        })
    }

    pub fn into_registration(self) -> Result<Registration, StoreError> {
        Ok(Registration {
            registration_id: parse_uuid(&self.id, "id")?,
            event_id: parse_uuid(&self.event_id, "event_id")?,
            volunteer_user_id: parse_uuid(&self.volunteer_id, "volunteer_id")?,
            has_attended: self.has_attended,
            in_time: self.in_time.map(from_millis).transpose()?,
            out_time: self.out_time.map(from_millis).transpose()?,
            exit_qr_token: self.exit_qr_token,
        })
    }
}
