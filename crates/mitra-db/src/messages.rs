use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use mitra_types::models::{Attachment, Message, Reaction};
use mitra_types::rules::{self, MAX_EDITS, MAX_MESSAGE_CHARS, MAX_PAGE_SIZE};

use crate::models::{MESSAGE_COLUMNS, MessageRow, ReactionRow, to_millis};
use crate::queries::upsert_user;
use crate::{Database, StoreError};

/// A message about to be stored. Exactly one of `text` / `attachment`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub event_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<Uuid>,
}

/// Outcome of a reaction toggle.
#[derive(Debug, Clone)]
pub struct ReactionToggle {
    pub added: bool,
    pub event_id: Uuid,
    pub reactions: Vec<Reaction>,
}

impl Database {
    // -- Messages --

    pub fn insert_message(&self, new: NewMessage, now: DateTime<Utc>) -> Result<Message, StoreError> {
        let text = validate_content(new.text.as_deref(), new.attachment.as_ref())?;
        let id = Uuid::new_v4();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            upsert_user(&tx, new.sender_id, &new.sender_name)?;

            if let Some(reply_to) = new.reply_to {
                let target = query_message(&tx, reply_to)?;
                if target.map(|m| m.event_id) != Some(new.event_id) {
                    return Err(StoreError::NotFound("reply target"));
                }
            }

            let att = new.attachment.as_ref();
            tx.execute(
                "INSERT INTO messages (id, event_id, sender_id, sender_name, text, created_at, reply_to,
                     attachment_url, attachment_name, attachment_mime, attachment_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    id.to_string(),
                    new.event_id.to_string(),
                    new.sender_id.to_string(),
                    new.sender_name,
                    text,
                    to_millis(now),
                    new.reply_to.map(|r| r.to_string()),
                    att.map(|a| a.url.as_str()),
                    att.map(|a| a.filename.as_str()),
                    att.map(|a| a.mime_type.as_str()),
                    att.map(|a| a.size_bytes as i64),
                ],
            )?;

            let message = query_message(&tx, id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// A live (not unsent) message.
    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// One history page, oldest first. With `before`, the page ends right
    /// before that message (which may itself have been unsent since).
    pub fn list_messages(
        &self,
        event_id: Uuid,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.with_conn(|conn| {
            let cursor = match before {
                Some(before) => conn
                    .query_row(
                        "SELECT seq FROM messages WHERE id = ?1 AND event_id = ?2",
                        [before.to_string(), event_id.to_string()],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?
                    .ok_or(StoreError::NotFound("cursor message"))?,
                None => i64::MAX,
            };

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.event_id = ?1 AND m.unsent_at IS NULL AND m.seq < ?2
                 ORDER BY m.seq DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    rusqlite::params![event_id.to_string(), cursor, limit as i64],
                    MessageRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let mut reactions = load_reactions(conn, &ids)?;

            rows.into_iter()
                .map(|row| {
                    let r = reactions.remove(&row.id).unwrap_or_default();
                    row.into_message(r)
                })
                .collect()
        })
    }

    /// The pinned message of an event, if any.
    pub fn pinned_message(&self, event_id: Uuid) -> Result<Option<Message>, StoreError> {
        self.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM messages WHERE event_id = ?1 AND is_pinned = 1 AND unsent_at IS NULL",
                    [event_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => query_message(conn, crate::models::parse_uuid(&id, "id")?),
                None => Ok(None),
            }
        })
    }

    /// Replace the text of a message. Sender only, once, within five minutes.
    pub fn edit_message(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let text = validate_text(text)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current = query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;

            check_owner_window(&current, editor_id, now)?;
            if current.edit_count >= MAX_EDITS {
                return Err(StoreError::AlreadyEdited);
            }
            if current.text.is_none() {
                return Err(StoreError::InvalidMessage("attachment messages cannot be edited"));
            }

            let changed = tx.execute(
                "UPDATE messages SET text = ?2, edited_at = ?3, edit_count = edit_count + 1
                 WHERE id = ?1 AND edit_count < ?4 AND unsent_at IS NULL",
                rusqlite::params![message_id.to_string(), text, to_millis(now), MAX_EDITS],
            )?;
            if changed == 0 {
                return Err(StoreError::AlreadyEdited);
            }

            let updated = query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Retract a message. Sender only, within five minutes; frees the pin slot.
    /// Returns the message as it was before removal.
    pub fn unsend_message(
        &self,
        message_id: Uuid,
        caller_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        self.with_conn(|conn| {
            let current = query_message(conn, message_id)?.ok_or(StoreError::NotFound("message"))?;
            check_owner_window(&current, caller_id, now)?;

            conn.execute(
                "UPDATE messages SET unsent_at = ?2, is_pinned = 0 WHERE id = ?1",
                rusqlite::params![message_id.to_string(), to_millis(now)],
            )?;
            debug!("Message {} unsent", message_id);
            Ok(current)
        })
    }

    /// Pin or unpin. Pinning while another message holds the slot is a conflict;
    /// pinning the already pinned message and unpinning are idempotent.
    pub fn set_pinned(
        &self,
        event_id: Uuid,
        message_id: Uuid,
        pinned: bool,
    ) -> Result<Message, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current = query_message(&tx, message_id)?
                .filter(|m| m.event_id == event_id)
                .ok_or(StoreError::NotFound("message"))?;

            if current.is_pinned == pinned {
                return Ok(current);
            }

            if pinned {
                let holder: Option<String> = tx
                    .query_row(
                        "SELECT id FROM messages WHERE event_id = ?1 AND is_pinned = 1",
                        [event_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if holder.is_some() {
                    return Err(StoreError::PinConflict);
                }
            }

            tx.execute(
                "UPDATE messages SET is_pinned = ?2 WHERE id = ?1",
                rusqlite::params![message_id.to_string(), pinned],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => StoreError::PinConflict,
                _ => StoreError::Sqlite(e),
            })?;

            let updated = query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(updated)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if present, inserts if not.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<ReactionToggle, StoreError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > 16 {
            return Err(StoreError::InvalidMessage("invalid emoji"));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let message = query_message(&tx, message_id)?.ok_or(StoreError::NotFound("message"))?;
            let mid = message_id.to_string();
            let uid = user_id.to_string();

            let removed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![mid, uid, emoji],
            )?;
            let added = removed == 0;
            if added {
                tx.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![mid, uid, emoji, to_millis(now)],
                )?;
            }

            let reactions = load_reactions(&tx, std::slice::from_ref(&mid))?
                .remove(&mid)
                .unwrap_or_default();
            tx.commit()?;

            Ok(ReactionToggle {
                added,
                event_id: message.event_id,
                reactions,
            })
        })
    }
}

fn check_owner_window(message: &Message, caller: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
    if message.sender.active_id() != Some(caller) {
        return Err(StoreError::NotSender);
    }
    if !rules::within_edit_window(message.created_at, now) {
        return Err(StoreError::EditWindowClosed);
    }
    Ok(())
}

fn validate_text(text: &str) -> Result<&str, StoreError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(StoreError::InvalidMessage("message text is empty"));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(StoreError::InvalidMessage("message text is too long"));
    }
    Ok(text)
}

fn validate_content<'a>(
    text: Option<&'a str>,
    attachment: Option<&Attachment>,
) -> Result<Option<&'a str>, StoreError> {
    let text = text.filter(|t| !t.trim().is_empty());
    match (text, attachment) {
        (None, None) => Err(StoreError::InvalidMessage("message needs text or an attachment")),
        (Some(_), Some(_)) => Err(StoreError::InvalidMessage(
            "text and attachment cannot be sent together",
        )),
        (Some(t), None) => validate_text(t).map(Some),
        (None, Some(a)) => {
            if a.size_bytes > rules::MAX_ATTACHMENT_BYTES {
                return Err(StoreError::InvalidMessage("attachment is larger than 10 MB"));
            }
            if !rules::is_allowed_mime(&a.mime_type) {
                return Err(StoreError::InvalidMessage("attachment type is not allowed"));
            }
            Ok(None)
        }
    }
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users u ON u.id = m.sender_id
         WHERE m.id = ?1 AND m.unsent_at IS NULL"
    );
    let row = conn
        .query_row(&sql, [id.to_string()], MessageRow::from_row)
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut reactions = load_reactions(conn, std::slice::from_ref(&row.id))?;
    let r = reactions.remove(&row.id).unwrap_or_default();
    row.into_message(r).map(Some)
}

/// Batch-fetch reactions for a set of message ids, in insertion order.
fn load_reactions(
    conn: &Connection,
    message_ids: &[String],
) -> Result<HashMap<String, Vec<Reaction>>, StoreError> {
    let mut out: HashMap<String, Vec<Reaction>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(out);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT message_id, user_id, emoji FROM reactions
         WHERE message_id IN ({})
         ORDER BY created_at, rowid",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
            Ok(ReactionRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                emoji: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for row in rows {
        let key = row.message_id.clone();
        out.entry(key).or_default().push(row.into_reaction()?);
    }
    Ok(out)
}
