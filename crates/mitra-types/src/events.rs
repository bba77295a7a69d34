use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Attachment, AttendanceStats, Message, Reaction, Registration, Role};

/// Events sent over the socket channel, server to client.
///
/// Wire shape: `{"event": "receiveMessage", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Connection authenticated
    Ready {
        user_id: Uuid,
        username: String,
        role: Role,
    },

    /// A message was posted to an event chat
    ReceiveMessage(Message),

    /// A message was edited (carries the stored version)
    MessageEdited(Message),

    /// A message was retracted by its sender
    MessageUnsent { event_id: Uuid, message_id: Uuid },

    /// A message was pinned or unpinned; `isPinned` tells which
    MessagePinned(Message),

    /// Full reaction list of a message after a toggle
    MessageReactionUpdate {
        event_id: Uuid,
        message_id: Uuid,
        reactions: Vec<Reaction>,
    },

    UserTyping {
        event_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStoppedTyping { event_id: Uuid, user_id: Uuid },

    /// Attendance changed for an event; stats are recomputed server-side
    AttendanceUpdated {
        event_id: Uuid,
        registration: Option<Registration>,
        stats: AttendanceStats,
    },

    /// A command from this connection failed. Never broadcast. `event_id`
    /// names the event the failed command targeted, absent for unparseable
    /// frames.
    Error {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<Uuid>,
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Event the payload belongs to, if any.
    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            Self::ReceiveMessage(m) | Self::MessageEdited(m) | Self::MessagePinned(m) => {
                Some(m.event_id)
            }
            Self::MessageUnsent { event_id, .. }
            | Self::MessageReactionUpdate { event_id, .. }
            | Self::UserTyping { event_id, .. }
            | Self::UserStoppedTyping { event_id, .. }
            | Self::AttendanceUpdated { event_id, .. } => Some(*event_id),
            Self::Error { event_id, .. } => *event_id,
            Self::Ready { .. } => None,
        }
    }

    /// Wire name of the event, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::ReceiveMessage(_) => "receiveMessage",
            Self::MessageEdited(_) => "messageEdited",
            Self::MessageUnsent { .. } => "messageUnsent",
            Self::MessagePinned(_) => "messagePinned",
            Self::MessageReactionUpdate { .. } => "messageReactionUpdate",
            Self::UserTyping { .. } => "userTyping",
            Self::UserStoppedTyping { .. } => "userStoppedTyping",
            Self::AttendanceUpdated { .. } => "attendanceUpdated",
            Self::Error { .. } => "error",
        }
    }
}

/// Commands sent FROM client TO server over the socket channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinEventRoom { event_id: Uuid },

    LeaveEventRoom { event_id: Uuid },

    /// Text or a previously uploaded attachment, never both
    SendMessage {
        event_id: Uuid,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        attachment: Option<Attachment>,
        #[serde(default)]
        reply_to_message_id: Option<Uuid>,
    },

    EditMessage {
        event_id: Uuid,
        message_id: Uuid,
        text: String,
    },

    UnsendMessage { event_id: Uuid, message_id: Uuid },

    /// Organizer-only. `pinned = false` unpins.
    PinMessage {
        event_id: Uuid,
        message_id: Uuid,
        #[serde(default = "default_pinned")]
        pinned: bool,
    },

    /// Toggles the caller's reaction with this emoji
    ReactToMessage {
        event_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },

    Typing { event_id: Uuid },

    StopTyping { event_id: Uuid },

    JoinAttendanceRoom { event_id: Uuid },

    LeaveAttendanceRoom { event_id: Uuid },
}

fn default_pinned() -> bool {
    true
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinEventRoom { .. } => "joinEventRoom",
            Self::LeaveEventRoom { .. } => "leaveEventRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::EditMessage { .. } => "editMessage",
            Self::UnsendMessage { .. } => "unsendMessage",
            Self::PinMessage { .. } => "pinMessage",
            Self::ReactToMessage { .. } => "reactToMessage",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stopTyping",
            Self::JoinAttendanceRoom { .. } => "joinAttendanceRoom",
            Self::LeaveAttendanceRoom { .. } => "leaveAttendanceRoom",
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            Self::JoinEventRoom { event_id }
            | Self::LeaveEventRoom { event_id }
            | Self::SendMessage { event_id, .. }
            | Self::EditMessage { event_id, .. }
            | Self::UnsendMessage { event_id, .. }
            | Self::PinMessage { event_id, .. }
            | Self::ReactToMessage { event_id, .. }
            | Self::Typing { event_id }
            | Self::StopTyping { event_id }
            | Self::JoinAttendanceRoom { event_id }
            | Self::LeaveAttendanceRoom { event_id } => *event_id,
        }
    }
}
