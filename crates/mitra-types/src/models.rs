use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when nothing is known about a removed sender.
pub const DELETED_USER_NAME: &str = "Deleted user";

/// Caller capability carried in the bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Volunteer,
    Organizer,
    Admin,
}

impl Role {
    /// Organizers and admins may pin, unpin and run attendance.
    pub fn is_organizer(self) -> bool {
        matches!(self, Role::Organizer | Role::Admin)
    }
}

/// A message sender. Removed accounts keep only what the message remembered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum User {
    Active { id: Uuid, name: String },
    Deleted { id: Option<Uuid>, last_known_name: String },
}

impl User {
    /// Id of an active user. Deleted users never match a caller.
    pub fn active_id(&self) -> Option<Uuid> {
        match self {
            User::Active { id, .. } => Some(*id),
            User::Deleted { .. } => None,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            User::Active { name, .. } => name,
            User::Deleted { last_known_name, .. } => last_known_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

/// Reactions on one message grouped by emoji, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

pub fn group_reactions(reactions: &[Reaction]) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for r in reactions {
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                if !group.user_ids.contains(&r.user_id) {
                    group.user_ids.push(r.user_id);
                    group.count += 1;
                }
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji.clone(),
                count: 1,
                user_ids: vec![r.user_id],
            }),
        }
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub event_id: Uuid,
    pub sender: User,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub edit_count: u8,
    pub is_pinned: bool,
    pub reply_to_message_id: Option<Uuid>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub attachment: Option<Attachment>,
}

impl Message {
    pub fn reaction_groups(&self) -> Vec<ReactionGroup> {
        group_reactions(&self.reactions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub registration_id: Uuid,
    pub event_id: Uuid,
    pub volunteer_user_id: Uuid,
    pub has_attended: bool,
    pub in_time: Option<DateTime<Utc>>,
    pub out_time: Option<DateTime<Utc>>,
    pub exit_qr_token: Option<String>,
}

impl Registration {
    /// The attendance checkbox may not be cleared once entry has a timestamp.
    pub fn can_uncheck_attendance(&self) -> bool {
        self.in_time.is_none()
    }
}

/// Aggregate counts shown on the live attendance dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub registered: u64,
    pub attended: u64,
    pub checked_in: u64,
    pub checked_out: u64,
    pub currently_present: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactions_group_by_emoji() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let reactions = vec![
            Reaction { user_id: a, emoji: "👍".into() },
            Reaction { user_id: b, emoji: "🎉".into() },
            Reaction { user_id: b, emoji: "👍".into() },
            Reaction { user_id: a, emoji: "🎉".into() },
        ];

        let groups = group_reactions(&reactions);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].emoji, "👍");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[1].user_ids, vec![b, a]);
    }

    #[test]
    fn deleted_user_has_no_active_id() {
        let gone = User::Deleted {
            id: None,
            last_known_name: DELETED_USER_NAME.into(),
        };
        assert_eq!(gone.active_id(), None);
        assert_eq!(gone.display_name(), "Deleted user");

        let json = serde_json::to_value(&gone).unwrap();
        assert_eq!(json["status"], "deleted");
        assert_eq!(json["lastKnownName"], "Deleted user");
    }
}
