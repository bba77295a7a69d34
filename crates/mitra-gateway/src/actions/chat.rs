use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use mitra_db::StoreError;
use mitra_db::messages::NewMessage;
use mitra_types::events::ServerEvent;
use mitra_types::models::{Attachment, Message};

use super::{Actions, Caller};
use crate::dispatcher::RoomKey;
use crate::error::ActionError;

/// Body of a `sendMessage` command.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<Uuid>,
}

impl Actions {
    pub async fn join_chat(&self, caller: &Caller, event_id: Uuid) {
        if let Some(conn) = caller.conn {
            if self.dispatcher.join(RoomKey::Chat(event_id), conn).await {
                info!("{} ({}) joined chat {}", caller.username, caller.user_id, event_id);
            }
        }
    }

    pub async fn leave_chat(&self, caller: &Caller, event_id: Uuid) {
        if let Some(conn) = caller.conn {
            if self.dispatcher.leave(RoomKey::Chat(event_id), conn).await {
                info!("{} ({}) left chat {}", caller.username, caller.user_id, event_id);
            }
        }
    }

    /// One page of history, oldest first.
    pub async fn history(
        &self,
        event_id: Uuid,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Message>, ActionError> {
        self.blocking(move |db| db.list_messages(event_id, before, limit))
            .await
    }

    pub async fn pinned(&self, event_id: Uuid) -> Result<Option<Message>, ActionError> {
        self.blocking(move |db| db.pinned_message(event_id)).await
    }

    /// Store a message and deliver it to the whole room, sender included.
    pub async fn send_message(
        &self,
        caller: &Caller,
        event_id: Uuid,
        req: SendRequest,
    ) -> Result<Message, ActionError> {
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;

        let new = NewMessage {
            event_id,
            sender_id: caller.user_id,
            sender_name: caller.username.clone(),
            text: req.text,
            attachment: req.attachment,
            reply_to: req.reply_to,
        };
        let message = self
            .blocking(move |db| db.insert_message(new, Utc::now()))
            .await?;

        if let Some(conn) = caller.conn {
            self.dispatcher.stop_typing(event_id, conn).await;
        }
        self.dispatcher
            .broadcast(room, &ServerEvent::ReceiveMessage(message.clone()), None)
            .await;
        debug!("Message {} sent to {}", message.id, event_id);
        Ok(message)
    }

    pub async fn edit_message(
        &self,
        caller: &Caller,
        event_id: Uuid,
        message_id: Uuid,
        text: String,
    ) -> Result<Message, ActionError> {
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;
        self.require_in_event(event_id, message_id).await?;

        let editor = caller.user_id;
        let message = self
            .blocking(move |db| db.edit_message(message_id, editor, &text, Utc::now()))
            .await?;

        self.dispatcher
            .broadcast(room, &ServerEvent::MessageEdited(message.clone()), None)
            .await;
        Ok(message)
    }

    pub async fn unsend_message(
        &self,
        caller: &Caller,
        event_id: Uuid,
        message_id: Uuid,
    ) -> Result<(), ActionError> {
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;
        self.require_in_event(event_id, message_id).await?;

        let sender = caller.user_id;
        self.blocking(move |db| db.unsend_message(message_id, sender, Utc::now()))
            .await?;

        info!("{} ({}) unsent message {}", caller.username, caller.user_id, message_id);
        self.dispatcher
            .broadcast(room, &ServerEvent::MessageUnsent { event_id, message_id }, None)
            .await;
        Ok(())
    }

    /// Organizer-only. A different message holding the slot is a conflict.
    pub async fn pin_message(
        &self,
        caller: &Caller,
        event_id: Uuid,
        message_id: Uuid,
        pinned: bool,
    ) -> Result<Message, ActionError> {
        caller.require_organizer()?;
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;

        let message = self
            .blocking(move |db| db.set_pinned(event_id, message_id, pinned))
            .await?;

        info!(
            "{} ({}) {} message {} in {}",
            caller.username,
            caller.user_id,
            if pinned { "pinned" } else { "unpinned" },
            message_id,
            event_id
        );
        self.dispatcher
            .broadcast(room, &ServerEvent::MessagePinned(message.clone()), None)
            .await;
        Ok(message)
    }

    pub async fn react_to_message(
        &self,
        caller: &Caller,
        event_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<bool, ActionError> {
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;
        self.require_in_event(event_id, message_id).await?;

        let user_id = caller.user_id;
        let toggle = self
            .blocking(move |db| db.toggle_reaction(message_id, user_id, &emoji, Utc::now()))
            .await?;

        self.dispatcher
            .broadcast(
                room,
                &ServerEvent::MessageReactionUpdate {
                    event_id: toggle.event_id,
                    message_id,
                    reactions: toggle.reactions,
                },
                None,
            )
            .await;
        Ok(toggle.added)
    }

    /// Relay a typing signal to the rest of the room.
    pub async fn typing(&self, caller: &Caller, event_id: Uuid) -> Result<(), ActionError> {
        let Some(conn) = caller.conn else {
            return Ok(());
        };
        let room = RoomKey::Chat(event_id);
        self.require_joined(caller, room).await?;

        self.dispatcher.start_typing(event_id, conn, caller.user_id).await;
        self.dispatcher
            .broadcast(
                room,
                &ServerEvent::UserTyping {
                    event_id,
                    user_id: caller.user_id,
                    username: caller.username.clone(),
                },
                Some(conn),
            )
            .await;
        Ok(())
    }

    pub async fn stop_typing(&self, caller: &Caller, event_id: Uuid) {
        if let Some(conn) = caller.conn {
            self.dispatcher.stop_typing(event_id, conn).await;
        }
    }

    async fn require_in_event(&self, event_id: Uuid, message_id: Uuid) -> Result<(), ActionError> {
        let message = self.blocking(move |db| db.get_message(message_id)).await?;
        match message {
            Some(m) if m.event_id == event_id => Ok(()),
            _ => Err(StoreError::NotFound("message").into()),
        }
    }
}
