use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mitra_types::events::{ClientCommand, ServerEvent};
use mitra_types::models::{Attachment, Message, Role};
use mitra_types::rules::{self, MAX_MESSAGE_CHARS, PAGE_SIZE};

use crate::api::ChatApi;
use crate::attendance::is_attendance_action;
use crate::config::ClientConfig;
use crate::connection::{CommandSink, ConnectionState};
use crate::error::{ClientError, ErrorKind};
use crate::typing::{TypingNotifier, TypingRoster, TypingSignal};
use crate::upload::{OperationId, PendingFile, UploadTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
    Sending,
    Left,
}

/// A failure shown to the user. The session keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&ClientError> for Notice {
    fn from(err: &ClientError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
            retryable: err.is_retryable(),
        }
    }
}

/// Scroll offset that keeps the same content in view after older messages
/// were prepended above it.
pub fn anchored_scroll_offset(offset_before: f64, height_before: f64, height_after: f64) -> f64 {
    (offset_before + (height_after - height_before)).max(0.0)
}

/// One user's view of one event chat.
///
/// Commands go out through the injected [`CommandSink`]; server events come
/// back in through [`ChatSession::apply_event`]. The local log only changes
/// in response to server events and history pages.
pub struct ChatSession<S: CommandSink, A: ChatApi> {
    sink: S,
    api: A,
    event_id: Uuid,
    user_id: Uuid,
    role: Role,
    state: SessionState,
    messages: Vec<Message>,
    pinned: Option<Message>,
    has_more: bool,
    draft: String,
    file: Option<PendingFile>,
    reply_to: Option<Uuid>,
    uploads: Arc<UploadTracker>,
    current_upload: Option<OperationId>,
    typing: TypingNotifier,
    typists: TypingRoster,
    pending_unsend: Option<Uuid>,
    notices: Vec<Notice>,
}

impl<S: CommandSink, A: ChatApi> ChatSession<S, A> {
    pub fn new(
        sink: S,
        api: A,
        config: &ClientConfig,
        event_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Self {
        Self {
            sink,
            api,
            event_id,
            user_id,
            role,
            state: SessionState::Disconnected,
            messages: Vec::new(),
            pinned: None,
            has_more: false,
            draft: String::new(),
            file: None,
            reply_to: None,
            uploads: Arc::new(UploadTracker::new()),
            current_upload: None,
            typing: TypingNotifier::new(config.typing_idle),
            typists: TypingRoster::new(config.typing_expiry),
            pending_unsend: None,
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// Oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pinned(&self) -> Option<&Message> {
        self.pinned.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn pending_file(&self) -> Option<&PendingFile> {
        self.file.as_ref()
    }

    pub fn pending_unsend(&self) -> Option<Uuid> {
        self.pending_unsend
    }

    /// Shared so progress can be read, or an upload cancelled, while
    /// [`ChatSession::send_message`] is running.
    pub fn upload_tracker(&self) -> Arc<UploadTracker> {
        self.uploads.clone()
    }

    pub fn current_upload(&self) -> Option<OperationId> {
        self.current_upload
    }

    pub fn typing_names(&self) -> Vec<&str> {
        self.typists.names()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, err: ClientError) -> ClientError {
        warn!("Chat {}: {}", self.event_id, err);
        self.notices.push(Notice::from(&err));
        err
    }

    fn send(&mut self, cmd: ClientCommand) -> Result<(), ClientError> {
        self.sink.send_command(cmd).map_err(|e| self.notify(e))
    }

    fn ensure_joined(&mut self) -> Result<(), ClientError> {
        match self.state {
            SessionState::Joined => Ok(()),
            SessionState::Sending => Err(self.notify(ClientError::Validation(
                "Wait for the current message to finish sending.".into(),
            ))),
            _ => Err(self.notify(ClientError::Disconnected)),
        }
    }

    fn find(&self, message_id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    // -- Room --

    /// Join the room and load the newest page plus the pinned message.
    /// History failures are reported but do not undo the join.
    pub async fn join(&mut self) -> Result<(), ClientError> {
        self.state = SessionState::Connecting;
        let event_id = self.event_id;
        if let Err(e) = self.send(ClientCommand::JoinEventRoom { event_id }) {
            self.state = SessionState::Disconnected;
            return Err(e);
        }
        self.state = SessionState::Joined;
        info!("Joined chat {}", event_id);

        match self.api.fetch_messages(event_id, None).await {
            Ok(page) => {
                self.has_more = page.len() == PAGE_SIZE;
                self.messages.clear();
                self.merge_older(page);
            }
            Err(e) => {
                self.notify(e);
            }
        }
        match self.api.fetch_pinned(event_id).await {
            Ok(pinned) => self.pinned = pinned,
            Err(e) => {
                self.notify(e);
            }
        }
        Ok(())
    }

    /// Fetch the page before the oldest loaded message and prepend it.
    /// Returns how many messages were added.
    pub async fn load_older(&mut self) -> Result<usize, ClientError> {
        if !self.has_more {
            return Ok(0);
        }
        let before = self.messages.first().map(|m| m.id);
        let page = match self.api.fetch_messages(self.event_id, before).await {
            Ok(page) => page,
            Err(e) => return Err(self.notify(e)),
        };
        self.has_more = page.len() == PAGE_SIZE;
        let added = self.merge_older(page);
        debug!("Loaded {} older messages for {}", added, self.event_id);
        Ok(added)
    }

    fn merge_older(&mut self, page: Vec<Message>) -> usize {
        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|m| self.find(m.id).is_none())
            .collect();
        let added = fresh.len();
        self.messages.splice(0..0, fresh);
        added
    }

    pub fn leave(&mut self) {
        if self.state == SessionState::Left {
            return;
        }
        let event_id = self.event_id;
        if self.typing.reset().is_some() {
            let _ = self.sink.send_command(ClientCommand::StopTyping { event_id });
        }
        if let Some(id) = self.current_upload.take() {
            self.uploads.cancel(id);
        }
        if let Err(e) = self.sink.send_command(ClientCommand::LeaveEventRoom { event_id }) {
            debug!("Leave for {} not sent: {}", event_id, e);
        }
        self.typists.clear();
        self.pending_unsend = None;
        self.state = SessionState::Left;
        info!("Left chat {}", event_id);
    }

    /// Follow the socket. The connection re-joins rooms itself after a
    /// reconnect, so the session only mirrors the state.
    pub fn connection_changed(&mut self, state: ConnectionState) {
        match (self.state, state) {
            (SessionState::Left, _) => {}
            (_, ConnectionState::Disconnected | ConnectionState::Connecting) => {
                self.typists.clear();
                self.typing.reset();
                self.state = SessionState::Disconnected;
            }
            (SessionState::Disconnected, ConnectionState::Connected) => {
                self.state = SessionState::Joined;
            }
            _ => {}
        }
    }

    // -- Composing --

    /// Typing text replaces a selected file.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.draft = text.into();
        if !self.draft.is_empty() {
            self.file = None;
        }
    }

    /// Select an attachment. Checked locally first; selecting clears the text.
    pub fn select_file(&mut self, file: PendingFile) -> Result<(), ClientError> {
        if let Err(e) = file.validate() {
            return Err(self.notify(e));
        }
        self.draft.clear();
        self.file = Some(file);
        Ok(())
    }

    pub fn clear_file(&mut self) {
        self.file = None;
    }

    pub fn set_reply_to(&mut self, message_id: Option<Uuid>) {
        self.reply_to = message_id;
    }

    pub fn keystroke(&mut self, now: Instant) {
        if self.state != SessionState::Joined {
            return;
        }
        if let Some(TypingSignal::Start) = self.typing.keystroke(now) {
            let event_id = self.event_id;
            let _ = self.send(ClientCommand::Typing { event_id });
        }
    }

    /// Drive timers: the local stop-typing and remote typist expiry.
    pub fn tick(&mut self, now: Instant) {
        if let Some(TypingSignal::Stop) = self.typing.poll(now) {
            let event_id = self.event_id;
            let _ = self.send(ClientCommand::StopTyping { event_id });
        }
        self.typists.expire(now);
    }

    /// Send the draft text, or upload the selected file and then send it.
    pub async fn send_message(&mut self) -> Result<(), ClientError> {
        self.ensure_joined()?;

        let (text, attachment) = match self.file.clone() {
            Some(file) => (None, Some(self.upload(file).await?)),
            None => {
                let text = self.draft.trim();
                if text.is_empty() {
                    return Err(self.notify(ClientError::Validation(
                        "Message cannot be empty.".into(),
                    )));
                }
                if text.chars().count() > MAX_MESSAGE_CHARS {
                    return Err(self.notify(ClientError::Validation(format!(
                        "Messages are limited to {MAX_MESSAGE_CHARS} characters."
                    ))));
                }
                (Some(text.to_string()), None)
            }
        };

        let event_id = self.event_id;
        let sent_file = attachment.is_some();
        self.send(ClientCommand::SendMessage {
            event_id,
            text,
            attachment,
            reply_to_message_id: self.reply_to,
        })?;

        // the server ends the typing burst when a message arrives
        self.typing.reset();
        self.reply_to = None;
        if sent_file {
            self.file = None;
        } else {
            self.draft.clear();
        }
        Ok(())
    }

    async fn upload(&mut self, file: PendingFile) -> Result<Attachment, ClientError> {
        self.state = SessionState::Sending;
        let (op, progress) = self.uploads.start(file.size());
        self.current_upload = Some(op);

        let result = self.api.upload(&file, progress).await;

        self.uploads.finish(op);
        self.current_upload = None;
        self.state = SessionState::Joined;

        match result {
            Ok(uploaded) => Ok(Attachment {
                url: uploaded.file_url.url,
                filename: uploaded.file_url.filename,
                mime_type: uploaded.file_type,
                size_bytes: uploaded.size_bytes,
            }),
            Err(e) => {
                // a file the server refused will be refused again
                if e.kind() == ErrorKind::Validation {
                    self.file = None;
                }
                Err(self.notify(e))
            }
        }
    }

    // -- Message actions --

    pub fn can_edit(&self, message_id: Uuid) -> bool {
        self.find(message_id)
            .is_some_and(|m| rules::can_edit_message(m, self.user_id, Utc::now()))
    }

    pub fn can_unsend(&self, message_id: Uuid) -> bool {
        self.find(message_id)
            .is_some_and(|m| rules::can_unsend_message(m, self.user_id, Utc::now()))
    }

    /// Organizers may pin while the slot is free, or unpin the pinned message.
    pub fn can_pin(&self, message_id: Uuid) -> bool {
        self.role.is_organizer()
            && self
                .pinned
                .as_ref()
                .is_none_or(|pinned| pinned.id == message_id)
    }

    /// Request an edit. The log changes when `messageEdited` comes back.
    pub fn edit(&mut self, message_id: Uuid, text: &str) -> Result<(), ClientError> {
        self.ensure_joined()?;
        if !self.can_edit(message_id) {
            return Err(self.notify(ClientError::domain(
                "edit_not_allowed",
                "This message can no longer be edited.",
            )));
        }
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(self.notify(ClientError::Validation(format!(
                "Messages must be 1 to {MAX_MESSAGE_CHARS} characters."
            ))));
        }
        let event_id = self.event_id;
        self.send(ClientCommand::EditMessage {
            event_id,
            message_id,
            text: text.to_string(),
        })
    }

    /// First step of unsending: remember the message until confirmed.
    pub fn request_unsend(&mut self, message_id: Uuid) -> Result<(), ClientError> {
        if !self.can_unsend(message_id) {
            return Err(self.notify(ClientError::domain(
                "unsend_not_allowed",
                "This message can no longer be unsent.",
            )));
        }
        self.pending_unsend = Some(message_id);
        Ok(())
    }

    pub fn cancel_unsend(&mut self) {
        self.pending_unsend = None;
    }

    pub fn confirm_unsend(&mut self) -> Result<(), ClientError> {
        let Some(message_id) = self.pending_unsend.take() else {
            return Ok(());
        };
        self.ensure_joined()?;
        // the window may have closed while the dialog was open
        if !self.can_unsend(message_id) {
            return Err(self.notify(ClientError::domain(
                "unsend_not_allowed",
                "This message can no longer be unsent.",
            )));
        }
        let event_id = self.event_id;
        self.send(ClientCommand::UnsendMessage {
            event_id,
            message_id,
        })
    }

    /// Pin a message, or unpin it if it is the pinned one.
    pub fn toggle_pin(&mut self, message_id: Uuid) -> Result<(), ClientError> {
        self.ensure_joined()?;
        if !self.role.is_organizer() {
            return Err(self.notify(ClientError::domain(
                "forbidden",
                "Only organizers can pin messages.",
            )));
        }
        if !self.can_pin(message_id) {
            return Err(self.notify(ClientError::domain(
                "pin_conflict",
                "Another message is already pinned.",
            )));
        }
        let pinned = self.pinned.as_ref().is_none_or(|p| p.id != message_id);
        let event_id = self.event_id;
        self.send(ClientCommand::PinMessage {
            event_id,
            message_id,
            pinned,
        })
    }

    /// Toggle the caller's reaction with `emoji`.
    pub fn react(&mut self, message_id: Uuid, emoji: &str) -> Result<(), ClientError> {
        self.ensure_joined()?;
        let event_id = self.event_id;
        self.send(ClientCommand::ReactToMessage {
            event_id,
            message_id,
            emoji: emoji.to_string(),
        })
    }

    // -- Server events --

    /// Apply a server event. Returns whether it concerned this chat.
    pub fn apply_event(&mut self, event: ServerEvent, now: Instant) -> bool {
        if let ServerEvent::Error {
            action,
            event_id,
            code,
            message,
        } = event
        {
            if event_id != Some(self.event_id) || is_attendance_action(&action) {
                return false;
            }
            debug!("Server rejected {}: {}", action, code);
            self.notify(ClientError::Domain { code, message });
            return true;
        }
        if event.event_id() != Some(self.event_id) {
            return false;
        }

        match event {
            ServerEvent::ReceiveMessage(message) => {
                if let Some(sender) = message.sender.active_id() {
                    self.typists.user_stopped(sender);
                }
                if self.find(message.id).is_none() {
                    self.messages.push(message);
                }
            }
            ServerEvent::MessageEdited(message) => {
                if let Some(pinned) = self.pinned.as_mut().filter(|p| p.id == message.id) {
                    *pinned = message.clone();
                }
                if let Some(slot) = self.messages.iter_mut().find(|m| m.id == message.id) {
                    *slot = message;
                }
            }
            ServerEvent::MessageUnsent { message_id, .. } => {
                self.messages.retain(|m| m.id != message_id);
                if self.pinned.as_ref().is_some_and(|p| p.id == message_id) {
                    self.pinned = None;
                }
                if self.pending_unsend == Some(message_id) {
                    self.pending_unsend = None;
                }
            }
            ServerEvent::MessagePinned(message) => {
                for m in &mut self.messages {
                    m.is_pinned = m.id == message.id && message.is_pinned;
                }
                if message.is_pinned {
                    self.pinned = Some(message);
                } else if self.pinned.as_ref().is_some_and(|p| p.id == message.id) {
                    self.pinned = None;
                }
            }
            ServerEvent::MessageReactionUpdate {
                message_id,
                reactions,
                ..
            } => {
                if let Some(pinned) = self.pinned.as_mut().filter(|p| p.id == message_id) {
                    pinned.reactions = reactions.clone();
                }
                if let Some(m) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    m.reactions = reactions;
                }
            }
            ServerEvent::UserTyping {
                user_id, username, ..
            } => {
                if user_id != self.user_id {
                    self.typists.user_typing(user_id, &username, now);
                }
            }
            ServerEvent::UserStoppedTyping { user_id, .. } => {
                self.typists.user_stopped(user_id);
            }
            ServerEvent::AttendanceUpdated { .. } => return false,
            ServerEvent::Ready { .. } | ServerEvent::Error { .. } => return false,
        }
        true
    }
}
