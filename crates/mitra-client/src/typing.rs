use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Turns keystrokes into one `typing` per burst and a `stopTyping` after a
/// quiet period.
#[derive(Debug)]
pub struct TypingNotifier {
    idle: Duration,
    last_keystroke: Option<Instant>,
    active: bool,
}

impl TypingNotifier {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_keystroke: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        if self.active {
            None
        } else {
            self.active = true;
            Some(TypingSignal::Start)
        }
    }

    /// Call periodically; yields `Stop` once the idle period has passed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        let quiet = self
            .last_keystroke
            .is_some_and(|last| now.saturating_duration_since(last) >= self.idle);
        if self.active && quiet {
            self.active = false;
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }

    /// Message sent or chat left: end the burst now.
    pub fn reset(&mut self) -> Option<TypingSignal> {
        self.last_keystroke = None;
        if std::mem::take(&mut self.active) {
            Some(TypingSignal::Stop)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct Typist {
    user_id: Uuid,
    username: String,
    seen: Instant,
}

/// Other users currently typing. Entries leave on `userStoppedTyping` or
/// when nothing was heard from them for `expiry`.
#[derive(Debug)]
pub struct TypingRoster {
    expiry: Duration,
    typists: Vec<Typist>,
}

impl TypingRoster {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            typists: Vec::new(),
        }
    }

    pub fn user_typing(&mut self, user_id: Uuid, username: &str, now: Instant) {
        match self.typists.iter_mut().find(|t| t.user_id == user_id) {
            Some(typist) => typist.seen = now,
            None => self.typists.push(Typist {
                user_id,
                username: username.to_string(),
                seen: now,
            }),
        }
    }

    pub fn user_stopped(&mut self, user_id: Uuid) {
        self.typists.retain(|t| t.user_id != user_id);
    }

    /// Drop stale entries. Returns whether anything changed.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.typists.len();
        let expiry = self.expiry;
        self.typists
            .retain(|t| now.saturating_duration_since(t.seen) < expiry);
        before != self.typists.len()
    }

    pub fn clear(&mut self) {
        self.typists.clear();
    }

    /// Names in the order they started typing.
    pub fn names(&self) -> Vec<&str> {
        self.typists.iter().map(|t| t.username.as_str()).collect()
    }
}
