use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use mitra_types::events::{ClientCommand, ServerEvent};
use mitra_types::models::{AttendanceStats, Registration};

use crate::api::AttendanceApi;
use crate::config::ClientConfig;
use crate::connection::CommandSink;
use crate::error::ClientError;
use crate::session::Notice;

/// Shown for every scan that does not succeed, whatever the reason.
pub const SCAN_FAILED: &str = "Invalid QR code or failed to mark attendance";

fn scan_failed() -> ClientError {
    ClientError::domain("scan_failed", SCAN_FAILED)
}

/// Decoded QR text. Entry codes carry the registration id, exit codes the
/// single-use exit token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrPayload {
    Entry { registration_id: Uuid },
    Exit { exit_qr_token: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    registration_id: Option<Uuid>,
    exit_qr_token: Option<String>,
}

/// Socket failures the attendance screen owns; the rest belong to a chat.
pub(crate) fn is_attendance_action(action: &str) -> bool {
    matches!(action, "joinAttendanceRoom" | "leaveAttendanceRoom")
}

/// Exit tokens are unpadded base64url.
pub(crate) fn is_exit_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl QrPayload {
    /// Exactly one of `registrationId` or `exitQrToken` must be present.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let payload: RawPayload = serde_json::from_str(raw.trim()).map_err(|_| scan_failed())?;
        match (payload.registration_id, payload.exit_qr_token) {
            (Some(registration_id), None) => Ok(Self::Entry { registration_id }),
            (None, Some(token)) if is_exit_token(token.trim()) => Ok(Self::Exit {
                exit_qr_token: token.trim().to_string(),
            }),
            _ => Err(scan_failed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Entered(Registration),
    Exited {
        registration_id: Uuid,
        out_time: DateTime<Utc>,
    },
}

/// Organizer attendance screen for one event: scanner, manual fixes and the
/// live counters.
pub struct AttendanceController<S: CommandSink, A: AttendanceApi> {
    sink: S,
    api: A,
    event_id: Uuid,
    registrations: Vec<Registration>,
    stats: AttendanceStats,
    scanner_open: bool,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    notices: Vec<Notice>,
}

impl<S: CommandSink, A: AttendanceApi> AttendanceController<S, A> {
    pub fn new(sink: S, api: A, config: &ClientConfig, event_id: Uuid) -> Self {
        Self {
            sink,
            api,
            event_id,
            registrations: Vec::new(),
            stats: AttendanceStats::default(),
            scanner_open: false,
            poll_interval: config.stats_poll_interval,
            last_poll: None,
            notices: Vec::new(),
        }
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn stats(&self) -> AttendanceStats {
        self.stats
    }

    pub fn is_scanner_open(&self) -> bool {
        self.scanner_open
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, err: ClientError) -> ClientError {
        warn!("Attendance {}: {}", self.event_id, err);
        self.notices.push(Notice::from(&err));
        err
    }

    fn upsert(&mut self, registration: Registration) {
        match self
            .registrations
            .iter_mut()
            .find(|r| r.registration_id == registration.registration_id)
        {
            Some(slot) => *slot = registration,
            None => self.registrations.push(registration),
        }
    }

    fn find(&self, registration_id: Uuid) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.registration_id == registration_id)
    }

    /// Subscribe to live updates and load the roster and counters. Without a
    /// socket the screen still works; it falls back to polling.
    pub async fn load(&mut self, now: Instant) -> Result<(), ClientError> {
        let event_id = self.event_id;
        if let Err(e) = self
            .sink
            .send_command(ClientCommand::JoinAttendanceRoom { event_id })
        {
            self.notify(e);
        }

        match self.api.fetch_registrations(event_id).await {
            Ok(rows) => self.registrations = rows,
            Err(e) => return Err(self.notify(e)),
        }
        self.poll_stats(now).await
    }

    pub fn leave(&mut self) {
        let event_id = self.event_id;
        let _ = self
            .sink
            .send_command(ClientCommand::LeaveAttendanceRoom { event_id });
        self.scanner_open = false;
    }

    // -- Scanner --

    pub fn open_scanner(&mut self) {
        self.scanner_open = true;
    }

    pub fn close_scanner(&mut self) {
        self.scanner_open = false;
    }

    /// Handle one decoded QR. The scanner closes whatever happens, and every
    /// failure reads the same. Nothing is retried.
    pub async fn handle_scan(&mut self, raw: &str) -> Result<ScanOutcome, ClientError> {
        self.scanner_open = false;

        let outcome = match QrPayload::parse(raw) {
            Ok(QrPayload::Entry { registration_id }) => self
                .api
                .mark_attendance(registration_id, true)
                .await
                .map(ScanOutcome::Entered),
            Ok(QrPayload::Exit { exit_qr_token }) => self
                .api
                .scan_exit(&exit_qr_token)
                .await
                .map(|exit| {
                    self.record_exit(&exit_qr_token, exit.registration_id, exit.out_time);
                    ScanOutcome::Exited {
                        registration_id: exit.registration_id,
                        out_time: exit.out_time,
                    }
                }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ScanOutcome::Entered(registration)) => {
                info!("Entry recorded for {}", registration.registration_id);
                self.upsert(registration.clone());
                Ok(ScanOutcome::Entered(registration))
            }
            Ok(exited) => {
                info!("Exit recorded");
                Ok(exited)
            }
            Err(e) => {
                warn!("Scan failed: {}", e);
                Err(self.notify(scan_failed()))
            }
        }
    }

    fn record_exit(&mut self, token: &str, registration_id: Uuid, out_time: DateTime<Utc>) {
        let row = match self
            .registrations
            .iter()
            .position(|r| r.exit_qr_token.as_deref() == Some(token))
        {
            Some(i) => Some(i),
            None => self
                .registrations
                .iter()
                .position(|r| r.registration_id == registration_id),
        };
        if let Some(i) = row {
            let r = &mut self.registrations[i];
            r.out_time = Some(out_time);
            r.exit_qr_token = None;
        }
    }

    // -- Manual fixes --

    /// Checking is always allowed; unchecking only before entry was timed.
    pub fn can_toggle_attendance(&self, registration_id: Uuid) -> bool {
        self.find(registration_id)
            .is_some_and(|r| !r.has_attended || r.can_uncheck_attendance())
    }

    pub async fn toggle_attendance(&mut self, registration_id: Uuid) -> Result<(), ClientError> {
        let Some(current) = self.find(registration_id).map(|r| r.has_attended) else {
            return Err(self.notify(ClientError::domain(
                "not_found",
                "Registration not found.",
            )));
        };
        if !self.can_toggle_attendance(registration_id) {
            return Err(self.notify(ClientError::domain(
                "attendance_locked",
                "Attendance cannot be removed after check-in.",
            )));
        }
        match self.api.mark_attendance(registration_id, !current).await {
            Ok(registration) => {
                self.upsert(registration);
                Ok(())
            }
            Err(e) => Err(self.notify(e)),
        }
    }

    pub async fn set_in_time(
        &mut self,
        registration_id: Uuid,
        in_time: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let out_time = self.find(registration_id).and_then(|r| r.out_time);
        if out_time.is_some_and(|out| out < in_time) {
            return Err(self.notify(ClientError::Validation(
                "Entry time must be before exit time.".into(),
            )));
        }
        match self.api.set_in_time(registration_id, in_time).await {
            Ok(registration) => {
                self.upsert(registration);
                Ok(())
            }
            Err(e) => Err(self.notify(e)),
        }
    }

    pub async fn set_out_time(
        &mut self,
        registration_id: Uuid,
        out_time: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        let in_time = self.find(registration_id).and_then(|r| r.in_time);
        if in_time.is_some_and(|t| out_time < t) {
            return Err(self.notify(ClientError::Validation(
                "Exit time must be after entry time.".into(),
            )));
        }
        match self.api.set_out_time(registration_id, out_time).await {
            Ok(registration) => {
                self.upsert(registration);
                Ok(())
            }
            Err(e) => Err(self.notify(e)),
        }
    }

    // -- Live counters --

    /// Apply an `attendanceUpdated` broadcast, or a rejected attendance-room
    /// command. Returns whether it was ours.
    pub fn apply_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Error {
                action,
                event_id: Some(event_id),
                code,
                message,
            } if event_id == self.event_id && is_attendance_action(&action) => {
                self.notify(ClientError::Domain { code, message });
                true
            }
            ServerEvent::AttendanceUpdated {
                event_id,
                registration,
                stats,
            } if event_id == self.event_id => {
                self.stats = stats;
                if let Some(registration) = registration {
                    self.upsert(registration);
                }
                true
            }
            _ => false,
        }
    }

    pub fn poll_due(&self, now: Instant) -> bool {
        self.last_poll
            .is_none_or(|last| now.saturating_duration_since(last) >= self.poll_interval)
    }

    pub async fn poll_stats(&mut self, now: Instant) -> Result<(), ClientError> {
        self.last_poll = Some(now);
        match self.api.fetch_stats(self.event_id).await {
            Ok(stats) => {
                self.stats = stats;
                Ok(())
            }
            Err(e) => Err(self.notify(e)),
        }
    }
}
