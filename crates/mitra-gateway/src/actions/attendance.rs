use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use mitra_types::events::ServerEvent;
use mitra_types::models::{AttendanceStats, Registration};

use super::{Actions, Caller};
use crate::dispatcher::RoomKey;
use crate::error::ActionError;

impl Actions {
    /// Organizers watching live stats.
    pub async fn join_attendance(&self, caller: &Caller, event_id: Uuid) -> Result<(), ActionError> {
        caller.require_organizer()?;
        if let Some(conn) = caller.conn {
            self.dispatcher.join(RoomKey::Attendance(event_id), conn).await;
        }
        Ok(())
    }

    pub async fn leave_attendance(&self, caller: &Caller, event_id: Uuid) {
        if let Some(conn) = caller.conn {
            self.dispatcher.leave(RoomKey::Attendance(event_id), conn).await;
        }
    }

    /// Volunteer self-registration.
    pub async fn register_for_event(
        &self,
        caller: &Caller,
        event_id: Uuid,
    ) -> Result<Registration, ActionError> {
        let volunteer = caller.user_id;
        let registration = self
            .blocking(move |db| db.create_registration(event_id, volunteer, Utc::now()))
            .await?;
        info!("{} ({}) registered for {}", caller.username, caller.user_id, event_id);
        self.publish_attendance(registration.clone()).await;
        Ok(registration)
    }

    pub async fn list_registrations(
        &self,
        caller: &Caller,
        event_id: Uuid,
    ) -> Result<Vec<Registration>, ActionError> {
        caller.require_organizer()?;
        self.blocking(move |db| db.list_registrations(event_id)).await
    }

    pub async fn attendance_stats(
        &self,
        caller: &Caller,
        event_id: Uuid,
    ) -> Result<AttendanceStats, ActionError> {
        caller.require_organizer()?;
        self.blocking(move |db| db.attendance_stats(event_id)).await
    }

    /// Exit QR token, for the volunteer who owns the registration.
    pub async fn exit_qr_token(
        &self,
        caller: &Caller,
        registration_id: Uuid,
    ) -> Result<String, ActionError> {
        let registration = self.registration(registration_id).await?;
        if registration.volunteer_user_id != caller.user_id && !caller.role.is_organizer() {
            return Err(ActionError::NotOwner);
        }
        self.blocking(move |db| db.exit_token(registration_id)).await
    }

    /// Attendance checkbox and entry scan.
    pub async fn mark_attendance(
        &self,
        caller: &Caller,
        registration_id: Uuid,
        has_attended: bool,
    ) -> Result<Registration, ActionError> {
        caller.require_organizer()?;
        let registration = self
            .blocking(move |db| db.set_attendance(registration_id, has_attended, Utc::now()))
            .await?;
        info!(
            "{} marked registration {} attended={}",
            caller.username, registration_id, has_attended
        );
        self.publish_attendance(registration.clone()).await;
        Ok(registration)
    }

    /// Exit scan. Consumes the token.
    pub async fn scan_exit(&self, caller: &Caller, token: String) -> Result<Registration, ActionError> {
        caller.require_organizer()?;
        let registration = self
            .blocking(move |db| db.consume_exit_token(&token, Utc::now()))
            .await?;
        self.publish_attendance(registration.clone()).await;
        Ok(registration)
    }

    pub async fn set_in_time(
        &self,
        caller: &Caller,
        registration_id: Uuid,
        in_time: DateTime<Utc>,
    ) -> Result<Registration, ActionError> {
        caller.require_organizer()?;
        let registration = self
            .blocking(move |db| db.set_in_time(registration_id, in_time))
            .await?;
        self.publish_attendance(registration.clone()).await;
        Ok(registration)
    }

    pub async fn set_out_time(
        &self,
        caller: &Caller,
        registration_id: Uuid,
        out_time: DateTime<Utc>,
    ) -> Result<Registration, ActionError> {
        caller.require_organizer()?;
        let registration = self
            .blocking(move |db| db.set_out_time(registration_id, out_time, Utc::now()))
            .await?;
        self.publish_attendance(registration.clone()).await;
        Ok(registration)
    }

    async fn registration(&self, registration_id: Uuid) -> Result<Registration, ActionError> {
        self.blocking(move |db| {
            db.get_registration(registration_id)?
                .ok_or(mitra_db::StoreError::NotFound("registration"))
        })
        .await
    }

    /// Push the changed row and fresh stats to the attendance room. Runs after
    /// the change is committed, so a failure here is logged and swallowed;
    /// watchers catch up on their next stats poll.
    async fn publish_attendance(&self, registration: Registration) {
        let event_id = registration.event_id;
        let stats = match self.blocking(move |db| db.attendance_stats(event_id)).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(
                    "Attendance update for {} not broadcast: {}",
                    registration.registration_id, e
                );
                return;
            }
        };
        self.dispatcher
            .broadcast(
                RoomKey::Attendance(event_id),
                &ServerEvent::AttendanceUpdated {
                    event_id,
                    registration: Some(registration),
                    stats,
                },
                None,
            )
            .await;
    }
}
