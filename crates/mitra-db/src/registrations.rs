use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use mitra_types::models::{AttendanceStats, Registration};

use crate::models::{REGISTRATION_COLUMNS, RegistrationRow, to_millis};
use crate::{Database, StoreError};

/// 24 random bytes, URL-safe so the token can sit in a path segment.
fn new_exit_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Database {
    // -- Registrations --

    pub fn create_registration(
        &self,
        event_id: Uuid,
        volunteer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let id = Uuid::new_v4();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO registrations (id, event_id, volunteer_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.to_string(),
                    event_id.to_string(),
                    volunteer_id.to_string(),
                    to_millis(now)
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => StoreError::AlreadyRegistered,
                _ => StoreError::Sqlite(e),
            })?;

            query_registration(conn, id)?.ok_or(StoreError::NotFound("registration"))
        })
    }

    pub fn get_registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        self.with_conn(|conn| query_registration(conn, id))
    }

    /// All registrations of an event, in sign-up order.
    pub fn list_registrations(&self, event_id: Uuid) -> Result<Vec<Registration>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM registrations
                 WHERE event_id = ?1
                 ORDER BY created_at, rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([event_id.to_string()], RegistrationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RegistrationRow::into_registration).collect()
        })
    }

    // -- Attendance --

    /// Attendance checkbox and entry scan.
    ///
    /// Marking present the first time records `in_time` and issues the exit
    /// token. Marking present again keeps the original entry. Clearing is
    /// refused once an entry time exists.
    pub fn set_attendance(
        &self,
        id: Uuid,
        has_attended: bool,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        self.with_conn(|conn| {
            let current = query_registration(conn, id)?.ok_or(StoreError::NotFound("registration"))?;
            let key = id.to_string();

            match (has_attended, current.in_time) {
                (true, None) => {
                    conn.execute(
                        "UPDATE registrations SET has_attended = 1, in_time = ?2, exit_qr_token = ?3
                         WHERE id = ?1",
                        rusqlite::params![key, to_millis(now), new_exit_token()],
                    )?;
                    info!("Entry recorded for registration {}", id);
                }
                (true, Some(_)) => {
                    if current.has_attended {
                        debug!("Repeated entry for registration {} ignored", id);
                        return Ok(current);
                    }
                    conn.execute(
                        "UPDATE registrations SET has_attended = 1 WHERE id = ?1",
                        [&key],
                    )?;
                }
                (false, Some(_)) => return Err(StoreError::AttendanceLocked),
                (false, None) => {
                    conn.execute(
                        "UPDATE registrations SET has_attended = 0 WHERE id = ?1",
                        [&key],
                    )?;
                }
            }

            query_registration(conn, id)?.ok_or(StoreError::NotFound("registration"))
        })
    }

    /// Single-use exit scan. The token is retired in the same critical
    /// section that records `out_time`.
    pub fn consume_exit_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE exit_qr_token = ?1"
            );
            let row = tx
                .query_row(&sql, [token], RegistrationRow::from_row)
                .optional()?;

            let Some(row) = row else {
                let consumed: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM consumed_exit_tokens WHERE token = ?1)",
                    [token],
                    |r| r.get(0),
                )?;
                return Err(if consumed {
                    StoreError::ExitTokenUsed
                } else {
                    StoreError::NotFound("exit token")
                });
            };
            let current = row.into_registration()?;
            if current.in_time.is_none() {
                return Err(StoreError::NotCheckedIn);
            }
            if current.out_time.is_some() {
                return Err(StoreError::AlreadyCheckedOut);
            }

            let key = current.registration_id.to_string();
            tx.execute(
                "UPDATE registrations SET out_time = ?2, exit_qr_token = NULL WHERE id = ?1",
                rusqlite::params![key, to_millis(now)],
            )?;
            retire_token(&tx, token, &key, now)?;

            let updated = query_registration(&tx, current.registration_id)?
                .ok_or(StoreError::NotFound("registration"))?;
            tx.commit()?;
            info!("Exit recorded for registration {}", key);
            Ok(updated)
        })
    }

    /// Outstanding exit token of a registration.
    pub fn exit_token(&self, id: Uuid) -> Result<String, StoreError> {
        let current = self
            .get_registration(id)?
            .ok_or(StoreError::NotFound("registration"))?;
        if current.out_time.is_some() {
            return Err(StoreError::AlreadyCheckedOut);
        }
        current.exit_qr_token.ok_or(StoreError::NotCheckedIn)
    }

    /// Organizer override of the entry time. Issues an exit token if the
    /// volunteer has none and has not left yet.
    pub fn set_in_time(
        &self,
        id: Uuid,
        in_time: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        self.with_conn(|conn| {
            let current = query_registration(conn, id)?.ok_or(StoreError::NotFound("registration"))?;
            if current.out_time.is_some_and(|out| out < in_time) {
                return Err(StoreError::InvalidTimes);
            }
            let token = match (&current.exit_qr_token, current.out_time) {
                (None, None) => Some(new_exit_token()),
                (existing, _) => existing.clone(),
            };
            conn.execute(
                "UPDATE registrations SET in_time = ?2, exit_qr_token = ?3 WHERE id = ?1",
                rusqlite::params![id.to_string(), to_millis(in_time), token],
            )?;
            query_registration(conn, id)?.ok_or(StoreError::NotFound("registration"))
        })
    }

    /// Organizer override of the exit time. Retires any outstanding token.
    pub fn set_out_time(
        &self,
        id: Uuid,
        out_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let current = query_registration(&tx, id)?.ok_or(StoreError::NotFound("registration"))?;
            let Some(in_time) = current.in_time else {
                return Err(StoreError::NotCheckedIn);
            };
            if out_time < in_time {
                return Err(StoreError::InvalidTimes);
            }

            let key = id.to_string();
            tx.execute(
                "UPDATE registrations SET out_time = ?2, exit_qr_token = NULL WHERE id = ?1",
                rusqlite::params![key, to_millis(out_time)],
            )?;
            if let Some(token) = current.exit_qr_token.as_deref() {
                retire_token(&tx, token, &key, now)?;
            }

            let updated = query_registration(&tx, id)?.ok_or(StoreError::NotFound("registration"))?;
            tx.commit()?;
            Ok(updated)
        })
    }

    pub fn attendance_stats(&self, event_id: Uuid) -> Result<AttendanceStats, StoreError> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(has_attended), 0),
                        COUNT(in_time),
                        COUNT(out_time),
                        COALESCE(SUM(in_time IS NOT NULL AND out_time IS NULL), 0)
                 FROM registrations WHERE event_id = ?1",
                [event_id.to_string()],
                |row| {
                    Ok(AttendanceStats {
                        registered: row.get::<_, i64>(0)? as u64,
                        attended: row.get::<_, i64>(1)? as u64,
                        checked_in: row.get::<_, i64>(2)? as u64,
                        checked_out: row.get::<_, i64>(3)? as u64,
                        currently_present: row.get::<_, i64>(4)? as u64,
                    })
                },
            )?;
            Ok(stats)
        })
    }
}

fn retire_token(
    conn: &Connection,
    token: &str,
    registration_id: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO consumed_exit_tokens (token, registration_id, consumed_at)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![token, registration_id, to_millis(now)],
    )?;
    Ok(())
}

fn query_registration(conn: &Connection, id: Uuid) -> Result<Option<Registration>, StoreError> {
    let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], RegistrationRow::from_row)
        .optional()?
        .map(RegistrationRow::into_registration)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registered(db: &Database) -> Registration {
        db.create_registration(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .unwrap()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let event_id = Uuid::new_v4();
        let volunteer = Uuid::new_v4();
        db.create_registration(event_id, volunteer, Utc::now()).unwrap();
        let err = db
            .create_registration(event_id, volunteer, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyRegistered));
        assert_eq!(db.list_registrations(event_id).unwrap().len(), 1);
    }

    #[test]
    fn second_entry_scan_keeps_first_in_time() {
        let db = Database::open_in_memory().unwrap();
        let reg = registered(&db);
        let first = Utc::now();

        let entered = db.set_attendance(reg.registration_id, true, first).unwrap();
        assert!(entered.has_attended);
        assert!(entered.exit_qr_token.is_some());
        let in_time = entered.in_time.unwrap();

        let again = db
            .set_attendance(reg.registration_id, true, first + Duration::minutes(10))
            .unwrap();
        assert_eq!(again.in_time, Some(in_time));
        assert_eq!(again.exit_qr_token, entered.exit_qr_token);
    }

    #[test]
    fn cannot_uncheck_after_entry() {
        let db = Database::open_in_memory().unwrap();
        let reg = registered(&db);

        // before entry the checkbox is free
        db.set_attendance(reg.registration_id, false, Utc::now()).unwrap();

        db.set_attendance(reg.registration_id, true, Utc::now()).unwrap();
        let err = db
            .set_attendance(reg.registration_id, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::AttendanceLocked));
        assert!(db.get_registration(reg.registration_id).unwrap().unwrap().has_attended);
    }

    #[test]
    fn exit_token_is_single_use() {
        let db = Database::open_in_memory().unwrap();
        let reg = registered(&db);
        let now = Utc::now();
        db.set_attendance(reg.registration_id, true, now).unwrap();
        let token = db.exit_token(reg.registration_id).unwrap();

        let out = db.consume_exit_token(&token, now + Duration::hours(2)).unwrap();
        let out_time = out.out_time.unwrap();
        assert!(out.exit_qr_token.is_none());

        let err = db
            .consume_exit_token(&token, now + Duration::hours(3))
            .unwrap_err();
        assert!(matches!(err, StoreError::ExitTokenUsed));
        let stored = db.get_registration(reg.registration_id).unwrap().unwrap();
        assert_eq!(stored.out_time, Some(out_time));

        let err = db.consume_exit_token("bogus", now).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(matches!(
            db.exit_token(reg.registration_id),
            Err(StoreError::AlreadyCheckedOut)
        ));
    }

    #[test]
    fn manual_times() {
        let db = Database::open_in_memory().unwrap();
        let reg = registered(&db);
        let now = Utc::now();

        let err = db.set_out_time(reg.registration_id, now, now).unwrap_err();
        assert!(matches!(err, StoreError::NotCheckedIn));

        let with_in = db.set_in_time(reg.registration_id, now).unwrap();
        assert!(!with_in.has_attended);
        let token = with_in.exit_qr_token.clone().unwrap();

        let err = db
            .set_out_time(reg.registration_id, now - Duration::minutes(1), now)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTimes));

        let done = db
            .set_out_time(reg.registration_id, now + Duration::hours(1), now)
            .unwrap();
        assert!(done.exit_qr_token.is_none());
        assert!(matches!(
            db.consume_exit_token(&token, now),
            Err(StoreError::ExitTokenUsed)
        ));
    }

    #[test]
    fn stats_count_each_stage() {
        let db = Database::open_in_memory().unwrap();
        let event_id = Uuid::new_v4();
        let now = Utc::now();
        let regs: Vec<Registration> = (0..4)
            .map(|_| db.create_registration(event_id, Uuid::new_v4(), now).unwrap())
            .collect();

        db.set_attendance(regs[0].registration_id, true, now).unwrap();
        db.set_attendance(regs[1].registration_id, true, now).unwrap();
        let token = db.exit_token(regs[1].registration_id).unwrap();
        db.consume_exit_token(&token, now + Duration::hours(1)).unwrap();

        let stats = db.attendance_stats(event_id).unwrap();
        assert_eq!(
            stats,
            AttendanceStats {
                registered: 4,
                attended: 2,
                checked_in: 2,
                checked_out: 1,
                currently_present: 1,
            }
        );
        assert_eq!(db.attendance_stats(Uuid::new_v4()).unwrap().registered, 0);
    }
}
