//! Server-side chat and attendance actions. Each one validates the caller,
//! mutates the store off the async runtime, then broadcasts the result.

pub mod attendance;
pub mod chat;

use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use mitra_db::{Database, StoreError};
use mitra_types::api::Claims;
use mitra_types::models::Role;

use crate::dispatcher::{ConnId, Dispatcher, RoomKey};
use crate::error::ActionError;

/// Who is acting. `conn` is set for socket commands, `None` for REST calls.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub conn: Option<ConnId>,
}

impl Caller {
    pub fn from_claims(claims: &Claims, conn: Option<ConnId>) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username.clone(),
            role: claims.role,
            conn,
        }
    }

    fn require_organizer(&self) -> Result<(), ActionError> {
        if self.role.is_organizer() {
            Ok(())
        } else {
            Err(ActionError::NotOrganizer)
        }
    }
}

#[derive(Clone)]
pub struct Actions {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Actions {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ActionError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ActionError::Internal
            })?;
        result.map_err(|e| {
            if e.is_internal() {
                error!("Store failure: {}", e);
            }
            ActionError::from(e)
        })
    }

    /// Socket callers must have joined the room they act in.
    async fn require_joined(&self, caller: &Caller, room: RoomKey) -> Result<(), ActionError> {
        match caller.conn {
            Some(conn) if !self.dispatcher.is_member(room, conn).await => Err(ActionError::NotJoined),
            _ => Ok(()),
        }
    }
}
