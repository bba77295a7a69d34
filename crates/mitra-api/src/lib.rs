pub mod auth;
pub mod error;
pub mod files;
pub mod messages;
pub mod middleware;
pub mod registrations;
pub mod router;
pub mod socket;
pub mod storage;

pub use auth::{AppState, AppStateInner};
pub use router::build_router;
