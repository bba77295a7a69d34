//! Reference client for the chat and attendance service: an owned socket
//! connection, a REST client, and the controllers that drive one event chat
//! or one attendance screen.

pub mod api;
pub mod attendance;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod typing;
pub mod upload;

pub use api::{ApiClient, AttendanceApi, ChatApi};
pub use attendance::{AttendanceController, QrPayload, SCAN_FAILED, ScanOutcome};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{CommandSink, Connection, ConnectionState};
pub use error::{ClientError, ErrorKind};
pub use session::{ChatSession, Notice, SessionState, anchored_scroll_offset};
pub use typing::{TypingNotifier, TypingRoster, TypingSignal};
pub use upload::{OperationId, PendingFile, UploadProgress, UploadTracker};
