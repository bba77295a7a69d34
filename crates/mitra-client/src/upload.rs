use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::Stream;
use uuid::Uuid;

use mitra_types::rules::{self, MAX_ATTACHMENT_BYTES};

use crate::error::ClientError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Identifies one upload. Two uploads of the same file get different ids.
pub type OperationId = Uuid;

/// Progress shared between the request body stream and whoever displays it.
#[derive(Debug)]
pub struct UploadProgress {
    sent: AtomicU64,
    total: u64,
    cancelled: AtomicBool,
}

impl UploadProgress {
    pub fn new(total: u64) -> Self {
        Self {
            sent: AtomicU64::new(0),
            total,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// 0..=100. An empty body counts as done.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let sent = self.bytes_sent().min(self.total);
        (sent * 100 / self.total) as u8
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn record(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// A file picked for sending, held in memory until the upload finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl PendingFile {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Local checks run before any request is made.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.size() > MAX_ATTACHMENT_BYTES {
            return Err(ClientError::FileTooLarge);
        }
        if self.data.is_empty() {
            return Err(ClientError::Validation("The selected file is empty.".into()));
        }
        if !rules::is_allowed_mime(&self.mime_type) {
            return Err(ClientError::UnsupportedType(self.mime_type.clone()));
        }
        Ok(())
    }
}

/// Uploads in flight for one controller.
#[derive(Debug, Default)]
pub struct UploadTracker {
    ops: Mutex<HashMap<OperationId, Arc<UploadProgress>>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ops(&self) -> std::sync::MutexGuard<'_, HashMap<OperationId, Arc<UploadProgress>>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, total: u64) -> (OperationId, Arc<UploadProgress>) {
        let id = Uuid::new_v4();
        let progress = Arc::new(UploadProgress::new(total));
        self.ops().insert(id, progress.clone());
        (id, progress)
    }

    pub fn progress(&self, id: OperationId) -> Option<u8> {
        self.ops().get(&id).map(|p| p.percent())
    }

    /// Stop feeding the request body and forget the operation. Bytes already
    /// sent may still reach the server.
    pub fn cancel(&self, id: OperationId) -> bool {
        match self.ops().remove(&id) {
            Some(progress) => {
                progress.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, id: OperationId) {
        self.ops().remove(&id);
    }

    pub fn active(&self) -> Vec<OperationId> {
        self.ops().keys().copied().collect()
    }
}

/// Request body that reports progress per chunk and aborts on cancel.
pub(crate) fn upload_stream(
    data: Bytes,
    progress: Arc<UploadProgress>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + Sync + 'static {
    futures_util::stream::unfold(
        (data, 0usize, progress, false),
        |(data, offset, progress, done)| async move {
            if done || offset >= data.len() {
                return None;
            }
            if progress.is_cancelled() {
                let err = io::Error::new(io::ErrorKind::Interrupted, "upload cancelled");
                return Some((Err(err), (data, offset, progress, true)));
            }
            let end = (offset + CHUNK_SIZE).min(data.len());
            let chunk = data.slice(offset..end);
            progress.record(chunk.len());
            Some((Ok(chunk), (data, end, progress, false)))
        },
    )
}
