use std::path::PathBuf;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// On-disk attachment storage.
///
/// Each upload is a single flat file at `{dir}/{upload_id}`; metadata lives
/// in the `uploads` table.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Upload directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Path to the file for a given upload. Ids are UUIDs, so no traversal.
    pub fn file_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Write the bytes and return their SHA-256 as lowercase hex.
    pub async fn write(&self, id: Uuid, data: &[u8]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = hex::encode(hasher.finalize());

        let path = self.file_path(id);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(sha256)
    }

    pub async fn open(&self, id: Uuid) -> std::io::Result<fs::File> {
        fs::File::open(self.file_path(id)).await
    }

    /// Remove a stored file, e.g. when recording its metadata failed.
    pub async fn delete_file(&self, id: Uuid) -> Result<()> {
        match fs::remove_file(self.file_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("File for upload {} already gone", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
