//! Persisted resume state
//!
//! Stores one small JSON record per URL in a resume directory so an
//! interrupted transfer can continue across process restarts. Resumption is
//! a best-effort optimization: every validation failure here degrades to
//! "start fresh" and is never surfaced to the caller as an error.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::core::error::{Error, Result};

/// Progress record persisted for one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub url: String,
    pub file_path: PathBuf,
    pub total_size: u64,
    /// Contiguous bytes confirmed written from the start of the file
    pub downloaded: u64,
    pub chunk_size: u64,
    /// When this record was written, not the remote file's timestamp
    pub last_modified: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Durable store of resume records, one JSON file per URL
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// Open a store rooted at `dir`, defaulting to a `sharedl-resume`
    /// directory under the system temp dir. The directory is created
    /// eagerly; failure to create it only disables resumption.
    pub fn new(dir: Option<PathBuf>) -> Self {
        let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("sharedl-resume"));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("Could not create resume directory {}: {e}", dir.display());
        }
        Self { dir }
    }

    /// Path of the record file for a URL. The derivation is deliberately
    /// weak (truncated digest); the record contents re-validate identity.
    fn record_path(&self, url: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
        self.dir.join(format!("resume_{}.json", &digest[..16]))
    }

    /// Atomically persist a record: write to a temp file, then rename
    pub async fn save(&self, url: &str, record: &ResumeRecord) -> Result<()> {
        let path = self.record_path(url);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::InvalidInput(format!("failed to serialize resume record: {e}")))?;

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Load the record for a URL. Absence and unreadable or malformed
    /// records all yield `None`.
    pub async fn load(&self, url: &str) -> Option<ResumeRecord> {
        let path = self.record_path(url);
        let data = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Ignoring malformed resume record {}: {e}", path.display());
                None
            }
        }
    }

    /// Remove the record for a URL; absence is not an error
    pub async fn clear(&self, url: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(url)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a download of `url` into `output_path` can resume.
    ///
    /// True only if a record exists for the same output path, the file is
    /// present with exactly `downloaded` bytes, and the file has not been
    /// touched since the record was written. Every mismatch silently yields
    /// `None`.
    pub async fn is_resumable(&self, url: &str, output_path: &Path) -> Option<ResumeRecord> {
        let record = self.load(url).await?;

        if record.file_path != output_path {
            return None;
        }

        let metadata = tokio::fs::metadata(output_path).await.ok()?;
        if metadata.len() != record.downloaded {
            return None;
        }

        let mtime = metadata.modified().ok()?;
        if mtime > record.last_modified {
            return None;
        }

        Some(record)
    }

    /// Garbage-collect records whose file mtime is older than `max_age`.
    /// Interruptible between entries; individual delete failures are
    /// ignored.
    pub async fn cleanup_older_than(
        &self,
        max_age: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                continue;
            }

            if let Ok(mtime) = metadata.modified() {
                if mtime < cutoff {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }

        Ok(())
    }
}
