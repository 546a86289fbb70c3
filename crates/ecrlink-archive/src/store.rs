//! Record persistence.
//!
//! The store is keyed by the record's timestamp and transaction id; saving
//! twice in the same second de-duplicates with a numeric suffix.

#![allow(async_fn_in_trait)]

use crate::error::{ArchiveError, ArchiveResult};
use crate::record::TransactionRecord;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension shared by all archived records.
pub const RECORD_EXTENSION: &str = ".ecrtn.txt";

/// Contract for archiving completed transactions.
pub trait RecordStore: Send + Sync {
    /// Persist a record; returns where it landed.
    async fn save(&self, record: &TransactionRecord) -> ArchiveResult<PathBuf>;

    /// Load a record by path.
    async fn load(&self, path: &Path) -> ArchiveResult<TransactionRecord>;

    /// All record paths in the store, unordered.
    async fn list(&self) -> ArchiveResult<Vec<PathBuf>>;
}

/// Filesystem-backed store: one text file per record in a flat directory.
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// Use `dir` as the archive root, creating it on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// First free path for the record's stem: `<stem>.ecrtn.txt`, then
    /// `<stem>-1.ecrtn.txt` and so on.
    async fn free_path(&self, stem: &str) -> PathBuf {
        let candidate = self.dir.join(format!("{stem}{RECORD_EXTENSION}"));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            let mut n = 1u32;
            loop {
                let candidate = self.dir.join(format!("{stem}-{n}{RECORD_EXTENSION}"));
                if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                    return candidate;
                }
                n += 1;
            }
        }
        candidate
    }
}

impl RecordStore for DirectoryStore {
    async fn save(&self, record: &TransactionRecord) -> ArchiveResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.free_path(&record.file_stem()).await;
        tokio::fs::write(&path, record.to_text()).await?;
        info!(path = %path.display(), "transaction record archived");
        Ok(path)
    }

    async fn load(&self, path: &Path) -> ArchiveResult<TransactionRecord> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::NotFound(path.display().to_string())
            } else {
                ArchiveError::Io(e)
            }
        })?;
        TransactionRecord::from_text(&text)
    }

    async fn list(&self) -> ArchiveResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(RECORD_EXTENSION) {
                paths.push(entry.path());
            }
        }
        debug!(count = paths.len(), "listed archived records");
        Ok(paths)
    }
}
