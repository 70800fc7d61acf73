//! Bundle blob store
//!
//! Owns the raw bundle files under `<root>/plugins/`, keyed by
//! `{name}-{version}.zip`. Writes are crash-safe: the bundle lands in a
//! temp file which is fsynced and renamed into place. Deletes are
//! idempotent. At boot the store is reconciled against the repository:
//! blobs without a record are orphaned, records without a blob are
//! quarantined.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use plugon_common::{PlugonError, Result};
use plugon_core::types::PluginStatus;
use plugon_core::utils::blob_key;

use crate::repository::{ListOptions, PluginRepository, StatusFilter};

/// Outcome of a boot-time reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Blob files with no matching repository record
    pub orphaned_blobs: Vec<String>,

    /// Records whose blob is missing; these were quarantined
    pub quarantined_records: Vec<String>,
}

/// File-backed bundle store
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a store rooted at `<root>/plugins/`, creating the directory
    pub async fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.join("plugins"),
        };
        fs::create_dir_all(&store.root)
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to create blob root: {}", e)))?;
        debug!("🔧 blob store rooted at {}", store.root.display());
        Ok(store)
    }

    /// Path of the bundle for `(name, version)`
    pub fn path_for(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(blob_key(name, version))
    }

    /// Crash-safe write: temp file, fsync, rename
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub async fn write(&self, name: &str, version: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.path_for(name, version);
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to create temp blob: {}", e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to write blob: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to sync blob: {}", e)))?;
        drop(file);

        fs::rename(&temp, &target)
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to publish blob: {}", e)))?;

        debug!("✅ stored bundle at {}", target.display());
        Ok(target)
    }

    /// Read the full bundle
    pub async fn read(&self, name: &str, version: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name, version);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlugonError::NotFound(format!("bundle {} not found", blob_key(name, version)))
            } else {
                PlugonError::Storage(format!("failed to read blob: {}", e))
            }
        })
    }

    /// Whether the bundle exists
    pub async fn exists(&self, name: &str, version: &str) -> bool {
        fs::metadata(self.path_for(name, version)).await.is_ok()
    }

    /// Idempotent delete
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, name: &str, version: &str) -> Result<()> {
        match fs::remove_file(self.path_for(name, version)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlugonError::Storage(format!("failed to delete blob: {}", e))),
        }
    }

    /// File names of every stored bundle
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to list blobs: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PlugonError::Storage(format!("failed to list blobs: {}", e)))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(".zip") {
                names.push(file_name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Reconcile blobs with the repository
    ///
    /// A blob no record points at is reported as orphaned; a record whose
    /// blob is gone is quarantined (status set to disabled).
    #[instrument(level = "info", skip(self, repository))]
    pub async fn reconcile(&self, repository: &dyn PluginRepository) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let records = repository
            .list(&ListOptions {
                status: StatusFilter::All,
                ..Default::default()
            })
            .await?;
        let blobs = self.list().await?;

        let expected: Vec<String> = records
            .iter()
            .filter_map(|r| {
                Path::new(&r.file_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .collect();

        for blob in &blobs {
            if !expected.contains(blob) {
                warn!("⚠️ orphaned blob with no record: {}", blob);
                report.orphaned_blobs.push(blob.clone());
            }
        }

        for record in &records {
            let present = Path::new(&record.file_path)
                .file_name()
                .map(|n| blobs.iter().any(|b| b.as_str() == n.to_string_lossy()))
                .unwrap_or(false);
            if !present {
                warn!(
                    "⚠️ record {} has no blob on disk, quarantining",
                    record.name
                );
                repository
                    .update_status(&record.name, PluginStatus::Disabled)
                    .await?;
                report.quarantined_records.push(record.name.clone());
            }
        }

        info!(
            "✅ blob reconcile: {} orphaned, {} quarantined",
            report.orphaned_blobs.len(),
            report.quarantined_records.len()
        );
        Ok(report)
    }
}
