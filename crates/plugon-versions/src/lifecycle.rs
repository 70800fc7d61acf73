//! Version lifecycle engine
//!
//! Drives the versions table: exactly one active version per plugin,
//! promotion mirrors the active payload into the primary record, rollback
//! preserves the displaced version as a rollback target, and archival
//! retires old versions while keeping the newest N.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use plugon_common::{PlugonError, Result};
use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::{PluginManifest, PluginVersionRecord, VersionStatus};
use plugon_core::utils::compare_versions_desc;
use plugon_storage::PluginRepository;

use crate::compat::{analyze, CompatibilityReport};
use crate::store::VersionStore;

/// Options for a rollback
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Keep the displaced active version around as a rollback target
    pub preserve_current_version: bool,

    /// Reason recorded on the displaced row and in the rollback event
    pub reason: String,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            preserve_current_version: true,
            reason: "operator rollback".to_string(),
        }
    }
}

/// The version lifecycle engine
pub struct VersionLifecycle {
    store: Arc<dyn VersionStore>,
    repository: Arc<dyn PluginRepository>,
    events: EventBus,
}

impl VersionLifecycle {
    /// Create an engine over a version store and the primary repository
    pub fn new(
        store: Arc<dyn VersionStore>,
        repository: Arc<dyn PluginRepository>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            repository,
            events,
        }
    }

    /// All versions of a plugin, newest first
    ///
    /// Semver ordering with pre-release tags below the release; rows whose
    /// version does not parse sort after parseable ones, lexically
    /// descending. Upload-date ties break by id.
    #[instrument(level = "debug", skip(self))]
    pub async fn list_versions(&self, name: &str) -> Result<Vec<PluginVersionRecord>> {
        let mut rows = self.store.list(name).await?;
        rows.sort_by(|a, b| {
            compare_versions_desc(&a.version, &b.version)
                .then_with(|| a.upload_date.cmp(&b.upload_date))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    /// The single active version, if any
    pub async fn get_active(&self, name: &str) -> Result<Option<PluginVersionRecord>> {
        let rows = self.store.list(name).await?;
        Ok(rows
            .into_iter()
            .find(|r| r.is_active && r.status == VersionStatus::Active))
    }

    /// Insert a new version row; optionally promote it immediately
    #[instrument(level = "debug", skip(self, record), fields(name = %record.plugin_name, version = %record.version))]
    pub async fn add_version(
        &self,
        record: PluginVersionRecord,
        make_active: bool,
    ) -> Result<PluginVersionRecord> {
        let name = record.plugin_name.clone();
        let version = record.version.clone();
        self.store.insert(&record).await?;
        debug!("🔧 added version {}@{}", name, version);

        if make_active {
            return self.promote(&name, &version).await;
        }
        Ok(record)
    }

    /// Promote a version to active
    ///
    /// Transactionally flips every `is_active` flag for the plugin, stamps
    /// the promotion date, then mirrors the promoted payload into the
    /// primary record. Promoting the already-active version is a no-op
    /// beyond refreshing the promotion date.
    #[instrument(level = "info", skip(self))]
    pub async fn promote(&self, name: &str, version: &str) -> Result<PluginVersionRecord> {
        let promoted = self.store.set_active_exclusive(name, version).await?;

        // mirror the essential fields into the primary record
        let manifest: PluginManifest = serde_json::from_value(promoted.manifest.clone())
            .map_err(|e| PlugonError::Internal(format!("stored manifest unreadable: {}", e)))?;
        self.repository
            .save(
                &manifest,
                &promoted.file_path,
                promoted.file_size,
                &promoted.checksum,
            )
            .await?;

        info!("✅ promoted {}@{}", name, version);
        self.events.emit(PluginEvent::VersionPromoted {
            name: name.to_string(),
            version: version.to_string(),
        });
        Ok(promoted)
    }

    /// Roll back to a prior version
    ///
    /// The target must exist. With `preserve_current_version` the
    /// displaced active version is marked as a rollback target before the
    /// promotion.
    #[instrument(level = "info", skip(self, options))]
    pub async fn rollback(
        &self,
        name: &str,
        target: &str,
        options: &RollbackOptions,
    ) -> Result<PluginVersionRecord> {
        if self.store.get(name, target).await?.is_none() {
            return Err(PlugonError::NotFound(format!(
                "rollback target {}@{} does not exist",
                name, target
            )));
        }

        let current = self.get_active(name).await?;
        let from_version = current.as_ref().map(|c| c.version.clone());

        if let Some(mut current) = current {
            if options.preserve_current_version && current.version != target {
                current.status = VersionStatus::RollbackTarget;
                current.rollback_reason = Some(options.reason.clone());
                current.deprecation_date = Some(Utc::now());
                self.store.update(&current).await?;
                debug!(
                    "🔧 preserved {}@{} as rollback target",
                    name, current.version
                );
            }
        }

        let promoted = self.promote(name, target).await?;

        warn!("⚠️ rolled back {} to {}: {}", name, target, options.reason);
        self.events.emit(PluginEvent::VersionRolledBack {
            name: name.to_string(),
            from_version,
            to_version: target.to_string(),
            reason: options.reason.clone(),
        });
        Ok(promoted)
    }

    /// Archive old versions, preserving the newest `keep_latest`
    ///
    /// The active version and rollback targets are never archived.
    #[instrument(level = "debug", skip(self))]
    pub async fn archive(&self, name: &str, keep_latest: usize) -> Result<Vec<String>> {
        let rows = self.list_versions(name).await?;
        let mut archived = Vec::new();

        for row in rows.into_iter().skip(keep_latest) {
            if row.is_active
                || row.status == VersionStatus::RollbackTarget
                || row.status == VersionStatus::Archived
            {
                continue;
            }
            let mut row = row;
            row.status = VersionStatus::Archived;
            row.deprecation_date = Some(Utc::now());
            self.store.update(&row).await?;
            archived.push(row.version);
        }

        if !archived.is_empty() {
            info!("✅ archived {} old versions of {}", archived.len(), name);
        }
        Ok(archived)
    }

    /// Delete a version row
    ///
    /// Refuses to delete the active version unless forced.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_version(&self, name: &str, version: &str, force: bool) -> Result<bool> {
        if let Some(row) = self.store.get(name, version).await? {
            if row.is_active && !force {
                return Err(PlugonError::Conflict(format!(
                    "{}@{} is the active version; use force to delete it",
                    name, version
                )));
            }
        }
        self.store.delete(name, version).await
    }

    /// Compatibility analysis between two stored versions
    #[instrument(level = "debug", skip(self))]
    pub async fn check_compatibility(
        &self,
        name: &str,
        from: &str,
        to: &str,
    ) -> Result<CompatibilityReport> {
        let from_row = self.store.get(name, from).await?.ok_or_else(|| {
            PlugonError::NotFound(format!("version {}@{} not found", name, from))
        })?;
        let to_row = self.store.get(name, to).await?.ok_or_else(|| {
            PlugonError::NotFound(format!("version {}@{} not found", name, to))
        })?;
        Ok(analyze(&from_row, &to_row))
    }
}
