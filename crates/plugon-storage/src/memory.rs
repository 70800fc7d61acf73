//! In-memory repository backend
//!
//! The conformance target for the repository contract: tests run against
//! this backend, and small single-node deployments can use it directly.
//! One lock guards records, download history and trust rows together so
//! `record_download` is atomic by construction.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use plugon_common::{PlugonError, Result};
use plugon_core::types::{
    PluginDownloadRecord, PluginManifest, PluginRecord, PluginStatus, TrustAssignment,
};
use plugon_core::utils::compare_versions_desc;

use crate::repository::{
    ListOptions, PluginRepository, RegistryStats, SortField, TrustAssignmentStore,
};

#[derive(Debug, Default)]
struct Inner {
    plugins: HashMap<String, PluginRecord>,
    downloads: Vec<PluginDownloadRecord>,
    trust: Vec<TrustAssignment>,
}

/// In-memory implementation of the repository contract
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_records(records: &mut [PluginRecord], sort_by: SortField, descending: bool) {
    records.sort_by(|a, b| {
        let ordering = match sort_by {
            SortField::Name => a.name.cmp(&b.name),
            SortField::UploadDate => a
                .upload_date
                .cmp(&b.upload_date)
                .then_with(|| a.id.cmp(&b.id)),
            SortField::DownloadCount => a.download_count.cmp(&b.download_count),
            // ascending version order is the reverse of newest-first
            SortField::Version => compare_versions_desc(&a.version, &b.version).reverse(),
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn paginate(records: Vec<PluginRecord>, offset: usize, limit: usize) -> Vec<PluginRecord> {
    let iter = records.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

#[async_trait]
impl PluginRepository for MemoryRepository {
    #[instrument(level = "debug", skip(self, manifest), fields(name = %manifest.name))]
    async fn save(
        &self,
        manifest: &PluginManifest,
        file_path: &str,
        file_size: u64,
        checksum: &str,
    ) -> Result<PluginRecord> {
        let mut inner = self.inner.write().await;

        // checksum uniqueness across records
        if inner
            .plugins
            .values()
            .any(|r| r.checksum == checksum && r.name != manifest.name)
        {
            return Err(PlugonError::Database(format!(
                "checksum {} already belongs to another plugin",
                checksum
            )));
        }

        let now = Utc::now();
        let existing = inner.plugins.get(&manifest.name);
        let record = PluginRecord {
            id: existing.map(|r| r.id).unwrap_or_else(Uuid::new_v4),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            license: manifest.license.clone(),
            manifest: serde_json::to_value(manifest)?,
            file_path: file_path.to_string(),
            file_size,
            checksum: checksum.to_string(),
            upload_date: now,
            last_accessed: existing.and_then(|r| r.last_accessed),
            download_count: existing.map(|r| r.download_count).unwrap_or(0),
            status: PluginStatus::Active,
            tags: existing.map(|r| r.tags.clone()).unwrap_or_default(),
            dependencies: manifest.dependencies.clone(),
            created_at: existing.map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        debug!("🔧 saved plugin record {}@{}", record.name, record.version);
        inner.plugins.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .plugins
            .get(name)
            .filter(|r| r.status == PluginStatus::Active)
            .cloned())
    }

    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<PluginRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .plugins
            .values()
            .find(|r| r.checksum == checksum)
            .cloned())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<PluginRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<PluginRecord> = inner
            .plugins
            .values()
            .filter(|r| options.status.matches(r.status))
            .cloned()
            .collect();
        sort_records(&mut records, options.sort_by, options.descending);
        Ok(paginate(records, options.offset, options.limit))
    }

    async fn search(&self, query: &str) -> Result<Vec<PluginRecord>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().await;
        let mut records: Vec<PluginRecord> = inner
            .plugins
            .values()
            .filter(|r| r.status == PluginStatus::Active)
            .filter(|r| {
                r.name.to_lowercase().contains(&needle)
                    || r.description.to_lowercase().contains(&needle)
                    || r.author.to_lowercase().contains(&needle)
                    || r.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    #[instrument(level = "debug", skip(self))]
    async fn record_download(
        &self,
        name: &str,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let (plugin_id, version) = {
            let record = inner
                .plugins
                .get_mut(name)
                .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;
            record.download_count += 1;
            record.last_accessed = Some(now);
            (record.id, record.version.clone())
        };

        inner.downloads.push(PluginDownloadRecord {
            id: Uuid::new_v4(),
            plugin_id,
            version,
            download_date: now,
            user_agent: user_agent.map(|s| s.to_string()),
            ip_address: ip_address.map(|s| s.to_string()),
        });
        Ok(())
    }

    async fn downloads_for(&self, name: &str) -> Result<Vec<PluginDownloadRecord>> {
        let inner = self.inner.read().await;
        let Some(record) = inner.plugins.get(name) else {
            return Ok(Vec::new());
        };
        let mut downloads: Vec<PluginDownloadRecord> = inner
            .downloads
            .iter()
            .filter(|d| d.plugin_id == record.id)
            .cloned()
            .collect();
        downloads.sort_by(|a, b| b.download_date.cmp(&a.download_date));
        Ok(downloads)
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.plugins.remove(name) {
            Some(record) => {
                inner.downloads.retain(|d| d.plugin_id != record.id);
                debug!("🔧 deleted plugin record {}", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_status(&self, name: &str, status: PluginStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .plugins
            .get_mut(name)
            .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let inner = self.inner.read().await;
        let total_plugins = inner.plugins.len() as u64;
        let total_downloads: u64 = inner.plugins.values().map(|r| r.download_count).sum();
        let total_size_bytes: u64 = inner.plugins.values().map(|r| r.file_size).sum();

        let tie_break = |field_cmp: Ordering, a: &PluginRecord, b: &PluginRecord| {
            field_cmp.then_with(|| a.id.cmp(&b.id))
        };

        Ok(RegistryStats {
            total_plugins,
            total_downloads,
            total_size_bytes,
            average_size_bytes: if total_plugins == 0 {
                0
            } else {
                total_size_bytes / total_plugins
            },
            most_downloaded: inner
                .plugins
                .values()
                .max_by(|a, b| tie_break(a.download_count.cmp(&b.download_count), a, b))
                .map(|r| r.name.clone()),
            oldest: inner
                .plugins
                .values()
                .min_by(|a, b| tie_break(a.upload_date.cmp(&b.upload_date), a, b))
                .map(|r| r.name.clone()),
            newest: inner
                .plugins
                .values()
                .max_by(|a, b| tie_break(a.upload_date.cmp(&b.upload_date), a, b))
                .map(|r| r.name.clone()),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl TrustAssignmentStore for MemoryRepository {
    async fn save_assignment(&self, assignment: &TrustAssignment) -> Result<()> {
        let mut inner = self.inner.write().await;
        for row in inner.trust.iter_mut() {
            if row.is_active
                && row.plugin_name == assignment.plugin_name
                && row.version == assignment.version
            {
                row.is_active = false;
            }
        }
        inner.trust.push(assignment.clone());
        Ok(())
    }

    async fn load_active_assignments(&self) -> Result<Vec<TrustAssignment>> {
        let inner = self.inner.read().await;
        Ok(inner.trust.iter().filter(|a| a.is_active).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugon_core::types::TrustLevel;

    fn manifest(name: &str, version: &str) -> PluginManifest {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "version": version,
            "description": format!("{} plugin", name),
            "author": "tester",
            "license": "MIT",
            "entryPoint": "Entry",
            "compatibilityVersion": "1.0.0",
        }))
        .unwrap()
    }

    async fn seeded() -> MemoryRepository {
        let repo = MemoryRepository::new();
        for (name, version, checksum) in [
            ("alpha", "1.0.0", "c1"),
            ("beta", "2.0.0", "c2"),
            ("gamma", "0.9.0", "c3"),
        ] {
            repo.save(&manifest(name, version), &format!("{}.zip", name), 100, checksum)
                .await
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let repo = MemoryRepository::new();
        let record = repo
            .save(&manifest("greeter", "1.0.0"), "greeter-1.0.0.zip", 512, "abc")
            .await
            .unwrap();
        assert_eq!(record.name, "greeter");
        assert_eq!(record.download_count, 0);

        let fetched = repo.get_by_name("greeter").await.unwrap().unwrap();
        assert_eq!(fetched.checksum, "abc");
    }

    #[tokio::test]
    async fn test_upsert_preserves_download_count_and_identity() {
        let repo = MemoryRepository::new();
        let first = repo
            .save(&manifest("p", "1.0.0"), "p-1.0.0.zip", 100, "c1")
            .await
            .unwrap();
        repo.record_download("p", None, None).await.unwrap();

        let second = repo
            .save(&manifest("p", "1.1.0"), "p-1.1.0.zip", 120, "c2")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.download_count, 1);
        assert_eq!(second.version, "1.1.0");
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_checksum_uniqueness_enforced() {
        let repo = MemoryRepository::new();
        repo.save(&manifest("a", "1.0.0"), "a.zip", 1, "same")
            .await
            .unwrap();
        let err = repo
            .save(&manifest("b", "1.0.0"), "b.zip", 1, "same")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_get_by_name_filters_to_active() {
        let repo = seeded().await;
        repo.update_status("alpha", PluginStatus::Disabled)
            .await
            .unwrap();
        assert!(repo.get_by_name("alpha").await.unwrap().is_none());

        // but an all-status listing still shows it
        let all = repo
            .list(&ListOptions {
                status: crate::repository::StatusFilter::All,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(all.iter().any(|r| r.name == "alpha"));
    }

    #[tokio::test]
    async fn test_get_by_checksum() {
        let repo = seeded().await;
        let found = repo.get_by_checksum("c2").await.unwrap().unwrap();
        assert_eq!(found.name, "beta");
        assert!(repo.get_by_checksum("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorting_and_pagination() {
        let repo = seeded().await;

        let by_name = repo.list(&ListOptions::default()).await.unwrap();
        let names: Vec<&str> = by_name.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);

        let by_version_desc = repo
            .list(&ListOptions {
                sort_by: SortField::Version,
                descending: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_version_desc[0].name, "beta");
        assert_eq!(by_version_desc[2].name, "gamma");

        let page = repo
            .list(&ListOptions {
                offset: 1,
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "beta");
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_active_only() {
        let repo = seeded().await;
        repo.update_status("beta", PluginStatus::Disabled)
            .await
            .unwrap();

        let hits = repo.search("ALPHA").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "alpha");

        // disabled records never match
        assert!(repo.search("beta").await.unwrap().is_empty());

        // substring across description
        let hits = repo.search("plugin").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_download_atomicity() {
        let repo = seeded().await;
        repo.record_download("alpha", Some("curl/8"), Some("10.0.0.1"))
            .await
            .unwrap();
        repo.record_download("alpha", None, None).await.unwrap();

        let record = repo.get_by_name("alpha").await.unwrap().unwrap();
        let downloads = repo.downloads_for("alpha").await.unwrap();
        // D1: the counter and the history agree
        assert_eq!(record.download_count, 2);
        assert_eq!(downloads.len(), 2);
        assert!(record.last_accessed.is_some());
        assert_eq!(downloads[1].user_agent.as_deref(), Some("curl/8"));
    }

    #[tokio::test]
    async fn test_download_unknown_plugin_fails_without_history() {
        let repo = seeded().await;
        assert!(repo.record_download("ghost", None, None).await.is_err());
        assert!(repo.downloads_for("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_downloads() {
        let repo = seeded().await;
        repo.record_download("alpha", None, None).await.unwrap();
        assert!(repo.delete("alpha").await.unwrap());
        assert!(!repo.delete("alpha").await.unwrap());
        assert!(repo.get_by_name("alpha").await.unwrap().is_none());
        assert!(repo.downloads_for("alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let repo = seeded().await;
        repo.record_download("beta", None, None).await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total_plugins, 3);
        assert_eq!(stats.total_downloads, 1);
        assert_eq!(stats.total_size_bytes, 300);
        assert_eq!(stats.average_size_bytes, 100);
        assert_eq!(stats.most_downloaded.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_trust_assignment_store() {
        let repo = MemoryRepository::new();
        let mut assignment = TrustAssignment {
            id: Uuid::new_v4(),
            plugin_name: "p".to_string(),
            version: None,
            trust_level: TrustLevel::Community,
            assigned_by: "boot".to_string(),
            assigned_at: Utc::now(),
            reason: "r".to_string(),
            evidence: Vec::new(),
            valid_until: None,
            review_required: false,
            is_active: true,
        };
        repo.save_assignment(&assignment).await.unwrap();

        assignment.id = Uuid::new_v4();
        assignment.trust_level = TrustLevel::Verified;
        repo.save_assignment(&assignment).await.unwrap();

        let active = repo.load_active_assignments().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trust_level, TrustLevel::Verified);
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(MemoryRepository::new().health_check().await.unwrap());
    }
}
