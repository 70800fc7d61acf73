//! Ingestion orchestrator
//!
//! Single writer for a given `(name, version)`. The pipeline: size gate,
//! digest, manifest extraction and validation, duplicate check, structural
//! and static-security validation through the verdict cache, signature
//! verification, trust assignment, policy validation, optional
//! optimization, then blob, record and version writes in that order with
//! reverse-order cleanup on failure.

use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use plugon_common::{PlugonError, Result};
use plugon_core::config::{OptimizationSection, SignatureSection, ValidationSection};
use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::{
    EvidenceKind, PluginManifest, PluginRecord, PluginVersionRecord, TrustAssignment,
    TrustEvidence, TrustViolation, ValidationVerdict, VerdictKind, VersionStatus,
    ViolationAction, ViolationSeverity,
};
use plugon_core::utils::sha256_hex;
use plugon_storage::{
    BlobStore, ListOptions, PluginRepository, ReconcileReport, RegistryStats, StatusFilter,
    TrustAssignmentStore,
};
use plugon_trust::TrustEngine;
use plugon_validate::{
    extract_manifest, scan_bundle, validate_manifest, validate_structure, BundleOptimizer,
    CacheStats, DefaultStructureCheck, ScanLimits, SignatureVerifier, StructureCheck,
    TrustedKeyRegistry, ValidationCache,
};
use plugon_versions::{store::VersionStore, VersionLifecycle};

/// Cancellation signal checked between pipeline phases
pub type CancelSignal = watch::Receiver<bool>;

/// Combined statistics for the `/stats` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatsSnapshot {
    /// Repository aggregates
    pub repository: RegistryStats,

    /// Validation cache counters
    pub cache: CacheStats,
}

/// Builder for [`RegistryService`]
pub struct RegistryServiceBuilder {
    validation: ValidationSection,
    signatures: SignatureSection,
    optimization: OptimizationSection,
    repository: Option<Arc<dyn PluginRepository>>,
    trust_store: Option<Arc<dyn TrustAssignmentStore>>,
    version_store: Option<Arc<dyn VersionStore>>,
    blobs: Option<BlobStore>,
    events: EventBus,
    structure_check: Arc<dyn StructureCheck>,
}

impl RegistryServiceBuilder {
    /// Start a builder from the configuration sections
    pub fn new(
        validation: ValidationSection,
        signatures: SignatureSection,
        optimization: OptimizationSection,
    ) -> Self {
        Self {
            validation,
            signatures,
            optimization,
            repository: None,
            trust_store: None,
            version_store: None,
            blobs: None,
            events: EventBus::default(),
            structure_check: Arc::new(DefaultStructureCheck),
        }
    }

    /// Set the plugin repository
    pub fn repository(mut self, repository: Arc<dyn PluginRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the trust assignment store
    pub fn trust_store(mut self, store: Arc<dyn TrustAssignmentStore>) -> Self {
        self.trust_store = Some(store);
        self
    }

    /// Set the version store
    pub fn version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.version_store = Some(store);
        self
    }

    /// Set the blob store
    pub fn blobs(mut self, blobs: BlobStore) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Set the event bus shared with other components
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace the structure checker
    pub fn structure_check(mut self, check: Arc<dyn StructureCheck>) -> Self {
        self.structure_check = check;
        self
    }

    /// Assemble the service
    pub fn build(self) -> Result<RegistryService> {
        let repository = self
            .repository
            .ok_or_else(|| PlugonError::Config("registry needs a repository".into()))?;
        let trust_store = self
            .trust_store
            .ok_or_else(|| PlugonError::Config("registry needs a trust store".into()))?;
        let version_store = self
            .version_store
            .ok_or_else(|| PlugonError::Config("registry needs a version store".into()))?;
        let blobs = self
            .blobs
            .ok_or_else(|| PlugonError::Config("registry needs a blob store".into()))?;

        let cache = Arc::new(ValidationCache::new(
            self.validation.cache_size,
            std::time::Duration::from_secs(self.validation.cache_ttl_secs),
        ));
        let verifier = SignatureVerifier::new(
            TrustedKeyRegistry::new(self.signatures.trusted_keys.clone()),
            self.signatures.require_signatures,
            self.signatures.allow_unsigned,
        );
        let trust = Arc::new(TrustEngine::new(self.events.clone()));
        let versions = Arc::new(VersionLifecycle::new(
            version_store.clone(),
            repository.clone(),
            self.events.clone(),
        ));

        Ok(RegistryService {
            validation: self.validation,
            optimization: self.optimization.clone(),
            cache,
            verifier,
            optimizer: BundleOptimizer::new(self.optimization),
            structure_check: self.structure_check,
            trust,
            trust_store,
            repository,
            versions,
            version_store,
            blobs,
            events: self.events,
            inflight: Mutex::new(HashSet::new()),
        })
    }
}

/// The bundle ingestion orchestrator and registry facade
pub struct RegistryService {
    validation: ValidationSection,
    optimization: OptimizationSection,
    cache: Arc<ValidationCache>,
    verifier: SignatureVerifier,
    optimizer: BundleOptimizer,
    structure_check: Arc<dyn StructureCheck>,
    trust: Arc<TrustEngine>,
    trust_store: Arc<dyn TrustAssignmentStore>,
    repository: Arc<dyn PluginRepository>,
    versions: Arc<VersionLifecycle>,
    version_store: Arc<dyn VersionStore>,
    blobs: BlobStore,
    events: EventBus,
    inflight: Mutex<HashSet<String>>,
}

fn verdict_to_error(verdict: &ValidationVerdict) -> PlugonError {
    PlugonError::PluginValidation(verdict.errors.join("; "))
}

fn check_cancelled(cancel: Option<&CancelSignal>) -> Result<()> {
    if cancel.map(|c| *c.borrow()).unwrap_or(false) {
        return Err(PlugonError::Timeout("ingestion cancelled".into()));
    }
    Ok(())
}

impl RegistryService {
    /// Boot-time work: reconcile blobs with records and warm the trust
    /// engine from the durable assignment store
    #[instrument(level = "info", skip(self))]
    pub async fn startup(&self) -> Result<ReconcileReport> {
        for assignment in self.trust_store.load_active_assignments().await? {
            self.trust.assign_trust_level(assignment).await?;
        }
        self.blobs.reconcile(self.repository.as_ref()).await
    }

    /// Ingest an uploaded bundle
    pub async fn ingest(&self, buffer: Vec<u8>) -> Result<PluginRecord> {
        self.ingest_with_cancel(buffer, None).await
    }

    /// Ingest with a cancellation signal, honored between phases
    #[instrument(level = "info", skip(self, buffer, cancel), fields(len = buffer.len()))]
    pub async fn ingest_with_cancel(
        &self,
        buffer: Vec<u8>,
        cancel: Option<CancelSignal>,
    ) -> Result<PluginRecord> {
        let start = Instant::now();
        counter!("plugon.ingest.attempts", 1);

        // 1. size gate
        if buffer.len() as u64 > self.validation.max_plugin_size {
            return Err(PlugonError::PayloadTooLarge {
                size: buffer.len() as u64,
                max: self.validation.max_plugin_size,
            });
        }

        // 2. digest
        let checksum = sha256_hex(&buffer);

        // 3. manifest
        let manifest = extract_manifest(&buffer)?;
        let manifest_verdict = self
            .cached_verdict(&checksum, VerdictKind::Manifest, || {
                validate_manifest(&manifest)
            })
            .await;
        if !manifest_verdict.is_valid {
            counter!("plugon.ingest.rejected", 1);
            return Err(verdict_to_error(&manifest_verdict));
        }
        self.events.emit(PluginEvent::ManifestExtracted {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        });

        // single writer per (name, version)
        let key = format!("{}@{}", manifest.name, manifest.version);
        {
            let mut inflight = self.inflight.lock().await;
            if !inflight.insert(key.clone()) {
                return Err(PlugonError::Conflict(format!(
                    "upload of {} already in progress",
                    key
                )));
            }
        }

        let result = self
            .ingest_locked(buffer, checksum, manifest, cancel)
            .await;
        self.inflight.lock().await.remove(&key);

        match &result {
            Ok(record) => {
                counter!("plugon.ingest.accepted", 1);
                histogram!("plugon.ingest.time", start.elapsed());
                info!(
                    "✅ ingested {}@{} in {:?}",
                    record.name,
                    record.version,
                    start.elapsed()
                );
            }
            Err(e) => {
                counter!("plugon.ingest.rejected", 1);
                warn!("⚠️ ingestion rejected: {}", e);
            }
        }
        result
    }

    async fn ingest_locked(
        &self,
        buffer: Vec<u8>,
        checksum: String,
        manifest: PluginManifest,
        cancel: Option<CancelSignal>,
    ) -> Result<PluginRecord> {
        let name = manifest.name.clone();
        let version = manifest.version.clone();

        // 4. duplicate check
        if self.version_store.get(&name, &version).await?.is_some() {
            return Err(PlugonError::PluginConflict { name, version });
        }
        check_cancelled(cancel.as_ref())?;

        // 5. structure
        let structure_verdict = self
            .cached_verdict(&checksum, VerdictKind::Structure, || {
                validate_structure(&buffer, self.structure_check.as_ref())
            })
            .await;
        if !structure_verdict.is_valid {
            return Err(verdict_to_error(&structure_verdict));
        }
        check_cancelled(cancel.as_ref())?;

        // 6. static security
        let limits = ScanLimits {
            max_content_size: self.validation.max_content_size,
            max_iterations: self.validation.max_iterations,
            timeout: std::time::Duration::from_millis(self.validation.regex_timeout_ms),
        };
        let security_verdict = self
            .cached_verdict(&checksum, VerdictKind::Security, || {
                scan_bundle(&buffer, &limits)
            })
            .await;
        if !security_verdict.is_valid {
            return Err(verdict_to_error(&security_verdict));
        }
        check_cancelled(cancel.as_ref())?;

        // 7. signature
        let signature_spec = manifest.security.as_ref().and_then(|s| s.signature.as_ref());
        let outcome = self.verifier.verify(&buffer, signature_spec);
        self.events.emit(PluginEvent::SignatureVerified {
            name: name.clone(),
            version: version.clone(),
            verified: outcome.verified,
            trust_level: outcome.trust_level,
        });
        if !outcome.is_valid {
            return Err(PlugonError::Security(outcome.errors.join("; ")));
        }

        // 8. initial trust assignment with the signature as evidence
        let assignment = TrustAssignment {
            id: Uuid::new_v4(),
            plugin_name: name.clone(),
            version: Some(version.clone()),
            trust_level: outcome.trust_level,
            assigned_by: "registry".to_string(),
            assigned_at: Utc::now(),
            reason: if outcome.verified {
                "signature verification".to_string()
            } else {
                "unsigned upload default".to_string()
            },
            evidence: vec![TrustEvidence {
                kind: EvidenceKind::Signature,
                score: if outcome.verified { 95 } else { 25 },
                detail: match outcome.algorithm {
                    Some(algorithm) => format!("signature verified with {}", algorithm),
                    None => "no signature presented".to_string(),
                },
                recorded_at: Utc::now(),
            }],
            valid_until: None,
            review_required: !outcome.verified,
            is_active: true,
        };
        self.trust.assign_trust_level(assignment.clone()).await?;
        self.trust_store.save_assignment(&assignment).await?;
        check_cancelled(cancel.as_ref())?;

        // 9. policy validation at the derived trust level
        let policy = self
            .trust
            .validate_against_policy(&name, &manifest, Some(&version))
            .await;
        if !policy.is_valid {
            for capability in &policy.violations {
                let severity = self.trust.severity_for_capability(capability);
                let action = match severity {
                    ViolationSeverity::Low => ViolationAction::Warn,
                    ViolationSeverity::Medium => ViolationAction::Restrict,
                    ViolationSeverity::High => ViolationAction::Quarantine,
                    ViolationSeverity::Critical => ViolationAction::Remove,
                };
                self.trust
                    .record_violation(TrustViolation {
                        id: Uuid::new_v4(),
                        plugin_name: name.clone(),
                        version: Some(version.clone()),
                        capability: Some(capability.clone()),
                        severity,
                        action,
                        description: format!(
                            "manifest requests '{}' beyond the {} policy",
                            capability, outcome.trust_level
                        ),
                        recorded_at: Utc::now(),
                    })
                    .await;
            }
            return Err(PlugonError::Security(format!(
                "manifest requests capabilities outside its trust policy: {}",
                policy.violations.join(", ")
            )));
        }
        check_cancelled(cancel.as_ref())?;

        // 10. optimization; the optimized buffer is stored when it wins
        let (buffer, checksum) = if self.optimization.enabled {
            let outcome = self.optimizer.optimize(&buffer)?;
            self.events.emit(PluginEvent::OptimizationCompleted {
                name: name.clone(),
                version: version.clone(),
                original_size: outcome.original_size,
                optimized_size: outcome.optimized_size,
                accepted: outcome.accepted,
            });
            if outcome.accepted {
                debug!(
                    "🔧 optimizer accepted: {:.1}% smaller",
                    outcome.savings_ratio * 100.0
                );
                let checksum = sha256_hex(&outcome.buffer);
                (outcome.buffer, checksum)
            } else {
                (buffer, checksum)
            }
        } else {
            (buffer, checksum)
        };
        check_cancelled(cancel.as_ref())?;

        // 11. persist: blob, then record, then version row; clean up in
        // reverse on failure
        let prior = self.repository.get_by_checksum(&checksum).await?;
        if prior.is_some() {
            return Err(PlugonError::Conflict(format!(
                "a plugin with checksum {} already exists",
                checksum
            )));
        }

        let blob_path = self.blobs.write(&name, &version, &buffer).await?;
        let file_path = blob_path.to_string_lossy().to_string();

        let prior_record = self.repository.get_by_name(&name).await?;
        let record = match self
            .repository
            .save(&manifest, &file_path, buffer.len() as u64, &checksum)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.blobs.delete(&name, &version).await.ok();
                return Err(e);
            }
        };

        let now = Utc::now();
        let version_record = PluginVersionRecord {
            id: Uuid::new_v4(),
            plugin_name: name.clone(),
            version: version.clone(),
            is_active: false,
            status: VersionStatus::Active,
            promotion_date: None,
            deprecation_date: None,
            rollback_reason: None,
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            license: manifest.license.clone(),
            manifest: serde_json::to_value(&manifest)?,
            file_path: file_path.clone(),
            file_size: buffer.len() as u64,
            checksum: checksum.clone(),
            upload_date: now,
            dependencies: manifest.dependencies.clone(),
            exports: manifest.exports().to_vec(),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.versions.add_version(version_record, true).await {
            // reverse cleanup: restore or remove the record, drop the blob
            match prior_record {
                Some(prior) => {
                    if let Ok(prior_manifest) =
                        serde_json::from_value::<PluginManifest>(prior.manifest.clone())
                    {
                        self.repository
                            .save(
                                &prior_manifest,
                                &prior.file_path,
                                prior.file_size,
                                &prior.checksum,
                            )
                            .await
                            .ok();
                    }
                }
                None => {
                    self.repository.delete(&name).await.ok();
                }
            }
            self.blobs.delete(&name, &version).await.ok();
            return Err(e);
        }

        // 12. stored
        self.events.emit(PluginEvent::PluginStored {
            name: name.clone(),
            version: version.clone(),
            checksum: checksum.clone(),
        });

        // the repository row now mirrors the promoted version
        self.repository
            .get_by_name(&name)
            .await?
            .ok_or_else(|| PlugonError::Internal("record vanished after ingest".into()))
    }

    /// Fetch a verdict through the cache, producing and caching it on miss
    async fn cached_verdict<F>(
        &self,
        checksum: &str,
        kind: VerdictKind,
        produce: F,
    ) -> ValidationVerdict
    where
        F: FnOnce() -> ValidationVerdict,
    {
        if let Some(verdict) = self.cache.get(checksum, kind).await {
            self.events.emit(PluginEvent::ValidationCompleted {
                checksum: checksum.to_string(),
                kind,
                is_valid: verdict.is_valid,
            });
            return verdict;
        }
        let verdict = produce();
        self.cache.put(checksum, kind, verdict.clone()).await;
        self.events.emit(PluginEvent::ValidationCompleted {
            checksum: checksum.to_string(),
            kind,
            is_valid: verdict.is_valid,
        });
        verdict
    }

    /// The active record for a plugin
    pub async fn get_plugin(&self, name: &str) -> Result<Option<PluginRecord>> {
        self.repository.get_by_name(name).await
    }

    /// Listing with options
    pub async fn list_plugins(&self, options: &ListOptions) -> Result<Vec<PluginRecord>> {
        self.repository.list(options).await
    }

    /// Search active plugins
    pub async fn search_plugins(&self, query: &str) -> Result<Vec<PluginRecord>> {
        self.repository.search(query).await
    }

    /// Stream a download: returns the record and the bundle bytes after
    /// atomically recording the download
    #[instrument(level = "debug", skip(self))]
    pub async fn download(
        &self,
        name: &str,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<(PluginRecord, Vec<u8>)> {
        let record = self
            .repository
            .get_by_name(name)
            .await?
            .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;
        let bytes = self.blobs.read(&record.name, &record.version).await?;
        self.repository
            .record_download(name, user_agent, ip_address)
            .await?;
        self.events.emit(PluginEvent::DownloadRecorded {
            name: record.name.clone(),
            version: record.version.clone(),
        });
        Ok((record, bytes))
    }

    /// Delete a plugin: record, download history, version rows and blobs
    #[instrument(level = "info", skip(self))]
    pub async fn delete_plugin(&self, name: &str) -> Result<bool> {
        let versions = self.versions.list_versions(name).await?;
        let deleted = self.repository.delete(name).await?;
        if !deleted && versions.is_empty() {
            return Ok(false);
        }
        for row in versions {
            self.version_store.delete(name, &row.version).await?;
            self.blobs.delete(name, &row.version).await?;
        }
        self.events.emit(PluginEvent::PluginDeleted {
            name: name.to_string(),
        });
        Ok(true)
    }

    /// Combined repository and cache statistics
    pub async fn stats(&self) -> Result<RegistryStatsSnapshot> {
        Ok(RegistryStatsSnapshot {
            repository: self.repository.stats().await?,
            cache: self.cache.stats().await,
        })
    }

    /// Repository liveness for `/health`
    pub async fn health(&self) -> Result<bool> {
        self.repository.health_check().await
    }

    /// Assign a trust level: runtime engine plus durable write-through
    pub async fn assign_trust(&self, assignment: TrustAssignment) -> Result<()> {
        self.trust.assign_trust_level(assignment.clone()).await?;
        self.trust_store.save_assignment(&assignment).await
    }

    /// The trust engine shared with the HTTP surface
    pub fn trust(&self) -> &Arc<TrustEngine> {
        &self.trust
    }

    /// The version lifecycle engine shared with the HTTP surface
    pub fn versions(&self) -> &Arc<VersionLifecycle> {
        &self.versions
    }

    /// The validation cache (sweeper wiring lives in the binary)
    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    /// The event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// All records regardless of status (used by reconciliation tooling)
    pub async fn list_all(&self) -> Result<Vec<PluginRecord>> {
        self.repository
            .list(&ListOptions {
                status: StatusFilter::All,
                ..Default::default()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plugon_core::types::PluginDownloadRecord;
    use plugon_core::types::PluginStatus;
    use plugon_storage::MemoryRepository;
    use plugon_versions::MemoryVersionStore;
    use std::io::Write as _;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn bundle(files: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, content) in files {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn manifest_json(name: &str, version: &str) -> String {
        serde_json::json!({
            "name": name,
            "version": version,
            "description": "test plugin",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Greeter",
            "compatibilityVersion": "1.0.0",
            "module": { "exports": ["Greeter"] }
        })
        .to_string()
    }

    fn greeter_bundle(version: &str) -> Vec<u8> {
        bundle(&[
            ("plugin.manifest.json", &manifest_json("greeter", version)),
            ("index.js", "export const Greeter = {};\n"),
        ])
    }

    async fn service_with(dir: &TempDir) -> RegistryService {
        service_with_sections(dir, ValidationSection::default(), OptimizationSection::default())
            .await
    }

    async fn service_with_sections(
        dir: &TempDir,
        validation: ValidationSection,
        optimization: OptimizationSection,
    ) -> RegistryService {
        let repo = Arc::new(MemoryRepository::new());
        RegistryServiceBuilder::new(validation, SignatureSection::default(), optimization)
            .repository(repo.clone())
            .trust_store(repo)
            .version_store(Arc::new(MemoryVersionStore::new()))
            .blobs(BlobStore::open(dir.path()).await.unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_ingest() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        let bytes = greeter_bundle("1.0.0");
        let expected_checksum = sha256_hex(&bytes);

        let record = service.ingest(bytes.clone()).await.unwrap();
        assert_eq!(record.name, "greeter");
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.checksum, expected_checksum);

        let fetched = service.get_plugin("greeter").await.unwrap().unwrap();
        assert_eq!(fetched.checksum, expected_checksum);

        let (_, downloaded) = service.download("greeter", None, None).await.unwrap();
        assert_eq!(downloaded, bytes);
        assert_eq!(sha256_hex(&downloaded), fetched.checksum);
    }

    #[tokio::test]
    async fn test_unsafe_import_rejected_and_cached() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        let bytes = bundle(&[
            ("plugin.manifest.json", &manifest_json("sneaky", "1.0.0")),
            ("index.js", "const fs = require('fs');\n"),
        ]);

        let err = service.ingest(bytes.clone()).await.unwrap_err();
        assert_eq!(err.code().as_str(), "PLUGIN_VALIDATION_FAILED");
        assert!(err.to_string().contains("fs"));

        // the second attempt is answered from the verdict cache
        let before = service.cache.stats().await.hits;
        let err = service.ingest(bytes).await.unwrap_err();
        assert!(err.to_string().contains("fs"));
        assert!(service.cache.stats().await.hits > before);
    }

    #[tokio::test]
    async fn test_duplicate_version_conflict() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        service.ingest(greeter_bundle("1.0.0")).await.unwrap();
        let err = service.ingest(greeter_bundle("1.0.0")).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert_eq!(err.code().as_str(), "PLUGIN_CONFLICT");
        let details = err.details().unwrap();
        assert_eq!(details["name"], "greeter");
        assert_eq!(details["version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service_with_sections(
            &dir,
            ValidationSection {
                max_plugin_size: 64,
                ..Default::default()
            },
            OptimizationSection::default(),
        )
        .await;

        let err = service.ingest(greeter_bundle("1.0.0")).await.unwrap_err();
        assert_eq!(err.http_status(), 413);
    }

    #[tokio::test]
    async fn test_trust_violation_rejected_and_recorded() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        let manifest = serde_json::json!({
            "name": "grabby",
            "version": "1.0.0",
            "description": "wants the disk",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Grabby",
            "compatibilityVersion": "1.0.0",
            "permissions": { "services": ["filesystem"], "modules": [] }
        })
        .to_string();
        let bytes = bundle(&[
            ("plugin.manifest.json", &manifest),
            ("index.js", "export const Grabby = {};\n"),
        ]);

        let err = service.ingest(bytes).await.unwrap_err();
        assert_eq!(err.code().as_str(), "PLUGIN_SECURITY_VIOLATION");
        assert_eq!(err.http_status(), 403);

        let violations = service.trust().violations_for("grabby").await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::High);

        // nothing was persisted
        assert!(service.get_plugin("grabby").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_version_becomes_active() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        service.ingest(greeter_bundle("1.0.0")).await.unwrap();
        service.ingest(greeter_bundle("1.1.0")).await.unwrap();

        let active = service.versions().get_active("greeter").await.unwrap().unwrap();
        assert_eq!(active.version, "1.1.0");
        let record = service.get_plugin("greeter").await.unwrap().unwrap();
        assert_eq!(record.version, "1.1.0");

        // both bundles remain downloadable as versions
        assert_eq!(
            service.versions().list_versions("greeter").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_optimized_buffer_is_what_gets_stored() {
        let dir = TempDir::new().unwrap();
        let service = service_with_sections(
            &dir,
            ValidationSection::default(),
            OptimizationSection {
                enabled: true,
                ..Default::default()
            },
        )
        .await;

        // plenty of strippable content so the 5% gate passes
        let padded = format!(
            "export const Greeter = {{}};\n{}",
            "// filler comment line\n".repeat(400)
        );
        let bytes = bundle(&[
            ("plugin.manifest.json", &manifest_json("greeter", "1.0.0")),
            ("index.js", &padded),
            ("README.md", "strip me"),
        ]);

        let record = service.ingest(bytes.clone()).await.unwrap();
        assert_ne!(record.checksum, sha256_hex(&bytes));
        assert!(record.file_size < bytes.len() as u64);

        // the served bytes hash to the stored checksum
        let (_, downloaded) = service.download("greeter", None, None).await.unwrap();
        assert_eq!(sha256_hex(&downloaded), record.checksum);
    }

    #[tokio::test]
    async fn test_delete_plugin_cleans_everything() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        service.ingest(greeter_bundle("1.0.0")).await.unwrap();
        service.ingest(greeter_bundle("1.1.0")).await.unwrap();

        assert!(service.delete_plugin("greeter").await.unwrap());
        assert!(service.get_plugin("greeter").await.unwrap().is_none());
        assert!(service
            .versions()
            .list_versions("greeter")
            .await
            .unwrap()
            .is_empty());
        assert!(!service.delete_plugin("greeter").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_ingest_stops_between_phases() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir).await;

        let (tx, rx) = watch::channel(true);
        let err = service
            .ingest_with_cancel(greeter_bundle("1.0.0"), Some(rx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        drop(tx);

        // nothing persisted
        assert!(service.get_plugin("greeter").await.unwrap().is_none());
    }

    /// Repository that fails every save, for cleanup testing
    struct FailingRepository {
        inner: MemoryRepository,
    }

    #[async_trait]
    impl PluginRepository for FailingRepository {
        async fn save(
            &self,
            _manifest: &PluginManifest,
            _file_path: &str,
            _file_size: u64,
            _checksum: &str,
        ) -> Result<PluginRecord> {
            Err(PlugonError::Database("induced failure".into()))
        }

        async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>> {
            self.inner.get_by_name(name).await
        }
        async fn get_by_checksum(&self, checksum: &str) -> Result<Option<PluginRecord>> {
            self.inner.get_by_checksum(checksum).await
        }
        async fn list(&self, options: &ListOptions) -> Result<Vec<PluginRecord>> {
            self.inner.list(options).await
        }
        async fn search(&self, query: &str) -> Result<Vec<PluginRecord>> {
            self.inner.search(query).await
        }
        async fn record_download(
            &self,
            name: &str,
            user_agent: Option<&str>,
            ip_address: Option<&str>,
        ) -> Result<()> {
            self.inner.record_download(name, user_agent, ip_address).await
        }
        async fn downloads_for(&self, name: &str) -> Result<Vec<PluginDownloadRecord>> {
            self.inner.downloads_for(name).await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            self.inner.delete(name).await
        }
        async fn update_status(&self, name: &str, status: PluginStatus) -> Result<()> {
            self.inner.update_status(name, status).await
        }
        async fn stats(&self) -> Result<RegistryStats> {
            self.inner.stats().await
        }
        async fn health_check(&self) -> Result<bool> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn test_record_failure_rolls_back_blob() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let service = RegistryServiceBuilder::new(
            ValidationSection::default(),
            SignatureSection::default(),
            OptimizationSection::default(),
        )
        .repository(Arc::new(FailingRepository {
            inner: MemoryRepository::new(),
        }))
        .trust_store(repo)
        .version_store(Arc::new(MemoryVersionStore::new()))
        .blobs(BlobStore::open(dir.path()).await.unwrap())
        .build()
        .unwrap();

        let err = service.ingest(greeter_bundle("1.0.0")).await.unwrap_err();
        assert_eq!(err.http_status(), 500);

        // the blob written before the failing record save was cleaned up
        assert!(!service.blobs.exists("greeter", "1.0.0").await);
    }
}
