//! Plugin repository contract
//!
//! The storage contract consumed by the ingestion orchestrator and the
//! HTTP surface. Every operation may fail with a storage-kind error.
//! Conformance notes that both backends must honor:
//!
//! - `save` upserts by name, replacing fields but preserving the download
//!   counter and creation timestamp.
//! - `get_by_name` returns the active record only; bulk listing supports
//!   an explicit `all` filter.
//! - `record_download` is atomic: the counter increment and the history
//!   append succeed or fail together.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use plugon_common::Result;
use plugon_core::types::{
    PluginDownloadRecord, PluginManifest, PluginRecord, PluginStatus, TrustAssignment,
};

/// Status filter for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Active,
    Deprecated,
    Disabled,
    All,
}

impl StatusFilter {
    /// Whether a record status passes this filter
    pub fn matches(&self, status: PluginStatus) -> bool {
        match self {
            StatusFilter::Active => status == PluginStatus::Active,
            StatusFilter::Deprecated => status == PluginStatus::Deprecated,
            StatusFilter::Disabled => status == PluginStatus::Disabled,
            StatusFilter::All => true,
        }
    }
}

/// Sort field for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Name,
    UploadDate,
    DownloadCount,
    Version,
}

/// Listing options: filter, sort, paginate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOptions {
    /// Status filter
    pub status: StatusFilter,

    /// Sort field
    pub sort_by: SortField,

    /// Descending sort when true
    pub descending: bool,

    /// Pagination offset
    pub offset: usize,

    /// Pagination limit; 0 means unbounded
    pub limit: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            status: StatusFilter::Active,
            sort_by: SortField::Name,
            descending: false,
            offset: 0,
            limit: 0,
        }
    }
}

/// Aggregate repository statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Total stored plugins
    pub total_plugins: u64,

    /// Sum of all download counters
    pub total_downloads: u64,

    /// Sum of bundle sizes in bytes
    pub total_size_bytes: u64,

    /// Mean bundle size in bytes
    pub average_size_bytes: u64,

    /// Name of the most downloaded plugin
    pub most_downloaded: Option<String>,

    /// Name of the oldest plugin by upload date
    pub oldest: Option<String>,

    /// Name of the newest plugin by upload date
    pub newest: Option<String>,
}

/// The repository contract for plugin records and download history
#[async_trait]
pub trait PluginRepository: Send + Sync {
    /// Upsert a plugin record by name
    ///
    /// On conflict the stored fields are replaced from the manifest and
    /// file metadata while `download_count`, `id` and `created_at` are
    /// preserved.
    async fn save(
        &self,
        manifest: &PluginManifest,
        file_path: &str,
        file_size: u64,
        checksum: &str,
    ) -> Result<PluginRecord>;

    /// The active record with this name, or None
    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>>;

    /// Any record with this checksum, or None
    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<PluginRecord>>;

    /// Filtered, sorted, paginated listing
    async fn list(&self, options: &ListOptions) -> Result<Vec<PluginRecord>>;

    /// Case-insensitive substring search over name, description, author
    /// and tags; active records only, sorted by name
    async fn search(&self, query: &str) -> Result<Vec<PluginRecord>>;

    /// Atomically bump the download counter, set `last_accessed` and
    /// append a download history row
    async fn record_download(
        &self,
        name: &str,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<()>;

    /// Download history for a plugin, newest first
    async fn downloads_for(&self, name: &str) -> Result<Vec<PluginDownloadRecord>>;

    /// Remove the record and cascade its download history; returns whether
    /// a record existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Transition the record status and bump `updated_at`
    async fn update_status(&self, name: &str, status: PluginStatus) -> Result<()>;

    /// Aggregate statistics
    async fn stats(&self) -> Result<RegistryStats>;

    /// Backend liveness
    async fn health_check(&self) -> Result<bool>;
}

/// Durable store for trust assignments
///
/// The trust engine owns the runtime ledger; the registry writes
/// assignments through this store and warms the engine from it at boot.
#[async_trait]
pub trait TrustAssignmentStore: Send + Sync {
    /// Persist an assignment, deactivating prior rows for the same
    /// `(plugin_name, version?)` key
    async fn save_assignment(&self, assignment: &TrustAssignment) -> Result<()>;

    /// All rows with `is_active = true`
    async fn load_active_assignments(&self) -> Result<Vec<TrustAssignment>>;
}
