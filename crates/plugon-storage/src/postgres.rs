//! PostgreSQL repository backend
//!
//! Durable implementation of the repository contract on sqlx. The
//! `record_download` operation runs the counter bump and the history
//! append in one transaction, and `ensure_schema` creates the tables on
//! first boot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use plugon_common::{PlugonError, Result};
use plugon_core::config::DatabaseSection;
use plugon_core::types::{
    PluginDownloadRecord, PluginManifest, PluginRecord, PluginStatus, TrustAssignment, TrustLevel,
};

use crate::repository::{
    ListOptions, PluginRepository, RegistryStats, SortField, StatusFilter, TrustAssignmentStore,
};

/// Schema for the registry tables
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS plugins (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    description TEXT NOT NULL,
    author TEXT NOT NULL,
    license TEXT NOT NULL,
    manifest JSONB NOT NULL,
    file_path TEXT NOT NULL,
    file_size BIGINT NOT NULL,
    checksum TEXT NOT NULL UNIQUE,
    upload_date TIMESTAMPTZ NOT NULL,
    last_accessed TIMESTAMPTZ,
    download_count BIGINT NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    tags TEXT[] NOT NULL DEFAULT '{}',
    dependencies TEXT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS plugin_versions (
    id UUID PRIMARY KEY,
    plugin_name TEXT NOT NULL,
    version TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT FALSE,
    status TEXT NOT NULL DEFAULT 'active',
    promotion_date TIMESTAMPTZ,
    deprecation_date TIMESTAMPTZ,
    rollback_reason TEXT,
    description TEXT NOT NULL,
    author TEXT NOT NULL,
    license TEXT NOT NULL,
    manifest JSONB NOT NULL,
    file_path TEXT NOT NULL,
    file_size BIGINT NOT NULL,
    checksum TEXT NOT NULL,
    upload_date TIMESTAMPTZ NOT NULL,
    dependencies TEXT[] NOT NULL DEFAULT '{}',
    exports TEXT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (plugin_name, version)
);

CREATE TABLE IF NOT EXISTS plugin_downloads (
    id UUID PRIMARY KEY,
    plugin_id UUID NOT NULL REFERENCES plugins(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    download_date TIMESTAMPTZ NOT NULL,
    user_agent TEXT,
    ip_address TEXT
);

CREATE TABLE IF NOT EXISTS plugin_trust_levels (
    id UUID PRIMARY KEY,
    plugin_name TEXT NOT NULL,
    version TEXT,
    trust_level TEXT NOT NULL,
    assigned_by TEXT NOT NULL,
    assigned_at TIMESTAMPTZ NOT NULL,
    reason TEXT NOT NULL,
    evidence JSONB NOT NULL DEFAULT '[]',
    valid_until TIMESTAMPTZ,
    review_required BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE INDEX IF NOT EXISTS idx_plugin_versions_name ON plugin_versions (plugin_name);
CREATE INDEX IF NOT EXISTS idx_plugin_downloads_plugin ON plugin_downloads (plugin_id);
CREATE INDEX IF NOT EXISTS idx_plugin_trust_active ON plugin_trust_levels (plugin_name, is_active);
"#;

/// PostgreSQL implementation of the repository contract
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> PlugonError {
    PlugonError::Database(e.to_string())
}

fn row_to_record(row: &PgRow) -> Result<PluginRecord> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(PluginRecord {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        author: row.try_get("author").map_err(db_err)?,
        license: row.try_get("license").map_err(db_err)?,
        manifest: row.try_get("manifest").map_err(db_err)?,
        file_path: row.try_get("file_path").map_err(db_err)?,
        file_size: row.try_get::<i64, _>("file_size").map_err(db_err)? as u64,
        checksum: row.try_get("checksum").map_err(db_err)?,
        upload_date: row.try_get("upload_date").map_err(db_err)?,
        last_accessed: row.try_get("last_accessed").map_err(db_err)?,
        download_count: row.try_get::<i64, _>("download_count").map_err(db_err)? as u64,
        status: status.parse().map_err(PlugonError::Database)?,
        tags: row.try_get("tags").map_err(db_err)?,
        dependencies: row.try_get("dependencies").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

const RECORD_COLUMNS: &str = "id, name, version, description, author, license, manifest, \
     file_path, file_size, checksum, upload_date, last_accessed, download_count, status, \
     tags, dependencies, created_at, updated_at";

impl PostgresRepository {
    /// Connect a pool and create the schema if needed
    #[instrument(level = "debug", skip(config))]
    pub async fn connect(config: &DatabaseSection) -> Result<Self> {
        debug!("🔧 Creating database connection pool");
        let start = Instant::now();

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout))
            .connect(&config.url)
            .await
            .map_err(db_err)?;

        histogram!("plugon.db.pool.create.time", start.elapsed());
        info!(
            "✅ Created database connection pool with {} max connections",
            config.max_connections
        );

        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    /// Wrap an existing pool (used by the version store, which shares it)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("✅ Registry schema ensured");
        Ok(())
    }
}

#[async_trait]
impl PluginRepository for PostgresRepository {
    #[instrument(level = "debug", skip(self, manifest), fields(name = %manifest.name))]
    async fn save(
        &self,
        manifest: &PluginManifest,
        file_path: &str,
        file_size: u64,
        checksum: &str,
    ) -> Result<PluginRecord> {
        let start = Instant::now();
        let now = Utc::now();
        let manifest_json = serde_json::to_value(manifest)?;

        let row = sqlx::query(&format!(
            "INSERT INTO plugins ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, 0, 'active', '{{}}', $12, $13, $13)
             ON CONFLICT (name) DO UPDATE SET
                 version = EXCLUDED.version,
                 description = EXCLUDED.description,
                 author = EXCLUDED.author,
                 license = EXCLUDED.license,
                 manifest = EXCLUDED.manifest,
                 file_path = EXCLUDED.file_path,
                 file_size = EXCLUDED.file_size,
                 checksum = EXCLUDED.checksum,
                 upload_date = EXCLUDED.upload_date,
                 status = 'active',
                 dependencies = EXCLUDED.dependencies,
                 updated_at = EXCLUDED.updated_at
             RETURNING {}",
            RECORD_COLUMNS, RECORD_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&manifest.name)
        .bind(&manifest.version)
        .bind(&manifest.description)
        .bind(&manifest.author)
        .bind(&manifest.license)
        .bind(&manifest_json)
        .bind(file_path)
        .bind(file_size as i64)
        .bind(checksum)
        .bind(now)
        .bind(&manifest.dependencies)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        counter!("plugon.db.plugins.saved", 1);
        histogram!("plugon.db.save.time", start.elapsed());
        row_to_record(&row)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<PluginRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM plugins WHERE name = $1 AND status = 'active'",
            RECORD_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<PluginRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM plugins WHERE checksum = $1",
            RECORD_COLUMNS
        ))
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<PluginRecord>> {
        let order_column = match options.sort_by {
            SortField::Name => "name",
            SortField::UploadDate => "upload_date",
            SortField::DownloadCount => "download_count",
            // pre-release tags are cut before the numeric cast
            SortField::Version => "string_to_array(split_part(version, '-', 1), '.')::int[]",
        };
        let direction = if options.descending { "DESC" } else { "ASC" };
        let status_clause = match options.status {
            StatusFilter::All => String::new(),
            other => format!(
                "WHERE status = '{}'",
                match other {
                    StatusFilter::Active => "active",
                    StatusFilter::Deprecated => "deprecated",
                    StatusFilter::Disabled => "disabled",
                    StatusFilter::All => unreachable!(),
                }
            ),
        };
        let limit_clause = if options.limit == 0 {
            String::new()
        } else {
            format!("LIMIT {}", options.limit)
        };

        let rows = sqlx::query(&format!(
            "SELECT {} FROM plugins {} ORDER BY {} {}, id ASC {} OFFSET {}",
            RECORD_COLUMNS, status_clause, order_column, direction, limit_clause, options.offset
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn search(&self, query: &str) -> Result<Vec<PluginRecord>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM plugins
             WHERE status = 'active'
               AND (lower(name) LIKE $1
                    OR lower(description) LIKE $1
                    OR lower(author) LIKE $1
                    OR EXISTS (SELECT 1 FROM unnest(tags) t WHERE lower(t) LIKE $1))
             ORDER BY name ASC",
            RECORD_COLUMNS
        ))
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }

    #[instrument(level = "debug", skip(self))]
    async fn record_download(
        &self,
        name: &str,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now();

        let row = sqlx::query(
            "UPDATE plugins
             SET download_count = download_count + 1, last_accessed = $2
             WHERE name = $1
             RETURNING id, version",
        )
        .bind(name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;

        let plugin_id: Uuid = row.try_get("id").map_err(db_err)?;
        let version: String = row.try_get("version").map_err(db_err)?;

        sqlx::query(
            "INSERT INTO plugin_downloads (id, plugin_id, version, download_date, user_agent, ip_address)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(plugin_id)
        .bind(&version)
        .bind(now)
        .bind(user_agent)
        .bind(ip_address)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        counter!("plugon.db.downloads.recorded", 1);
        Ok(())
    }

    async fn downloads_for(&self, name: &str) -> Result<Vec<PluginDownloadRecord>> {
        let rows = sqlx::query(
            "SELECT d.id, d.plugin_id, d.version, d.download_date, d.user_agent, d.ip_address
             FROM plugin_downloads d
             JOIN plugins p ON p.id = d.plugin_id
             WHERE p.name = $1
             ORDER BY d.download_date DESC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(PluginDownloadRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    plugin_id: row.try_get("plugin_id").map_err(db_err)?,
                    version: row.try_get("version").map_err(db_err)?,
                    download_date: row.try_get("download_date").map_err(db_err)?,
                    user_agent: row.try_get("user_agent").map_err(db_err)?,
                    ip_address: row.try_get("ip_address").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        // downloads cascade via the foreign key
        let result = sqlx::query("DELETE FROM plugins WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, name: &str, status: PluginStatus) -> Result<()> {
        let result = sqlx::query("UPDATE plugins SET status = $2, updated_at = $3 WHERE name = $1")
            .bind(name)
            .bind(status.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PlugonError::PluginNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(download_count), 0)::BIGINT AS downloads,
                    COALESCE(SUM(file_size), 0)::BIGINT AS size,
                    COALESCE(AVG(file_size), 0)::BIGINT AS average
             FROM plugins",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let name_of = |query: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query(query)
                    .fetch_optional(&pool)
                    .await
                    .map_err(db_err)?
                    .map(|row| row.try_get::<String, _>("name").map_err(db_err))
                    .transpose()
            }
        };

        Ok(RegistryStats {
            total_plugins: totals.try_get::<i64, _>("total").map_err(db_err)? as u64,
            total_downloads: totals.try_get::<i64, _>("downloads").map_err(db_err)? as u64,
            total_size_bytes: totals.try_get::<i64, _>("size").map_err(db_err)? as u64,
            average_size_bytes: totals.try_get::<i64, _>("average").map_err(db_err)? as u64,
            most_downloaded: name_of(
                "SELECT name FROM plugins ORDER BY download_count DESC, id ASC LIMIT 1",
            )
            .await?,
            oldest: name_of("SELECT name FROM plugins ORDER BY upload_date ASC, id ASC LIMIT 1")
                .await?,
            newest: name_of("SELECT name FROM plugins ORDER BY upload_date DESC, id ASC LIMIT 1")
                .await?,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let result = sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TrustAssignmentStore for PostgresRepository {
    async fn save_assignment(&self, assignment: &TrustAssignment) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "UPDATE plugin_trust_levels
             SET is_active = FALSE
             WHERE plugin_name = $1 AND version IS NOT DISTINCT FROM $2 AND is_active",
        )
        .bind(&assignment.plugin_name)
        .bind(&assignment.version)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO plugin_trust_levels
             (id, plugin_name, version, trust_level, assigned_by, assigned_at, reason,
              evidence, valid_until, review_required, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE)",
        )
        .bind(assignment.id)
        .bind(&assignment.plugin_name)
        .bind(&assignment.version)
        .bind(assignment.trust_level.to_string())
        .bind(&assignment.assigned_by)
        .bind(assignment.assigned_at)
        .bind(&assignment.reason)
        .bind(serde_json::to_value(&assignment.evidence)?)
        .bind(assignment.valid_until)
        .bind(assignment.review_required)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn load_active_assignments(&self) -> Result<Vec<TrustAssignment>> {
        let rows = sqlx::query(
            "SELECT id, plugin_name, version, trust_level, assigned_by, assigned_at, reason,
                    evidence, valid_until, review_required, is_active
             FROM plugin_trust_levels WHERE is_active",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("trust_level").map_err(db_err)?;
                let evidence: serde_json::Value = row.try_get("evidence").map_err(db_err)?;
                Ok(TrustAssignment {
                    id: row.try_get("id").map_err(db_err)?,
                    plugin_name: row.try_get("plugin_name").map_err(db_err)?,
                    version: row.try_get("version").map_err(db_err)?,
                    trust_level: level
                        .parse::<TrustLevel>()
                        .map_err(PlugonError::Database)?,
                    assigned_by: row.try_get("assigned_by").map_err(db_err)?,
                    assigned_at: row.try_get("assigned_at").map_err(db_err)?,
                    reason: row.try_get("reason").map_err(db_err)?,
                    evidence: serde_json::from_value(evidence)?,
                    valid_until: row
                        .try_get::<Option<DateTime<Utc>>, _>("valid_until")
                        .map_err(db_err)?,
                    review_required: row.try_get("review_required").map_err(db_err)?,
                    is_active: row.try_get("is_active").map_err(db_err)?,
                })
            })
            .collect()
    }
}
