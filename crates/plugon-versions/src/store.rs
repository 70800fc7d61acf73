//! Version table storage
//!
//! The `VersionStore` trait carries the row-level operations the lifecycle
//! engine composes. `set_active_exclusive` is the one multi-row operation
//! and is transactional: all `is_active` flips for a plugin happen
//! together.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::instrument;

use plugon_common::{PlugonError, Result};
use plugon_core::types::{PluginVersionRecord, VersionStatus};

/// Row-level storage for the versions table
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Insert a new row; `(plugin_name, version)` must be unique
    async fn insert(&self, record: &PluginVersionRecord) -> Result<()>;

    /// Fetch one row
    async fn get(&self, name: &str, version: &str) -> Result<Option<PluginVersionRecord>>;

    /// All rows for a plugin, storage order
    async fn list(&self, name: &str) -> Result<Vec<PluginVersionRecord>>;

    /// Replace a row matched by id
    async fn update(&self, record: &PluginVersionRecord) -> Result<()>;

    /// Delete one row; returns whether it existed
    async fn delete(&self, name: &str, version: &str) -> Result<bool>;

    /// Transactionally clear `is_active` on every row of the plugin and
    /// set the target row active with `status = active` and a fresh
    /// promotion date; returns the updated target
    async fn set_active_exclusive(&self, name: &str, version: &str)
        -> Result<PluginVersionRecord>;
}

/// In-memory version store used by tests
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    rows: RwLock<Vec<PluginVersionRecord>>,
}

impl MemoryVersionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn insert(&self, record: &PluginVersionRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows
            .iter()
            .any(|r| r.plugin_name == record.plugin_name && r.version == record.version)
        {
            return Err(PlugonError::PluginConflict {
                name: record.plugin_name.clone(),
                version: record.version.clone(),
            });
        }
        rows.push(record.clone());
        Ok(())
    }

    async fn get(&self, name: &str, version: &str) -> Result<Option<PluginVersionRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|r| r.plugin_name == name && r.version == version)
            .cloned())
    }

    async fn list(&self, name: &str) -> Result<Vec<PluginVersionRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.plugin_name == name)
            .cloned()
            .collect())
    }

    async fn update(&self, record: &PluginVersionRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.iter_mut().find(|r| r.id == record.id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(PlugonError::NotFound(format!(
                "version row {} not found",
                record.id
            ))),
        }
    }

    async fn delete(&self, name: &str, version: &str) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| !(r.plugin_name == name && r.version == version));
        Ok(rows.len() < before)
    }

    async fn set_active_exclusive(
        &self,
        name: &str,
        version: &str,
    ) -> Result<PluginVersionRecord> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();

        if !rows
            .iter()
            .any(|r| r.plugin_name == name && r.version == version)
        {
            return Err(PlugonError::NotFound(format!(
                "version {} of {} not found",
                version, name
            )));
        }

        let mut updated = None;
        for row in rows.iter_mut().filter(|r| r.plugin_name == name) {
            if row.version == version {
                row.is_active = true;
                row.status = VersionStatus::Active;
                row.promotion_date = Some(now);
                row.updated_at = now;
                updated = Some(row.clone());
            } else if row.is_active {
                row.is_active = false;
                row.updated_at = now;
            }
        }
        Ok(updated.expect("target row checked above"))
    }
}

/// PostgreSQL version store
#[derive(Debug, Clone)]
pub struct PostgresVersionStore {
    pool: PgPool,
}

impl PostgresVersionStore {
    /// Wrap a pool; the schema is owned by the repository's
    /// `ensure_schema`
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> PlugonError {
    PlugonError::Database(e.to_string())
}

const VERSION_COLUMNS: &str = "id, plugin_name, version, is_active, status, promotion_date, \
     deprecation_date, rollback_reason, description, author, license, manifest, file_path, \
     file_size, checksum, upload_date, dependencies, exports, created_at, updated_at";

fn row_to_version(row: &PgRow) -> Result<PluginVersionRecord> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(PluginVersionRecord {
        id: row.try_get("id").map_err(db_err)?,
        plugin_name: row.try_get("plugin_name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        is_active: row.try_get("is_active").map_err(db_err)?,
        status: status.parse().map_err(PlugonError::Database)?,
        promotion_date: row.try_get("promotion_date").map_err(db_err)?,
        deprecation_date: row.try_get("deprecation_date").map_err(db_err)?,
        rollback_reason: row.try_get("rollback_reason").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        author: row.try_get("author").map_err(db_err)?,
        license: row.try_get("license").map_err(db_err)?,
        manifest: row.try_get("manifest").map_err(db_err)?,
        file_path: row.try_get("file_path").map_err(db_err)?,
        file_size: row.try_get::<i64, _>("file_size").map_err(db_err)? as u64,
        checksum: row.try_get("checksum").map_err(db_err)?,
        upload_date: row.try_get("upload_date").map_err(db_err)?,
        dependencies: row.try_get("dependencies").map_err(db_err)?,
        exports: row.try_get("exports").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl VersionStore for PostgresVersionStore {
    #[instrument(level = "debug", skip(self, record), fields(name = %record.plugin_name, version = %record.version))]
    async fn insert(&self, record: &PluginVersionRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO plugin_versions (id, plugin_name, version, is_active, status,
                 promotion_date, deprecation_date, rollback_reason, description, author,
                 license, manifest, file_path, file_size, checksum, upload_date,
                 dependencies, exports, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                 $17, $18, $19, $20)
             ON CONFLICT (plugin_name, version) DO NOTHING",
        )
        .bind(record.id)
        .bind(&record.plugin_name)
        .bind(&record.version)
        .bind(record.is_active)
        .bind(record.status.to_string())
        .bind(record.promotion_date)
        .bind(record.deprecation_date)
        .bind(&record.rollback_reason)
        .bind(&record.description)
        .bind(&record.author)
        .bind(&record.license)
        .bind(&record.manifest)
        .bind(&record.file_path)
        .bind(record.file_size as i64)
        .bind(&record.checksum)
        .bind(record.upload_date)
        .bind(&record.dependencies)
        .bind(&record.exports)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(PlugonError::PluginConflict {
                name: record.plugin_name.clone(),
                version: record.version.clone(),
            });
        }
        Ok(())
    }

    async fn get(&self, name: &str, version: &str) -> Result<Option<PluginVersionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM plugin_versions WHERE plugin_name = $1 AND version = $2",
            VERSION_COLUMNS
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_version(&r)).transpose()
    }

    async fn list(&self, name: &str) -> Result<Vec<PluginVersionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM plugin_versions WHERE plugin_name = $1",
            VERSION_COLUMNS
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_version).collect()
    }

    async fn update(&self, record: &PluginVersionRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE plugin_versions SET is_active = $2, status = $3, promotion_date = $4,
                 deprecation_date = $5, rollback_reason = $6, updated_at = $7
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.is_active)
        .bind(record.status.to_string())
        .bind(record.promotion_date)
        .bind(record.deprecation_date)
        .bind(&record.rollback_reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(PlugonError::NotFound(format!(
                "version row {} not found",
                record.id
            )));
        }
        Ok(())
    }

    async fn delete(&self, name: &str, version: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM plugin_versions WHERE plugin_name = $1 AND version = $2")
                .bind(name)
                .bind(version)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "debug", skip(self))]
    async fn set_active_exclusive(
        &self,
        name: &str,
        version: &str,
    ) -> Result<PluginVersionRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE plugin_versions SET is_active = FALSE, updated_at = $2
             WHERE plugin_name = $1 AND is_active",
        )
        .bind(name)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "UPDATE plugin_versions
             SET is_active = TRUE, status = 'active', promotion_date = $3, updated_at = $3
             WHERE plugin_name = $1 AND version = $2
             RETURNING {}",
            VERSION_COLUMNS
        ))
        .bind(name)
        .bind(version)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            PlugonError::NotFound(format!("version {} of {} not found", version, name))
        })?;

        tx.commit().await.map_err(db_err)?;
        row_to_version(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(name: &str, version: &str) -> PluginVersionRecord {
        let now = Utc::now();
        PluginVersionRecord {
            id: Uuid::new_v4(),
            plugin_name: name.to_string(),
            version: version.to_string(),
            is_active: false,
            status: VersionStatus::Active,
            promotion_date: None,
            deprecation_date: None,
            rollback_reason: None,
            description: "d".to_string(),
            author: "a".to_string(),
            license: "MIT".to_string(),
            manifest: serde_json::json!({}),
            file_path: format!("{}-{}.zip", name, version),
            file_size: 1,
            checksum: format!("{}-{}", name, version),
            upload_date: now,
            dependencies: Vec::new(),
            exports: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_duplicate() {
        let store = MemoryVersionStore::new();
        store.insert(&record("p", "1.0.0")).await.unwrap();
        let err = store.insert(&record("p", "1.0.0")).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
        // a different version is fine
        store.insert(&record("p", "1.1.0")).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_active_exclusive_flips_together() {
        let store = MemoryVersionStore::new();
        store.insert(&record("p", "1.0.0")).await.unwrap();
        store.insert(&record("p", "1.1.0")).await.unwrap();

        store.set_active_exclusive("p", "1.0.0").await.unwrap();
        let promoted = store.set_active_exclusive("p", "1.1.0").await.unwrap();
        assert!(promoted.is_active);
        assert!(promoted.promotion_date.is_some());

        let rows = store.list("p").await.unwrap();
        let active: Vec<_> = rows.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, "1.1.0");
    }

    #[tokio::test]
    async fn test_set_active_unknown_version() {
        let store = MemoryVersionStore::new();
        store.insert(&record("p", "1.0.0")).await.unwrap();
        let err = store.set_active_exclusive("p", "9.9.9").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = MemoryVersionStore::new();
        let mut row = record("p", "1.0.0");
        store.insert(&row).await.unwrap();

        row.status = VersionStatus::Deprecated;
        store.update(&row).await.unwrap();
        let fetched = store.get("p", "1.0.0").await.unwrap().unwrap();
        assert_eq!(fetched.status, VersionStatus::Deprecated);

        assert!(store.delete("p", "1.0.0").await.unwrap());
        assert!(!store.delete("p", "1.0.0").await.unwrap());
    }
}
