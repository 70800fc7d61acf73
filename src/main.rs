// =============================================================================
// Plugon - High Performance Plugin Registry & Host Runtime
// =============================================================================
//
// Project: Plugon - High Performance Plugin Registry & Host Runtime
// Author: arkSong (arksong2018@gmail.com)
// Contributors: Plugon Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Main entry point for the Plugon registry server. Wires configuration,
//   structured logging, the metrics exporter, the storage backends and the
//   ingestion pipeline together, reconciles the blob store against the
//   repository and then serves the HTTP API until shutdown.
//
// Architecture:
//   • Tokio runtime with Axum for the HTTP surface
//   • PostgreSQL via sqlx, or the in-memory backend for small deployments
//   • Content-addressed validation cache in front of every verdict
//   • Structured logging with tracing, metrics via the metrics facade
//   • Configuration from plugon.toml + PLUGON_* and documented env vars
//
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plugon_core::config::RegistryConfig;
use plugon_registry::RegistryServiceBuilder;
use plugon_storage::{BlobStore, MemoryRepository, PostgresRepository};
use plugon_versions::{MemoryVersionStore, PostgresVersionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RegistryConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    config.validate().context("invalid configuration")?;
    info!("🔧 Starting Plugon registry v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = PrometheusBuilder::new().install() {
        warn!("⚠️ metrics exporter not installed: {}", e);
    }

    let events = plugon_core::events::EventBus::default();
    let blobs = BlobStore::open(&config.storage.root)
        .await
        .context("failed to open blob store")?;

    let builder = RegistryServiceBuilder::new(
        config.validation.clone(),
        config.signatures.clone(),
        config.optimization.clone(),
    )
    .events(events)
    .blobs(blobs);

    let service = if config.database.url.starts_with("postgres") {
        let repository = Arc::new(
            PostgresRepository::connect(&config.database)
                .await
                .context("failed to connect to PostgreSQL")?,
        );
        let versions = Arc::new(PostgresVersionStore::new(repository.pool().clone()));
        builder
            .repository(repository.clone())
            .trust_store(repository)
            .version_store(versions)
            .build()?
    } else {
        info!("🔧 Using the in-memory repository backend");
        let repository = Arc::new(MemoryRepository::new());
        builder
            .repository(repository.clone())
            .trust_store(repository)
            .version_store(Arc::new(MemoryVersionStore::new()))
            .build()?
    };
    let service = Arc::new(service);

    let report = service.startup().await.context("startup reconcile failed")?;
    if !report.orphaned_blobs.is_empty() || !report.quarantined_records.is_empty() {
        warn!(
            "⚠️ reconcile found {} orphaned blobs, quarantined {} records",
            report.orphaned_blobs.len(),
            report.quarantined_records.len()
        );
    }

    // periodic sweep of expired validation verdicts
    let _sweeper = service.cache().start_sweeper(Duration::from_secs(300));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let state = plugon_api::AppState {
        service,
        // leave room for multipart framing around the bundle itself
        upload_limit: (config.validation.max_plugin_size as usize).saturating_mul(2),
    };

    plugon_api::serve(state, addr).await?;
    info!("✅ Plugon registry stopped");
    Ok(())
}
