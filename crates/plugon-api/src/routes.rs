//! API routes for the Plugon registry
//!
//! This module defines the API routes for the registry server. All paths
//! are prefixed with `/api/v1`.

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use plugon_registry::RegistryService;

use crate::handlers;

/// Shared state for the HTTP surface
#[derive(Clone)]
pub struct AppState {
    /// The registry facade
    pub service: Arc<RegistryService>,

    /// Request body ceiling for uploads, in bytes
    pub upload_limit: usize,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.upload_limit;
    Router::new()
        // Plugin CRUD
        .route("/api/v1/plugins", get(handlers::list_plugins))
        .route("/api/v1/plugins", post(handlers::upload_plugin))
        .route("/api/v1/plugins/search", get(handlers::search_plugins))
        .route("/api/v1/plugins/:name", get(handlers::get_plugin))
        .route("/api/v1/plugins/:name", delete(handlers::delete_plugin))
        .route(
            "/api/v1/plugins/:name/download",
            get(handlers::download_plugin),
        )
        // Trust surface
        .route("/api/v1/plugins/trust/levels", get(handlers::trust_levels))
        .route(
            "/api/v1/plugins/trust/policies/:level",
            get(handlers::trust_policy),
        )
        .route(
            "/api/v1/plugins/:name/trust-level",
            get(handlers::get_plugin_trust_level),
        )
        .route(
            "/api/v1/plugins/:name/trust-level",
            put(handlers::put_plugin_trust_level),
        )
        .route(
            "/api/v1/plugins/:name/capability-check",
            post(handlers::capability_check),
        )
        .route(
            "/api/v1/plugins/:name/trust-violation",
            post(handlers::report_violation),
        )
        // Version lifecycle
        .route("/api/v1/plugins/:name/versions", get(handlers::list_versions))
        .route(
            "/api/v1/plugins/:name/versions/:version/promote",
            post(handlers::promote_version),
        )
        .route(
            "/api/v1/plugins/:name/rollback",
            post(handlers::rollback_version),
        )
        .route(
            "/api/v1/plugins/:name/versions/archive",
            post(handlers::archive_versions),
        )
        .route(
            "/api/v1/plugins/:name/compatibility",
            get(handlers::check_compatibility),
        )
        // Operational
        .route("/api/v1/health", get(handlers::health_check))
        .route("/api/v1/stats", get(handlers::stats))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
