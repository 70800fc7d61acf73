//! Request handlers for the Plugon registry API
//!
//! Handlers translate HTTP to `RegistryService`, `TrustEngine` and
//! `VersionLifecycle` calls and wrap failures in the standard error
//! envelope via [`RequestContext`].

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use plugon_common::PlugonError;
use plugon_core::types::{
    PluginRecord, TrustAssignment, TrustEvidence, TrustLevel, TrustPolicy, TrustViolation,
    ViolationAction, ViolationSeverity,
};
use plugon_storage::{ListOptions, SortField, StatusFilter};
use plugon_versions::RollbackOptions;

use crate::error::{ApiError, RequestContext};
use crate::routes::AppState;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Query parameters for listings
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Status filter: active, deprecated, disabled or all
    pub status: Option<String>,

    /// Sort field: name, upload_date, download_count or version
    pub sort: Option<String>,

    /// Sort order: asc or desc
    pub order: Option<String>,

    /// Pagination offset
    pub offset: Option<usize>,

    /// Pagination limit
    pub limit: Option<usize>,
}

fn parse_list_options(query: &ListQuery) -> Result<ListOptions, PlugonError> {
    let status = match query.status.as_deref() {
        None | Some("active") => StatusFilter::Active,
        Some("deprecated") => StatusFilter::Deprecated,
        Some("disabled") => StatusFilter::Disabled,
        Some("all") => StatusFilter::All,
        Some(other) => {
            return Err(PlugonError::Validation(format!(
                "unknown status filter: {}",
                other
            )))
        }
    };
    let sort_by = match query.sort.as_deref() {
        None | Some("name") => SortField::Name,
        Some("upload_date") => SortField::UploadDate,
        Some("download_count") => SortField::DownloadCount,
        Some("version") => SortField::Version,
        Some(other) => {
            return Err(PlugonError::Validation(format!(
                "unknown sort field: {}",
                other
            )))
        }
    };
    Ok(ListOptions {
        status,
        sort_by,
        descending: query.order.as_deref() == Some("desc"),
        offset: query.offset.unwrap_or(0),
        limit: query.limit.unwrap_or(0),
    })
}

/// GET /api/v1/plugins
pub async fn list_plugins(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<PluginRecord>>> {
    let options = parse_list_options(&query).map_err(|e| ctx.error(e))?;
    let records = state
        .service
        .list_plugins(&options)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(records))
}

/// POST /api/v1/plugins — multipart upload, field `file`
#[instrument(level = "debug", skip_all)]
pub async fn upload_plugin(
    State(state): State<AppState>,
    ctx: RequestContext,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut bundle: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ctx.error(PlugonError::Upload(format!("malformed multipart body: {}", e))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let is_zip_mime = field.content_type() == Some("application/zip");
        let is_zip_name = field
            .file_name()
            .map(|n| n.ends_with(".zip"))
            .unwrap_or(false);
        if !is_zip_mime && !is_zip_name {
            return Err(ctx.error(PlugonError::Validation(
                "file must be a ZIP archive (application/zip or .zip)".into(),
            )));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ctx.error(PlugonError::Upload(format!("failed to read upload: {}", e))))?;
        bundle = Some(bytes.to_vec());
        break;
    }

    let bundle = bundle
        .ok_or_else(|| ctx.error(PlugonError::Validation("missing multipart field 'file'".into())))?;

    let record = state
        .service
        .ingest(bundle)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// GET /api/v1/plugins/:name
pub async fn get_plugin(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> ApiResult<Json<PluginRecord>> {
    let record = state
        .service
        .get_plugin(&name)
        .await
        .map_err(|e| ctx.error(e))?
        .ok_or_else(|| ctx.error(PlugonError::PluginNotFound(name)))?;
    Ok(Json(record))
}

/// GET /api/v1/plugins/:name/download
pub async fn download_plugin(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: axum::http::HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim());

    let (record, bytes) = state
        .service
        .download(&name, user_agent, ip_address)
        .await
        .map_err(|e| ctx.error(e))?;

    let response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}-{}.zip\"",
                    record.name, record.version
                ),
            ),
        ],
        bytes,
    );
    Ok(response.into_response())
}

/// DELETE /api/v1/plugins/:name
pub async fn delete_plugin(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .service
        .delete_plugin(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    if !deleted {
        return Err(ctx.error(PlugonError::PluginNotFound(name)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Query parameters for search
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    /// Substring to search for
    #[serde(default)]
    pub q: String,
}

/// GET /api/v1/plugins/search?q=
pub async fn search_plugins(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<PluginRecord>>> {
    let records = state
        .service
        .search_plugins(&query.q)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(records))
}

/// One entry of the trust level listing
#[derive(Debug, Serialize)]
pub struct TrustLevelEntry {
    /// Level name
    pub level: TrustLevel,

    /// Integer rank
    pub rank: u8,
}

/// GET /api/v1/plugins/trust/levels
pub async fn trust_levels() -> Json<Vec<TrustLevelEntry>> {
    Json(
        TrustLevel::all()
            .into_iter()
            .map(|level| TrustLevelEntry {
                level,
                rank: level.rank(),
            })
            .collect(),
    )
}

/// GET /api/v1/plugins/trust/policies/:level
pub async fn trust_policy(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(level): Path<String>,
) -> ApiResult<Json<TrustPolicy>> {
    let level: TrustLevel = level
        .parse()
        .map_err(|_| ctx.error(PlugonError::NotFound(format!("trust level {}", level))))?;
    let policy = state
        .service
        .trust()
        .policy_for(level)
        .cloned()
        .ok_or_else(|| ctx.error(PlugonError::NotFound(format!("policy for {}", level))))?;
    Ok(Json(policy))
}

/// Response for the per-plugin trust level
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginTrustResponse {
    /// Plugin name
    pub plugin_name: String,

    /// Effective trust level
    pub trust_level: TrustLevel,

    /// Integer rank of the level
    pub rank: u8,
}

/// GET /api/v1/plugins/:name/trust-level
pub async fn get_plugin_trust_level(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> ApiResult<Json<PluginTrustResponse>> {
    ensure_plugin_exists(&state, &ctx, &name).await?;
    let level = state.service.trust().get_trust_level(&name, None).await;
    Ok(Json(PluginTrustResponse {
        plugin_name: name,
        trust_level: level,
        rank: level.rank(),
    }))
}

/// Body of a trust level assignment
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTrustBody {
    /// The level to assign
    pub trust_level: TrustLevel,

    /// Who is assigning it
    pub assigned_by: String,

    /// Why
    pub reason: String,

    /// Optional version scope
    #[serde(default)]
    pub version: Option<String>,
}

/// PUT /api/v1/plugins/:name/trust-level
pub async fn put_plugin_trust_level(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<AssignTrustBody>,
) -> ApiResult<Json<PluginTrustResponse>> {
    ensure_plugin_exists(&state, &ctx, &name).await?;
    if body.assigned_by.trim().is_empty() {
        return Err(ctx.error(PlugonError::Validation("assignedBy is required".into())));
    }

    state
        .service
        .assign_trust(TrustAssignment {
            id: Uuid::new_v4(),
            plugin_name: name.clone(),
            version: body.version.clone(),
            trust_level: body.trust_level,
            assigned_by: body.assigned_by,
            assigned_at: Utc::now(),
            reason: body.reason,
            evidence: Vec::<TrustEvidence>::new(),
            valid_until: None,
            review_required: state
                .service
                .trust()
                .policy_for(body.trust_level)
                .map(|p| p.requires_review)
                .unwrap_or(true),
            is_active: true,
        })
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(PluginTrustResponse {
        plugin_name: name,
        trust_level: body.trust_level,
        rank: body.trust_level.rank(),
    }))
}

/// Body of a capability check
#[derive(Debug, Deserialize)]
pub struct CapabilityCheckBody {
    /// Capability name to check
    pub capability: String,

    /// Optional version scope
    #[serde(default)]
    pub version: Option<String>,
}

/// Response of a capability check
#[derive(Debug, Serialize)]
pub struct CapabilityCheckResponse {
    /// Whether the plugin may perform the capability
    pub allowed: bool,

    /// Explanation
    pub reason: String,
}

/// POST /api/v1/plugins/:name/capability-check
pub async fn capability_check(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<CapabilityCheckBody>,
) -> ApiResult<Json<CapabilityCheckResponse>> {
    ensure_plugin_exists(&state, &ctx, &name).await?;
    let trust = state.service.trust();
    let level = trust.get_trust_level(&name, body.version.as_deref()).await;
    let allowed = trust
        .can_perform_capability(&name, &body.capability, body.version.as_deref())
        .await;
    Ok(Json(CapabilityCheckResponse {
        allowed,
        reason: if allowed {
            format!("'{}' is permitted at {}", body.capability, level)
        } else {
            format!("'{}' is not permitted at {}", body.capability, level)
        },
    }))
}

/// Body of a reported trust violation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationBody {
    /// Violation severity
    pub severity: ViolationSeverity,

    /// Enforcement action taken
    pub action: ViolationAction,

    /// What happened
    pub description: String,

    /// Optional version scope
    #[serde(default)]
    pub version: Option<String>,

    /// Capability involved, if any
    #[serde(default)]
    pub capability: Option<String>,
}

/// POST /api/v1/plugins/:name/trust-violation
pub async fn report_violation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<ViolationBody>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_plugin_exists(&state, &ctx, &name).await?;
    state
        .service
        .trust()
        .record_violation(TrustViolation {
            id: Uuid::new_v4(),
            plugin_name: name,
            version: body.version,
            capability: body.capability,
            severity: body.severity,
            action: body.action,
            description: body.description,
            recorded_at: Utc::now(),
        })
        .await;
    Ok(Json(serde_json::json!({ "recorded": true })))
}

/// GET /api/v1/plugins/:name/versions
pub async fn list_versions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<plugon_core::types::PluginVersionRecord>>> {
    let versions = state
        .service
        .versions()
        .list_versions(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    if versions.is_empty() {
        return Err(ctx.error(PlugonError::PluginNotFound(name)));
    }
    Ok(Json(versions))
}

/// POST /api/v1/plugins/:name/versions/:version/promote
pub async fn promote_version(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<Json<plugon_core::types::PluginVersionRecord>> {
    let promoted = state
        .service
        .versions()
        .promote(&name, &version)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(promoted))
}

/// Body of a rollback request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackBody {
    /// Version to roll back to
    pub target_version: String,

    /// Keep the displaced version as a rollback target
    #[serde(default = "default_true")]
    pub preserve_current_version: bool,

    /// Reason recorded with the rollback
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

/// POST /api/v1/plugins/:name/rollback
pub async fn rollback_version(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<plugon_core::types::PluginVersionRecord>> {
    let options = RollbackOptions {
        preserve_current_version: body.preserve_current_version,
        reason: body
            .reason
            .unwrap_or_else(|| "operator rollback".to_string()),
    };
    let promoted = state
        .service
        .versions()
        .rollback(&name, &body.target_version, &options)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(promoted))
}

/// Body of an archive request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBody {
    /// How many of the newest versions to preserve
    #[serde(default = "default_keep_latest")]
    pub keep_latest: usize,
}

fn default_keep_latest() -> usize {
    3
}

/// POST /api/v1/plugins/:name/versions/archive
pub async fn archive_versions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(body): Json<ArchiveBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let archived = state
        .service
        .versions()
        .archive(&name, body.keep_latest)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(serde_json::json!({ "archived": archived })))
}

/// Query parameters for a compatibility check
#[derive(Debug, Deserialize)]
pub struct CompatibilityQuery {
    /// Version to compare from
    pub from: String,

    /// Version to compare to
    pub to: String,
}

/// GET /api/v1/plugins/:name/compatibility?from=&to=
pub async fn check_compatibility(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Query(query): Query<CompatibilityQuery>,
) -> ApiResult<Json<plugon_versions::CompatibilityReport>> {
    let report = state
        .service
        .versions()
        .check_compatibility(&name, &query.from, &query.to)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(report))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server status
    pub status: String,

    /// Current server time
    pub timestamp: chrono::DateTime<Utc>,
}

/// GET /api/v1/health
pub async fn health_check(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> ApiResult<Json<HealthResponse>> {
    let healthy = state.service.health().await.map_err(|e| ctx.error(e))?;
    if !healthy {
        return Err(ctx.error(PlugonError::Internal("repository unhealthy".into())));
    }
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    }))
}

/// GET /api/v1/stats
pub async fn stats(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> ApiResult<Json<plugon_registry::RegistryStatsSnapshot>> {
    let snapshot = state.service.stats().await.map_err(|e| ctx.error(e))?;
    Ok(Json(snapshot))
}

async fn ensure_plugin_exists(
    state: &AppState,
    ctx: &RequestContext,
    name: &str,
) -> ApiResult<()> {
    let known = state
        .service
        .get_plugin(name)
        .await
        .map_err(|e| ctx.error(e))?
        .is_some()
        || !state
            .service
            .versions()
            .list_versions(name)
            .await
            .map_err(|e| ctx.error(e))?
            .is_empty();
    if !known {
        return Err(ctx.error(PlugonError::PluginNotFound(name.to_string())));
    }
    Ok(())
}
