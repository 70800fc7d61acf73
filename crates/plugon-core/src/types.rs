//! Core types for Plugon
//!
//! This module defines the fundamental types used throughout the Plugon
//! ecosystem: the plugin manifest as found inside a bundle, the canonical
//! stored records, the trust model and the validation verdict types.
//! These types are designed to be shared across all crates in the project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Trust tiers gating capability access, ordered from least to most trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustLevel {
    Quarantined,
    Untrusted,
    Community,
    Verified,
    Internal,
}

impl TrustLevel {
    /// Integer rank of this level; strict total order
    pub fn rank(&self) -> u8 {
        match self {
            TrustLevel::Quarantined => 0,
            TrustLevel::Untrusted => 1,
            TrustLevel::Community => 2,
            TrustLevel::Verified => 3,
            TrustLevel::Internal => 4,
        }
    }

    /// Whether this level satisfies the given minimum
    pub fn meets(&self, min: TrustLevel) -> bool {
        self.rank() >= min.rank()
    }

    /// All levels, lowest rank first
    pub fn all() -> [TrustLevel; 5] {
        [
            TrustLevel::Quarantined,
            TrustLevel::Untrusted,
            TrustLevel::Community,
            TrustLevel::Verified,
            TrustLevel::Internal,
        ]
    }
}

impl PartialOrd for TrustLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrustLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustLevel::Quarantined => "QUARANTINED",
            TrustLevel::Untrusted => "UNTRUSTED",
            TrustLevel::Community => "COMMUNITY",
            TrustLevel::Verified => "VERIFIED",
            TrustLevel::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUARANTINED" => Ok(TrustLevel::Quarantined),
            "UNTRUSTED" => Ok(TrustLevel::Untrusted),
            "COMMUNITY" => Ok(TrustLevel::Community),
            "VERIFIED" => Ok(TrustLevel::Verified),
            "INTERNAL" => Ok(TrustLevel::Internal),
            other => Err(format!("unknown trust level: {}", other)),
        }
    }
}

/// Status of a plugin's primary record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Deprecated,
    Disabled,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Active => "active",
            PluginStatus::Deprecated => "deprecated",
            PluginStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PluginStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(PluginStatus::Active),
            "deprecated" => Ok(PluginStatus::Deprecated),
            "disabled" => Ok(PluginStatus::Disabled),
            other => Err(format!("unknown plugin status: {}", other)),
        }
    }
}

/// Status of a row in the multi-version table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Active,
    Deprecated,
    Disabled,
    Archived,
    RollbackTarget,
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionStatus::Active => "active",
            VersionStatus::Deprecated => "deprecated",
            VersionStatus::Disabled => "disabled",
            VersionStatus::Archived => "archived",
            VersionStatus::RollbackTarget => "rollback_target",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(VersionStatus::Active),
            "deprecated" => Ok(VersionStatus::Deprecated),
            "disabled" => Ok(VersionStatus::Disabled),
            "archived" => Ok(VersionStatus::Archived),
            "rollback_target" => Ok(VersionStatus::RollbackTarget),
            other => Err(format!("unknown version status: {}", other)),
        }
    }
}

/// Signature algorithms accepted in a bundle manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    RS256,
    RS512,
    ES256,
    ES512,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignatureAlgorithm::RS256 => "RS256",
            SignatureAlgorithm::RS512 => "RS512",
            SignatureAlgorithm::ES256 => "ES256",
            SignatureAlgorithm::ES512 => "ES512",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(SignatureAlgorithm::RS256),
            "RS512" => Ok(SignatureAlgorithm::RS512),
            "ES256" => Ok(SignatureAlgorithm::ES256),
            "ES512" => Ok(SignatureAlgorithm::ES512),
            other => Err(format!("unsupported signature algorithm: {}", other)),
        }
    }
}

/// Signature block inside a manifest's `security` section
///
/// The algorithm is kept as the raw manifest string; the signature
/// verifier applies the supported-set policy so that an unknown algorithm
/// fails verification instead of manifest parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Signature algorithm name, e.g. `RS256`
    pub algorithm: String,

    /// PEM-encoded public key of the issuer
    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// Base64-encoded signature over the bundle bytes
    pub signature: String,
}

/// `security` section of a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSecurity {
    /// Optional cryptographic signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureSpec>,

    /// Trust level requested by the author (advisory)
    #[serde(
        rename = "trustLevel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub trust_level: Option<TrustLevel>,
}

/// `permissions` section of a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestPermissions {
    /// Service capabilities the plugin asks for
    #[serde(default)]
    pub services: Vec<String>,

    /// Module capabilities the plugin asks for
    #[serde(default)]
    pub modules: Vec<String>,
}

/// `configuration` section of a manifest; the schema is opaque
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfiguration {
    /// Opaque configuration schema, passed through untouched
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// `module` section of a manifest
///
/// The exports list feeds compatibility analysis; everything else in the
/// section is opaque pass-through data and is serialized back verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestModule {
    /// Exported symbols
    #[serde(default)]
    pub exports: Vec<String>,

    /// Unrecognized module fields, preserved round-trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Plugin manifest as found in `plugin.manifest.json` at the bundle root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Lowercase plugin identifier
    pub name: String,

    /// Semantic version (triple plus optional pre-release tag)
    pub version: String,

    /// Human-readable description
    pub description: String,

    /// Author
    pub author: String,

    /// License identifier
    pub license: String,

    /// PascalCase entry point symbol
    #[serde(rename = "entryPoint")]
    pub entry_point: String,

    /// Names of plugins this plugin depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Optional explicit load order hint
    #[serde(rename = "loadOrder", default, skip_serializing_if = "Option::is_none")]
    pub load_order: Option<i32>,

    /// Host compatibility version (semver)
    #[serde(rename = "compatibilityVersion")]
    pub compatibility_version: String,

    /// Routes the plugin wants to register
    #[serde(default)]
    pub routes: Vec<String>,

    /// Configuration schema section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ManifestConfiguration>,

    /// Module exports section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<ManifestModule>,

    /// Security section (signature, requested trust level)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ManifestSecurity>,

    /// Permission requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ManifestPermissions>,

    /// Whether the plugin is critical for the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
}

impl PluginManifest {
    /// Exported symbols declared by the manifest, empty when absent
    pub fn exports(&self) -> &[String] {
        self.module.as_ref().map(|m| m.exports.as_slice()).unwrap_or(&[])
    }

    /// All capability names implied by the manifest's permission requests
    /// and route registrations
    pub fn implied_capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if let Some(perms) = &self.permissions {
            caps.extend(perms.services.iter().cloned());
            caps.extend(perms.modules.iter().cloned());
        }
        if !self.routes.is_empty() {
            caps.push("api.routes".to_string());
        }
        caps
    }
}

/// Canonical stored form of a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin name (unique)
    pub name: String,

    /// Currently active version
    pub version: String,

    /// Description
    pub description: String,

    /// Author
    pub author: String,

    /// License
    pub license: String,

    /// Serialized manifest
    pub manifest: serde_json::Value,

    /// Path of the stored bundle
    pub file_path: String,

    /// Bundle size in bytes
    pub file_size: u64,

    /// SHA-256 hex digest of the bundle (unique)
    pub checksum: String,

    /// Upload timestamp
    pub upload_date: DateTime<Utc>,

    /// Last download/access timestamp
    pub last_accessed: Option<DateTime<Utc>>,

    /// Download counter
    pub download_count: u64,

    /// Record status
    pub status: PluginStatus,

    /// Free-form tags
    pub tags: Vec<String>,

    /// Dependency plugin names
    pub dependencies: Vec<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// One row in the multi-version table
///
/// The versions table fully owns the per-version payload; the primary
/// [`PluginRecord`] only mirrors the active version's fields, updated
/// inside the promotion transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginVersionRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin name
    pub plugin_name: String,

    /// Version string; `(plugin_name, version)` is unique
    pub version: String,

    /// Whether this is the single active version
    pub is_active: bool,

    /// Row status
    pub status: VersionStatus,

    /// When this version was last promoted
    pub promotion_date: Option<DateTime<Utc>>,

    /// When this version was deprecated
    pub deprecation_date: Option<DateTime<Utc>>,

    /// Why this version was rolled back to/away from
    pub rollback_reason: Option<String>,

    /// Description
    pub description: String,

    /// Author
    pub author: String,

    /// License
    pub license: String,

    /// Serialized manifest
    pub manifest: serde_json::Value,

    /// Path of the stored bundle
    pub file_path: String,

    /// Bundle size in bytes
    pub file_size: u64,

    /// SHA-256 hex digest of the bundle
    pub checksum: String,

    /// Upload timestamp
    pub upload_date: DateTime<Utc>,

    /// Dependency plugin names
    pub dependencies: Vec<String>,

    /// Exported symbols, for compatibility analysis
    pub exports: Vec<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Append-only download history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDownloadRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin the download belongs to
    pub plugin_id: Uuid,

    /// Version that was served
    pub version: String,

    /// Download timestamp
    pub download_date: DateTime<Utc>,

    /// Client user agent, if known
    pub user_agent: Option<String>,

    /// Client address, if known
    pub ip_address: Option<String>,
}

/// Typed evidence attached to a trust assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustEvidence {
    /// Evidence kind
    pub kind: EvidenceKind,

    /// Confidence score, 0-100
    pub score: u8,

    /// Free-form detail
    pub detail: String,

    /// When the evidence was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Kinds of trust evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Signature,
    Audit,
    Behavior,
}

/// A trust level assignment for `(plugin_name, version?)`
///
/// Assignments are append-only; superseded rows stay in the ledger with
/// `is_active` cleared for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustAssignment {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin name
    pub plugin_name: String,

    /// Specific version, or None for a name-wide assignment
    pub version: Option<String>,

    /// Assigned trust level
    pub trust_level: TrustLevel,

    /// Who made the assignment
    pub assigned_by: String,

    /// When the assignment was made
    pub assigned_at: DateTime<Utc>,

    /// Reason for the assignment
    pub reason: String,

    /// Supporting evidence
    pub evidence: Vec<TrustEvidence>,

    /// Optional expiry
    pub valid_until: Option<DateTime<Utc>>,

    /// Whether a human review is still required
    pub review_required: bool,

    /// Whether this is the active assignment for the key
    pub is_active: bool,
}

/// Resource ceilings attached to a trust policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU budget in milliseconds per invocation
    pub cpu_ms: u64,

    /// Memory ceiling in megabytes
    pub memory_mb: u64,

    /// Maximum open file handles
    pub file_handles: u32,

    /// Maximum concurrent network connections
    pub network_connections: u32,
}

/// Audit verbosity attached to a trust policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    None,
    Basic,
    Detailed,
    Forensic,
}

/// Policy for a single trust level
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustPolicy {
    /// The level this policy applies to
    pub trust_level: TrustLevel,

    /// Capabilities granted at this level
    pub allowed_capabilities: HashSet<String>,

    /// Capabilities explicitly denied at this level
    pub denied_capabilities: HashSet<String>,

    /// Resource ceilings
    pub resource_limits: ResourceLimits,

    /// Whether assignments at this level require review
    pub requires_review: bool,

    /// Audit verbosity
    pub audit_level: AuditLevel,
}

/// Risk classification of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Functional category of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Network,
    Filesystem,
    Process,
    Database,
    Api,
    Security,
}

/// A named action a plugin may perform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// Capability name, e.g. `filesystem.read`
    pub name: String,

    /// Risk classification
    pub risk_level: RiskLevel,

    /// Functional category
    pub category: CapabilityCategory,
}

/// Severity of a recorded trust violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Enforcement action taken for a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationAction {
    Warn,
    Restrict,
    Quarantine,
    Remove,
}

/// An entry in the violation ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustViolation {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin name
    pub plugin_name: String,

    /// Specific version, if the violation is version-scoped
    pub version: Option<String>,

    /// Capability involved, if any
    pub capability: Option<String>,

    /// Severity
    pub severity: ViolationSeverity,

    /// Enforcement action
    pub action: ViolationAction,

    /// Description of the violation
    pub description: String,

    /// When the violation was recorded
    pub recorded_at: DateTime<Utc>,
}

/// A queued trust level change request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustChangeRequest {
    /// Unique identifier
    pub id: Uuid,

    /// Plugin name
    pub plugin_name: String,

    /// Specific version, or None for a name-wide change
    pub version: Option<String>,

    /// Current effective level
    pub current_level: TrustLevel,

    /// Requested level
    pub requested_level: TrustLevel,

    /// Who requested the change
    pub requested_by: String,

    /// Justification
    pub reason: String,

    /// When the change was requested
    pub requested_at: DateTime<Utc>,

    /// Review status
    pub status: ChangeRequestStatus,
}

/// Review status of a trust change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Pending,
    Approved,
    Rejected,
    AutoApplied,
}

/// Kind tag for a cached validation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictKind {
    Manifest,
    Structure,
    Security,
    Full,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictKind::Manifest => "manifest",
            VerdictKind::Structure => "structure",
            VerdictKind::Security => "security",
            VerdictKind::Full => "full",
        };
        f.write_str(s)
    }
}

/// Outcome of a validation step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    /// Whether the input passed
    pub is_valid: bool,

    /// Fatal errors; any entry makes the verdict invalid
    pub errors: Vec<String>,

    /// Non-fatal findings
    pub warnings: Vec<String>,
}

impl ValidationVerdict {
    /// A passing verdict with no findings
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// A failing verdict with one error
    pub fn invalid<S: Into<String>>(error: S) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    /// Merge another verdict into this one; validity is conjunctive
    pub fn merge(&mut self, other: ValidationVerdict) {
        self.is_valid = self.is_valid && other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Per-plugin lifecycle state, shared between host components and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Unloaded,
    Discovered,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Unloaded => "UNLOADED",
            PluginState::Discovered => "DISCOVERED",
            PluginState::Loading => "LOADING",
            PluginState::Loaded => "LOADED",
            PluginState::Unloading => "UNLOADING",
            PluginState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
