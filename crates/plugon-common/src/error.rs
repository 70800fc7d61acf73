//! Error types for Plugon
//!
//! This module defines the error types used throughout the Plugon system.
//! Every error carries a stable machine-readable code so that the HTTP
//! surface and the host runtime report failures consistently.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Stable error codes surfaced in the HTTP error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    AuthenticationRequired,
    InsufficientPermissions,
    ResourceNotFound,
    ResourceConflict,
    RateLimitExceeded,
    InternalServerError,
    PluginNotFound,
    PluginValidationFailed,
    PluginUploadFailed,
    PluginSecurityViolation,
    InsufficientTrustLevel,
    CapabilityDenied,
    PluginConflict,
    OperationTimeout,
    StorageOperationFailed,
    DatabaseOperationFailed,
    ConfigurationError,
}

impl ErrorCode {
    /// The wire form of the code (SCREAMING_SNAKE_CASE)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::ResourceConflict => "RESOURCE_CONFLICT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::PluginNotFound => "PLUGIN_NOT_FOUND",
            ErrorCode::PluginValidationFailed => "PLUGIN_VALIDATION_FAILED",
            ErrorCode::PluginUploadFailed => "PLUGIN_UPLOAD_FAILED",
            ErrorCode::PluginSecurityViolation => "PLUGIN_SECURITY_VIOLATION",
            ErrorCode::InsufficientTrustLevel => "INSUFFICIENT_TRUST_LEVEL",
            ErrorCode::CapabilityDenied => "CAPABILITY_DENIED",
            ErrorCode::PluginConflict => "PLUGIN_CONFLICT",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::StorageOperationFailed => "STORAGE_OPERATION_FAILED",
            ErrorCode::DatabaseOperationFailed => "DATABASE_OPERATION_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugon error types
#[derive(Debug, Error)]
pub enum PlugonError {
    /// Generic request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Plugin bundle failed validation (manifest, structure or security scan)
    #[error("Plugin validation failed: {0}")]
    PluginValidation(String),

    /// Security violation (bad signature, unsafe imports, policy breach)
    #[error("Security violation: {0}")]
    Security(String),

    /// The acting trust level does not meet the required one
    #[error("Insufficient trust level: required {required}, actual {actual}")]
    InsufficientTrust {
        /// Minimum trust level required for the operation
        required: String,
        /// Trust level the plugin actually holds
        actual: String,
    },

    /// A capability was denied by the effective trust policy
    #[error("Capability '{capability}' denied for plugin '{plugin}'")]
    CapabilityDenied {
        /// The capability that was requested
        capability: String,
        /// Plugin that requested it
        plugin: String,
    },

    /// Authentication error
    #[error("Authentication required: {0}")]
    Auth(String),

    /// Authorization error
    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Plugin not found by name
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Generic resource conflict
    #[error("Resource conflict: {0}")]
    Conflict(String),

    /// Duplicate `(name, version)` upload
    #[error("Plugin conflict: {name}@{version} already exists")]
    PluginConflict {
        /// Plugin name
        name: String,
        /// Conflicting version
        version: String,
    },

    /// Upload processing failure
    #[error("Plugin upload failed: {0}")]
    Upload(String),

    /// Upload larger than the configured maximum
    #[error("Bundle too large: {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Size of the rejected upload
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Blob store I/O failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Repository/database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Rate limit error
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for Plugon operations
pub type Result<T> = std::result::Result<T, PlugonError>;

impl PlugonError {
    /// The stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            PlugonError::Validation(_) => ErrorCode::ValidationFailed,
            PlugonError::PluginValidation(_) => ErrorCode::PluginValidationFailed,
            PlugonError::Security(_) => ErrorCode::PluginSecurityViolation,
            PlugonError::InsufficientTrust { .. } => ErrorCode::InsufficientTrustLevel,
            PlugonError::CapabilityDenied { .. } => ErrorCode::CapabilityDenied,
            PlugonError::Auth(_) => ErrorCode::AuthenticationRequired,
            PlugonError::Forbidden(_) => ErrorCode::InsufficientPermissions,
            PlugonError::NotFound(_) => ErrorCode::ResourceNotFound,
            PlugonError::PluginNotFound(_) => ErrorCode::PluginNotFound,
            PlugonError::Conflict(_) => ErrorCode::ResourceConflict,
            PlugonError::PluginConflict { .. } => ErrorCode::PluginConflict,
            PlugonError::Upload(_) => ErrorCode::PluginUploadFailed,
            PlugonError::PayloadTooLarge { .. } => ErrorCode::PluginUploadFailed,
            PlugonError::Storage(_) => ErrorCode::StorageOperationFailed,
            PlugonError::Database(_) => ErrorCode::DatabaseOperationFailed,
            PlugonError::RateLimit(_) => ErrorCode::RateLimitExceeded,
            PlugonError::Timeout(_) => ErrorCode::OperationTimeout,
            PlugonError::Config(_) => ErrorCode::ConfigurationError,
            PlugonError::Serialization(_) => ErrorCode::InternalServerError,
            PlugonError::Io(_) => ErrorCode::StorageOperationFailed,
            PlugonError::Internal(_) => ErrorCode::InternalServerError,
        }
    }

    /// The HTTP status this error maps to
    pub fn http_status(&self) -> u16 {
        match self {
            PlugonError::Validation(_) | PlugonError::PluginValidation(_) => 400,
            PlugonError::Security(_) => 403,
            PlugonError::InsufficientTrust { .. } | PlugonError::CapabilityDenied { .. } => 403,
            PlugonError::Auth(_) => 401,
            PlugonError::Forbidden(_) => 403,
            PlugonError::NotFound(_) | PlugonError::PluginNotFound(_) => 404,
            PlugonError::Conflict(_) | PlugonError::PluginConflict { .. } => 409,
            PlugonError::Upload(_) => 400,
            PlugonError::PayloadTooLarge { .. } => 413,
            PlugonError::RateLimit(_) => 429,
            PlugonError::Timeout(_) => 408,
            PlugonError::Storage(_)
            | PlugonError::Database(_)
            | PlugonError::Config(_)
            | PlugonError::Serialization(_)
            | PlugonError::Io(_)
            | PlugonError::Internal(_) => 500,
        }
    }

    /// Structured details for the error envelope, when the variant carries any
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            PlugonError::InsufficientTrust { required, actual } => Some(serde_json::json!({
                "requiredTrustLevel": required,
                "actualTrustLevel": actual,
            })),
            PlugonError::CapabilityDenied { capability, plugin } => Some(serde_json::json!({
                "capability": capability,
                "plugin": plugin,
            })),
            PlugonError::PluginConflict { name, version } => Some(serde_json::json!({
                "name": name,
                "version": version,
            })),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PlugonError {
    fn from(err: serde_json::Error) -> Self {
        PlugonError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PlugonError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        PlugonError::Timeout(err.to_string())
    }
}
