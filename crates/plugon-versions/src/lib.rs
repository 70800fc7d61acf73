//! Plugon Version Lifecycle Library
//!
//! The multi-version table behind each plugin: exactly one active version
//! per plugin, semver-aware promotion and rollback, archival of old
//! versions and compatibility analysis between any two versions. The
//! versions table fully owns per-version payloads; the primary plugin
//! record only mirrors the active version, updated during promotion.

pub mod compat;
pub mod lifecycle;
pub mod store;

pub use compat::CompatibilityReport;
pub use lifecycle::{RollbackOptions, VersionLifecycle};
pub use store::{MemoryVersionStore, PostgresVersionStore, VersionStore};

pub use plugon_common::{PlugonError, Result};
