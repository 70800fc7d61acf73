//! Plugon
//!
//! A two-tier plugin platform: a registry that ingests, validates,
//! signs/verifies, stores and serves versioned plugin bundles over HTTP,
//! and a host runtime that discovers, orders, loads and supervises those
//! bundles. This crate re-exports the workspace members for embedders and
//! integration tests.

pub use plugon_api as api;
pub use plugon_common as common;
pub use plugon_core as core;
pub use plugon_host as host;
pub use plugon_registry as registry;
pub use plugon_storage as storage;
pub use plugon_trust as trust;
pub use plugon_validate as validate;
pub use plugon_versions as versions;

pub use plugon_common::{ErrorCode, PlugonError, Result};
