//! Plugon Storage Library
//!
//! The repository abstraction over plugin records, downloads and trust
//! assignments, with two conformant backends: a durable PostgreSQL
//! implementation and an in-memory one used by tests and small
//! deployments. The blob store owns the raw bundle files on disk.

pub mod blob;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use blob::{BlobStore, ReconcileReport};
pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{
    ListOptions, PluginRepository, RegistryStats, SortField, StatusFilter, TrustAssignmentStore,
};

pub use plugon_common::{PlugonError, Result};
