//! Plugon Registry Library
//!
//! The ingestion orchestrator: sequences validation, signature
//! verification, trust assignment, optimization and persistence for
//! uploaded bundles, emitting a typed event per phase. Uploads for the
//! same `(name, version)` are serialized; independent uploads proceed in
//! parallel.

pub mod service;

pub use service::{CancelSignal, RegistryService, RegistryServiceBuilder, RegistryStatsSnapshot};

pub use plugon_common::{PlugonError, Result};
