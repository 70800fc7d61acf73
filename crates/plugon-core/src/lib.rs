//! Plugon Core Library
//!
//! This is the core library for Plugon, providing the data model,
//! configuration and event bus shared by the registry and the host runtime.
//!
//! # Features
//! - Plugin manifest and record types
//! - Trust model types (levels, policies, assignments, violations)
//! - Registry configuration with environment overrides
//! - Typed broadcast event bus
//!
//! # Examples
//! ```rust
//! use plugon_core::{config::RegistryConfig, Result};
//!
//! fn example() -> Result<()> {
//!     let config = RegistryConfig::default();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod events;
pub mod types;
pub mod utils;

pub use plugon_common::{ErrorCode, PlugonError, Result};
