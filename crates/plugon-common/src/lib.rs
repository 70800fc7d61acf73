//! Plugon Common Library
//!
//! Shared error taxonomy and result types used by every crate in the
//! Plugon workspace. Keeping the error surface in one leaf crate lets the
//! registry and the host agree on stable error codes without depending on
//! each other.

pub mod error;

pub use error::{ErrorCode, PlugonError, Result};
