//! Plugon API Library
//!
//! The HTTP surface of the registry: all routes under `/api/v1`, the
//! standard error envelope with correlation ids, and the server with
//! graceful shutdown.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;

pub use error::{ApiError, ErrorEnvelope};
pub use routes::{create_router, AppState};
pub use server::serve;

pub use plugon_common::{PlugonError, Result};
