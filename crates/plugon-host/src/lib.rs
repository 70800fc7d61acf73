//! Plugon Host Library
//!
//! The host side of the platform: discovers plugin bundles on disk,
//! orders them by their dependency graph, loads them through a pluggable
//! module runtime and supervises them afterwards. Loading is event-driven:
//! each plugin's waiter parks on state-change events instead of polling,
//! with partial resolution and graceful timeouts for slow dependency
//! chains.

pub mod discovery;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;
pub mod state;
pub mod strategy;
pub mod tracker;

pub use discovery::{discover_plugins, DiscoveredPlugin, DiscoveryError, DiscoveryErrorKind};
pub use orchestrator::{PluginHost, PluginHostBuilder, ScanReport};
pub use resolver::{
    DependencyResolver, GracefulTimeoutPolicy, HealthCheckPolicy, HealthProbe,
    PartialResolutionPolicy, ResolutionOutcome, ResolverConfig,
};
pub use runtime::{ModuleHandle, ModuleRuntime, PluginContext};
pub use state::{StateMachine, TransitionRecord};
pub use strategy::{compute_batches, topological_order, LoadingStrategy};
pub use tracker::{ResourceTracker, TrackerConfig};

pub use plugon_common::{PlugonError, Result};
