//! Module runtime collaborator
//!
//! The host does not execute plugin code itself: an external dynamic
//! module mechanism instantiates a plugin from its manifest, bundle path
//! and a capability-restricted context, and hands back an opaque module
//! handle. The core treats that mechanism as this two-method interface.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use plugon_common::Result;
use plugon_core::types::{PluginManifest, TrustLevel};

/// Opaque module handle returned by the runtime
pub type ModuleHandle = Arc<dyn Any + Send + Sync>;

/// Capability-restricted view handed to a plugin at instantiation
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// The plugin's name
    pub plugin_name: String,

    /// Effective trust level at load time
    pub trust_level: TrustLevel,

    /// Capabilities the plugin may use
    pub allowed_capabilities: HashSet<String>,
}

/// The external dynamic-module mechanism
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// Instantiate a plugin from its entry point
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        path: &Path,
        context: &PluginContext,
    ) -> Result<ModuleHandle>;

    /// Dispose a module handle
    async fn dispose(&self, module: ModuleHandle) -> Result<()>;
}
