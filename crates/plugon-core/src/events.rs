//! Typed event bus for Plugon
//!
//! Every ingestion phase and every host state transition emits a typed
//! event on a process-wide broadcast bus. Subscribers observe for metrics
//! or coordination; emitters never block on them, and a lagging subscriber
//! drops events rather than applying backpressure to the pipeline.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{PluginState, TrustLevel, VerdictKind};

/// Default buffered capacity of the broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the registry and the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginEvent {
    /// A manifest was successfully extracted from an uploaded bundle
    ManifestExtracted { name: String, version: String },

    /// A validation step produced a verdict
    ValidationCompleted {
        checksum: String,
        #[serde(rename = "verdict_kind")]
        kind: VerdictKind,
        is_valid: bool,
    },

    /// Signature verification finished
    SignatureVerified {
        name: String,
        version: String,
        verified: bool,
        trust_level: TrustLevel,
    },

    /// A trust level was assigned
    TrustAssigned {
        plugin_name: String,
        version: Option<String>,
        trust_level: TrustLevel,
        assigned_by: String,
    },

    /// Bundle optimization finished
    OptimizationCompleted {
        name: String,
        version: String,
        original_size: u64,
        optimized_size: u64,
        accepted: bool,
    },

    /// A bundle was fully ingested and persisted
    PluginStored {
        name: String,
        version: String,
        checksum: String,
    },

    /// A plugin and its history were deleted
    PluginDeleted { name: String },

    /// A download was served and recorded
    DownloadRecorded { name: String, version: String },

    /// A version became the active one
    VersionPromoted { name: String, version: String },

    /// A rollback was performed
    VersionRolledBack {
        name: String,
        from_version: Option<String>,
        to_version: String,
        reason: String,
    },

    /// A trust violation was recorded
    ViolationRecorded {
        plugin_name: String,
        severity: String,
    },

    /// A host-side plugin changed lifecycle state
    StateChanged {
        name: String,
        from: PluginState,
        to: PluginState,
    },

    /// A plugin finished loading
    PluginLoaded { name: String },

    /// A plugin failed to load
    PluginLoadFailed { name: String, error: String },

    /// A tracked dependency crossed the unhealthy threshold
    DependencyUnhealthy { name: String, dependency: String },

    /// A previously unhealthy dependency recovered
    DependencyRecovered { name: String, dependency: String },
}

impl PluginEvent {
    /// Plugin name the event is about, when it has one
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            PluginEvent::ManifestExtracted { name, .. }
            | PluginEvent::SignatureVerified { name, .. }
            | PluginEvent::OptimizationCompleted { name, .. }
            | PluginEvent::PluginStored { name, .. }
            | PluginEvent::PluginDeleted { name }
            | PluginEvent::DownloadRecorded { name, .. }
            | PluginEvent::VersionPromoted { name, .. }
            | PluginEvent::VersionRolledBack { name, .. }
            | PluginEvent::StateChanged { name, .. }
            | PluginEvent::PluginLoaded { name }
            | PluginEvent::PluginLoadFailed { name, .. }
            | PluginEvent::DependencyUnhealthy { name, .. }
            | PluginEvent::DependencyRecovered { name, .. } => Some(name),
            PluginEvent::TrustAssigned { plugin_name, .. }
            | PluginEvent::ViolationRecorded { plugin_name, .. } => Some(plugin_name),
            PluginEvent::ValidationCompleted { .. } => None,
        }
    }
}

/// Process-wide broadcast bus for [`PluginEvent`]s
///
/// Cloning is cheap; all clones share the same channel. Events emitted by
/// one component are delivered in emission order to each subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    /// Create a bus with the given buffered capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event; subscribers that lag drop it, emitters never block
    pub fn emit(&self, event: PluginEvent) {
        trace!("📢 event: {:?}", event);
        // send only fails when there are no receivers, which is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}
