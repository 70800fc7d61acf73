//! Host orchestrator
//!
//! Composes discovery, the dependency resolver, the loading strategy and
//! the resource tracker: discover -> order -> pre-load trust validation ->
//! load -> verify. A single plugin failure is contained to that plugin
//! and its dependents; phase-level failures roll the host back to the
//! last snapshot of active plugins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use plugon_common::{PlugonError, Result};
use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::{PluginManifest, PluginState};
use plugon_trust::TrustEngine;

use crate::discovery::{discover_plugins, DiscoveredPlugin, DiscoveryError};
use crate::resolver::{DependencyResolver, ResolverConfig};
use crate::runtime::{ModuleHandle, ModuleRuntime, PluginContext};
use crate::state::StateMachine;
use crate::strategy::{execute, GraphNode, LoadingStrategy, PluginLoader};
use crate::tracker::{ResourceTracker, TrackerConfig};

/// A plugin that has been instantiated
pub struct LoadedPlugin {
    /// Parsed manifest
    pub manifest: PluginManifest,

    /// Opaque module handle from the runtime
    pub module: ModuleHandle,

    /// Capability-restricted context it was given
    pub context: PluginContext,

    /// Directory it was loaded from
    pub path: PathBuf,

    /// When it finished loading
    pub loaded_at: DateTime<Utc>,
}

/// Outcome of a full scan-and-load pass
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Plugins that reached LOADED
    pub loaded: Vec<String>,

    /// Plugins that failed, with the failure reason
    pub failed: Vec<(String, String)>,

    /// Directories that did not discover cleanly
    pub discovery_errors: Vec<DiscoveryError>,
}

/// Builder for [`PluginHost`]
pub struct PluginHostBuilder {
    plugins_dir: PathBuf,
    strategy: LoadingStrategy,
    load_timeout: Duration,
    resolver_config: ResolverConfig,
    tracker_config: TrackerConfig,
    runtime: Option<Arc<dyn ModuleRuntime>>,
    trust: Option<Arc<TrustEngine>>,
    events: EventBus,
}

impl PluginHostBuilder {
    /// Start a builder over the given plugins directory
    pub fn new(plugins_dir: PathBuf) -> Self {
        Self {
            plugins_dir,
            strategy: LoadingStrategy::Batched,
            load_timeout: Duration::from_secs(30),
            resolver_config: ResolverConfig::default(),
            tracker_config: TrackerConfig::default(),
            runtime: None,
            trust: None,
            events: EventBus::default(),
        }
    }

    /// Set the loading strategy
    pub fn strategy(mut self, strategy: LoadingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the per-plugin load timeout
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Set the resolver configuration
    pub fn resolver_config(mut self, config: ResolverConfig) -> Self {
        self.resolver_config = config;
        self
    }

    /// Set the tracker configuration
    pub fn tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    /// Set the module runtime collaborator
    pub fn runtime(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the trust engine
    pub fn trust(mut self, trust: Arc<TrustEngine>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Set the event bus shared with other components
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Assemble the host
    pub fn build(self) -> Result<PluginHost> {
        let runtime = self
            .runtime
            .ok_or_else(|| PlugonError::Config("host needs a module runtime".into()))?;
        let trust = self
            .trust
            .unwrap_or_else(|| Arc::new(TrustEngine::new(self.events.clone())));
        let state = Arc::new(StateMachine::new(self.events.clone()));
        let resolver = Arc::new(DependencyResolver::new(
            state.clone(),
            self.events.clone(),
            self.resolver_config,
        ));
        let tracker = Arc::new(ResourceTracker::new(self.tracker_config));

        Ok(PluginHost {
            plugins_dir: self.plugins_dir,
            strategy: self.strategy,
            load_timeout: self.load_timeout,
            state,
            resolver,
            tracker,
            runtime,
            trust,
            events: self.events,
            loaded: RwLock::new(HashMap::new()),
            discovered: RwLock::new(HashMap::new()),
            snapshot: Mutex::new(Vec::new()),
        })
    }
}

/// The plugin host
pub struct PluginHost {
    plugins_dir: PathBuf,
    strategy: LoadingStrategy,
    load_timeout: Duration,
    state: Arc<StateMachine>,
    resolver: Arc<DependencyResolver>,
    tracker: Arc<ResourceTracker>,
    runtime: Arc<dyn ModuleRuntime>,
    trust: Arc<TrustEngine>,
    events: EventBus,
    loaded: RwLock<HashMap<String, LoadedPlugin>>,
    discovered: RwLock<HashMap<String, DiscoveredPlugin>>,
    snapshot: Mutex<Vec<String>>,
}

#[async_trait]
impl PluginLoader for PluginHost {
    async fn load_one(&self, name: &str) -> Result<()> {
        match self.load_one_inner(name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.to_string();
                self.state
                    .transition(name, PluginState::Failed, "load failure", Some(reason.clone()))
                    .await
                    .ok();
                self.events.emit(PluginEvent::PluginLoadFailed {
                    name: name.to_string(),
                    error: reason,
                });
                Err(e)
            }
        }
    }
}

impl PluginHost {
    /// Discover every plugin on disk and load them with the configured
    /// strategy
    #[instrument(level = "info", skip(self))]
    pub async fn scan_and_load_all(&self) -> Result<ScanReport> {
        // snapshot the active set before changing anything
        {
            let loaded = self.loaded.read().await;
            *self.snapshot.lock().await = loaded.keys().cloned().collect();
        }

        // 1. discovery
        let (found, discovery_errors) = discover_plugins(&self.plugins_dir).await?;
        {
            let mut discovered = self.discovered.write().await;
            discovered.clear();
            for plugin in &found {
                discovered.insert(plugin.name.clone(), plugin.clone());
            }
        }
        for plugin in &found {
            self.state
                .transition(&plugin.name, PluginState::Discovered, "discovery", None)
                .await
                .ok();
        }

        // 2+3. pre-load trust validation; failures are contained here
        let mut admitted = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for plugin in &found {
            if self.loaded.read().await.contains_key(&plugin.name) {
                continue;
            }
            let validation = self
                .trust
                .validate_against_policy(
                    &plugin.name,
                    &plugin.manifest,
                    Some(&plugin.manifest.version),
                )
                .await;
            if validation.is_valid {
                admitted.push(plugin.clone());
            } else {
                let reason = format!(
                    "trust policy violation: [{}]",
                    validation.violations.join(", ")
                );
                self.state
                    .transition(&plugin.name, PluginState::Failed, "trust gate", Some(reason.clone()))
                    .await
                    .ok();
                self.events.emit(PluginEvent::PluginLoadFailed {
                    name: plugin.name.clone(),
                    error: reason.clone(),
                });
                failed.push((plugin.name.clone(), reason));
            }
        }

        let nodes: Vec<GraphNode> = admitted
            .iter()
            .map(|p| GraphNode {
                name: p.name.clone(),
                dependencies: p.manifest.dependencies.clone(),
                load_order: p.manifest.load_order,
            })
            .collect();

        // 4. strategy execution; an ordering error is a phase failure
        match execute(self.strategy, &nodes, self).await {
            Ok((loaded, mut strategy_failures)) => {
                failed.append(&mut strategy_failures);
                info!(
                    "✅ scan complete: {} loaded, {} failed, {} discovery errors",
                    loaded.len(),
                    failed.len(),
                    discovery_errors.len()
                );
                Ok(ScanReport {
                    loaded,
                    failed,
                    discovery_errors,
                })
            }
            Err(e) => {
                error!("❌ load phase failed: {}; rolling back to snapshot", e);
                self.recover_to_snapshot().await;
                Err(e)
            }
        }
    }

    async fn load_one_inner(&self, name: &str) -> Result<()> {
        let plugin = self
            .discovered
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;

        self.state
            .transition(name, PluginState::Loading, "strategy", None)
            .await?;

        // wait for dependencies through the resolver
        let outcome = self
            .resolver
            .resolve(name, &plugin.manifest.dependencies)
            .await?;
        for warning in &outcome.warnings {
            warn!("⚠️ {}: {}", name, warning);
        }

        // capability-restricted context from the effective policy
        let level = self
            .trust
            .get_trust_level(name, Some(&plugin.manifest.version))
            .await;
        let allowed: HashSet<String> = self
            .trust
            .policy_for(level)
            .map(|p| {
                p.allowed_capabilities
                    .difference(&p.denied_capabilities)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let context = PluginContext {
            plugin_name: name.to_string(),
            trust_level: level,
            allowed_capabilities: allowed,
        };

        let module = tokio::time::timeout(
            self.load_timeout,
            self.runtime.instantiate(&plugin.manifest, &plugin.path, &context),
        )
        .await
        .map_err(|_| {
            PlugonError::Timeout(format!(
                "plugin '{}' did not instantiate within {:?}",
                name, self.load_timeout
            ))
        })??;

        // register tracked resources and go LOADED
        self.tracker.register(name, &module);
        self.loaded.write().await.insert(
            name.to_string(),
            LoadedPlugin {
                manifest: plugin.manifest.clone(),
                module,
                context,
                path: plugin.path.clone(),
                loaded_at: Utc::now(),
            },
        );
        self.state
            .transition(name, PluginState::Loaded, "instantiated", None)
            .await?;
        self.events.emit(PluginEvent::PluginLoaded {
            name: name.to_string(),
        });
        debug!("✅ loaded {}", name);
        Ok(())
    }

    /// Load a single plugin by name from the plugins directory
    ///
    /// Conflicts with an already-loaded plugin of the same name.
    #[instrument(level = "info", skip(self))]
    pub async fn load_plugin(&self, name: &str) -> Result<()> {
        if self.loaded.read().await.contains_key(name) {
            return Err(PlugonError::Conflict(format!(
                "plugin '{}' is already loaded",
                name
            )));
        }

        let (found, _) = discover_plugins(&self.plugins_dir).await?;
        let plugin = found
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PlugonError::PluginNotFound(name.to_string()))?;

        let validation = self
            .trust
            .validate_against_policy(name, &plugin.manifest, Some(&plugin.manifest.version))
            .await;
        if !validation.is_valid {
            return Err(PlugonError::Security(format!(
                "trust policy violation: [{}]",
                validation.violations.join(", ")
            )));
        }

        self.discovered
            .write()
            .await
            .insert(name.to_string(), plugin);
        if self.state.state_of(name).await == PluginState::Failed {
            self.state
                .transition(name, PluginState::Unloaded, "reset", None)
                .await?;
        }
        self.state
            .transition(name, PluginState::Discovered, "targeted load", None)
            .await?;
        self.load_one(name).await
    }

    /// Unload one plugin: tracker cleanup, runtime dispose, state reset
    #[instrument(level = "info", skip(self))]
    pub async fn unload_plugin(&self, name: &str) -> Result<bool> {
        let Some(plugin) = self.loaded.write().await.remove(name) else {
            return Ok(false);
        };

        self.state
            .transition(name, PluginState::Unloading, "unload", None)
            .await?;
        self.tracker.cleanup(name);
        if let Err(e) = self.runtime.dispose(plugin.module).await {
            warn!("⚠️ dispose of {} failed: {}", name, e);
        }
        self.state
            .transition(name, PluginState::Unloaded, "disposed", None)
            .await?;
        Ok(true)
    }

    /// Unload every loaded plugin
    pub async fn unload_all(&self) -> Result<usize> {
        let names: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        let mut count = 0;
        for name in names {
            if self.unload_plugin(&name).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Reload: unload everything, reset failed plugins and scan again
    ///
    /// The pre-reload snapshot is kept so a phase failure can roll back.
    #[instrument(level = "info", skip(self))]
    pub async fn reload(&self) -> Result<ScanReport> {
        self.unload_all().await?;

        // failed plugins get a fresh start
        for (name, state) in self.state.snapshot().await {
            if state == PluginState::Failed {
                self.state
                    .transition(&name, PluginState::Unloaded, "reload reset", None)
                    .await
                    .ok();
            }
        }
        self.scan_and_load_all().await
    }

    async fn recover_to_snapshot(&self) {
        let snapshot: HashSet<String> = self.snapshot.lock().await.iter().cloned().collect();
        let extra: Vec<String> = {
            let loaded = self.loaded.read().await;
            loaded
                .keys()
                .filter(|name| !snapshot.contains(*name))
                .cloned()
                .collect()
        };
        for name in extra {
            warn!("⚠️ rolling back plugin loaded after snapshot: {}", name);
            self.unload_plugin(&name).await.ok();
        }
    }

    /// Names of currently loaded plugins
    pub async fn loaded_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Current state of a plugin
    pub async fn plugin_state(&self, name: &str) -> PluginState {
        self.state.state_of(name).await
    }

    /// The state machine, for introspection
    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// The resource tracker
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// The dependency resolver
    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }
}
