//! Event-driven dependency resolver
//!
//! A plugin's waiter parks on the state-change event stream instead of
//! polling. Fast paths short-circuit when every dependency is already
//! loaded or one has already failed. Partial resolution lets a plugin
//! proceed once a minimum subset (including every required dependency) is
//! up; graceful timeouts re-arm the wait with a reduced budget before
//! giving up. Every exit path, including cancellation, runs waiter
//! cleanup exactly once and leaves no state behind in the resolver maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use plugon_common::{PlugonError, Result};
use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::PluginState;

use crate::state::StateMachine;

/// Partial resolution policy
#[derive(Debug, Clone, Default)]
pub struct PartialResolutionPolicy {
    /// Whether partial resolution is allowed
    pub enabled: bool,

    /// Minimum number of resolved dependencies
    pub min_required: usize,

    /// Dependencies that must be resolved regardless of the minimum
    pub required_dependencies: Vec<String>,
}

/// Graceful timeout policy
#[derive(Debug, Clone)]
pub struct GracefulTimeoutPolicy {
    /// Whether timed-out waits are retried
    pub enabled: bool,

    /// Retry budget per waiter
    pub max_retries: u32,

    /// Pause before re-arming the wait
    pub cleanup_delay: Duration,

    /// Factor applied to the timeout on each retry
    pub timeout_reduction: f64,
}

impl Default for GracefulTimeoutPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            cleanup_delay: Duration::from_millis(250),
            timeout_reduction: 0.5,
        }
    }
}

/// Health probing policy for tracked dependencies
#[derive(Debug, Clone)]
pub struct HealthCheckPolicy {
    /// Whether probes run while a waiter is active
    pub enabled: bool,

    /// Time between probe rounds
    pub interval: Duration,

    /// Budget for a single probe
    pub probe_timeout: Duration,

    /// Consecutive failures before a dependency is unhealthy
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Wait budget before the timeout ladder starts
    pub max_wait_time: Duration,

    /// Default partial resolution policy
    pub partial: PartialResolutionPolicy,

    /// Graceful timeout policy
    pub graceful: GracefulTimeoutPolicy,

    /// Health probing policy
    pub health: HealthCheckPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_wait_time: Duration::from_secs(30),
            partial: PartialResolutionPolicy::default(),
            graceful: GracefulTimeoutPolicy::default(),
            health: HealthCheckPolicy::default(),
        }
    }
}

/// Outcome of a dependency resolution
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    /// Dependencies that reached LOADED
    pub resolved: Vec<String>,

    /// Dependencies still outstanding (non-empty only for partial)
    pub pending: Vec<String>,

    /// Whether this was a partial resolution
    pub partial: bool,

    /// Non-fatal findings
    pub warnings: Vec<String>,
}

/// Probe deciding whether a dependency is healthy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the plugin currently counts as healthy
    async fn probe(&self, plugin: &str) -> bool;
}

/// Default probe: healthy means LOADED
pub struct StateHealthProbe {
    state: Arc<StateMachine>,
}

impl StateHealthProbe {
    /// Probe against the given state machine
    pub fn new(state: Arc<StateMachine>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl HealthProbe for StateHealthProbe {
    async fn probe(&self, plugin: &str) -> bool {
        self.state.state_of(plugin).await == PluginState::Loaded
    }
}

#[derive(Debug)]
struct WaiterInfo {
    #[allow(dead_code)]
    deps: Vec<String>,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
}

/// The event-driven dependency resolver
pub struct DependencyResolver {
    state: Arc<StateMachine>,
    events: EventBus,
    config: ResolverConfig,
    probe: Arc<dyn HealthProbe>,
    waiters: Mutex<HashMap<String, WaiterInfo>>,
    retries: Mutex<HashMap<String, u32>>,
    health_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    failure_counts: Arc<Mutex<HashMap<(String, String), u32>>>,
}

/// Runs waiter cleanup exactly once on every exit path, including drop
/// of a cancelled resolution future
struct WaiterGuard<'a> {
    resolver: &'a DependencyResolver,
    name: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.resolver.cleanup_waiter(&self.name);
    }
}

impl DependencyResolver {
    /// Create a resolver over the state machine and event bus
    pub fn new(state: Arc<StateMachine>, events: EventBus, config: ResolverConfig) -> Self {
        let probe = Arc::new(StateHealthProbe::new(state.clone()));
        Self::with_probe(state, events, config, probe)
    }

    /// Create a resolver with a custom health probe
    pub fn with_probe(
        state: Arc<StateMachine>,
        events: EventBus,
        config: ResolverConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            state,
            events,
            config,
            probe,
            waiters: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            health_tasks: Mutex::new(HashMap::new()),
            failure_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live waiters (empty after every resolution returns)
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().expect("waiters lock").len()
    }

    /// Number of live retry counters
    pub fn retry_entry_count(&self) -> usize {
        self.retries.lock().expect("retries lock").len()
    }

    /// Resolve with the configured default partial policy
    pub async fn resolve(&self, name: &str, deps: &[String]) -> Result<ResolutionOutcome> {
        let partial = self.config.partial.clone();
        self.resolve_with_policy(name, deps, &partial).await
    }

    /// Resolve with an explicit partial resolution policy
    #[instrument(level = "debug", skip(self, deps, partial), fields(deps = deps.len()))]
    pub async fn resolve_with_policy(
        &self,
        name: &str,
        deps: &[String],
        partial: &PartialResolutionPolicy,
    ) -> Result<ResolutionOutcome> {
        if deps.is_empty() {
            return Ok(ResolutionOutcome {
                resolved: Vec::new(),
                pending: Vec::new(),
                partial: false,
                warnings: Vec::new(),
            });
        }

        // subscribe before inspecting states so no transition is missed
        let mut rx = self.events.subscribe();

        let mut resolved: HashSet<String> = HashSet::new();
        for dep in deps {
            match self.state.state_of(dep).await {
                PluginState::Loaded => {
                    resolved.insert(dep.clone());
                }
                PluginState::Failed => {
                    return Err(dependency_failed(name, dep));
                }
                _ => {}
            }
        }
        if resolved.len() == deps.len() {
            return Ok(full_outcome(deps));
        }

        // register the waiter; the guard guarantees cleanup on every exit
        self.waiters.lock().expect("waiters lock").insert(
            name.to_string(),
            WaiterInfo {
                deps: deps.to_vec(),
                started_at: Utc::now(),
            },
        );
        self.retries
            .lock()
            .expect("retries lock")
            .insert(name.to_string(), 0);
        let _guard = WaiterGuard {
            resolver: self,
            name: name.to_string(),
        };
        if self.config.health.enabled {
            self.start_health_checks(name, deps);
        }

        let mut warnings = Vec::new();
        let mut wait_budget = self.config.max_wait_time;
        let mut deadline = Instant::now() + wait_budget;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Some(outcome) = self.apply_event(
                            name, deps, partial, &mut resolved, &mut warnings, event,
                        )? {
                            return Ok(outcome);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️ waiter for '{}' lagged {} events, re-reading states", name, skipped);
                        for dep in deps {
                            match self.state.state_of(dep).await {
                                PluginState::Loaded => {
                                    resolved.insert(dep.clone());
                                }
                                PluginState::Failed => return Err(dependency_failed(name, dep)),
                                _ => {}
                            }
                        }
                        if resolved.len() == deps.len() {
                            return Ok(full_outcome(deps));
                        }
                        if partial_met(partial, &resolved, deps) {
                            return Ok(self.partial_outcome(deps, &resolved, &mut warnings));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PlugonError::Internal(
                            "event bus closed while waiting for dependencies".into(),
                        ));
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    // timeout ladder
                    if partial_met(partial, &resolved, deps) {
                        return Ok(self.partial_outcome(deps, &resolved, &mut warnings));
                    }

                    let attempts = {
                        let retries = self.retries.lock().expect("retries lock");
                        retries.get(name).copied().unwrap_or(0)
                    };
                    if self.config.graceful.enabled && attempts < self.config.graceful.max_retries {
                        self.retries
                            .lock()
                            .expect("retries lock")
                            .insert(name.to_string(), attempts + 1);
                        tokio::time::sleep(self.config.graceful.cleanup_delay).await;

                        // restart on the still-pending set with a reduced budget
                        for dep in deps {
                            match self.state.state_of(dep).await {
                                PluginState::Loaded => {
                                    resolved.insert(dep.clone());
                                }
                                PluginState::Failed => return Err(dependency_failed(name, dep)),
                                _ => {}
                            }
                        }
                        if resolved.len() == deps.len() {
                            return Ok(full_outcome(deps));
                        }

                        wait_budget = wait_budget.mul_f64(self.config.graceful.timeout_reduction);
                        deadline = Instant::now() + wait_budget;
                        warnings.push(format!(
                            "graceful timeout: retry {} of {} with {:?} budget",
                            attempts + 1,
                            self.config.graceful.max_retries,
                            wait_budget
                        ));
                        debug!(
                            "🔧 waiter for '{}' re-armed (retry {}, budget {:?})",
                            name, attempts + 1, wait_budget
                        );
                        continue;
                    }

                    let pending = pending_list(deps, &resolved);
                    return Err(PlugonError::Timeout(format!(
                        "dependency resolution for '{}' timed out; pending: [{}]",
                        name,
                        pending.join(", ")
                    )));
                }
            }
        }
    }

    fn apply_event(
        &self,
        name: &str,
        deps: &[String],
        partial: &PartialResolutionPolicy,
        resolved: &mut HashSet<String>,
        warnings: &mut Vec<String>,
        event: PluginEvent,
    ) -> Result<Option<ResolutionOutcome>> {
        let (dep, reached) = match event {
            PluginEvent::StateChanged { name: dep, to, .. } => (dep, to),
            PluginEvent::PluginLoaded { name: dep } => (dep, PluginState::Loaded),
            PluginEvent::PluginLoadFailed { name: dep, .. } => (dep, PluginState::Failed),
            _ => return Ok(None),
        };
        if !deps.contains(&dep) {
            return Ok(None);
        }

        match reached {
            PluginState::Loaded => {
                resolved.insert(dep);
                if resolved.len() == deps.len() {
                    return Ok(Some(full_outcome(deps)));
                }
                if partial_met(partial, resolved, deps) {
                    return Ok(Some(self.partial_outcome(deps, resolved, warnings)));
                }
                Ok(None)
            }
            PluginState::Failed => Err(dependency_failed(name, &dep)),
            _ => Ok(None),
        }
    }

    fn partial_outcome(
        &self,
        deps: &[String],
        resolved: &HashSet<String>,
        warnings: &mut Vec<String>,
    ) -> ResolutionOutcome {
        let pending = pending_list(deps, resolved);
        warnings.push(format!(
            "partial resolution accepted; still pending: [{}]",
            pending.join(", ")
        ));
        info!("✅ partial resolution with {} pending", pending.len());
        ResolutionOutcome {
            resolved: deps.iter().filter(|d| resolved.contains(*d)).cloned().collect(),
            pending,
            partial: true,
            warnings: warnings.clone(),
        }
    }

    fn start_health_checks(&self, owner: &str, deps: &[String]) {
        let policy = self.config.health.clone();
        let probe = self.probe.clone();
        let events = self.events.clone();
        let counts = self.failure_counts.clone();
        let owner = owner.to_string();
        let deps: Vec<String> = deps.to_vec();

        let task_owner = owner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for dep in &deps {
                    let healthy = tokio::time::timeout(policy.probe_timeout, probe.probe(dep))
                        .await
                        .unwrap_or(false);
                    let key = (owner.clone(), dep.clone());
                    let mut counts = counts.lock().expect("health counts lock");
                    let entry = counts.entry(key).or_insert(0);
                    if healthy {
                        if *entry >= policy.max_consecutive_failures {
                            events.emit(PluginEvent::DependencyRecovered {
                                name: owner.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        *entry = 0;
                    } else {
                        *entry += 1;
                        // emit only on the first crossing of the threshold
                        if *entry == policy.max_consecutive_failures {
                            events.emit(PluginEvent::DependencyUnhealthy {
                                name: owner.clone(),
                                dependency: dep.clone(),
                            });
                        }
                    }
                }
            }
        });

        let mut tasks = self.health_tasks.lock().expect("health tasks lock");
        if let Some(previous) = tasks.insert(task_owner, handle) {
            previous.abort();
        }
    }

    fn cleanup_waiter(&self, name: &str) {
        self.waiters.lock().expect("waiters lock").remove(name);
        self.retries.lock().expect("retries lock").remove(name);
        if let Some(task) = self.health_tasks.lock().expect("health tasks lock").remove(name) {
            task.abort();
        }
        self.failure_counts
            .lock()
            .expect("health counts lock")
            .retain(|(owner, _), _| owner != name);
    }
}

fn dependency_failed(name: &str, dep: &str) -> PlugonError {
    PlugonError::Internal(format!(
        "dependency '{}' of '{}' is in FAILED state",
        dep, name
    ))
}

fn partial_met(
    policy: &PartialResolutionPolicy,
    resolved: &HashSet<String>,
    deps: &[String],
) -> bool {
    policy.enabled
        && resolved.len() >= policy.min_required
        && resolved.len() < deps.len()
        && policy
            .required_dependencies
            .iter()
            .all(|d| resolved.contains(d))
}

fn pending_list(deps: &[String], resolved: &HashSet<String>) -> Vec<String> {
    deps.iter()
        .filter(|d| !resolved.contains(*d))
        .cloned()
        .collect()
}

fn full_outcome(deps: &[String]) -> ResolutionOutcome {
    ResolutionOutcome {
        resolved: deps.to_vec(),
        pending: Vec::new(),
        partial: false,
        warnings: Vec::new(),
    }
}
