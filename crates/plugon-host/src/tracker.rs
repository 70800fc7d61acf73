//! Memory and resource tracker
//!
//! For every loaded plugin the tracker holds a weak reference to its
//! module instance, the timers it registered, its event listener
//! registrations and the set of objects it owns. Cleanup cancels the
//! timers, removes the listeners, clears the instance set and drops the
//! weak reference. A scheduled sweep collects plugins whose instance has
//! been dropped; the sweep is forced when memory pressure crosses the
//! configured threshold.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Opaque module instance handle shared with the runtime
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Time between scheduled sweeps
    pub cleanup_interval: Duration,

    /// Memory pressure ratio (0.0-1.0) beyond which a sweep is forced
    pub memory_pressure_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            memory_pressure_threshold: 0.85,
        }
    }
}

/// A listener registration owned by a plugin
#[derive(Debug)]
pub struct ListenerRegistration {
    /// What the listener was attached to
    pub target: String,

    /// The event name
    pub event: String,

    /// The subscription task; aborted on cleanup
    pub task: JoinHandle<()>,
}

#[derive(Default)]
struct TrackedResources {
    instance: Option<Weak<dyn Any + Send + Sync>>,
    timers: Vec<JoinHandle<()>>,
    listeners: Vec<ListenerRegistration>,
    owned: Vec<Instance>,
}

/// Per-plugin resource supervision
pub struct ResourceTracker {
    plugins: Mutex<HashMap<String, TrackedResources>>,
    config: TrackerConfig,
}

impl ResourceTracker {
    /// Create a tracker
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register a plugin's module instance (held weakly)
    pub fn register(&self, name: &str, instance: &Instance) {
        let mut plugins = self.plugins.lock().expect("tracker lock");
        let entry = plugins.entry(name.to_string()).or_default();
        entry.instance = Some(Arc::downgrade(instance));
        debug!("🔧 tracking instance for {}", name);
    }

    /// Track a timer task the plugin registered
    pub fn add_timer(&self, name: &str, handle: JoinHandle<()>) {
        let mut plugins = self.plugins.lock().expect("tracker lock");
        plugins.entry(name.to_string()).or_default().timers.push(handle);
    }

    /// Track a listener registration
    pub fn add_listener(&self, name: &str, target: &str, event: &str, task: JoinHandle<()>) {
        let mut plugins = self.plugins.lock().expect("tracker lock");
        plugins
            .entry(name.to_string())
            .or_default()
            .listeners
            .push(ListenerRegistration {
                target: target.to_string(),
                event: event.to_string(),
                task,
            });
    }

    /// Track an object the plugin owns
    pub fn add_owned(&self, name: &str, object: Instance) {
        let mut plugins = self.plugins.lock().expect("tracker lock");
        plugins.entry(name.to_string()).or_default().owned.push(object);
    }

    /// Whether the plugin's instance is still alive
    pub fn instance_alive(&self, name: &str) -> bool {
        let plugins = self.plugins.lock().expect("tracker lock");
        plugins
            .get(name)
            .and_then(|r| r.instance.as_ref())
            .map(|weak| weak.upgrade().is_some())
            .unwrap_or(false)
    }

    /// Counts of tracked resources, for introspection
    pub fn resource_counts(&self, name: &str) -> (usize, usize, usize) {
        let plugins = self.plugins.lock().expect("tracker lock");
        plugins
            .get(name)
            .map(|r| (r.timers.len(), r.listeners.len(), r.owned.len()))
            .unwrap_or((0, 0, 0))
    }

    /// Number of tracked plugins
    pub fn tracked_count(&self) -> usize {
        self.plugins.lock().expect("tracker lock").len()
    }

    /// Release everything the plugin holds
    #[instrument(level = "debug", skip(self))]
    pub fn cleanup(&self, name: &str) {
        let removed = self.plugins.lock().expect("tracker lock").remove(name);
        let Some(resources) = removed else {
            return;
        };
        for timer in &resources.timers {
            timer.abort();
        }
        for listener in &resources.listeners {
            listener.task.abort();
        }
        debug!(
            "🔧 cleaned up {}: {} timers, {} listeners, {} owned objects",
            name,
            resources.timers.len(),
            resources.listeners.len(),
            resources.owned.len()
        );
        // owned objects and the weak instance ref drop here
    }

    /// Current memory pressure ratio, 0.0 when unknown
    pub fn memory_pressure(&self) -> f64 {
        match sys_info::mem_info() {
            Ok(info) if info.total > 0 => 1.0 - (info.avail as f64 / info.total as f64),
            _ => 0.0,
        }
    }

    /// Sweep plugins whose instance has been dropped
    ///
    /// Returns the names that were cleaned up. When `force` is set (or
    /// memory pressure exceeds the threshold) dead entries are collected
    /// even between scheduled runs.
    pub fn sweep(&self, force: bool) -> Vec<String> {
        let dead: Vec<String> = {
            let plugins = self.plugins.lock().expect("tracker lock");
            plugins
                .iter()
                .filter(|(_, r)| {
                    r.instance
                        .as_ref()
                        .map(|weak| weak.upgrade().is_none())
                        .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if dead.is_empty() {
            return dead;
        }
        if force {
            warn!("⚠️ forced sweep collecting {} dead plugins", dead.len());
        }
        for name in &dead {
            self.cleanup(name);
        }
        info!("✅ swept {} dead plugin entries", dead.len());
        dead
    }

    /// Spawn the scheduled sweeper
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let pressure = tracker.memory_pressure();
                let force = pressure > tracker.config.memory_pressure_threshold;
                tracker.sweep(force);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        Arc::new("module".to_string())
    }

    #[tokio::test]
    async fn test_register_and_cleanup() {
        let tracker = ResourceTracker::new(TrackerConfig::default());
        let module = instance();
        tracker.register("p", &module);

        tracker.add_timer("p", tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        tracker.add_listener(
            "p",
            "bus",
            "plugin.state.changed",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );
        tracker.add_owned("p", Arc::new(42u32));

        assert!(tracker.instance_alive("p"));
        assert_eq!(tracker.resource_counts("p"), (1, 1, 1));

        tracker.cleanup("p");
        assert_eq!(tracker.tracked_count(), 0);
        assert_eq!(tracker.resource_counts("p"), (0, 0, 0));
        assert!(!tracker.instance_alive("p"));
    }

    #[tokio::test]
    async fn test_cleanup_aborts_timers() {
        let tracker = ResourceTracker::new(TrackerConfig::default());
        let module = instance();
        tracker.register("p", &module);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tracker.add_timer(
            "p",
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                tx.send(()).ok();
            }),
        );
        tracker.cleanup("p");

        // the aborted timer never fires, so the channel closes with an error
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_unknown_plugin_is_noop() {
        let tracker = ResourceTracker::new(TrackerConfig::default());
        tracker.cleanup("ghost");
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_collects_dead_instances() {
        let tracker = ResourceTracker::new(TrackerConfig::default());

        let alive = instance();
        tracker.register("alive", &alive);

        {
            let dead = instance();
            tracker.register("dead", &dead);
            // `dead` drops here; only the weak ref remains
        }

        let swept = tracker.sweep(false);
        assert_eq!(swept, vec!["dead".to_string()]);
        assert_eq!(tracker.tracked_count(), 1);
        assert!(tracker.instance_alive("alive"));
    }

    #[tokio::test]
    async fn test_sweep_ignores_live_instances() {
        let tracker = ResourceTracker::new(TrackerConfig::default());
        let module = instance();
        tracker.register("p", &module);
        assert!(tracker.sweep(true).is_empty());
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_pressure_is_a_ratio() {
        let tracker = ResourceTracker::new(TrackerConfig::default());
        let pressure = tracker.memory_pressure();
        assert!((0.0..=1.0).contains(&pressure));
    }
}
