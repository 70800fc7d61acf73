//! Per-plugin lifecycle state machine
//!
//! Legal transitions:
//!
//! ```text
//! UNLOADED -> DISCOVERED -> LOADING -> LOADED
//!                  |                      |
//!               FAILED <-------------- FAILED
//! LOADED -> UNLOADING -> UNLOADED
//! any -> FAILED (on fatal error)
//! FAILED -> UNLOADED (reset before a reload)
//! ```
//!
//! Re-requesting the current state is a no-op. Every transition is
//! stamped with a timestamp, the triggering event and an optional error,
//! and kept in a bounded per-plugin history ring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use plugon_common::{PlugonError, Result};
use plugon_core::events::{EventBus, PluginEvent};
use plugon_core::types::PluginState;

/// Default bound of the per-plugin transition history
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One recorded transition
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// State before
    pub from: PluginState,

    /// State after
    pub to: PluginState,

    /// When the transition happened
    pub at: DateTime<Utc>,

    /// What triggered it
    pub trigger: String,

    /// Error attached to the transition, if any
    pub error: Option<String>,
}

/// The per-plugin state machine
#[derive(Debug)]
pub struct StateMachine {
    states: RwLock<HashMap<String, PluginState>>,
    history: RwLock<HashMap<String, VecDeque<TransitionRecord>>>,
    history_limit: usize,
    events: EventBus,
}

fn is_legal(from: PluginState, to: PluginState) -> bool {
    use PluginState::*;
    matches!(
        (from, to),
        (Unloaded, Discovered)
            | (Discovered, Loading)
            | (Loading, Loaded)
            | (Loaded, Unloading)
            | (Unloading, Unloaded)
            | (Failed, Unloaded)
            | (_, Failed)
    )
}

impl StateMachine {
    /// Create a machine with the default history bound
    pub fn new(events: EventBus) -> Self {
        Self::with_history_limit(events, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a machine with an explicit history bound
    pub fn with_history_limit(events: EventBus, history_limit: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            history_limit: history_limit.max(1),
            events,
        }
    }

    /// Current state of a plugin; unknown plugins are UNLOADED
    pub async fn state_of(&self, name: &str) -> PluginState {
        self.states
            .read()
            .await
            .get(name)
            .copied()
            .unwrap_or(PluginState::Unloaded)
    }

    /// Request a transition
    ///
    /// Transitioning to the current state is a no-op; an illegal
    /// transition is a conflict error.
    #[instrument(level = "debug", skip(self, error))]
    pub async fn transition(
        &self,
        name: &str,
        to: PluginState,
        trigger: &str,
        error: Option<String>,
    ) -> Result<()> {
        let from = {
            let mut states = self.states.write().await;
            let from = states.get(name).copied().unwrap_or(PluginState::Unloaded);
            if from == to {
                return Ok(());
            }
            if !is_legal(from, to) {
                return Err(PlugonError::Conflict(format!(
                    "illegal state transition for {}: {} -> {}",
                    name, from, to
                )));
            }
            states.insert(name.to_string(), to);
            from
        };

        {
            let mut history = self.history.write().await;
            let ring = history.entry(name.to_string()).or_default();
            ring.push_back(TransitionRecord {
                from,
                to,
                at: Utc::now(),
                trigger: trigger.to_string(),
                error,
            });
            while ring.len() > self.history_limit {
                ring.pop_front();
            }
        }

        debug!("🔧 {}: {} -> {} ({})", name, from, to, trigger);
        self.events.emit(PluginEvent::StateChanged {
            name: name.to_string(),
            from,
            to,
        });
        Ok(())
    }

    /// Transition history of a plugin, oldest first
    pub async fn history(&self, name: &str) -> Vec<TransitionRecord> {
        self.history
            .read()
            .await
            .get(name)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current state of every known plugin
    pub async fn snapshot(&self) -> HashMap<String, PluginState> {
        self.states.read().await.clone()
    }

    /// Forget a plugin entirely (used after deletion)
    pub async fn remove(&self, name: &str) {
        self.states.write().await.remove(name);
        self.history.write().await.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new(EventBus::default())
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_unloaded() {
        let machine = machine();
        assert_eq!(machine.state_of("p").await, PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let machine = machine();
        for (to, trigger) in [
            (PluginState::Discovered, "scan"),
            (PluginState::Loading, "load"),
            (PluginState::Loaded, "instantiated"),
            (PluginState::Unloading, "shutdown"),
            (PluginState::Unloaded, "disposed"),
        ] {
            machine.transition("p", to, trigger, None).await.unwrap();
            assert_eq!(machine.state_of("p").await, to);
        }
    }

    #[tokio::test]
    async fn test_self_transition_is_noop() {
        let machine = machine();
        machine
            .transition("p", PluginState::Discovered, "scan", None)
            .await
            .unwrap();
        machine
            .transition("p", PluginState::Discovered, "scan again", None)
            .await
            .unwrap();
        // the no-op leaves no history entry
        assert_eq!(machine.history("p").await.len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let machine = machine();
        let err = machine
            .transition("p", PluginState::Loaded, "skip ahead", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal"));
        assert_eq!(machine.state_of("p").await, PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_any_state_can_fail() {
        let machine = machine();
        machine
            .transition("p", PluginState::Discovered, "scan", None)
            .await
            .unwrap();
        machine
            .transition("p", PluginState::Loading, "load", None)
            .await
            .unwrap();
        machine
            .transition(
                "p",
                PluginState::Failed,
                "load error",
                Some("instantiation panicked".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(machine.state_of("p").await, PluginState::Failed);

        let history = machine.history("p").await;
        assert_eq!(
            history.last().unwrap().error.as_deref(),
            Some("instantiation panicked")
        );
    }

    #[tokio::test]
    async fn test_failed_resets_to_unloaded() {
        let machine = machine();
        machine
            .transition("p", PluginState::Failed, "boom", None)
            .await
            .unwrap();
        machine
            .transition("p", PluginState::Unloaded, "reload reset", None)
            .await
            .unwrap();
        machine
            .transition("p", PluginState::Discovered, "rescan", None)
            .await
            .unwrap();
        assert_eq!(machine.state_of("p").await, PluginState::Discovered);
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let machine = StateMachine::with_history_limit(EventBus::default(), 4);
        for _ in 0..5 {
            machine
                .transition("p", PluginState::Failed, "fail", None)
                .await
                .unwrap();
            machine
                .transition("p", PluginState::Unloaded, "reset", None)
                .await
                .unwrap();
        }
        let history = machine.history("p").await;
        assert_eq!(history.len(), 4);
        // the oldest entries were dropped
        assert_eq!(history.first().unwrap().from, PluginState::Failed);
    }

    #[tokio::test]
    async fn test_transitions_emit_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let machine = StateMachine::new(bus);

        machine
            .transition("p", PluginState::Discovered, "scan", None)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            PluginEvent::StateChanged { name, from, to } => {
                assert_eq!(name, "p");
                assert_eq!(from, PluginState::Unloaded);
                assert_eq!(to, PluginState::Discovered);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
