//! Loading strategies and dependency ordering
//!
//! The host instantiates plugins through one of three strategies. Serial
//! walks the topological order one plugin at a time; parallel launches a
//! task per plugin, each awaiting its own dependencies through the
//! resolver; batched computes dependency frontiers and runs the batches
//! serially with the plugins of a batch in parallel.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

use plugon_common::{PlugonError, Result};

/// The available loading strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStrategy {
    Serial,
    Parallel,
    Batched,
}

impl std::str::FromStr for LoadingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "serial" => Ok(LoadingStrategy::Serial),
            "parallel" => Ok(LoadingStrategy::Parallel),
            "batched" => Ok(LoadingStrategy::Batched),
            other => Err(format!("unknown loading strategy: {}", other)),
        }
    }
}

/// A plugin and its dependency edges, as fed to the ordering functions
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Plugin name
    pub name: String,

    /// Names of plugins it depends on
    pub dependencies: Vec<String>,

    /// Optional explicit ordering hint from the manifest
    pub load_order: Option<i32>,
}

/// Loads a single plugin; implemented by the host orchestrator
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Resolve dependencies and instantiate one plugin
    async fn load_one(&self, name: &str) -> Result<()>;
}

/// Topologically order the graph
///
/// Ready plugins are drained lowest `load_order` first (then by name for
/// stability). A cycle aborts with a configuration error naming the
/// plugins involved.
#[instrument(level = "debug", skip(nodes), fields(count = nodes.len()))]
pub fn topological_order(nodes: &[GraphNode]) -> Result<Vec<String>> {
    let known: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let mut remaining: HashMap<&str, Vec<&str>> = nodes
        .iter()
        .map(|n| {
            // dependencies outside the discovered set are assumed external
            // (already loaded or provided by the host) and do not block
            let deps: Vec<&str> = n
                .dependencies
                .iter()
                .map(|d| d.as_str())
                .filter(|d| known.contains(d))
                .collect();
            (n.name.as_str(), deps)
        })
        .collect();
    let hints: HashMap<&str, i32> = nodes
        .iter()
        .map(|n| (n.name.as_str(), n.load_order.unwrap_or(i32::MAX)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| placed.contains(d)))
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            let mut cycle: Vec<&str> = remaining.keys().copied().collect();
            cycle.sort_unstable();
            return Err(PlugonError::Config(format!(
                "dependency cycle among plugins: [{}]",
                cycle.join(", ")
            )));
        }
        ready.sort_by_key(|name| (hints.get(name).copied().unwrap_or(i32::MAX), *name));
        for name in ready {
            remaining.remove(name);
            placed.insert(name);
            order.push(name.to_string());
        }
    }
    Ok(order)
}

/// Compute dependency-frontier batches
///
/// Each batch holds the plugins whose (known) dependencies all sit in
/// earlier batches. A genuine cycle is a configuration error; a residual
/// set that stalls on dependencies absent from the graph is emitted as a
/// single final batch with a warning.
#[instrument(level = "debug", skip(nodes), fields(count = nodes.len()))]
pub fn compute_batches(nodes: &[GraphNode]) -> Result<Vec<Vec<String>>> {
    let known: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let mut remaining: HashMap<&str, &GraphNode> =
        nodes.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut batches: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let mut frontier: Vec<&str> = remaining
            .values()
            .filter(|n| {
                n.dependencies
                    .iter()
                    .filter(|d| known.contains(d.as_str()))
                    .all(|d| placed.contains(d.as_str()))
            })
            .map(|n| n.name.as_str())
            .collect();

        if frontier.is_empty() {
            // stalled: distinguish a cycle from unknown external deps
            let cyclic = remaining.values().all(|n| {
                n.dependencies
                    .iter()
                    .any(|d| remaining.contains_key(d.as_str()))
            });
            let mut residual: Vec<String> =
                remaining.keys().map(|s| s.to_string()).collect();
            residual.sort_unstable();
            if cyclic {
                return Err(PlugonError::Config(format!(
                    "dependency cycle among plugins: [{}]",
                    residual.join(", ")
                )));
            }
            warn!(
                "⚠️ residual plugins stalled on unknown dependencies, emitting final batch: [{}]",
                residual.join(", ")
            );
            batches.push(residual);
            break;
        }

        frontier.sort_unstable();
        for name in &frontier {
            remaining.remove(name);
            placed.insert(name);
        }
        batches.push(frontier.into_iter().map(|s| s.to_string()).collect());
    }

    debug!("🔧 computed {} load batches", batches.len());
    Ok(batches)
}

/// Execute a strategy over the graph with the given loader
///
/// Returns `(loaded, failed)` name lists. A plugin failure never aborts
/// the run; its dependents fail through the resolver.
pub async fn execute(
    strategy: LoadingStrategy,
    nodes: &[GraphNode],
    loader: &dyn PluginLoader,
) -> Result<(Vec<String>, Vec<(String, String)>)> {
    let mut loaded = Vec::new();
    let mut failed = Vec::new();

    match strategy {
        LoadingStrategy::Serial => {
            for name in topological_order(nodes)? {
                match loader.load_one(&name).await {
                    Ok(()) => loaded.push(name),
                    Err(e) => failed.push((name, e.to_string())),
                }
            }
        }
        LoadingStrategy::Parallel => {
            let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
            let results = join_all(names.iter().map(|name| async move {
                (name.clone(), loader.load_one(name).await)
            }))
            .await;
            for (name, result) in results {
                match result {
                    Ok(()) => loaded.push(name),
                    Err(e) => failed.push((name, e.to_string())),
                }
            }
        }
        LoadingStrategy::Batched => {
            for batch in compute_batches(nodes)? {
                let results = join_all(batch.iter().map(|name| async move {
                    (name.clone(), loader.load_one(name).await)
                }))
                .await;
                for (name, result) in results {
                    match result {
                        Ok(()) => loaded.push(name),
                        Err(e) => failed.push((name, e.to_string())),
                    }
                }
            }
        }
    }

    Ok((loaded, failed))
}
