//! Shared mutable state owned by the orchestration layer.
//!
//! [`FleetState`] replaces process-wide globals: it is created once, wrapped in
//! an [`Arc`], and handed to every component that needs it. Each structure is
//! guarded independently:
//!
//! - exists-flags record pools and jobs already verified in this process and
//!   are only ever set, never cleared;
//! - the node cache is an immutable map behind a lock. A merge builds the next
//!   map and swaps it in whole, so a reader sees either the view before a
//!   refresh or the view after it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::inventory::NodeInfo;

/// Set of `(account, resource)` pairs known to exist remotely.
#[derive(Debug, Default)]
pub struct ExistsFlags {
    verified: Mutex<HashSet<(String, String)>>,
}

impl ExistsFlags {
    /// Whether `resource_id` was already verified on `account`.
    pub async fn is_set(&self, account: &str, resource_id: &str) -> bool {
        self.verified
            .lock()
            .await
            .contains(&(account.to_owned(), resource_id.to_owned()))
    }

    /// Records that `resource_id` exists on `account`.
    pub async fn set(&self, account: &str, resource_id: &str) {
        self.verified
            .lock()
            .await
            .insert((account.to_owned(), resource_id.to_owned()));
    }
}

/// Cache entry pairing a node with the time it was last listed.
#[derive(Clone, Debug)]
pub struct CachedNode {
    /// Node details as of the last refresh that listed it.
    pub info: NodeInfo,
    /// When a refresh last listed the node.
    pub observed_at: Instant,
}

/// Consistent view of the node cache at one point in time.
pub type NodeSnapshot = Arc<HashMap<String, CachedNode>>;

/// Node id to [`NodeInfo`] lookup table.
///
/// Entries are added or overwritten by merges and never removed.
#[derive(Debug, Default)]
pub struct NodeCache {
    current: RwLock<NodeSnapshot>,
}

impl NodeCache {
    /// Returns the complete current view.
    pub async fn snapshot(&self) -> NodeSnapshot {
        Arc::clone(&*self.current.read().await)
    }

    /// Looks a node up regardless of how long ago it was listed.
    pub async fn lookup(&self, node_id: &str) -> Option<NodeInfo> {
        self.current
            .read()
            .await
            .get(node_id)
            .map(|entry| entry.info.clone())
    }

    /// Looks a node up, ignoring entries last listed more than `ttl` ago.
    pub async fn lookup_fresh(&self, node_id: &str, ttl: Duration) -> Option<NodeInfo> {
        let now = Instant::now();
        self.current
            .read()
            .await
            .get(node_id)
            .filter(|entry| now.saturating_duration_since(entry.observed_at) <= ttl)
            .map(|entry| entry.info.clone())
    }

    /// Merges `nodes` into the cache and returns the new entry count.
    pub async fn merge(&self, nodes: impl IntoIterator<Item = NodeInfo>) -> usize {
        let observed_at = Instant::now();
        let mut current = self.current.write().await;
        let mut next = (**current).clone();
        for info in nodes {
            next.insert(info.id.clone(), CachedNode { info, observed_at });
        }
        let total = next.len();
        *current = Arc::new(next);
        total
    }

    /// Number of cached nodes.
    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_empty()
    }
}

/// All mutable state shared between requests.
#[derive(Debug, Default)]
pub struct FleetState {
    pools: ExistsFlags,
    jobs: ExistsFlags,
    nodes: NodeCache,
}

impl FleetState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pools verified to exist.
    #[must_use]
    pub const fn pools(&self) -> &ExistsFlags {
        &self.pools
    }

    /// Jobs verified to exist.
    #[must_use]
    pub const fn jobs(&self) -> &ExistsFlags {
        &self.jobs
    }

    /// Node inventory cache.
    #[must_use]
    pub const fn nodes(&self) -> &NodeCache {
        &self.nodes
    }
}
