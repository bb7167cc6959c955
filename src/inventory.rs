//! Multi-account node inventory.
//!
//! A refresh lists every account's pool concurrently, one worker per account,
//! waits for all of them, and only then merges the combined result into the
//! shared node cache. An account whose listing fails simply contributes no
//! nodes to that refresh.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountRegistry};
use crate::batch::{BatchService, ComputeNode};
use crate::state::FleetState;

/// A pool node as seen by the orchestration layer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Node identifier, unique across accounts.
    pub id: String,
    /// Account owning the node's pool.
    pub account: Account,
    /// Public IP of the first inbound endpoint; empty when none is configured.
    pub public_ip: String,
    /// Public port of the first inbound endpoint, when reported.
    pub public_port: Option<u16>,
}

impl NodeInfo {
    /// Normalises a provider node.
    #[must_use]
    pub fn from_compute_node(account: &Account, node: ComputeNode) -> Self {
        let first = node.inbound_endpoints.into_iter().next();
        Self {
            id: node.id,
            account: account.clone(),
            public_port: first.as_ref().and_then(|endpoint| endpoint.frontend_port),
            public_ip: first.map(|endpoint| endpoint.public_ip).unwrap_or_default(),
        }
    }
}

/// Fans node listings out over every account and merges the results.
pub struct NodeInventoryAggregator<S> {
    service: Arc<S>,
    state: Arc<FleetState>,
    registry: Arc<AccountRegistry>,
    pool_id: String,
}

impl<S> Clone for NodeInventoryAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            state: Arc::clone(&self.state),
            registry: Arc::clone(&self.registry),
            pool_id: self.pool_id.clone(),
        }
    }
}

impl<S> NodeInventoryAggregator<S>
where
    S: BatchService + 'static,
{
    /// Creates an aggregator listing `pool_id` on each registered account.
    #[must_use]
    pub fn new(
        service: Arc<S>,
        state: Arc<FleetState>,
        registry: Arc<AccountRegistry>,
        pool_id: impl Into<String>,
    ) -> Self {
        Self {
            service,
            state,
            registry,
            pool_id: pool_id.into(),
        }
    }

    /// Refreshes every registered account.
    pub async fn refresh(&self) -> HashMap<String, NodeInfo> {
        self.refresh_all(self.registry.accounts()).await
    }

    /// Lists nodes on each of `accounts` concurrently and merges the union
    /// into the shared cache.
    ///
    /// The returned map holds only the nodes discovered by this refresh. The
    /// cache is updated once, after every worker has finished.
    pub async fn refresh_all(&self, accounts: &[Account]) -> HashMap<String, NodeInfo> {
        let mut workers = JoinSet::new();
        for account in accounts {
            let service = Arc::clone(&self.service);
            let account = account.clone();
            let pool_id = self.pool_id.clone();
            workers.spawn(async move { list_account_nodes(service.as_ref(), &account, &pool_id).await });
        }

        let mut discovered = HashMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(nodes) => {
                    for node in nodes {
                        discovered.insert(node.id.clone(), node);
                    }
                }
                Err(err) => warn!(error = %err, "inventory worker did not finish"),
            }
        }

        let total = self
            .state
            .nodes()
            .merge(discovered.values().cloned())
            .await;
        info!(
            discovered = discovered.len(),
            total, "updated nodes info"
        );
        discovered
    }
}

async fn list_account_nodes<S: BatchService + ?Sized>(
    service: &S,
    account: &Account,
    pool_id: &str,
) -> Vec<NodeInfo> {
    match service.list_pool_nodes(account, pool_id).await {
        Ok(nodes) => nodes
            .into_iter()
            .map(|node| {
                debug!(account = %account.name, node = %node.id, "found node");
                NodeInfo::from_compute_node(account, node)
            })
            .collect(),
        Err(err) => {
            warn!(account = %account.name, error = %err, "listing pool nodes failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::batch::{BatchError, InboundEndpoint};
    use crate::test_support::{ScriptedBatchService, compute_node};
    use rstest::rstest;

    fn accounts(count: usize) -> Vec<Account> {
        (0..count)
            .map(|index| Account::new(format!("acc-{index}"), format!("loc-{index}")))
            .collect()
    }

    fn aggregator(
        service: Arc<ScriptedBatchService>,
        accounts: Vec<Account>,
    ) -> (NodeInventoryAggregator<ScriptedBatchService>, Arc<FleetState>) {
        let state = Arc::new(FleetState::new());
        let registry = Arc::new(AccountRegistry::new(accounts).expect("registry"));
        (
            NodeInventoryAggregator::new(service, Arc::clone(&state), registry, "GameServers"),
            state,
        )
    }

    #[rstest]
    fn from_compute_node_uses_first_endpoint() {
        let account = Account::new("eu-acc", "eu");
        let node = ComputeNode {
            id: String::from("tvm-1"),
            inbound_endpoints: vec![
                InboundEndpoint {
                    public_ip: String::from("20.0.0.1"),
                    frontend_port: Some(50000),
                },
                InboundEndpoint {
                    public_ip: String::from("20.0.0.2"),
                    frontend_port: Some(50001),
                },
            ],
        };
        let info = NodeInfo::from_compute_node(&account, node);
        assert_eq!(info.public_ip, "20.0.0.1");
        assert_eq!(info.public_port, Some(50000));
        assert_eq!(info.account, account);
    }

    #[rstest]
    fn from_compute_node_without_endpoints_has_empty_address() {
        let info = NodeInfo::from_compute_node(
            &Account::new("eu-acc", "eu"),
            ComputeNode {
                id: String::from("tvm-1"),
                inbound_endpoints: vec![],
            },
        );
        assert_eq!(info.public_ip, "");
        assert_eq!(info.public_port, None);
    }

    #[rstest]
    #[case(&[2, 0, 3])]
    #[case(&[0])]
    #[case(&[1, 1, 1, 1])]
    #[tokio::test(start_paused = true)]
    async fn refresh_all_collects_every_account(#[case] counts: &[usize]) {
        let accounts = accounts(counts.len());
        let service = Arc::new(ScriptedBatchService::new());
        for (index, (account, count)) in accounts.iter().zip(counts).enumerate() {
            let nodes = (0..*count)
                .map(|n| compute_node(&format!("{}-node-{n}", account.name), "10.0.0.1"))
                .collect();
            service.set_nodes(&account.name, nodes);
            // Later accounts answer first so completion order differs from spawn order.
            let delay = counts.len().saturating_sub(index);
            service.set_list_delay(&account.name, Duration::from_millis(delay as u64 * 10));
        }
        let (aggregator, state) = aggregator(Arc::clone(&service), accounts.clone());

        let merged = aggregator.refresh_all(&accounts).await;

        let expected: usize = counts.iter().sum();
        assert_eq!(merged.len(), expected);
        assert_eq!(state.nodes().len().await, expected);
    }

    #[tokio::test]
    async fn failing_account_contributes_nothing() {
        let accounts = accounts(3);
        let service = Arc::new(ScriptedBatchService::new());
        service.set_nodes("acc-0", vec![compute_node("a", "10.0.0.1")]);
        service.fail_nodes("acc-1", BatchError::status("list nodes", 503, "busy"));
        service.set_nodes(
            "acc-2",
            vec![compute_node("c1", "10.0.0.3"), compute_node("c2", "10.0.0.4")],
        );
        let (aggregator, _state) = aggregator(Arc::clone(&service), accounts.clone());

        let merged = aggregator.refresh_all(&accounts).await;

        let mut ids: Vec<_> = merged.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c1", "c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn readers_see_old_or_new_view_during_refresh() {
        let accounts = accounts(2);
        let service = Arc::new(ScriptedBatchService::new());
        service.set_nodes("acc-0", vec![compute_node("b1", "10.0.1.1")]);
        service.set_nodes("acc-1", vec![compute_node("b2", "10.0.1.2")]);
        service.set_list_delay("acc-0", Duration::from_millis(20));
        service.set_list_delay("acc-1", Duration::from_millis(40));
        let (aggregator, state) = aggregator(Arc::clone(&service), accounts.clone());
        let old = accounts.first().cloned().expect("account");
        state
            .nodes()
            .merge([
                NodeInfo::from_compute_node(&old, compute_node("a1", "10.0.0.1")),
                NodeInfo::from_compute_node(&old, compute_node("a2", "10.0.0.2")),
            ])
            .await;

        let reader_state = Arc::clone(&state);
        let reader = tokio::spawn(async move {
            let mut views = Vec::new();
            for _ in 0..10 {
                let snapshot = reader_state.nodes().snapshot().await;
                let mut keys: Vec<_> = snapshot.keys().cloned().collect();
                keys.sort();
                views.push(keys);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            views
        });
        aggregator.refresh_all(&accounts).await;
        let views = reader.await.expect("reader task");

        let before = vec!["a1", "a2"];
        let after = vec!["a1", "a2", "b1", "b2"];
        assert!(views.iter().any(|keys| *keys == before));
        assert!(views.iter().any(|keys| *keys == after));
        for keys in &views {
            assert!(
                *keys == before || *keys == after,
                "reader observed a partial merge: {keys:?}"
            );
        }
    }
}
