//! Cluster sync: pull inventories through the adapters into the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use rosfleet_state::{
    ClusterRegistration, RefreshSummary, ReservationId, ResourceCache, SyncFailure,
};

use crate::client::ClusterClient;
use crate::error::{ClientError, SyncError, SyncResult};
use crate::registry::{ClusterRegistry, connect};

/// Couples the registry of adapters with the cache they feed.
#[derive(Clone)]
pub struct ClusterSyncer {
    cache: ResourceCache,
    registry: ClusterRegistry,
}

impl ClusterSyncer {
    pub fn new(cache: ResourceCache, registry: ClusterRegistry) -> Self {
        Self { cache, registry }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Register a cluster and open its adapter.
    pub fn register(&self, registration: ClusterRegistration) -> SyncResult<()> {
        let client = connect(&registration)
            .map_err(|e| SyncError::from_client(&registration.name, e))?;
        self.register_client(registration, client)
    }

    /// Register a cluster with an adapter built by the caller.
    pub fn register_client(
        &self,
        registration: ClusterRegistration,
        client: Arc<dyn ClusterClient>,
    ) -> SyncResult<()> {
        self.cache.register(registration)?;
        self.registry.insert(client);
        Ok(())
    }

    pub fn deregister(&self, name: &str) -> SyncResult<Vec<ReservationId>> {
        self.registry.remove(name);
        Ok(self.cache.deregister(name)?)
    }

    /// Fetch one cluster's inventory and swap it into the cache.
    ///
    /// No cache lock is held while the adapter call is in flight. On
    /// failure the cluster is marked unreachable and keeps its last
    /// inventory.
    pub async fn refresh(&self, name: &str) -> SyncResult<RefreshSummary> {
        let client = self
            .registry
            .get(name)
            .ok_or_else(|| SyncError::UnknownCluster(name.to_string()))?;

        match client.list_nodes().await {
            Ok(nodes) => {
                let summary = self.cache.apply_refresh(name, nodes, Instant::now())?;
                debug!(cluster = %name, generation = summary.generation, "cluster synced");
                Ok(summary)
            }
            Err(err) => {
                let failure = match &err {
                    ClientError::AuthenticationFailed(msg) => SyncFailure::authentication(msg.clone()),
                    other => SyncFailure::unreachable(other.to_string()),
                };
                self.cache.mark_unreachable(name, failure)?;
                Err(SyncError::from_client(name, err))
            }
        }
    }

    /// Refresh every registered cluster concurrently.
    pub async fn sync_all(&self) -> BTreeMap<String, SyncResult<RefreshSummary>> {
        let mut tasks = JoinSet::new();
        for name in self.registry.names() {
            let syncer = self.clone();
            tasks.spawn(async move {
                let result = syncer.refresh(&name).await;
                (name, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    results.insert(name, result);
                }
                Err(e) => warn!(error = %e, "sync task panicked"),
            }
        }
        let failed = results.values().filter(|r| r.is_err()).count();
        info!(clusters = results.len(), failed, "sync pass complete");
        results
    }

    /// Push node labels to a cluster, then re-read its inventory so the
    /// new labels are visible to placement.
    pub async fn label_node(
        &self,
        cluster: &str,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> SyncResult<RefreshSummary> {
        let client = self
            .registry
            .get(cluster)
            .ok_or_else(|| SyncError::UnknownCluster(cluster.to_string()))?;
        client
            .label_node(node, labels)
            .await
            .map_err(|e| SyncError::from_client(cluster, e))?;
        info!(%cluster, %node, labels = labels.len(), "node labels updated");
        self.refresh(cluster).await
    }

    /// Bring nodes in line with the registration's `node_labels`. Nodes
    /// missing from the last inventory are skipped. Returns the number of
    /// nodes relabelled.
    pub async fn apply_node_labels(&self, cluster: &str) -> SyncResult<usize> {
        let registration = self
            .cache
            .registration(cluster)
            .ok_or_else(|| SyncError::UnknownCluster(cluster.to_string()))?;
        if registration.node_labels.is_empty() {
            return Ok(0);
        }

        let pending: Vec<(String, BTreeMap<String, Option<String>>)> = {
            let snapshot = self.cache.snapshot(Instant::now());
            let Some(view) = snapshot.cluster(cluster) else {
                return Ok(0);
            };
            registration
                .node_labels
                .iter()
                .filter_map(|(node, desired)| {
                    let Some(current) = view.nodes.get(node) else {
                        debug!(%cluster, %node, "labelled node not in inventory");
                        return None;
                    };
                    let missing: BTreeMap<String, Option<String>> = desired
                        .iter()
                        .filter(|(key, value)| current.node.labels.get(*key) != Some(*value))
                        .map(|(key, value)| (key.clone(), Some(value.clone())))
                        .collect();
                    (!missing.is_empty()).then(|| (node.clone(), missing))
                })
                .collect()
        };

        for (node, labels) in &pending {
            self.label_node(cluster, node, labels).await?;
        }
        Ok(pending.len())
    }
}
