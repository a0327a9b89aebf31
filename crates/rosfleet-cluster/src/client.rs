//! The per-cluster adapter interface.

use std::collections::BTreeMap;

use async_trait::async_trait;

use rosfleet_state::{ClusterKind, NodeResourceSnapshot};

use crate::error::ClientResult;
use crate::workload::{WorkloadManifest, WorkloadRef, WorkloadStatus};

/// One registered cluster's control plane.
///
/// Mutations are idempotent: applying a workload that already exists and
/// deleting one that is already gone both succeed.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ClusterKind;

    /// Current node inventory with capacity already net of running workloads.
    async fn list_nodes(&self) -> ClientResult<Vec<NodeResourceSnapshot>>;

    async fn apply(&self, manifest: &WorkloadManifest) -> ClientResult<()>;

    async fn delete(&self, workload: &WorkloadRef) -> ClientResult<()>;

    async fn workload_status(&self, workload: &WorkloadRef) -> ClientResult<WorkloadStatus>;

    /// Set (`Some`) or remove (`None`) labels on a node.
    async fn label_node(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> ClientResult<()>;
}
