//! Simulated cluster.
//!
//! Keeps a node inventory and a workload table in memory and behaves
//! like a control plane that schedules pods instantly: applied workloads
//! consume capacity on their node until deleted or finished. Failure
//! knobs let tests make the cluster unreachable, reject credentials, or
//! refuse specific workloads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use rosfleet_core::quantity::{parse_cpu_millis, parse_units};
use rosfleet_state::{ClusterKind, ClusterRegistration, NodeResourceSnapshot, ResourceAmount};

use crate::client::ClusterClient;
use crate::error::{ClientError, ClientResult};
use crate::profile::label_capabilities;
use crate::workload::{WorkloadManifest, WorkloadRef, WorkloadStatus};

#[derive(Debug, Clone)]
struct SimNode {
    capacity: ResourceAmount,
    labels: BTreeMap<String, String>,
    schedulable: bool,
}

#[derive(Debug, Clone)]
struct SimWorkload {
    node: String,
    resources: ResourceAmount,
    status: WorkloadStatus,
}

#[derive(Debug)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    workloads: BTreeMap<WorkloadRef, SimWorkload>,
    reachable: bool,
    credentials_valid: bool,
    start_running: bool,
    rejected: BTreeSet<String>,
    apply_calls: usize,
    delete_calls: usize,
}

pub struct InMemoryCluster {
    name: String,
    state: Mutex<SimState>,
}

impl InMemoryCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SimState {
                nodes: BTreeMap::new(),
                workloads: BTreeMap::new(),
                reachable: true,
                credentials_valid: true,
                start_running: true,
                rejected: BTreeSet::new(),
                apply_calls: 0,
                delete_calls: 0,
            }),
        }
    }

    /// Build from a `kind = "simulated"` registration.
    pub fn from_registration(registration: &ClusterRegistration) -> ClientResult<Self> {
        let cluster = Self::new(&registration.name);
        for node in &registration.nodes {
            let cpu = parse_cpu_millis(&node.cpu)
                .ok_or_else(|| ClientError::Decode(format!("cpu quantity {:?}", node.cpu)))?;
            let memory = parse_units(&node.memory)
                .ok_or_else(|| ClientError::Decode(format!("memory quantity {:?}", node.memory)))?;
            let mut capacity = ResourceAmount::new(cpu, memory);
            capacity.custom = node.custom.clone();
            cluster.add_node(&node.name, capacity, node.labels.clone());
            if !node.schedulable {
                cluster.set_schedulable(&node.name, false);
            }
        }
        Ok(cluster)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_node(self, id: &str, capacity: ResourceAmount) -> Self {
        self.add_node(id, capacity, BTreeMap::new());
        self
    }

    pub fn add_node(&self, id: &str, capacity: ResourceAmount, labels: BTreeMap<String, String>) {
        self.lock().nodes.insert(
            id.to_string(),
            SimNode {
                capacity,
                labels,
                schedulable: true,
            },
        );
    }

    /// Drop a node together with everything running on it.
    pub fn remove_node(&self, id: &str) {
        let mut state = self.lock();
        state.nodes.remove(id);
        state.workloads.retain(|_, w| w.node != id);
    }

    pub fn set_schedulable(&self, id: &str, schedulable: bool) {
        if let Some(node) = self.lock().nodes.get_mut(id) {
            node.schedulable = schedulable;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_credentials_valid(&self, valid: bool) {
        self.lock().credentials_valid = valid;
    }

    /// Whether applied workloads report `Running` immediately (default)
    /// or stay `Pending` until told otherwise.
    pub fn set_start_running(&self, running: bool) {
        self.lock().start_running = running;
    }

    /// Refuse applies for the named workload.
    pub fn reject_workload(&self, name: &str) {
        self.lock().rejected.insert(name.to_string());
    }

    pub fn accept_workload(&self, name: &str) {
        self.lock().rejected.remove(name);
    }

    pub fn set_workload_status(&self, workload: &WorkloadRef, status: WorkloadStatus) {
        if let Some(w) = self.lock().workloads.get_mut(workload) {
            w.status = status;
        }
    }

    /// Remove a workload behind the control plane's back.
    pub fn evict(&self, workload: &WorkloadRef) {
        self.lock().workloads.remove(workload);
    }

    pub fn workloads(&self) -> Vec<(WorkloadRef, String)> {
        self.lock()
            .workloads
            .iter()
            .map(|(r, w)| (r.clone(), w.node.clone()))
            .collect()
    }

    pub fn apply_calls(&self) -> usize {
        self.lock().apply_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    fn gate(state: &SimState) -> ClientResult<()> {
        if !state.reachable {
            return Err(ClientError::Unreachable("connection refused".into()));
        }
        if !state.credentials_valid {
            return Err(ClientError::AuthenticationFailed("401 Unauthorized".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClusterKind {
        ClusterKind::Simulated
    }

    async fn list_nodes(&self) -> ClientResult<Vec<NodeResourceSnapshot>> {
        let state = self.lock();
        Self::gate(&state)?;

        let mut used: BTreeMap<&str, ResourceAmount> = BTreeMap::new();
        for w in state.workloads.values() {
            if matches!(w.status, WorkloadStatus::Pending | WorkloadStatus::Running) {
                let slot = used.entry(w.node.as_str()).or_default();
                *slot = slot.saturating_add(&w.resources);
            }
        }

        Ok(state
            .nodes
            .iter()
            .map(|(id, node)| {
                let taken = used.get(id.as_str()).cloned().unwrap_or_default();
                NodeResourceSnapshot {
                    node_id: id.clone(),
                    labels: node.labels.clone(),
                    available: node.capacity.saturating_sub(&taken),
                    capacity: node.capacity.clone(),
                    capabilities: label_capabilities(&node.labels),
                    schedulable: node.schedulable,
                }
            })
            .collect())
    }

    async fn apply(&self, manifest: &WorkloadManifest) -> ClientResult<()> {
        let mut state = self.lock();
        Self::gate(&state)?;
        state.apply_calls += 1;

        if state.rejected.contains(&manifest.workload.name) {
            return Err(ClientError::Rejected {
                status: 422,
                message: format!("workload {} refused", manifest.workload.name),
            });
        }
        if !state.nodes.contains_key(&manifest.node) {
            return Err(ClientError::Rejected {
                status: 422,
                message: format!("node {} not found", manifest.node),
            });
        }
        if state.workloads.contains_key(&manifest.workload) {
            debug!(cluster = %self.name, workload = %manifest.workload, "workload already exists");
            return Ok(());
        }
        let status = if state.start_running {
            WorkloadStatus::Running
        } else {
            WorkloadStatus::Pending
        };
        state.workloads.insert(
            manifest.workload.clone(),
            SimWorkload {
                node: manifest.node.clone(),
                resources: manifest.resources.clone(),
                status,
            },
        );
        Ok(())
    }

    async fn delete(&self, workload: &WorkloadRef) -> ClientResult<()> {
        let mut state = self.lock();
        Self::gate(&state)?;
        state.delete_calls += 1;
        state.workloads.remove(workload);
        Ok(())
    }

    async fn workload_status(&self, workload: &WorkloadRef) -> ClientResult<WorkloadStatus> {
        let state = self.lock();
        Self::gate(&state)?;
        Ok(state
            .workloads
            .get(workload)
            .map(|w| w.status.clone())
            .unwrap_or(WorkloadStatus::Absent))
    }

    async fn label_node(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> ClientResult<()> {
        let mut state = self.lock();
        Self::gate(&state)?;
        let target = state.nodes.get_mut(node).ok_or_else(|| ClientError::Rejected {
            status: 404,
            message: format!("node {node} not found"),
        })?;
        for (key, value) in labels {
            match value {
                Some(v) => target.labels.insert(key.clone(), v.clone()),
                None => target.labels.remove(key),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::RestartPolicy;

    fn manifest(name: &str, node: &str, cpu: u64) -> WorkloadManifest {
        WorkloadManifest {
            workload: WorkloadRef::new("rosfleet", name),
            node: node.into(),
            image: "img".into(),
            resources: ResourceAmount::new(cpu, 0),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            image_pull_secret: None,
            restart: RestartPolicy::Always,
        }
    }

    #[tokio::test]
    async fn applied_workloads_consume_capacity() {
        let cluster = InMemoryCluster::new("sim").with_node("n1", ResourceAmount::new(4000, 0));
        cluster.apply(&manifest("a", "n1", 1500)).await.unwrap();
        cluster.apply(&manifest("a", "n1", 1500)).await.unwrap();

        let nodes = cluster.list_nodes().await.unwrap();
        assert_eq!(nodes[0].available.cpu_millis, 2500);
        assert_eq!(cluster.apply_calls(), 2);

        cluster.delete(&WorkloadRef::new("rosfleet", "a")).await.unwrap();
        cluster.delete(&WorkloadRef::new("rosfleet", "a")).await.unwrap();
        let nodes = cluster.list_nodes().await.unwrap();
        assert_eq!(nodes[0].available.cpu_millis, 4000);
    }

    #[tokio::test]
    async fn failure_knobs() {
        let cluster = InMemoryCluster::new("sim").with_node("n1", ResourceAmount::new(4000, 0));
        cluster.set_reachable(false);
        assert!(matches!(cluster.list_nodes().await, Err(ClientError::Unreachable(_))));

        cluster.set_reachable(true);
        cluster.set_credentials_valid(false);
        assert!(matches!(
            cluster.list_nodes().await,
            Err(ClientError::AuthenticationFailed(_))
        ));

        cluster.set_credentials_valid(true);
        cluster.reject_workload("bad");
        assert!(matches!(
            cluster.apply(&manifest("bad", "n1", 1)).await,
            Err(ClientError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn removing_node_drops_its_workloads() {
        let cluster = InMemoryCluster::new("sim")
            .with_node("n1", ResourceAmount::new(4000, 0))
            .with_node("n2", ResourceAmount::new(4000, 0));
        cluster.apply(&manifest("a", "n1", 100)).await.unwrap();
        cluster.remove_node("n1");
        assert_eq!(
            cluster.workload_status(&WorkloadRef::new("rosfleet", "a")).await.unwrap(),
            WorkloadStatus::Absent
        );
    }

    #[tokio::test]
    async fn label_changes_show_up_as_capabilities() {
        let cluster = InMemoryCluster::new("sim").with_node("n1", ResourceAmount::new(1000, 0));
        let labels = BTreeMap::from([(
            "rosfleet.io/capability.lidar".to_string(),
            Some("true".to_string()),
        )]);
        cluster.label_node("n1", &labels).await.unwrap();
        let nodes = cluster.list_nodes().await.unwrap();
        assert!(nodes[0].capabilities.contains("lidar"));
    }

    #[test]
    fn builds_from_registration() {
        let registration = ClusterRegistration::simulated(
            "sim",
            vec![rosfleet_core::SimulatedNode::new("n1", "2", "4Gi").with_label("zone", "a")],
        );
        let cluster = InMemoryCluster::from_registration(&registration).unwrap();
        let state = cluster.lock();
        assert_eq!(state.nodes["n1"].capacity.cpu_millis, 2000);
        assert_eq!(state.nodes["n1"].labels["zone"], "a");
    }
}
