//! Domain types for the resource state cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use rosfleet_core::{ClusterKind, ClusterRegistration, CredentialRef};
use rosfleet_core::quantity::{format_bytes, format_cpu_millis};

// ── Resources ──────────────────────────────────────────────────

/// An amount of node capacity. CPU in millicores, memory in bytes,
/// custom resources (GPUs, devices) in whole units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, u64>,
}

impl ResourceAmount {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_custom(mut self, name: &str, amount: u64) -> Self {
        self.custom.insert(name.to_string(), amount);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.custom.values().all(|v| *v == 0)
    }

    fn custom_of(&self, name: &str) -> u64 {
        self.custom.get(name).copied().unwrap_or(0)
    }

    /// Whether every component of `self` is covered by `other`.
    pub fn fits_within(&self, other: &ResourceAmount) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_bytes <= other.memory_bytes
            && self
                .custom
                .iter()
                .all(|(name, amount)| *amount <= other.custom_of(name))
    }

    pub fn saturating_add(&self, other: &ResourceAmount) -> ResourceAmount {
        let mut custom = self.custom.clone();
        for (name, amount) in &other.custom {
            let slot = custom.entry(name.clone()).or_insert(0);
            *slot = slot.saturating_add(*amount);
        }
        ResourceAmount {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            custom,
        }
    }

    /// Component-wise subtraction clamped at zero. Keeps the custom
    /// resources declared on `self`.
    pub fn saturating_sub(&self, other: &ResourceAmount) -> ResourceAmount {
        ResourceAmount {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            custom: self
                .custom
                .iter()
                .map(|(name, amount)| (name.clone(), amount.saturating_sub(other.custom_of(name))))
                .collect(),
        }
    }

    /// Component-wise minimum over the custom resources declared on `self`.
    pub fn min(&self, other: &ResourceAmount) -> ResourceAmount {
        ResourceAmount {
            cpu_millis: self.cpu_millis.min(other.cpu_millis),
            memory_bytes: self.memory_bytes.min(other.memory_bytes),
            custom: self
                .custom
                .iter()
                .map(|(name, amount)| (name.clone(), (*amount).min(other.custom_of(name))))
                .collect(),
        }
    }

    /// Ordering key used wherever "larger" has to be decided: CPU, then
    /// memory, then total custom units.
    pub fn size_key(&self) -> (u64, u64, u64) {
        (
            self.cpu_millis,
            self.memory_bytes,
            self.custom.values().fold(0u64, |acc, v| acc.saturating_add(*v)),
        )
    }

    /// How many copies of `per_instance` fit in `self`.
    pub fn instances_of(&self, per_instance: &ResourceAmount) -> u64 {
        let ratio = |have: u64, need: u64| if need == 0 { u64::MAX } else { have / need };
        let mut count = ratio(self.cpu_millis, per_instance.cpu_millis)
            .min(ratio(self.memory_bytes, per_instance.memory_bytes));
        for (name, need) in &per_instance.custom {
            count = count.min(ratio(self.custom_of(name), *need));
        }
        count
    }
}

impl fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}",
            format_cpu_millis(self.cpu_millis),
            format_bytes(self.memory_bytes)
        )?;
        for (name, amount) in &self.custom {
            write!(f, " {name}={amount}")?;
        }
        Ok(())
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// Fully qualified node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub cluster: String,
    pub node: String,
}

impl NodeRef {
    pub fn new(cluster: &str, node: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            node: node.to_string(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.node)
    }
}

/// One node as reported by its cluster's last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResourceSnapshot {
    pub node_id: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: ResourceAmount,
    /// Capacity not consumed by workloads the cluster already runs.
    pub available: ResourceAmount,
    /// Middleware and network capability tags.
    pub capabilities: BTreeSet<String>,
    pub schedulable: bool,
}

impl NodeResourceSnapshot {
    pub fn new(node_id: &str, capacity: ResourceAmount) -> Self {
        Self {
            node_id: node_id.to_string(),
            labels: BTreeMap::new(),
            available: capacity.clone(),
            capacity,
            capabilities: BTreeSet::new(),
            schedulable: true,
        }
    }

    pub fn with_available(mut self, available: ResourceAmount) -> Self {
        self.available = available;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.capabilities.insert(tag.to_string());
        self
    }

    pub fn unschedulable(mut self) -> Self {
        self.schedulable = false;
        self
    }
}

// ── Clusters ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFailureKind {
    /// Transient; the cluster is retried on the next sync.
    Unreachable,
    /// Fatal until the credential is fixed.
    AuthenticationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: SyncFailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: SyncFailureKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            kind: SyncFailureKind::AuthenticationFailed,
            message: message.into(),
        }
    }
}

/// A registered cluster and what the sync path last learned about it.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub registration: ClusterRegistration,
    pub reachability: Reachability,
    pub last_sync: Option<Instant>,
    pub last_error: Option<SyncFailure>,
    /// Incremented on every successful refresh.
    pub generation: u64,
}

impl ClusterHandle {
    pub fn new(registration: ClusterRegistration) -> Self {
        Self {
            registration,
            reachability: Reachability::Unknown,
            last_sync: None,
            last_error: None,
            generation: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }

    pub fn kind(&self) -> ClusterKind {
        self.registration.kind
    }

    /// Age of the node inventory. `None` until the first successful sync.
    pub fn staleness(&self, now: Instant) -> Option<Duration> {
        self.last_sync.map(|at| now.saturating_duration_since(at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Synced { generation: u64, nodes: usize },
    NodesAdded { nodes: Vec<String> },
    NodesRemoved { nodes: Vec<String>, invalidated: usize },
    Failed { failure: SyncFailure },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Unix seconds.
    pub at: u64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    const GI: u64 = 1 << 30;

    #[test]
    fn fits_within_checks_custom_resources() {
        let node = ResourceAmount::new(4000, 8 * GI).with_custom("nvidia.com/gpu", 1);
        let want = ResourceAmount::new(1000, GI).with_custom("nvidia.com/gpu", 1);
        assert!(want.fits_within(&node));

        let two_gpus = ResourceAmount::new(1000, GI).with_custom("nvidia.com/gpu", 2);
        assert!(!two_gpus.fits_within(&node));

        let plain = ResourceAmount::new(4000, 8 * GI);
        assert!(!want.fits_within(&plain));
    }

    #[test]
    fn subtraction_clamps_at_zero() {
        let a = ResourceAmount::new(500, 100);
        let b = ResourceAmount::new(800, 50);
        assert_eq!(a.saturating_sub(&b), ResourceAmount::new(0, 50));
    }

    #[test]
    fn instances_of_takes_tightest_dimension() {
        let free = ResourceAmount::new(5000, 4 * GI);
        assert_eq!(free.instances_of(&ResourceAmount::new(1000, GI)), 4);
        assert_eq!(free.instances_of(&ResourceAmount::new(1000, 0)), 5);
        assert_eq!(
            free.instances_of(&ResourceAmount::new(0, 0).with_custom("gpu", 1)),
            0
        );
    }

    #[test]
    fn display_uses_kubernetes_units() {
        let amount = ResourceAmount::new(250, 512 * 1024 * 1024).with_custom("gpu", 1);
        assert_eq!(amount.to_string(), "cpu=250m mem=512Mi gpu=1");
    }

    #[test]
    fn staleness_is_none_before_first_sync() {
        let handle = ClusterHandle::new(ClusterRegistration::simulated("lab", vec![]));
        assert_eq!(handle.staleness(Instant::now()), None);
        assert_eq!(handle.reachability, Reachability::Unknown);
    }
}
