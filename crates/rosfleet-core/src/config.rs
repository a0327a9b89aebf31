//! fleet.toml configuration parser.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::quantity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub scheduler: SchedulerSection,
    pub controller: ControllerSection,
    pub dispatch: DispatchSection,
    pub sync: SyncSection,
    pub batch: BatchSection,
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Clusters whose last successful sync is older than this are not
    /// offered to new placements.
    #[serde(with = "serde_str")]
    pub freshness_bound: Duration,
    /// Lost reservation races tolerated per module before giving up.
    pub reserve_retry_limit: u32,
    /// Lifetime of an uncommitted reservation.
    #[serde(with = "serde_str")]
    pub reservation_ttl: Duration,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            freshness_bound: Duration::from_secs(30),
            reserve_retry_limit: 3,
            reservation_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub schedule_attempts: u32,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
    /// In-place redeploys of a failed module before re-placing it.
    pub recovery_attempts: u32,
    #[serde(with = "serde_str")]
    pub unreachable_grace: Duration,
    #[serde(with = "serde_str")]
    pub status_poll_interval: Duration,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            schedule_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            recovery_attempts: 2,
            unreachable_grace: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    #[serde(with = "serde_str")]
    pub task_timeout: Duration,
    #[serde(with = "serde_str")]
    pub idempotency_ttl: Duration,
    /// Holder name used when acquiring periodic-job leases.
    pub instance_id: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(600),
            instance_id: format!("rosfleetd-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Longest a sync pass may run before it is cancelled. Must cover the
    /// cluster request timeout.
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// Entries kept in each cluster's sync log.
    pub log_capacity: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(45),
            log_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// CPU left free on every node when packing batch jobs.
    pub headroom_cpu: String,
    pub headroom_memory: String,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            headroom_cpu: "0".to_string(),
            headroom_memory: "0".to_string(),
        }
    }
}

impl BatchSection {
    pub fn headroom_cpu_millis(&self) -> ConfigResult<u64> {
        quantity::parse_cpu_millis(&self.headroom_cpu)
            .ok_or_else(|| ConfigError::Quantity(self.headroom_cpu.clone()))
    }

    pub fn headroom_memory_bytes(&self) -> ConfigResult<u64> {
        quantity::parse_units(&self.headroom_memory)
            .ok_or_else(|| ConfigError::Quantity(self.headroom_memory.clone()))
    }
}

/// Distribution of a registered cluster. Selects the adapter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    #[serde(alias = "k8s")]
    Kubernetes,
    K3s,
    Simulated,
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::K3s => write!(f, "k3s"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Where the admin credential for a cluster comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRef {
    Token(String),
    Env(String),
    File(PathBuf),
}

/// One `[[cluster]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRegistration {
    pub name: String,
    pub kind: ClusterKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Static inventory for `kind = "simulated"`.
    #[serde(default, rename = "node")]
    pub nodes: Vec<SimulatedNode>,
    /// Labels kept on named nodes, keyed by node name. Pushed to the
    /// cluster after each sync when a node lacks them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_namespace() -> String {
    "rosfleet".to_string()
}

impl ClusterRegistration {
    pub fn simulated(name: &str, nodes: Vec<SimulatedNode>) -> Self {
        Self {
            name: name.to_string(),
            kind: ClusterKind::Simulated,
            endpoint: String::new(),
            ca_cert: None,
            credential: None,
            namespace: default_namespace(),
            nodes,
            node_labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedNode {
    pub name: String,
    pub cpu: String,
    pub memory: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub custom: BTreeMap<String, u64>,
    #[serde(default = "default_true")]
    pub schedulable: bool,
}

fn default_true() -> bool {
    true
}

impl SimulatedNode {
    pub fn new(name: &str, cpu: &str, memory: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            labels: BTreeMap::new(),
            custom: BTreeMap::new(),
            schedulable: true,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the control plane cannot start with.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| -> ConfigResult<()> { Err(ConfigError::Invalid(msg)) };

        if self.sync.interval.is_zero() {
            return invalid("sync.interval must be non-zero".into());
        }
        if self.sync.timeout.is_zero() {
            return invalid("sync.timeout must be non-zero".into());
        }
        if self.controller.status_poll_interval.is_zero() {
            return invalid("controller.status_poll_interval must be non-zero".into());
        }
        if self.dispatch.task_timeout.is_zero() {
            return invalid("dispatch.task_timeout must be non-zero".into());
        }
        if self.scheduler.reservation_ttl <= self.dispatch.task_timeout {
            return invalid(format!(
                "scheduler.reservation_ttl ({:?}) must exceed dispatch.task_timeout ({:?})",
                self.scheduler.reservation_ttl, self.dispatch.task_timeout
            ));
        }
        if self.dispatch.instance_id.trim().is_empty() {
            return invalid("dispatch.instance_id must not be empty".into());
        }
        self.batch.headroom_cpu_millis()?;
        self.batch.headroom_memory_bytes()?;

        let mut seen = BTreeSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return invalid("cluster name must not be empty".into());
            }
            if !seen.insert(cluster.name.as_str()) {
                return invalid(format!("duplicate cluster name {:?}", cluster.name));
            }
            match cluster.kind {
                ClusterKind::Kubernetes | ClusterKind::K3s => {
                    if !cluster.endpoint.starts_with("https://")
                        && !cluster.endpoint.starts_with("http://")
                    {
                        return invalid(format!(
                            "cluster {:?}: endpoint must be an http(s) URL",
                            cluster.name
                        ));
                    }
                }
                ClusterKind::Simulated => {
                    for node in &cluster.nodes {
                        quantity::parse_cpu_millis(&node.cpu)
                            .ok_or_else(|| ConfigError::Quantity(node.cpu.clone()))?;
                        quantity::parse_units(&node.memory)
                            .ok_or_else(|| ConfigError::Quantity(node.memory.clone()))?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterRegistration> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Example configuration written by `rosfleetd check-config --scaffold`.
    pub fn scaffold() -> String {
        r#"[scheduler]
freshness_bound = "30s"
reserve_retry_limit = 3
reservation_ttl = "2m"

[controller]
schedule_attempts = 5
backoff_base = "2s"
backoff_max = "1m"
recovery_attempts = 2
unreachable_grace = "1m"
status_poll_interval = "10s"

[dispatch]
task_timeout = "1m"
idempotency_ttl = "10m"
instance_id = "rosfleetd-0"

[sync]
interval = "10s"
timeout = "45s"

[[cluster]]
name = "lab"
kind = "k3s"
endpoint = "https://10.0.0.10:6443"
ca_cert = "/etc/rosfleet/lab-ca.pem"
credential = { env = "LAB_CLUSTER_TOKEN" }

[[cluster]]
name = "sim"
kind = "simulated"

[[cluster.node]]
name = "sim-0"
cpu = "4"
memory = "8Gi"
labels = { "rosfleet.io/capability.gpu" = "true" }
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.freshness_bound, Duration::from_secs(30));
        assert_eq!(config.controller.schedule_attempts, 5);
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn scaffold_parses() {
        let config = FleetConfig::from_toml_str(&FleetConfig::scaffold()).unwrap();
        assert_eq!(config.clusters.len(), 2);

        let lab = config.cluster("lab").unwrap();
        assert_eq!(lab.kind, ClusterKind::K3s);
        assert_eq!(
            lab.credential,
            Some(CredentialRef::Env("LAB_CLUSTER_TOKEN".into()))
        );
        assert_eq!(lab.namespace, "rosfleet");

        let sim = config.cluster("sim").unwrap();
        assert_eq!(sim.nodes.len(), 1);
        assert!(sim.nodes[0].schedulable);
        assert_eq!(config.dispatch.task_timeout, Duration::from_secs(60));
    }

    #[test]
    fn k8s_alias_accepted() {
        let config = FleetConfig::from_toml_str(
            r#"
[[cluster]]
name = "edge"
kind = "k8s"
endpoint = "https://edge:6443"
credential = { token = "abc" }
"#,
        )
        .unwrap();
        assert_eq!(config.clusters[0].kind, ClusterKind::Kubernetes);
    }

    #[test]
    fn duplicate_cluster_names_rejected() {
        let err = FleetConfig::from_toml_str(
            r#"
[[cluster]]
name = "a"
kind = "simulated"

[[cluster]]
name = "a"
kind = "simulated"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn bad_duration_rejected() {
        let err = FleetConfig::from_toml_str("[sync]\ninterval = \"often\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_interval_rejected() {
        let err = FleetConfig::from_toml_str("[sync]\ninterval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn remote_cluster_requires_url() {
        let err = FleetConfig::from_toml_str(
            "[[cluster]]\nname = \"x\"\nkind = \"kubernetes\"\nendpoint = \"x:6443\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn reservation_ttl_must_outlive_task_timeout() {
        let err = FleetConfig::from_toml_str(
            "[scheduler]\nreservation_ttl = \"30s\"\n[dispatch]\ntask_timeout = \"1m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("reservation_ttl"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[controller]\nrecovery_attempts = 4\n").unwrap();
        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.controller.recovery_attempts, 4);

        let missing = FleetConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
