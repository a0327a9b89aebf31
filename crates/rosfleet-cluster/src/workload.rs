//! Workloads as the adapters see them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use rosfleet_core::quantity::format_cpu_millis;
use rosfleet_state::ResourceAmount;

const MAX_NAME_LEN: usize = 63;

pub const LABEL_OWNER: &str = "rosfleet.io/owner";
pub const LABEL_UNIT: &str = "rosfleet.io/unit";
pub const LABEL_GENERATION: &str = "rosfleet.io/generation";

/// Namespaced name of a workload in one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Stable object name for one unit of an owner (a module of a
    /// deployment, an instance of a batch job).
    pub fn for_unit(namespace: &str, owner: &str, unit: &str) -> Self {
        Self::new(namespace, &dns_label(&format!("{owner}-{unit}")))
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lowercase RFC 1123 label. Names that would exceed 63 characters keep
/// a prefix and gain a digest suffix so distinct inputs stay distinct.
pub fn dns_label(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '-' }
        })
        .collect();
    out = out.trim_matches('-').to_string();
    if out.is_empty() {
        out = "unit".to_string();
    }
    if out.len() > MAX_NAME_LEN {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        let prefix = out[..MAX_NAME_LEN - 11].trim_end_matches('-');
        out = format!("{prefix}-{}", &digest[..10]);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Long-running modules.
    Always,
    /// Batch job instances; a finished container is a result.
    Never,
}

/// A workload pinned to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadManifest {
    pub workload: WorkloadRef,
    pub node: String,
    pub image: String,
    pub resources: ResourceAmount,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    pub restart: RestartPolicy,
}

impl WorkloadManifest {
    /// Render as a pod bound directly to `node`.
    pub fn to_pod(&self) -> Value {
        let mut requests = serde_json::Map::new();
        requests.insert("cpu".into(), json!(format_cpu_millis(self.resources.cpu_millis)));
        requests.insert("memory".into(), json!(self.resources.memory_bytes.to_string()));
        for (name, amount) in &self.resources.custom {
            requests.insert(name.clone(), json!(amount.to_string()));
        }

        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut spec = json!({
            "nodeName": self.node,
            "restartPolicy": match self.restart {
                RestartPolicy::Always => "Always",
                RestartPolicy::Never => "Never",
            },
            "containers": [{
                "name": "main",
                "image": self.image,
                "env": env,
                "resources": { "requests": requests.clone(), "limits": requests },
            }],
        });
        if let Some(secret) = &self.image_pull_secret {
            spec["imagePullSecrets"] = json!([{ "name": secret }]);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.workload.name,
                "namespace": self.workload.namespace,
                "labels": self.labels,
            },
            "spec": spec,
        })
    }
}

/// Observed state of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    /// The cluster has no such workload.
    Absent,
}

impl WorkloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}
