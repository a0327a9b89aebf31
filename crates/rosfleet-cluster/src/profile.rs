//! Distribution profiles.
//!
//! A profile captures what differs between Kubernetes distributions as
//! far as placement is concerned: which nodes take workloads, how much
//! capacity the distribution itself keeps, and which capability tags a
//! node advertises.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rosfleet_state::{ClusterKind, ResourceAmount};

/// Label prefix marking a boolean capability, e.g.
/// `rosfleet.io/capability.gpu=true`.
pub const CAPABILITY_PREFIX: &str = "rosfleet.io/capability.";
/// Label naming the node's network/middleware class, e.g. `rosfleet.io/network=5g`.
pub const NETWORK_LABEL: &str = "rosfleet.io/network";

const ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
const ROLE_MASTER: &str = "node-role.kubernetes.io/master";

pub trait DistributionProfile: Send + Sync + fmt::Debug {
    fn kind(&self) -> ClusterKind;

    /// Whether a node with these labels may run rosfleet workloads.
    fn accepts_workloads(&self, labels: &BTreeMap<String, String>) -> bool;

    /// Capacity the distribution keeps for itself on top of what the node
    /// reports as allocatable.
    fn system_reserved(&self, labels: &BTreeMap<String, String>) -> ResourceAmount;

    fn capability_tags(&self, labels: &BTreeMap<String, String>) -> BTreeSet<String>;
}

/// Capability tags shared by every distribution.
pub fn label_capabilities(labels: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for (key, value) in labels {
        if let Some(tag) = key.strip_prefix(CAPABILITY_PREFIX) {
            if value == "true" && !tag.is_empty() {
                tags.insert(tag.to_string());
            }
        } else if key == NETWORK_LABEL && !value.is_empty() {
            tags.insert(value.clone());
        }
    }
    tags
}

fn is_control_plane(labels: &BTreeMap<String, String>) -> bool {
    labels.contains_key(ROLE_CONTROL_PLANE) || labels.contains_key(ROLE_MASTER)
}

/// Upstream Kubernetes: control-plane nodes are kept free of workloads.
#[derive(Debug, Default)]
pub struct KubernetesProfile;

impl DistributionProfile for KubernetesProfile {
    fn kind(&self) -> ClusterKind {
        ClusterKind::Kubernetes
    }

    fn accepts_workloads(&self, labels: &BTreeMap<String, String>) -> bool {
        !is_control_plane(labels)
    }

    fn system_reserved(&self, _labels: &BTreeMap<String, String>) -> ResourceAmount {
        ResourceAmount::default()
    }

    fn capability_tags(&self, labels: &BTreeMap<String, String>) -> BTreeSet<String> {
        label_capabilities(labels)
    }
}

/// K3s: single-binary servers run workloads too, but the embedded control
/// plane is not reflected in allocatable, so server nodes hold some back.
#[derive(Debug)]
pub struct K3sProfile {
    pub server_reserved: ResourceAmount,
}

impl Default for K3sProfile {
    fn default() -> Self {
        Self {
            server_reserved: ResourceAmount::new(200, 256 << 20),
        }
    }
}

impl DistributionProfile for K3sProfile {
    fn kind(&self) -> ClusterKind {
        ClusterKind::K3s
    }

    fn accepts_workloads(&self, _labels: &BTreeMap<String, String>) -> bool {
        true
    }

    fn system_reserved(&self, labels: &BTreeMap<String, String>) -> ResourceAmount {
        if is_control_plane(labels) {
            self.server_reserved.clone()
        } else {
            ResourceAmount::default()
        }
    }

    fn capability_tags(&self, labels: &BTreeMap<String, String>) -> BTreeSet<String> {
        let mut tags = label_capabilities(labels);
        tags.insert("k3s".to_string());
        tags
    }
}

/// Profile for a declared cluster kind. Simulated clusters follow the
/// upstream Kubernetes rules.
pub fn profile_for(kind: ClusterKind) -> Box<dyn DistributionProfile> {
    match kind {
        ClusterKind::Kubernetes | ClusterKind::Simulated => Box::new(KubernetesProfile),
        ClusterKind::K3s => Box::new(K3sProfile::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn capabilities_from_labels() {
        let tags = label_capabilities(&labels(&[
            ("rosfleet.io/capability.gpu", "true"),
            ("rosfleet.io/capability.lidar", "false"),
            ("rosfleet.io/network", "5g"),
            ("kubernetes.io/arch", "arm64"),
        ]));
        assert_eq!(tags, BTreeSet::from(["5g".to_string(), "gpu".to_string()]));
    }

    #[test]
    fn kubernetes_excludes_control_plane() {
        let profile = KubernetesProfile;
        assert!(!profile.accepts_workloads(&labels(&[(ROLE_CONTROL_PLANE, "")])));
        assert!(profile.accepts_workloads(&labels(&[])));
    }

    #[test]
    fn k3s_servers_run_workloads_with_reserve() {
        let profile = K3sProfile::default();
        let server = labels(&[(ROLE_MASTER, "true")]);
        assert!(profile.accepts_workloads(&server));
        assert_eq!(profile.system_reserved(&server).cpu_millis, 200);
        assert!(profile.system_reserved(&labels(&[])).is_zero());
        assert!(profile.capability_tags(&server).contains("k3s"));
    }

    #[test]
    fn profile_selected_by_kind() {
        assert_eq!(profile_for(ClusterKind::K3s).kind(), ClusterKind::K3s);
        assert_eq!(profile_for(ClusterKind::Simulated).kind(), ClusterKind::Kubernetes);
    }
}
