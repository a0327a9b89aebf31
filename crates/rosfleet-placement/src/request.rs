//! Placement inputs and outputs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use rosfleet_state::{NodeRef, ReservationId, ResourceAmount};

/// Hard constraints a node must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConstraints {
    /// Only nodes of this cluster qualify.
    pub cluster: Option<String>,
    /// Every label must be present with exactly this value.
    pub node_labels: BTreeMap<String, String>,
    /// Middleware/network capability tags the node must advertise.
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub module_id: String,
    pub resources: ResourceAmount,
    #[serde(default)]
    pub constraints: PlacementConstraints,
}

impl ModuleRequest {
    pub fn new(module_id: &str, resources: ResourceAmount) -> Self {
        Self {
            module_id: module_id.to_string(),
            resources,
            constraints: PlacementConstraints::default(),
        }
    }

    pub fn pinned_to(mut self, cluster: &str) -> Self {
        self.constraints.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.constraints
            .node_labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.constraints.capabilities.insert(tag.to_string());
        self
    }
}

/// Surroundings of a scheduling call that are not part of the modules
/// themselves. Empty for a first schedule; a partial re-plan passes the
/// placements it keeps and the nodes it is moving away from.
#[derive(Debug, Clone, Default)]
pub struct PlacementContext {
    /// Sibling placements that stay where they are. They count towards
    /// co-location but are not touched.
    pub preserved: Vec<ModulePlacement>,
    /// Nodes that must not be chosen.
    pub excluded: BTreeSet<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePlacement {
    pub module_id: String,
    pub node: NodeRef,
    pub reservation: ReservationId,
    /// Cluster sync generation the reservation was taken against.
    pub generation: u64,
}

/// Placements for every requested module, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub placements: Vec<ModulePlacement>,
}

impl DeploymentPlan {
    pub fn placement(&self, module_id: &str) -> Option<&ModulePlacement> {
        self.placements.iter().find(|p| p.module_id == module_id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = ReservationId> + '_ {
        self.placements.iter().map(|p| p.reservation)
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}
