//! Candidate filtering and ranking.
//!
//! Filtering applies hard constraints only; ranking is a total order so
//! identical inputs always produce the same choice:
//!
//! 1. clusters already hosting more sibling modules first (co-location)
//! 2. more free capacity first (CPU, then memory, then custom units)
//! 3. smallest cluster name, then smallest node name

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rosfleet_state::{CacheSnapshot, ClusterView, NodeRef, NodeView, ResourceAmount};

use crate::request::PlacementConstraints;

/// Why a node was filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Unreachable, never synced, or synced longer ago than the bound.
    ClusterNotFresh,
    ClusterPinned,
    Excluded,
    Unschedulable,
    LabelMismatch(String),
    MissingCapability(String),
    Insufficient,
}

/// A node that passed every hard constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeRef,
    pub free: ResourceAmount,
}

/// Check one node against a request's hard constraints.
pub fn check_node(
    cluster: &ClusterView,
    node: &NodeView,
    resources: &ResourceAmount,
    constraints: &PlacementConstraints,
    freshness_bound: Duration,
) -> Result<(), Rejection> {
    if !cluster.is_fresh(freshness_bound) {
        return Err(Rejection::ClusterNotFresh);
    }
    if constraints
        .cluster
        .as_ref()
        .is_some_and(|pin| pin != &cluster.name)
    {
        return Err(Rejection::ClusterPinned);
    }
    if !node.node.schedulable {
        return Err(Rejection::Unschedulable);
    }
    for (key, value) in &constraints.node_labels {
        if node.node.labels.get(key) != Some(value) {
            return Err(Rejection::LabelMismatch(key.clone()));
        }
    }
    if let Some(tag) = constraints
        .capabilities
        .iter()
        .find(|tag| !node.node.capabilities.contains(*tag))
    {
        return Err(Rejection::MissingCapability(tag.clone()));
    }
    if !resources.fits_within(&node.free) {
        return Err(Rejection::Insufficient);
    }
    Ok(())
}

/// Every node in the snapshot that could take `resources` under
/// `constraints`, in (cluster, node) order.
pub fn filter_candidates(
    snapshot: &CacheSnapshot,
    resources: &ResourceAmount,
    constraints: &PlacementConstraints,
    excluded: &BTreeSet<NodeRef>,
    freshness_bound: Duration,
) -> Vec<Candidate> {
    snapshot
        .nodes()
        .filter(|(node_ref, cluster, node)| {
            !excluded.contains(node_ref)
                && check_node(cluster, node, resources, constraints, freshness_bound).is_ok()
        })
        .map(|(node_ref, _, node)| Candidate {
            node: node_ref,
            free: node.free.clone(),
        })
        .collect()
}

/// Order candidates best first. `colocated` counts sibling modules
/// already placed per cluster.
pub fn rank_candidates(candidates: &mut [Candidate], colocated: &BTreeMap<String, usize>) {
    candidates.sort_by_key(|c| {
        (
            Reverse(colocated.get(&c.node.cluster).copied().unwrap_or(0)),
            Reverse(c.free.size_key()),
            c.node.cluster.clone(),
            c.node.node.clone(),
        )
    });
}
