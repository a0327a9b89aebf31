//! Batch scheduler: best-effort fill for homogeneous job instances.
//!
//! Unlike deployment plans, batch placement is partial: nodes are taken
//! roomiest first and filled one reservation per instance until either
//! the requested count is met or nothing fits. Whatever is left over is
//! reported as a deficit for the caller to retry later.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rosfleet_state::{NodeRef, ReservationId, ResourceAmount, ResourceCache};

use crate::request::PlacementConstraints;
use crate::scorer::filter_candidates;

/// Per-instance requirements shared by every instance of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub resources: ResourceAmount,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    /// Upper bound on instances of this job per node.
    #[serde(default)]
    pub max_per_node: Option<u32>,
}

impl JobTemplate {
    pub fn new(resources: ResourceAmount) -> Self {
        Self {
            resources,
            constraints: PlacementConstraints::default(),
            max_per_node: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePlacement {
    pub node: NodeRef,
    pub reservation: ReservationId,
    pub generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlacement {
    pub placements: Vec<InstancePlacement>,
    /// Instances that found no capacity in this pass.
    pub deficit: u32,
}

#[derive(Clone)]
pub struct BatchScheduler {
    cache: ResourceCache,
    freshness_bound: Duration,
    /// Capacity left untouched on every node.
    headroom: ResourceAmount,
}

impl BatchScheduler {
    pub fn new(cache: ResourceCache, freshness_bound: Duration) -> Self {
        Self {
            cache,
            freshness_bound,
            headroom: ResourceAmount::default(),
        }
    }

    pub fn with_headroom(mut self, headroom: ResourceAmount) -> Self {
        self.headroom = headroom;
        self
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Place up to `count` instances of `template`.
    ///
    /// `already_placed` counts instances of the same job that hold
    /// capacity from an earlier pass, so `max_per_node` spans passes.
    pub fn schedule_batch(
        &self,
        template: &JobTemplate,
        count: u32,
        already_placed: &BTreeMap<NodeRef, u32>,
        now: Instant,
    ) -> BatchPlacement {
        if count == 0 {
            return BatchPlacement::default();
        }

        let snapshot = self.cache.snapshot(now);
        let needed = template.resources.saturating_add(&self.headroom);
        let mut candidates = filter_candidates(
            &snapshot,
            &needed,
            &template.constraints,
            &BTreeSet::new(),
            self.freshness_bound,
        );
        candidates.sort_by_key(|c| {
            (
                Reverse(c.free.size_key()),
                c.node.cluster.clone(),
                c.node.node.clone(),
            )
        });

        let mut placements = Vec::new();
        let mut remaining = count;

        for candidate in &candidates {
            if remaining == 0 {
                break;
            }
            let usable = candidate.free.saturating_sub(&self.headroom);
            let fits = usable.instances_of(&template.resources);
            let per_node_left = template.max_per_node.map_or(u64::MAX, |max| {
                u64::from(max.saturating_sub(already_placed.get(&candidate.node).copied().unwrap_or(0)))
            });
            let mut slots = fits.min(per_node_left).min(u64::from(remaining));

            while slots > 0 {
                match self.cache.reserve(&candidate.node, &template.resources, now) {
                    Ok(reservation) => {
                        placements.push(InstancePlacement {
                            node: reservation.node,
                            reservation: reservation.id,
                            generation: reservation.generation,
                        });
                        remaining -= 1;
                        slots -= 1;
                    }
                    Err(err) => {
                        debug!(node = %candidate.node, error = %err, "node filled up during batch pass");
                        break;
                    }
                }
            }
        }

        info!(
            requested = count,
            placed = placements.len(),
            deficit = remaining,
            nodes = candidates.len(),
            "batch pass complete"
        );
        BatchPlacement {
            placements,
            deficit: remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use rosfleet_state::{ClusterRegistration, NodeResourceSnapshot};

    use super::*;

    const UNIT: u64 = 1000;

    fn make_node(id: &str, units: u64) -> NodeResourceSnapshot {
        NodeResourceSnapshot::new(id, ResourceAmount::new(units * UNIT, 0))
    }

    fn setup(clusters: &[(&str, Vec<NodeResourceSnapshot>)], now: Instant) -> BatchScheduler {
        let cache = ResourceCache::new(Duration::from_secs(60));
        for (name, nodes) in clusters {
            cache.register(ClusterRegistration::simulated(name, vec![])).unwrap();
            cache.apply_refresh(name, nodes.clone(), now).unwrap();
        }
        BatchScheduler::new(cache, Duration::from_secs(30))
    }

    fn per_node(batch: &BatchPlacement) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for p in &batch.placements {
            *counts.entry(p.node.to_string()).or_default() += 1;
        }
        counts
    }

    #[test]
    fn fills_capacity_and_reports_deficit() {
        let now = Instant::now();
        let scheduler = setup(
            &[
                ("a", vec![make_node("a1", 5)]),
                ("b", vec![make_node("b1", 3)]),
                ("c", vec![make_node("c1", 2)]),
            ],
            now,
        );
        let template = JobTemplate::new(ResourceAmount::new(UNIT, 0));
        let batch = scheduler.schedule_batch(&template, 12, &BTreeMap::new(), now);

        assert_eq!(batch.placements.len(), 10);
        assert_eq!(batch.deficit, 2);
        assert_eq!(
            per_node(&batch),
            BTreeMap::from([
                ("a/a1".to_string(), 5),
                ("b/b1".to_string(), 3),
                ("c/c1".to_string(), 2),
            ])
        );
    }

    #[test]
    fn roomiest_node_is_filled_first() {
        let now = Instant::now();
        let scheduler = setup(&[("a", vec![make_node("a1", 2), make_node("a2", 5)])], now);
        let template = JobTemplate::new(ResourceAmount::new(UNIT, 0));
        let batch = scheduler.schedule_batch(&template, 4, &BTreeMap::new(), now);
        assert_eq!(batch.deficit, 0);
        assert_eq!(per_node(&batch), BTreeMap::from([("a/a2".to_string(), 4)]));
    }

    #[test]
    fn max_per_node_spreads_instances() {
        let now = Instant::now();
        let scheduler = setup(&[("a", vec![make_node("a1", 5), make_node("a2", 5)])], now);
        let mut template = JobTemplate::new(ResourceAmount::new(UNIT, 0));
        template.max_per_node = Some(2);

        let already = BTreeMap::from([(NodeRef::new("a", "a1"), 1)]);
        let batch = scheduler.schedule_batch(&template, 5, &already, now);
        assert_eq!(batch.placements.len(), 3);
        assert_eq!(batch.deficit, 2);
        assert_eq!(
            per_node(&batch),
            BTreeMap::from([("a/a1".to_string(), 1), ("a/a2".to_string(), 2)])
        );
    }

    #[test]
    fn headroom_is_left_free() {
        let now = Instant::now();
        let scheduler = setup(&[("a", vec![make_node("a1", 4)])], now)
            .with_headroom(ResourceAmount::new(300, 0));
        let template = JobTemplate::new(ResourceAmount::new(UNIT, 0));
        let batch = scheduler.schedule_batch(&template, 4, &BTreeMap::new(), now);
        assert_eq!(batch.placements.len(), 3);
        assert_eq!(batch.deficit, 1);
    }

    #[test]
    fn second_pass_picks_up_released_capacity() {
        let now = Instant::now();
        let scheduler = setup(&[("a", vec![make_node("a1", 2)])], now);
        let template = JobTemplate::new(ResourceAmount::new(UNIT, 0));

        let first = scheduler.schedule_batch(&template, 3, &BTreeMap::new(), now);
        assert_eq!(first.deficit, 1);

        scheduler
            .cache()
            .release(first.placements[0].reservation)
            .unwrap();
        let second = scheduler.schedule_batch(&template, first.deficit, &BTreeMap::new(), now);
        assert_eq!(second.placements.len(), 1);
        assert_eq!(second.deficit, 0);
    }

    #[test]
    fn zero_count_reserves_nothing() {
        let now = Instant::now();
        let scheduler = setup(&[("a", vec![make_node("a1", 2)])], now);
        let batch = scheduler.schedule_batch(
            &JobTemplate::new(ResourceAmount::new(UNIT, 0)),
            0,
            &BTreeMap::new(),
            now,
        );
        assert_eq!(batch, BatchPlacement::default());
        assert_eq!(scheduler.cache().live_reservations(), 0);
    }
}
