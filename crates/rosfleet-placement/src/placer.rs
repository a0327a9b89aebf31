//! Placement scheduler: all-or-nothing plans for a deployment's modules.
//!
//! Modules are placed largest first (first-fit-decreasing); equal sizes
//! keep declaration order. Each module takes the best ranked candidate
//! that accepts a reservation. A lost reservation race re-reads the cache
//! and tries again, up to the retry limit. If any module cannot be
//! placed, every reservation taken during the call is released before
//! the error is returned.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use rosfleet_core::SchedulerSection;
use rosfleet_state::{CacheSnapshot, NodeRef, ResourceCache};

use crate::error::{PlacementError, PlacementResult};
use crate::request::{DeploymentPlan, ModulePlacement, ModuleRequest, PlacementContext};
use crate::scorer::{filter_candidates, rank_candidates};

#[derive(Clone)]
pub struct PlacementScheduler {
    cache: ResourceCache,
    freshness_bound: Duration,
    retry_limit: u32,
}

impl PlacementScheduler {
    pub fn new(cache: ResourceCache, freshness_bound: Duration, retry_limit: u32) -> Self {
        Self {
            cache,
            freshness_bound,
            retry_limit,
        }
    }

    pub fn from_config(cache: ResourceCache, config: &SchedulerSection) -> Self {
        Self::new(cache, config.freshness_bound, config.reserve_retry_limit)
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Compute and reserve a plan for `modules`.
    pub fn schedule(
        &self,
        modules: &[ModuleRequest],
        context: &PlacementContext,
        now: Instant,
    ) -> PlacementResult<DeploymentPlan> {
        if modules.is_empty() {
            return Err(PlacementError::InvalidRequest("empty module set".into()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = modules.iter().find(|m| !seen.insert(m.module_id.as_str())) {
            return Err(PlacementError::InvalidRequest(format!(
                "duplicate module id {}",
                dup.module_id
            )));
        }

        let mut order: Vec<usize> = (0..modules.len()).collect();
        order.sort_by_key(|&i| (Reverse(modules[i].resources.size_key()), i));

        let mut colocated: BTreeMap<String, usize> = BTreeMap::new();
        for kept in &context.preserved {
            *colocated.entry(kept.node.cluster.clone()).or_default() += 1;
        }

        let mut snapshot = self.cache.snapshot(now);
        let mut placed: Vec<(usize, ModulePlacement)> = Vec::with_capacity(modules.len());

        for &index in &order {
            match self.place_one(&modules[index], context, &colocated, &mut snapshot, now) {
                Ok(placement) => {
                    *colocated.entry(placement.node.cluster.clone()).or_default() += 1;
                    placed.push((index, placement));
                }
                Err(err) => {
                    self.unwind(&placed);
                    warn!(module = %modules[index].module_id, error = %err, released = placed.len(), "placement failed");
                    return Err(err);
                }
            }
        }

        placed.sort_by_key(|(index, _)| *index);
        let plan = DeploymentPlan {
            placements: placed.into_iter().map(|(_, p)| p).collect(),
        };
        info!(
            modules = plan.len(),
            clusters = colocated.len(),
            "placement plan reserved"
        );
        Ok(plan)
    }

    fn place_one(
        &self,
        module: &ModuleRequest,
        context: &PlacementContext,
        colocated: &BTreeMap<String, usize>,
        snapshot: &mut CacheSnapshot,
        now: Instant,
    ) -> PlacementResult<ModulePlacement> {
        let mut refused: BTreeSet<NodeRef> = context.excluded.clone();
        let mut conflicts = 0u32;

        loop {
            let mut candidates = filter_candidates(
                snapshot,
                &module.resources,
                &module.constraints,
                &refused,
                self.freshness_bound,
            );
            rank_candidates(&mut candidates, colocated);

            let Some(best) = candidates.first() else {
                return Err(PlacementError::InsufficientResources {
                    module: module.module_id.clone(),
                    detail: format!(
                        "no eligible node has {} free ({} lost reservation races)",
                        module.resources, conflicts
                    ),
                });
            };

            match self.cache.reserve(&best.node, &module.resources, now) {
                Ok(reservation) => {
                    if let Some(view) = snapshot
                        .clusters
                        .get_mut(&best.node.cluster)
                        .and_then(|c| c.nodes.get_mut(&best.node.node))
                    {
                        view.free = view.free.saturating_sub(&module.resources);
                    }
                    debug!(module = %module.module_id, node = %best.node, reservation = %reservation.id, "module placed");
                    return Ok(ModulePlacement {
                        module_id: module.module_id.clone(),
                        node: reservation.node,
                        reservation: reservation.id,
                        generation: reservation.generation,
                    });
                }
                Err(err) => {
                    conflicts += 1;
                    debug!(module = %module.module_id, node = %best.node, error = %err, conflicts, "reservation race lost");
                    if conflicts > self.retry_limit {
                        return Err(PlacementError::InsufficientResources {
                            module: module.module_id.clone(),
                            detail: format!("gave up after {conflicts} lost reservation races"),
                        });
                    }
                    refused.insert(best.node.clone());
                    *snapshot = self.cache.snapshot(now);
                }
            }
        }
    }

    fn unwind(&self, placed: &[(usize, ModulePlacement)]) {
        for (_, placement) in placed {
            if let Err(err) = self.cache.release(placement.reservation) {
                warn!(reservation = %placement.reservation, error = %err, "release during unwind failed");
            }
        }
    }
}
