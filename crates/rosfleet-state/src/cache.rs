//! The resource state cache.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use rosfleet_core::epoch_secs;

use crate::error::{CacheError, CacheResult};
use crate::reservation::{ReservationArena, ReservationEntry, ReservationId, ReservationState, Retirement};
use crate::types::*;

const DEFAULT_LOG_CAPACITY: usize = 32;

/// A capacity hold handed out by [`ResourceCache::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityReservation {
    pub id: ReservationId,
    pub node: NodeRef,
    pub amount: ResourceAmount,
    pub generation: u64,
    pub expires_at: Instant,
}

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub generation: u64,
    pub nodes: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub invalidated: Vec<ReservationId>,
}

/// Accounting for one node at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub capacity: ResourceAmount,
    pub reported_available: ResourceAmount,
    pub committed: ResourceAmount,
    pub reserved: ResourceAmount,
    pub free: ResourceAmount,
}

#[derive(Debug, Clone)]
pub struct NodeView {
    pub node: NodeResourceSnapshot,
    pub committed: ResourceAmount,
    pub reserved: ResourceAmount,
    /// What a new reservation could take right now.
    pub free: ResourceAmount,
}

#[derive(Debug, Clone)]
pub struct ClusterView {
    pub name: String,
    pub kind: ClusterKind,
    pub reachability: Reachability,
    pub last_error: Option<SyncFailure>,
    pub generation: u64,
    pub staleness: Option<Duration>,
    pub nodes: BTreeMap<String, NodeView>,
}

impl ClusterView {
    /// Reachable and synced within `bound`.
    pub fn is_fresh(&self, bound: Duration) -> bool {
        self.reachability == Reachability::Reachable
            && self.staleness.is_some_and(|age| age <= bound)
    }
}

/// Read-only copy of the cache, consistent per cluster.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub taken_at: Instant,
    pub clusters: BTreeMap<String, ClusterView>,
}

impl CacheSnapshot {
    pub fn cluster(&self, name: &str) -> Option<&ClusterView> {
        self.clusters.get(name)
    }

    pub fn node(&self, node: &NodeRef) -> Option<&NodeView> {
        self.clusters.get(&node.cluster)?.nodes.get(&node.node)
    }

    /// Every node, in (cluster, node) order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeRef, &ClusterView, &NodeView)> {
        self.clusters.values().flat_map(|cluster| {
            cluster
                .nodes
                .iter()
                .map(move |(id, view)| (NodeRef::new(&cluster.name, id), cluster, view))
        })
    }
}

struct ClusterEntry {
    handle: ClusterHandle,
    nodes: BTreeMap<String, NodeResourceSnapshot>,
    log: VecDeque<SyncLogEntry>,
}

impl ClusterEntry {
    fn push_log(&mut self, event: SyncEvent, capacity: usize) {
        if self.log.len() >= capacity {
            self.log.pop_front();
        }
        self.log.push_back(SyncLogEntry {
            at: epoch_secs(),
            event,
        });
    }
}

struct CacheInner {
    clusters: RwLock<BTreeMap<String, ClusterEntry>>,
    arena: Mutex<ReservationArena>,
    reservation_ttl: Duration,
    log_capacity: usize,
}

/// Shared, in-memory cluster inventory plus the reservation arena.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

fn free_capacity(
    node: &NodeResourceSnapshot,
    committed: &ResourceAmount,
    reserved: &ResourceAmount,
) -> ResourceAmount {
    // Committed workloads show up in `available` once the cluster runs
    // them, so take the tighter of the two views before subtracting holds.
    node.available
        .min(&node.capacity.saturating_sub(committed))
        .saturating_sub(reserved)
}

impl ResourceCache {
    pub fn new(reservation_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                clusters: RwLock::new(BTreeMap::new()),
                arena: Mutex::new(ReservationArena::new()),
                reservation_ttl,
                log_capacity: DEFAULT_LOG_CAPACITY,
            }),
        }
    }

    /// Set the per-cluster sync log length. Only effective before the
    /// cache is shared.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.log_capacity = capacity.max(1);
        }
        self
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.inner.reservation_ttl
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ClusterEntry>> {
        self.inner.clusters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ClusterEntry>> {
        self.inner.clusters.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn arena(&self) -> MutexGuard<'_, ReservationArena> {
        self.inner.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ───────────────────────────────────────────

    pub fn register(&self, registration: ClusterRegistration) -> CacheResult<()> {
        let mut clusters = self.write();
        let name = registration.name.clone();
        if clusters.contains_key(&name) {
            return Err(CacheError::ClusterExists(name));
        }
        info!(cluster = %name, kind = %registration.kind, "cluster registered");
        clusters.insert(
            name,
            ClusterEntry {
                handle: ClusterHandle::new(registration),
                nodes: BTreeMap::new(),
                log: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Remove a cluster and invalidate every reservation on it.
    pub fn deregister(&self, name: &str) -> CacheResult<Vec<ReservationId>> {
        let mut clusters = self.write();
        if clusters.remove(name).is_none() {
            return Err(CacheError::UnknownCluster(name.to_string()));
        }
        let mut arena = self.arena();
        let ids = arena.ids_where(|e| e.node.cluster == name);
        for id in &ids {
            arena.retire(*id, Retirement::Invalidated)?;
        }
        info!(cluster = %name, invalidated = ids.len(), "cluster deregistered");
        Ok(ids)
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn handle(&self, name: &str) -> Option<ClusterHandle> {
        self.read().get(name).map(|e| e.handle.clone())
    }

    pub fn registration(&self, name: &str) -> Option<ClusterRegistration> {
        self.read().get(name).map(|e| e.handle.registration.clone())
    }

    pub fn sync_log(&self, name: &str) -> Vec<SyncLogEntry> {
        self.read()
            .get(name)
            .map(|e| e.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Sync path ──────────────────────────────────────────────

    /// Replace a cluster's whole node inventory.
    ///
    /// Reservations and allocations on nodes that disappeared are
    /// invalidated in the same critical section, so no reservation ever
    /// refers to a node the current inventory no longer has.
    pub fn apply_refresh(
        &self,
        name: &str,
        nodes: Vec<NodeResourceSnapshot>,
        now: Instant,
    ) -> CacheResult<RefreshSummary> {
        let capacity = self.inner.log_capacity;
        let mut clusters = self.write();
        let entry = clusters
            .get_mut(name)
            .ok_or_else(|| CacheError::UnknownCluster(name.to_string()))?;

        let fresh: BTreeMap<String, NodeResourceSnapshot> =
            nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect();
        let old_ids: BTreeSet<&String> = entry.nodes.keys().collect();
        let new_ids: BTreeSet<&String> = fresh.keys().collect();
        let added: Vec<String> = new_ids.difference(&old_ids).map(|s| s.to_string()).collect();
        let removed: Vec<String> = old_ids.difference(&new_ids).map(|s| s.to_string()).collect();

        let mut invalidated = Vec::new();
        if !removed.is_empty() {
            let mut arena = self.arena();
            invalidated = arena.ids_where(|e| e.node.cluster == name && removed.contains(&e.node.node));
            for id in &invalidated {
                arena.retire(*id, Retirement::Invalidated)?;
            }
        }

        entry.nodes = fresh;
        entry.handle.generation += 1;
        entry.handle.reachability = Reachability::Reachable;
        entry.handle.last_sync = Some(now);
        entry.handle.last_error = None;

        let generation = entry.handle.generation;
        let node_count = entry.nodes.len();
        if !added.is_empty() {
            info!(cluster = %name, nodes = ?added, "new nodes found");
            entry.push_log(SyncEvent::NodesAdded { nodes: added.clone() }, capacity);
        }
        if !removed.is_empty() {
            warn!(cluster = %name, nodes = ?removed, invalidated = invalidated.len(), "nodes left the cluster");
            entry.push_log(
                SyncEvent::NodesRemoved {
                    nodes: removed.clone(),
                    invalidated: invalidated.len(),
                },
                capacity,
            );
        }
        entry.push_log(
            SyncEvent::Synced {
                generation,
                nodes: node_count,
            },
            capacity,
        );
        debug!(cluster = %name, generation, nodes = node_count, "inventory refreshed");

        Ok(RefreshSummary {
            generation,
            nodes: node_count,
            added,
            removed,
            invalidated,
        })
    }

    /// Record a failed sync. The last inventory is kept; it just ages.
    pub fn mark_unreachable(&self, name: &str, failure: SyncFailure) -> CacheResult<()> {
        let capacity = self.inner.log_capacity;
        let mut clusters = self.write();
        let entry = clusters
            .get_mut(name)
            .ok_or_else(|| CacheError::UnknownCluster(name.to_string()))?;
        warn!(cluster = %name, kind = ?failure.kind, error = %failure.message, "cluster sync failed");
        entry.handle.reachability = Reachability::Unreachable;
        entry.handle.last_error = Some(failure.clone());
        entry.push_log(SyncEvent::Failed { failure }, capacity);
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn snapshot(&self, now: Instant) -> CacheSnapshot {
        let clusters = self.read();
        let arena = self.arena();

        let mut held: BTreeMap<&NodeRef, (ResourceAmount, ResourceAmount)> = BTreeMap::new();
        for (_, entry) in arena.iter() {
            let slot = held.entry(&entry.node).or_default();
            match entry.state {
                ReservationState::Committed => slot.0 = slot.0.saturating_add(&entry.amount),
                ReservationState::Live { expires_at } if expires_at > now => {
                    slot.1 = slot.1.saturating_add(&entry.amount)
                }
                ReservationState::Live { .. } => {}
            }
        }

        let views = clusters
            .iter()
            .map(|(name, entry)| {
                let nodes = entry
                    .nodes
                    .iter()
                    .map(|(id, node)| {
                        let key = NodeRef::new(name, id);
                        let (committed, reserved) = held.get(&key).cloned().unwrap_or_default();
                        let free = free_capacity(node, &committed, &reserved);
                        (
                            id.clone(),
                            NodeView {
                                node: node.clone(),
                                committed,
                                reserved,
                                free,
                            },
                        )
                    })
                    .collect();
                (
                    name.clone(),
                    ClusterView {
                        name: name.clone(),
                        kind: entry.handle.kind(),
                        reachability: entry.handle.reachability,
                        last_error: entry.handle.last_error.clone(),
                        generation: entry.handle.generation,
                        staleness: entry.handle.staleness(now),
                        nodes,
                    },
                )
            })
            .collect();

        CacheSnapshot {
            taken_at: now,
            clusters: views,
        }
    }

    pub fn usage(&self, node: &NodeRef, now: Instant) -> Option<NodeUsage> {
        let clusters = self.read();
        let snapshot = clusters.get(&node.cluster)?.nodes.get(&node.node)?;
        let (committed, reserved) = self.arena().held_on(node, now);
        Some(NodeUsage {
            capacity: snapshot.capacity.clone(),
            reported_available: snapshot.available.clone(),
            free: free_capacity(snapshot, &committed, &reserved),
            committed,
            reserved,
        })
    }

    pub fn reservation(&self, id: ReservationId) -> CacheResult<ReservationEntry> {
        self.arena().get(id).cloned()
    }

    pub fn live_reservations(&self) -> usize {
        self.arena().len()
    }

    // ── Reservation lifecycle ──────────────────────────────────

    /// Compare-and-reserve: free capacity is re-checked under the arena
    /// lock, so a concurrent reservation that got there first wins.
    pub fn reserve(
        &self,
        node: &NodeRef,
        amount: &ResourceAmount,
        now: Instant,
    ) -> CacheResult<CapacityReservation> {
        let clusters = self.read();
        let entry = clusters
            .get(&node.cluster)
            .ok_or_else(|| CacheError::UnknownCluster(node.cluster.clone()))?;
        let snapshot = entry
            .nodes
            .get(&node.node)
            .ok_or_else(|| CacheError::UnknownNode(node.clone()))?;
        if !snapshot.schedulable {
            return Err(CacheError::NodeUnschedulable(node.clone()));
        }

        let mut arena = self.arena();
        let (committed, reserved) = arena.held_on(node, now);
        let free = free_capacity(snapshot, &committed, &reserved);
        if !amount.fits_within(&free) {
            debug!(%node, requested = %amount, %free, "reservation refused");
            return Err(CacheError::InsufficientCapacity {
                node: node.clone(),
                requested: amount.clone(),
                free,
            });
        }

        let expires_at = now + self.inner.reservation_ttl;
        let generation = entry.handle.generation;
        let id = arena.insert(ReservationEntry {
            node: node.clone(),
            amount: amount.clone(),
            generation,
            state: ReservationState::Live { expires_at },
        });
        debug!(%node, reservation = %id, requested = %amount, "capacity reserved");

        Ok(CapacityReservation {
            id,
            node: node.clone(),
            amount: amount.clone(),
            generation,
            expires_at,
        })
    }

    pub fn release(&self, id: ReservationId) -> CacheResult<()> {
        let entry = self.arena().retire(id, Retirement::Released)?;
        debug!(node = %entry.node, reservation = %id, "capacity released");
        Ok(())
    }

    pub fn commit(&self, id: ReservationId, now: Instant) -> CacheResult<()> {
        self.arena().commit(id, now)?;
        debug!(reservation = %id, "reservation committed");
        Ok(())
    }

    /// Retire every live reservation past its expiry.
    pub fn expire(&self, now: Instant) -> Vec<ReservationId> {
        let mut arena = self.arena();
        let expired = arena.expired(now);
        for id in &expired {
            let _ = arena.retire(*id, Retirement::Expired);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired uncommitted reservations");
        }
        expired
    }
}
