//! rosfleet-state — in-memory view of every registered cluster.
//!
//! # Architecture
//!
//! ```text
//!   ClusterSyncer ──apply_refresh──▶ ResourceCache ◀──reserve/commit/release── schedulers
//!                                      │
//!                                      ├── clusters: RwLock<name → nodes + handle + sync log>
//!                                      └── arena:    Mutex<ReservationArena>
//! ```
//!
//! A refresh replaces a cluster's node map in one write-locked step, so
//! readers see either the old inventory or the new one. The arena is the
//! single place capacity is held; `reserve` re-checks free capacity under
//! its lock, which is what prevents two schedulers from over-committing a
//! node.
//!
//! The `ResourceCache` is `Clone` + `Send` + `Sync` and can be shared
//! across async tasks. Lock order is always clusters, then arena.

pub mod cache;
pub mod error;
pub mod reservation;
pub mod types;

pub use cache::{CacheSnapshot, CapacityReservation, ClusterView, NodeUsage, NodeView, RefreshSummary, ResourceCache};
pub use error::{CacheError, CacheResult};
pub use reservation::{ReservationArena, ReservationEntry, ReservationId, ReservationState, Retirement};
pub use types::*;
