//! rosfleet placement — decides which cluster and node run each workload.
//!
//! Both schedulers read a [`CacheSnapshot`](rosfleet_state::CacheSnapshot),
//! rank candidates, and hold capacity through the cache's
//! compare-and-reserve. Neither mutates the inventory.
//!
//! # Components
//!
//! - **`scorer`**: hard-constraint filtering and deterministic ranking
//! - **`placer`**: all-or-nothing deployment plans (first-fit-decreasing)
//! - **`batch`**: best-effort fill for homogeneous job instances
//! - **`request`**: module requests, constraints and plans

pub mod batch;
pub mod error;
pub mod placer;
pub mod request;
pub mod scorer;

pub use batch::{BatchPlacement, BatchScheduler, InstancePlacement, JobTemplate};
pub use error::{PlacementError, PlacementResult};
pub use placer::PlacementScheduler;
pub use request::{DeploymentPlan, ModulePlacement, ModuleRequest, PlacementConstraints, PlacementContext};
pub use scorer::{Candidate, Rejection, check_node, filter_candidates, rank_candidates};
