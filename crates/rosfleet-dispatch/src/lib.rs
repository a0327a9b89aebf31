//! rosfleet-dispatch — the boundary to the asynchronous execution layer.
//!
//! # Architecture
//!
//! ```text
//!  controllers ──submit──▶ DispatchGateway ──submit/cancel──▶ ExecutionLayer
//!       ▲                    │  busy: (cluster, workload) → task       │
//!       │                    │  queued: per resource key, FIFO         │
//!       └────poll_all────────┤  by_key / completed: idempotency        │
//!                            └◀──────────── ExecutionReport (mpsc) ◀───┘
//!
//!  PeriodicScheduler ──try_acquire──▶ LeaderLock (one owner per job per interval)
//! ```
//!
//! At most one task per (cluster, workload) is outstanding; later
//! submissions for the same resource wait in a queue. A task with no
//! report before its deadline is failed with `Timeout`; the report, if it
//! still arrives, is delivered flagged `late`.

pub mod error;
pub mod executor;
pub mod gateway;
pub mod lease;
pub mod periodic;
pub mod task;

pub use error::{DispatchError, DispatchResult, LeaseError};
pub use executor::{ExecutionLayer, ExecutionReport, LocalExecutor};
pub use gateway::{DispatchGateway, Submission};
pub use lease::{InMemoryLeaseStore, Lease, LeaderLock};
pub use periodic::{BoxFuture, PeriodicFactory, PeriodicScheduler};
pub use task::{
    Correlation, DispatchTask, FailureKind, OpKind, OwnerRef, ResourceKey, TaskId, TaskOp,
    TaskOutcome, TaskPayload, TaskResult,
};
