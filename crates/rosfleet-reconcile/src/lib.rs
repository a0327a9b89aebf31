//! rosfleet-reconcile — desired-vs-actual convergence for deployments and
//! batch jobs.
//!
//! # Architecture
//!
//! ```text
//!   manifest ──▶ Supervisor ──▶ DeploymentController ─┐
//!                    │      └─▶ BatchJobController ───┤ Vec<Command>
//!                    │                                ▼
//!                    └──────── DispatchGateway ◀── submit / cancel
//!                                    │
//!                              TaskResult (poll_all) ──▶ routed by owner
//! ```
//!
//! Controllers are plain state machines: they read the resource cache
//! through their schedulers, hold reservations, and return commands.
//! Only the supervisor talks to the gateway.

pub mod backoff;
pub mod batch_job;
pub mod command;
pub mod controller;
pub mod deployment;
pub mod error;
pub mod manifest;
pub mod supervisor;

pub use backoff::{ControllerPolicy, RetryPolicy, RetryState};
pub use batch_job::{
    BatchJobController, BatchJobSpec, BatchPhase, BatchStatus, InstanceStatus, JobInstance,
    JobStatus,
};
pub use command::Command;
pub use controller::DeploymentController;
pub use deployment::{
    DeploymentPhase, DeploymentStatus, Hold, ModulePhase, ModuleSpec, ModuleState, ModuleStatus,
};
pub use error::{ManifestError, ManifestResult, ReconcileError, ReconcileResult};
pub use manifest::{DeploymentManifest, ModuleManifest, SweepSpec, VaryingParam};
pub use supervisor::Supervisor;
