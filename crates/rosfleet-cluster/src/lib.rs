//! rosfleet-cluster — talking to registered clusters.
//!
//! # Components
//!
//! ```text
//! ClusterClient (trait)
//!   ├── KubeApiClient     — REST client, one DistributionProfile per kind
//!   │     ├── KubernetesProfile
//!   │     └── K3sProfile
//!   └── InMemoryCluster   — simulated inventory for tests and dry runs
//!
//! ClusterRegistry  — name → Arc<dyn ClusterClient>
//! ClusterSyncer    — refresh(cluster): adapter → ResourceCache
//! ```
//!
//! The scheduler never branches on cluster kind; everything that differs
//! between distributions sits behind `DistributionProfile`.

pub mod client;
pub mod error;
pub mod kube;
pub mod memory;
pub mod profile;
pub mod registry;
pub mod sync;
pub mod workload;

pub use client::ClusterClient;
pub use error::{ClientError, ClientResult, SyncError, SyncResult};
pub use kube::KubeApiClient;
pub use memory::InMemoryCluster;
pub use profile::{DistributionProfile, K3sProfile, KubernetesProfile, profile_for};
pub use registry::{ClusterRegistry, connect, resolve_credential};
pub use sync::ClusterSyncer;
pub use workload::{RestartPolicy, WorkloadManifest, WorkloadRef, WorkloadStatus};
