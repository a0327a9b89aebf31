//! rosfleet-core — shared types for the rosfleet control plane.
//!
//! # Components
//!
//! ```text
//! config    — fleet.toml model (scheduler, controller, dispatch, clusters)
//! duration  — "500ms" / "30s" / "2m" parsing and serde adapter
//! quantity  — Kubernetes resource quantities ("250m", "512Mi")
//! outcome   — closed response envelope surfaced by the controller
//! ```

pub mod config;
pub mod duration;
pub mod error;
pub mod outcome;
pub mod quantity;

pub use config::{
    BatchSection, ClusterKind, ClusterRegistration, ControllerSection, CredentialRef,
    DispatchSection, FleetConfig, SchedulerSection, SimulatedNode, SyncSection,
};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use outcome::{ErrorDetail, Outcome};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
