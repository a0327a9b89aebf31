//! Deployment lifecycle types.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use rosfleet_cluster::WorkloadRef;
use rosfleet_dispatch::{DispatchTask, OpKind};
use rosfleet_placement::{ModulePlacement, ModuleRequest};

use crate::error::ManifestResult;
use crate::manifest::ModuleManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentPhase {
    /// Accepted, no plan yet.
    Pending,
    Scheduling,
    Deploying,
    Running,
    Degraded,
    /// Re-placing displaced modules; the rest stay where they are.
    Rescheduling,
    Terminated,
    Failed,
}

impl DeploymentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulePhase {
    Unplaced,
    Applying,
    Running,
    /// Status polls cannot reach the module's cluster.
    Unreachable,
    /// Apply failed or the workload vanished; waiting on recovery.
    Lost,
}

/// What one module wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub request: ModuleRequest,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub image_pull_secret: Option<String>,
}

impl ModuleSpec {
    pub fn from_manifest(module: &ModuleManifest) -> ManifestResult<Self> {
        Ok(Self {
            request: module.to_request()?,
            image: module.image.clone(),
            env: module.env.clone(),
            image_pull_secret: module.registry_secret.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.request.module_id
    }
}

/// How a module's placement holds node capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Reserved,
    Committed,
    Released,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingTask {
    pub key: String,
    pub op: OpKind,
    pub task: DispatchTask,
}

#[derive(Debug, Clone)]
pub struct ModuleState {
    pub spec: ModuleSpec,
    pub phase: ModulePhase,
    pub placement: Option<ModulePlacement>,
    pub hold: Hold,
    /// Where the workload was last applied: cluster and object.
    pub deployed: Option<(String, WorkloadRef)>,
    /// Recovery attempts on the current placement.
    pub recoveries: u32,
    /// Deliberate re-applies; part of the idempotency key and of the
    /// object name on the cluster.
    pub attempt: u32,
    pub unreachable_since: Option<Instant>,
    pub last_error: Option<String>,
    pub(crate) pending: Option<PendingTask>,
}

impl ModuleState {
    pub fn new(spec: ModuleSpec) -> Self {
        Self {
            spec,
            phase: ModulePhase::Unplaced,
            placement: None,
            hold: Hold::Released,
            deployed: None,
            recoveries: 0,
            attempt: 0,
            unreachable_since: None,
            last_error: None,
            pending: None,
        }
    }

    pub fn id(&self) -> &str {
        self.spec.id()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub id: String,
    pub phase: ModulePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&ModuleState> for ModuleStatus {
    fn from(state: &ModuleState) -> Self {
        Self {
            id: state.id().to_string(),
            phase: state.phase,
            cluster: state.placement.as_ref().map(|p| p.node.cluster.clone()),
            node: state.placement.as_ref().map(|p| p.node.node.clone()),
            last_error: state.last_error.clone(),
        }
    }
}

/// Externally visible state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub name: String,
    pub phase: DeploymentPhase,
    pub generation: u64,
    pub modules: Vec<ModuleStatus>,
}
