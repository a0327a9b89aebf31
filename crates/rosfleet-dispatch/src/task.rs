//! Dispatch tasks and their results.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use rosfleet_cluster::{WorkloadManifest, WorkloadRef, WorkloadStatus};

/// Gateway-assigned handle for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Entity that issued a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OwnerRef {
    Deployment(String),
    BatchJob(String),
}

impl OwnerRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Deployment(name) | Self::BatchJob(name) => name,
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment(name) => write!(f, "deployment/{name}"),
            Self::BatchJob(name) => write!(f, "batchjob/{name}"),
        }
    }
}

/// Routes a result back to the module or instance that asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    pub owner: OwnerRef,
    /// Module id or job instance id.
    pub unit: String,
    /// Owner generation the task was issued under.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOp {
    Apply(WorkloadManifest),
    Delete(WorkloadRef),
    FetchStatus(WorkloadRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Apply,
    Delete,
    FetchStatus,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Delete => write!(f, "delete"),
            Self::FetchStatus => write!(f, "fetch-status"),
        }
    }
}

impl TaskOp {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Apply(_) => OpKind::Apply,
            Self::Delete(_) => OpKind::Delete,
            Self::FetchStatus(_) => OpKind::FetchStatus,
        }
    }

    pub fn workload(&self) -> &WorkloadRef {
        match self {
            Self::Apply(manifest) => &manifest.workload,
            Self::Delete(workload) | Self::FetchStatus(workload) => workload,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::FetchStatus(_))
    }
}

/// The external resource a task touches. At most one task per key is
/// outstanding at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub cluster: String,
    pub workload: WorkloadRef,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.workload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub cluster: String,
    pub op: TaskOp,
    pub correlation: Correlation,
    /// Deliberate redo counter; part of the idempotency key.
    pub attempt: u32,
    /// Resubmissions after a timeout; not part of the key.
    pub retries: u32,
    pub idempotency_key: String,
}

impl DispatchTask {
    pub fn new(cluster: &str, op: TaskOp, correlation: Correlation, attempt: u32) -> Self {
        let idempotency_key = idempotency_key(cluster, &op, &correlation, attempt);
        Self {
            cluster: cluster.to_string(),
            op,
            correlation,
            attempt,
            retries: 0,
            idempotency_key,
        }
    }

    /// Same logical operation, submitted again after a timeout.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.retries += 1;
        next
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            cluster: self.cluster.clone(),
            workload: self.op.workload().clone(),
        }
    }
}

/// Stable digest of everything that identifies one logical operation.
pub fn idempotency_key(cluster: &str, op: &TaskOp, correlation: &Correlation, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    for part in [
        correlation.owner.to_string(),
        correlation.unit.clone(),
        correlation.generation.to_string(),
        op.kind().to_string(),
        cluster.to_string(),
        op.workload().to_string(),
        attempt.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ClusterUnreachable,
    AuthenticationFailed,
    Rejected,
    Timeout,
    Cancelled,
    /// The execution layer would not take the task.
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    Applied,
    Deleted,
    Status(WorkloadStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(TaskPayload),
    Failure { kind: FailureKind, message: String },
}

impl TaskOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub cluster: String,
    pub op: OpKind,
    pub idempotency_key: String,
    pub correlation: Correlation,
    pub outcome: TaskOutcome,
    /// Arrived after the task had already been failed with `Timeout`.
    pub late: bool,
}

impl TaskResult {
    pub fn new(task_id: TaskId, task: &DispatchTask, outcome: TaskOutcome) -> Self {
        Self {
            task_id,
            cluster: task.cluster.clone(),
            op: task.op.kind(),
            idempotency_key: task.idempotency_key.clone(),
            correlation: task.correlation.clone(),
            outcome,
            late: false,
        }
    }
}
