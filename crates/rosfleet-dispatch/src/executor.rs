//! Execution layer seam.
//!
//! The gateway hands tasks to an [`ExecutionLayer`] and gets an
//! acknowledgement back; the outcome arrives later as an
//! [`ExecutionReport`] on the channel the layer was built with.
//! [`LocalExecutor`] runs each task on the tokio runtime against the
//! cluster adapters in a [`ClusterRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rosfleet_cluster::{ClientError, ClusterRegistry};

use crate::error::{DispatchError, DispatchResult};
use crate::task::{DispatchTask, FailureKind, TaskId, TaskOp, TaskOutcome, TaskPayload};

/// Outcome of one task as reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

#[async_trait]
pub trait ExecutionLayer: Send + Sync {
    /// Accept a task for execution. Returning `Ok` means a report for
    /// `id` will eventually be sent, unless the layer itself goes away.
    async fn submit(&self, id: TaskId, task: DispatchTask) -> DispatchResult<()>;

    /// Best-effort cancellation; a `Cancelled` report follows if the task
    /// was still running.
    async fn cancel(&self, id: TaskId);
}

// ── Local executor ──────────────────────────────────────────────

pub struct LocalExecutor {
    registry: ClusterRegistry,
    reports: mpsc::UnboundedSender<ExecutionReport>,
    running: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

impl LocalExecutor {
    /// Returns the executor and the receiving end of its report channel.
    pub fn new(registry: ClusterRegistry) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            registry,
            reports: tx,
            running: Arc::new(Mutex::new(HashMap::new())),
        });
        (executor, rx)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.running().len()
    }
}

fn failure_from_client(err: ClientError) -> TaskOutcome {
    let kind = match &err {
        ClientError::Unreachable(_) | ClientError::Decode(_) => FailureKind::ClusterUnreachable,
        ClientError::AuthenticationFailed(_) => FailureKind::AuthenticationFailed,
        ClientError::Rejected { .. } => FailureKind::Rejected,
    };
    TaskOutcome::failure(kind, err.to_string())
}

#[async_trait]
impl ExecutionLayer for LocalExecutor {
    async fn submit(&self, id: TaskId, task: DispatchTask) -> DispatchResult<()> {
        let Some(client) = self.registry.get(&task.cluster) else {
            return Err(DispatchError::Refused(format!(
                "no adapter for cluster {}",
                task.cluster
            )));
        };
        if self.reports.is_closed() {
            return Err(DispatchError::Refused("report channel closed".into()));
        }

        let reports = self.reports.clone();
        let running = Arc::clone(&self.running);
        // Held across spawn so the task's own removal cannot run first.
        let mut guard = self.running();
        let handle = tokio::spawn(async move {
            let result = match &task.op {
                TaskOp::Apply(manifest) => client.apply(manifest).await.map(|()| TaskPayload::Applied),
                TaskOp::Delete(workload) => client.delete(workload).await.map(|()| TaskPayload::Deleted),
                TaskOp::FetchStatus(workload) => {
                    client.workload_status(workload).await.map(TaskPayload::Status)
                }
            };
            let outcome = match result {
                Ok(payload) => TaskOutcome::Success(payload),
                Err(err) => failure_from_client(err),
            };
            debug!(task = %id, cluster = %task.cluster, op = %task.op.kind(), ok = outcome.is_success(), "task finished");
            running.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            if reports.send(ExecutionReport { task_id: id, outcome }).is_err() {
                warn!(task = %id, "report dropped, gateway is gone");
            }
        });
        guard.insert(id, handle);
        Ok(())
    }

    async fn cancel(&self, id: TaskId) {
        let handle = self.running().remove(&id);
        if let Some(handle) = handle {
            handle.abort();
            debug!(task = %id, "task cancelled");
            let _ = self.reports.send(ExecutionReport {
                task_id: id,
                outcome: TaskOutcome::failure(FailureKind::Cancelled, "cancelled by gateway"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosfleet_cluster::{InMemoryCluster, RestartPolicy, WorkloadManifest, WorkloadRef};
    use rosfleet_state::ResourceAmount;

    use crate::task::{Correlation, OwnerRef};

    fn apply_task(cluster: &str, name: &str) -> DispatchTask {
        DispatchTask::new(
            cluster,
            TaskOp::Apply(WorkloadManifest {
                workload: WorkloadRef::new("rosfleet", name),
                node: "n1".into(),
                image: "ros:humble".into(),
                resources: ResourceAmount::new(500, 1 << 30),
                env: Default::default(),
                labels: Default::default(),
                image_pull_secret: None,
                restart: RestartPolicy::Always,
            }),
            Correlation {
                owner: OwnerRef::Deployment("d".into()),
                unit: name.into(),
                generation: 1,
            },
            0,
        )
    }

    #[tokio::test]
    async fn runs_task_and_reports() {
        let registry = ClusterRegistry::new();
        let cluster = Arc::new(
            InMemoryCluster::new("lab").with_node("n1", ResourceAmount::new(4000, 8 << 30)),
        );
        registry.insert(cluster.clone());
        let (executor, mut reports) = LocalExecutor::new(registry);

        executor.submit(TaskId(1), apply_task("lab", "nav")).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.task_id, TaskId(1));
        assert_eq!(report.outcome, TaskOutcome::Success(TaskPayload::Applied));
        assert_eq!(cluster.apply_calls(), 1);
    }

    #[tokio::test]
    async fn adapter_errors_map_to_failure_kinds() {
        let registry = ClusterRegistry::new();
        let cluster = Arc::new(InMemoryCluster::new("lab"));
        cluster.set_reachable(false);
        registry.insert(cluster.clone());
        let (executor, mut reports) = LocalExecutor::new(registry);

        executor.submit(TaskId(7), apply_task("lab", "nav")).await.unwrap();
        let report = reports.recv().await.unwrap();
        assert!(matches!(
            report.outcome,
            TaskOutcome::Failure { kind: FailureKind::ClusterUnreachable, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_cluster_is_refused() {
        let (executor, _reports) = LocalExecutor::new(ClusterRegistry::new());
        let err = executor.submit(TaskId(1), apply_task("ghost", "nav")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Refused(_)));
    }
}
