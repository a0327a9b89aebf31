//! Supervisor: owns every controller and connects them to the gateway.
//!
//! Each `tick` drains task results from the dispatch gateway, routes them
//! to the owning deployment or batch job by correlation, lets every
//! controller reconcile, and executes the resulting commands. Controller
//! state sits behind one std mutex that is never held across an await;
//! commands are collected under the lock and executed after it is
//! dropped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use rosfleet_core::Outcome;
use rosfleet_dispatch::{DispatchGateway, OwnerRef, Submission, TaskResult};
use rosfleet_placement::{BatchScheduler, PlacementScheduler};

use crate::backoff::ControllerPolicy;
use crate::batch_job::{BatchJobController, BatchJobSpec, BatchStatus};
use crate::command::Command;
use crate::controller::DeploymentController;
use crate::deployment::{DeploymentPhase, DeploymentStatus};
use crate::error::{ReconcileError, ReconcileResult};
use crate::manifest::DeploymentManifest;

#[derive(Default)]
struct Controllers {
    deployments: BTreeMap<String, DeploymentController>,
    jobs: BTreeMap<String, BatchJobController>,
}

impl Controllers {
    fn contains(&self, name: &str) -> bool {
        self.deployments.contains_key(name) || self.jobs.contains_key(name)
    }

    fn route(&mut self, result: &TaskResult, now: Instant) -> Vec<Command> {
        match &result.correlation.owner {
            OwnerRef::Deployment(name) => match self.deployments.get_mut(name) {
                Some(ctl) => ctl.on_result(result, now),
                None => {
                    debug!(deployment = %name, task = %result.task_id, "result for retired deployment");
                    Vec::new()
                }
            },
            OwnerRef::BatchJob(name) => match self.jobs.get_mut(name) {
                Some(job) => job.on_result(result, now),
                None => {
                    debug!(job = %name, task = %result.task_id, "result for retired batch job");
                    Vec::new()
                }
            },
        }
    }
}

struct Inner {
    gateway: DispatchGateway,
    scheduler: PlacementScheduler,
    batch: BatchScheduler,
    policy: ControllerPolicy,
    controllers: Mutex<Controllers>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        gateway: DispatchGateway,
        scheduler: PlacementScheduler,
        batch: BatchScheduler,
        policy: ControllerPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                scheduler,
                batch,
                policy,
                controllers: Mutex::new(Controllers::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Controllers> {
        self.inner.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gateway(&self) -> &DispatchGateway {
        &self.inner.gateway
    }

    /// Accept a manifest. Nothing is reserved until the next tick.
    pub fn submit(&self, manifest: &DeploymentManifest) -> ReconcileResult<()> {
        let mut controllers = self.lock();
        if controllers.contains(&manifest.name) {
            let kind = if manifest.is_batch() { "batch job" } else { "deployment" };
            return Err(ReconcileError::Exists {
                kind,
                name: manifest.name.clone(),
            });
        }

        if manifest.is_batch() {
            let spec = BatchJobSpec::from_manifest(manifest)?;
            let job = BatchJobController::new(
                spec,
                self.inner.batch.clone(),
                self.inner.policy.status_poll_interval,
            );
            controllers.jobs.insert(manifest.name.clone(), job);
        } else {
            let ctl = DeploymentController::from_manifest(
                manifest,
                self.inner.scheduler.clone(),
                self.inner.policy,
            )?;
            controllers.deployments.insert(manifest.name.clone(), ctl);
            info!(deployment = %manifest.name, modules = manifest.modules.len(), "deployment accepted");
        }
        Ok(())
    }

    /// One reconciliation round. Returns the number of commands executed.
    pub async fn tick(&self, now: Instant) -> usize {
        let results = self.inner.gateway.poll_all(now).await;
        let commands = {
            let mut controllers = self.lock();
            let mut commands = Vec::new();
            for result in &results {
                commands.extend(controllers.route(result, now));
            }
            for ctl in controllers.deployments.values_mut() {
                commands.extend(ctl.reconcile(now));
            }
            for job in controllers.jobs.values_mut() {
                commands.extend(job.reconcile(now));
            }
            commands
        };
        self.execute(commands, now).await
    }

    /// Stop a deployment or batch job. Its controller stays queryable
    /// until [`Supervisor::retire`] drops it.
    pub async fn terminate(&self, name: &str, now: Instant) -> ReconcileResult<()> {
        let commands = {
            let mut controllers = self.lock();
            if let Some(ctl) = controllers.deployments.get_mut(name) {
                ctl.terminate()
            } else if let Some(job) = controllers.jobs.get_mut(name) {
                job.terminate()
            } else {
                return Err(ReconcileError::NotFound(name.to_string()));
            }
        };
        self.execute(commands, now).await;
        Ok(())
    }

    /// Drop terminated deployments and batch jobs. Failed ones stay
    /// queryable. Returns the names dropped.
    pub fn retire(&self) -> Vec<String> {
        let mut controllers = self.lock();
        let mut retired = Vec::new();
        controllers.deployments.retain(|name, ctl| {
            let done = ctl.phase() == DeploymentPhase::Terminated;
            if done {
                retired.push(name.clone());
            }
            !done
        });
        controllers.jobs.retain(|name, job| {
            let done = job.is_terminated();
            if done {
                retired.push(name.clone());
            }
            !done
        });
        for name in &retired {
            info!(%name, "controller retired");
        }
        retired
    }

    async fn execute(&self, commands: Vec<Command>, now: Instant) -> usize {
        let mut queue: VecDeque<Command> = commands.into();
        let mut executed = 0;
        while let Some(command) = queue.pop_front() {
            executed += 1;
            match command {
                Command::Submit(task) => {
                    if let Submission::Completed(result) = self.inner.gateway.submit(task, now).await {
                        // Replayed from the idempotency table; route it now.
                        let follow = self.lock().route(&result, now);
                        queue.extend(follow);
                    }
                }
                Command::Cancel { owner, unit } => {
                    let cancelled = self.inner.gateway.cancel(&owner, unit.as_deref()).await;
                    if !cancelled.is_empty() {
                        debug!(%owner, unit = unit.as_deref().unwrap_or("*"), tasks = cancelled.len(), "tasks cancelled");
                    }
                }
            }
        }
        executed
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn names(&self) -> Vec<String> {
        let controllers = self.lock();
        controllers
            .deployments
            .keys()
            .chain(controllers.jobs.keys())
            .cloned()
            .collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Outcome<DeploymentStatus>> {
        self.lock().deployments.get(name).map(DeploymentController::outcome)
    }

    pub fn batch_job(&self, name: &str) -> Option<Outcome<BatchStatus>> {
        self.lock().jobs.get(name).map(BatchJobController::outcome)
    }

    /// Outcome of any controller, rendered as JSON.
    pub fn outcome(&self, name: &str) -> Outcome<serde_json::Value> {
        if let Some(outcome) = self.deployment(name) {
            outcome.map(|status| serde_json::to_value(status).unwrap_or_default())
        } else if let Some(outcome) = self.batch_job(name) {
            outcome.map(|status| serde_json::to_value(status).unwrap_or_default())
        } else {
            let err = ReconcileError::NotFound(name.to_string());
            Outcome::rejected(err.reason(), err.to_string())
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.policy.status_poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rosfleet_cluster::{ClusterClient, ClusterRegistry, ClusterSyncer, InMemoryCluster, WorkloadStatus};
    use rosfleet_dispatch::LocalExecutor;
    use rosfleet_state::{ClusterRegistration, ResourceAmount, ResourceCache};

    use crate::backoff::RetryPolicy;

    const DEPLOYMENT: &str = r#"
name = "warehouse"

[[module]]
id = "slam"
image = "registry.local/slam:2"
cpu = "2"
memory = "1Gi"

[[module]]
id = "nav"
image = "registry.local/nav:1"
cpu = "1"
"#;

    const SWEEP: &str = r#"
name = "eval"

[[module]]
id = "evaluator"
image = "registry.local/eval:1"
cpu = "1"

[sweep]
count = 6
"#;

    async fn fleet(clusters: Vec<Arc<InMemoryCluster>>) -> Supervisor {
        let cache = ResourceCache::new(Duration::from_secs(60));
        let registry = ClusterRegistry::new();
        let syncer = ClusterSyncer::new(cache.clone(), registry.clone());
        for cluster in clusters {
            let name = cluster.name().to_string();
            syncer
                .register_client(ClusterRegistration::simulated(&name, vec![]), cluster)
                .unwrap();
        }
        syncer.sync_all().await;

        let (executor, reports) = LocalExecutor::new(registry);
        let gateway = DispatchGateway::new(
            executor,
            reports,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let policy = ControllerPolicy {
            schedule: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
            recovery_attempts: 1,
            unreachable_grace: Duration::from_secs(60),
            status_poll_interval: Duration::from_millis(20),
        };
        Supervisor::new(
            gateway,
            PlacementScheduler::new(cache.clone(), Duration::from_secs(30), 3),
            BatchScheduler::new(cache, Duration::from_secs(30)),
            policy,
        )
    }

    fn lab(cpu_units: u64) -> Arc<InMemoryCluster> {
        Arc::new(InMemoryCluster::new("lab").with_node("n1", ResourceAmount::new(cpu_units * 1000, 8 << 30)))
    }

    /// Tick until `name` reports `status`, giving executor tasks time to finish.
    async fn settle(supervisor: &Supervisor, name: &str, status: &str) -> bool {
        for _ in 0..100 {
            supervisor.tick(Instant::now()).await;
            if supervisor.outcome(name).status() == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn deployment_converges_to_running() {
        let cluster = lab(4);
        let supervisor = fleet(vec![cluster.clone()]).await;
        supervisor
            .submit(&DeploymentManifest::from_toml_str(DEPLOYMENT).unwrap())
            .unwrap();
        assert_eq!(supervisor.outcome("warehouse").status(), "accepted");

        assert!(settle(&supervisor, "warehouse", "success").await);
        assert_eq!(cluster.workloads().len(), 2);
        assert_eq!(cluster.apply_calls(), 2);
    }

    #[tokio::test]
    async fn crashed_module_is_redeployed_on_the_cluster() {
        let cluster = lab(4);
        let supervisor = fleet(vec![cluster.clone()]).await;
        supervisor
            .submit(&DeploymentManifest::from_toml_str(DEPLOYMENT).unwrap())
            .unwrap();
        assert!(settle(&supervisor, "warehouse", "success").await);

        let (crashed, _) = cluster
            .workloads()
            .into_iter()
            .find(|(w, _)| w.name.contains("slam"))
            .unwrap();
        cluster.set_workload_status(
            &crashed,
            WorkloadStatus::Failed {
                reason: "OOMKilled".into(),
            },
        );

        for _ in 0..100 {
            supervisor.tick(Instant::now()).await;
            let replaced = !cluster.workloads().iter().any(|(w, _)| *w == crashed);
            if replaced && cluster.workloads().len() == 2 && supervisor.outcome("warehouse").status() == "success" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cluster.apply_calls(), 3);
        let workloads = cluster.workloads();
        assert_eq!(workloads.len(), 2);
        assert!(workloads.iter().all(|(w, _)| *w != crashed));
        for (workload, _) in &workloads {
            assert_eq!(cluster.workload_status(workload).await.unwrap(), WorkloadStatus::Running);
        }
        assert_eq!(supervisor.outcome("warehouse").status(), "success");
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let supervisor = fleet(vec![lab(4)]).await;
        let manifest = DeploymentManifest::from_toml_str(DEPLOYMENT).unwrap();
        supervisor.submit(&manifest).unwrap();
        let err = supervisor.submit(&manifest).unwrap_err();
        assert_eq!(err.reason(), "AlreadyExists");
        assert_eq!(supervisor.names(), vec!["warehouse".to_string()]);
    }

    #[tokio::test]
    async fn terminate_deletes_and_retires() {
        let cluster = lab(4);
        let supervisor = fleet(vec![cluster.clone()]).await;
        supervisor
            .submit(&DeploymentManifest::from_toml_str(DEPLOYMENT).unwrap())
            .unwrap();
        assert!(settle(&supervisor, "warehouse", "success").await);

        supervisor.terminate("warehouse", Instant::now()).await.unwrap();
        for _ in 0..100 {
            if cluster.workloads().is_empty() {
                break;
            }
            // Deletes may queue behind a cancelled status read.
            supervisor.tick(Instant::now()).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cluster.workloads().is_empty());
        assert_eq!(supervisor.retire(), vec!["warehouse".to_string()]);
        assert_eq!(supervisor.outcome("warehouse").status(), "rejected");
        assert!(matches!(
            supervisor.terminate("warehouse", Instant::now()).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn batch_job_fills_capacity() {
        let cluster = lab(4);
        let supervisor = fleet(vec![cluster.clone()]).await;
        supervisor
            .submit(&DeploymentManifest::from_toml_str(SWEEP).unwrap())
            .unwrap();
        supervisor.tick(Instant::now()).await;

        let status = supervisor.batch_job("eval").unwrap().data().cloned().unwrap();
        assert_eq!(status.total, 6);
        assert_eq!(status.scheduled, 4);
        assert_eq!(status.pending_capacity, 2);
    }
}
