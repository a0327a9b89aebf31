//! Batch job controller.
//!
//! Tracks every instance of one sweep through
//! `Pending → Scheduled → Running → {Succeeded | Failed}`. Instances the
//! batch scheduler could not place sit in `PendingCapacity` and are
//! offered again on every pass. A failed attempt (apply error, workload
//! failure, startup or running timeout) goes back to `Pending` until
//! `max_retry` is used up. The aggregate status is always derived from
//! the instances.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rosfleet_cluster::workload::{LABEL_GENERATION, LABEL_OWNER, LABEL_UNIT};
use rosfleet_cluster::{RestartPolicy, WorkloadManifest, WorkloadRef, WorkloadStatus};
use rosfleet_core::Outcome;
use rosfleet_dispatch::{
    Correlation, DispatchTask, FailureKind, OpKind, OwnerRef, TaskOp, TaskOutcome, TaskPayload,
    TaskResult,
};
use rosfleet_placement::{BatchScheduler, InstancePlacement, JobTemplate};
use rosfleet_state::{NodeRef, ResourceCache};

use crate::command::Command;
use crate::deployment::{Hold, PendingTask};
use crate::error::{ManifestError, ManifestResult};
use crate::manifest::DeploymentManifest;

const FALLBACK_NAMESPACE: &str = "rosfleet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    PendingCapacity,
    Scheduled,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::PendingCapacity)
    }

    fn is_placed(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct BatchJobSpec {
    pub name: String,
    pub image: String,
    pub template: JobTemplate,
    pub image_pull_secret: Option<String>,
    pub max_retry: u32,
    pub startup_timeout: Duration,
    pub running_timeout: Duration,
    /// Environment of each instance, one entry per instance.
    pub instances: Vec<BTreeMap<String, String>>,
}

impl BatchJobSpec {
    pub fn from_manifest(manifest: &DeploymentManifest) -> ManifestResult<Self> {
        manifest.validate()?;
        let (Some(sweep), Some(module), Some(template)) =
            (&manifest.sweep, manifest.modules.first(), manifest.job_template()?)
        else {
            return Err(ManifestError::Invalid(format!("{} has no sweep", manifest.name)));
        };

        let instances = sweep
            .expand()
            .into_iter()
            .enumerate()
            .map(|(index, params)| {
                let mut env = module.env.clone();
                env.extend(params);
                env.insert("ROSFLEET_JOB".into(), manifest.name.clone());
                env.insert("ROSFLEET_INSTANCE".into(), instance_id(index));
                env
            })
            .collect();

        Ok(Self {
            name: manifest.name.clone(),
            image: module.image.clone(),
            template,
            image_pull_secret: module.registry_secret.clone(),
            max_retry: sweep.max_retry,
            startup_timeout: sweep.startup_timeout,
            running_timeout: sweep.running_timeout,
            instances,
        })
    }
}

fn instance_id(index: usize) -> String {
    format!("{index:04}")
}

#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: String,
    pub env: BTreeMap<String, String>,
    pub status: JobStatus,
    pub placement: Option<InstancePlacement>,
    pub hold: Hold,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Bumped per attempt; results of earlier attempts are stale.
    pub generation: u64,
    pub since: Option<Instant>,
    pub deployed: Option<(String, WorkloadRef)>,
    pub last_error: Option<String>,
    pending: Option<PendingTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPhase {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub name: String,
    pub phase: BatchPhase,
    pub total: usize,
    pub pending: usize,
    pub pending_capacity: usize,
    pub scheduled: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub instances: Vec<InstanceStatus>,
}

pub struct BatchJobController {
    spec: BatchJobSpec,
    instances: Vec<JobInstance>,
    scheduler: BatchScheduler,
    cache: ResourceCache,
    poll_interval: Duration,
    next_poll_at: Option<Instant>,
    poll_seq: u32,
    terminated: bool,
}

impl BatchJobController {
    pub fn new(spec: BatchJobSpec, scheduler: BatchScheduler, poll_interval: Duration) -> Self {
        let instances = spec
            .instances
            .iter()
            .enumerate()
            .map(|(index, env)| JobInstance {
                id: instance_id(index),
                env: env.clone(),
                status: JobStatus::Pending,
                placement: None,
                hold: Hold::Released,
                attempts: 0,
                generation: 1,
                since: None,
                deployed: None,
                last_error: None,
                pending: None,
            })
            .collect();
        info!(job = %spec.name, instances = spec.instances.len(), "batch job accepted");
        Self {
            cache: scheduler.cache().clone(),
            spec,
            instances,
            scheduler,
            poll_interval,
            next_poll_at: None,
            poll_seq: 0,
            terminated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    pub fn instance(&self, id: &str) -> Option<&JobInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn owner(&self) -> OwnerRef {
        OwnerRef::BatchJob(self.spec.name.clone())
    }

    fn correlation(&self, idx: usize) -> Correlation {
        Correlation {
            owner: self.owner(),
            unit: self.instances[idx].id.clone(),
            generation: self.instances[idx].generation,
        }
    }

    fn set_status(&mut self, idx: usize, status: JobStatus, now: Instant) {
        let instance = &mut self.instances[idx];
        if instance.status != status {
            debug!(job = %self.spec.name, instance = %instance.id, from = ?instance.status, to = ?status, "instance status");
            instance.status = status;
            instance.since = Some(now);
        }
    }

    // ── Entry points ────────────────────────────────────────────

    pub fn reconcile(&mut self, now: Instant) -> Vec<Command> {
        if self.terminated {
            return Vec::new();
        }
        let mut commands = Vec::new();

        for idx in 0..self.instances.len() {
            let instance = &self.instances[idx];
            let Some(since) = instance.since else { continue };
            let limit = match instance.status {
                JobStatus::Scheduled => self.spec.startup_timeout,
                JobStatus::Running => self.spec.running_timeout,
                _ => continue,
            };
            if now.duration_since(since) >= limit {
                let reason = format!("{:?} for longer than {}s", instance.status, limit.as_secs());
                commands.extend(self.fail_attempt(idx, &reason, now));
            }
        }

        commands.extend(self.schedule_pass(now));

        if self.next_poll_at.is_none_or(|at| at <= now) {
            self.poll_seq += 1;
            self.next_poll_at = Some(now + self.poll_interval);
            for idx in 0..self.instances.len() {
                let instance = &self.instances[idx];
                if instance.status.is_placed() && instance.pending.is_none() && instance.deployed.is_some() {
                    commands.extend(self.status_command(idx));
                }
            }
        }
        commands
    }

    pub fn on_result(&mut self, result: &TaskResult, now: Instant) -> Vec<Command> {
        if self.terminated {
            return Vec::new();
        }
        let Some(idx) = self.instances.iter().position(|i| i.id == result.correlation.unit) else {
            return Vec::new();
        };
        if result.correlation.generation < self.instances[idx].generation {
            debug!(job = %self.spec.name, instance = %result.correlation.unit, "stale result discarded");
            return Vec::new();
        }
        let waiting = self.instances[idx]
            .pending
            .as_ref()
            .is_some_and(|p| p.key == result.idempotency_key);
        if !waiting {
            return Vec::new();
        }
        let Some(pending) = self.instances[idx].pending.take() else {
            return Vec::new();
        };

        match (pending.op, &result.outcome) {
            (OpKind::Apply, TaskOutcome::Success(_)) => {
                self.commit(idx, now);
                Vec::new()
            }
            (OpKind::Apply, TaskOutcome::Failure { kind: FailureKind::Cancelled, .. }) => Vec::new(),
            (OpKind::Apply, TaskOutcome::Failure { kind, message }) => {
                let reason = format!("{kind:?}: {message}");
                self.fail_attempt(idx, &reason, now)
            }
            (OpKind::FetchStatus, TaskOutcome::Success(TaskPayload::Status(status))) => match status {
                WorkloadStatus::Pending => Vec::new(),
                WorkloadStatus::Running => {
                    self.set_status(idx, JobStatus::Running, now);
                    Vec::new()
                }
                WorkloadStatus::Succeeded => {
                    self.release(idx);
                    self.set_status(idx, JobStatus::Succeeded, now);
                    info!(job = %self.spec.name, instance = %self.instances[idx].id, "instance succeeded");
                    self.schedule_pass(now)
                }
                WorkloadStatus::Failed { reason } => {
                    let reason = format!("workload failed: {reason}");
                    self.fail_attempt(idx, &reason, now)
                }
                WorkloadStatus::Absent => self.fail_attempt(idx, "workload disappeared", now),
            },
            _ => Vec::new(),
        }
    }

    /// Stop every instance and give back all capacity. Idempotent.
    pub fn terminate(&mut self) -> Vec<Command> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        let mut commands = vec![Command::Cancel {
            owner: self.owner(),
            unit: None,
        }];
        for idx in 0..self.instances.len() {
            self.release(idx);
            self.instances[idx].pending = None;
            self.instances[idx].generation += 1;
            if let Some((cluster, workload)) = self.instances[idx].deployed.take() {
                commands.push(self.delete_command(idx, &cluster, workload));
            }
        }
        info!(job = %self.spec.name, "batch job terminated");
        commands
    }

    // ── Internals ───────────────────────────────────────────────

    fn schedule_pass(&mut self, now: Instant) -> Vec<Command> {
        let waiting: Vec<usize> = (0..self.instances.len())
            .filter(|&idx| self.instances[idx].status.is_waiting())
            .collect();
        if waiting.is_empty() {
            return Vec::new();
        }

        let mut already: BTreeMap<NodeRef, u32> = BTreeMap::new();
        for instance in self.instances.iter().filter(|i| i.status.is_placed()) {
            if let Some(placement) = &instance.placement {
                *already.entry(placement.node.clone()).or_default() += 1;
            }
        }

        let count = u32::try_from(waiting.len()).unwrap_or(u32::MAX);
        let batch = self.scheduler.schedule_batch(&self.spec.template, count, &already, now);
        let placed = batch.placements.len();

        let mut commands = Vec::new();
        let mut placements = batch.placements.into_iter();
        for &idx in &waiting {
            match placements.next() {
                Some(placement) => {
                    let instance = &mut self.instances[idx];
                    instance.placement = Some(placement);
                    instance.hold = Hold::Reserved;
                    self.set_status(idx, JobStatus::Scheduled, now);
                    commands.extend(self.apply_command(idx));
                }
                None => self.set_status(idx, JobStatus::PendingCapacity, now),
            }
        }
        if placed > 0 || batch.deficit > 0 {
            info!(job = %self.spec.name, placed, deficit = batch.deficit, "batch pass");
        }
        commands
    }

    fn apply_command(&mut self, idx: usize) -> Option<Command> {
        let placement = self.instances[idx].placement.clone()?;
        let namespace = self
            .cache
            .registration(&placement.node.cluster)
            .map(|r| r.namespace)
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string());
        let instance = &self.instances[idx];
        // One object per attempt, so a retry never collides with the
        // finished pod of the previous one.
        let unit = format!("{}-{}", instance.id, instance.attempts);
        let workload = WorkloadRef::for_unit(&namespace, &self.spec.name, &unit);
        let labels = BTreeMap::from([
            (LABEL_OWNER.to_string(), self.spec.name.clone()),
            (LABEL_UNIT.to_string(), instance.id.clone()),
            (LABEL_GENERATION.to_string(), instance.generation.to_string()),
        ]);
        let manifest = WorkloadManifest {
            workload: workload.clone(),
            node: placement.node.node.clone(),
            image: self.spec.image.clone(),
            resources: self.spec.template.resources.clone(),
            env: instance.env.clone(),
            labels,
            image_pull_secret: self.spec.image_pull_secret.clone(),
            restart: RestartPolicy::Never,
        };
        let task = DispatchTask::new(
            &placement.node.cluster,
            TaskOp::Apply(manifest),
            self.correlation(idx),
            0,
        );
        let instance = &mut self.instances[idx];
        instance.pending = Some(PendingTask {
            key: task.idempotency_key.clone(),
            op: OpKind::Apply,
            task: task.clone(),
        });
        instance.deployed = Some((placement.node.cluster, workload));
        Some(Command::Submit(task))
    }

    fn status_command(&mut self, idx: usize) -> Option<Command> {
        let (cluster, workload) = self.instances[idx].deployed.clone()?;
        let task = DispatchTask::new(
            &cluster,
            TaskOp::FetchStatus(workload),
            self.correlation(idx),
            self.poll_seq,
        );
        self.instances[idx].pending = Some(PendingTask {
            key: task.idempotency_key.clone(),
            op: OpKind::FetchStatus,
            task: task.clone(),
        });
        Some(Command::Submit(task))
    }

    fn delete_command(&self, idx: usize, cluster: &str, workload: WorkloadRef) -> Command {
        Command::Submit(DispatchTask::new(
            cluster,
            TaskOp::Delete(workload),
            self.correlation(idx),
            0,
        ))
    }

    fn commit(&mut self, idx: usize, now: Instant) {
        let instance = &mut self.instances[idx];
        if instance.hold != Hold::Reserved {
            return;
        }
        if let Some(placement) = &instance.placement {
            match self.cache.commit(placement.reservation, now) {
                Ok(()) => instance.hold = Hold::Committed,
                Err(err) => {
                    warn!(job = %self.spec.name, instance = %instance.id, error = %err, "reservation lost before commit");
                    instance.hold = Hold::Released;
                }
            }
        }
    }

    fn release(&mut self, idx: usize) {
        let instance = &mut self.instances[idx];
        if instance.hold == Hold::Released {
            return;
        }
        if let Some(placement) = &instance.placement {
            if let Err(err) = self.cache.release(placement.reservation) {
                debug!(job = %self.spec.name, instance = %instance.id, error = %err, "hold already gone");
            }
        }
        instance.hold = Hold::Released;
    }

    /// End the current attempt: clean up, then retry or give up.
    fn fail_attempt(&mut self, idx: usize, reason: &str, now: Instant) -> Vec<Command> {
        self.release(idx);
        let mut commands = vec![Command::Cancel {
            owner: self.owner(),
            unit: Some(self.instances[idx].id.clone()),
        }];
        if let Some((cluster, workload)) = self.instances[idx].deployed.take() {
            commands.push(self.delete_command(idx, &cluster, workload));
        }

        let max_retry = self.spec.max_retry;
        let instance = &mut self.instances[idx];
        instance.attempts += 1;
        instance.generation += 1;
        instance.pending = None;
        instance.placement = None;
        instance.last_error = Some(reason.to_string());
        let attempts = instance.attempts;
        if attempts <= max_retry {
            warn!(job = %self.spec.name, instance = %instance.id, attempts, reason, "instance attempt failed, retrying");
            self.set_status(idx, JobStatus::Pending, now);
        } else {
            warn!(job = %self.spec.name, instance = %instance.id, attempts, reason, "instance failed");
            self.set_status(idx, JobStatus::Failed, now);
        }
        commands
    }

    // ── Views ───────────────────────────────────────────────────

    pub fn status(&self) -> BatchStatus {
        let count = |s: JobStatus| self.instances.iter().filter(|i| i.status == s).count();
        let total = self.instances.len();
        let succeeded = count(JobStatus::Succeeded);
        let failed = count(JobStatus::Failed);
        let waiting = self.instances.iter().filter(|i| i.status.is_waiting()).count();
        let phase = if succeeded + failed == total {
            BatchPhase::Completed
        } else if waiting == total {
            BatchPhase::Pending
        } else {
            BatchPhase::Running
        };
        BatchStatus {
            name: self.spec.name.clone(),
            phase,
            total,
            pending: count(JobStatus::Pending),
            pending_capacity: count(JobStatus::PendingCapacity),
            scheduled: count(JobStatus::Scheduled),
            running: count(JobStatus::Running),
            succeeded,
            failed,
            instances: self
                .instances
                .iter()
                .map(|i| InstanceStatus {
                    id: i.id.clone(),
                    status: i.status,
                    node: i.placement.as_ref().map(|p| p.node.clone()),
                    attempts: i.attempts,
                })
                .collect(),
        }
    }

    pub fn outcome(&self) -> Outcome<BatchStatus> {
        let status = self.status();
        match status.phase {
            BatchPhase::Completed if status.failed > 0 => Outcome::failed(
                "InstancesFailed",
                format!("{} of {} instances failed", status.failed, status.total),
            ),
            BatchPhase::Completed => Outcome::success(status),
            _ if self.terminated => Outcome::success(status).with_msg("terminated"),
            _ => {
                let msg = format!(
                    "{} running, {} waiting for capacity",
                    status.running + status.scheduled,
                    status.pending_capacity
                );
                Outcome::accepted(status).with_msg(msg)
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
