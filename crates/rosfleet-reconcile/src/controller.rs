//! Deployment reconciliation controller.
//!
//! One [`DeploymentController`] owns one deployment and drives it through
//!
//! ```text
//! Pending ─▶ Scheduling ─▶ Deploying ─▶ Running ─▶ Degraded ─▶ Rescheduling ─▶ Deploying …
//!               │                                                 │
//!               └──────────── Failed (budget spent) ◀─────────────┘
//! any ─▶ Terminated
//! ```
//!
//! The controller is synchronous. `reconcile` and `on_result` return
//! [`Command`]s for the supervisor to execute against the dispatch
//! gateway; time is passed in. Results from an older generation, or for
//! a task the module no longer waits on, are dropped, so replaying a
//! result is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use rosfleet_cluster::workload::{LABEL_GENERATION, LABEL_OWNER, LABEL_UNIT};
use rosfleet_cluster::{RestartPolicy, WorkloadManifest, WorkloadRef, WorkloadStatus};
use rosfleet_core::{ErrorDetail, Outcome};
use rosfleet_dispatch::{
    Correlation, DispatchTask, FailureKind, OpKind, OwnerRef, TaskOp, TaskOutcome, TaskPayload,
    TaskResult,
};
use rosfleet_placement::{
    ModulePlacement, ModuleRequest, PlacementContext, PlacementError, PlacementScheduler,
};
use rosfleet_state::{NodeRef, Reachability, ResourceCache};

use crate::backoff::{ControllerPolicy, RetryState};
use crate::command::Command;
use crate::deployment::{
    DeploymentPhase, DeploymentStatus, Hold, ModulePhase, ModuleSpec, ModuleState, ModuleStatus,
    PendingTask,
};
use crate::error::ManifestResult;
use crate::manifest::DeploymentManifest;

const FALLBACK_NAMESPACE: &str = "rosfleet";

#[derive(Debug, Clone)]
struct Failure {
    detail: ErrorDetail,
    /// Ran out of schedule attempts on insufficient resources.
    rejected: bool,
}

pub struct DeploymentController {
    name: String,
    phase: DeploymentPhase,
    generation: u64,
    modules: Vec<ModuleState>,
    scheduler: PlacementScheduler,
    cache: ResourceCache,
    policy: ControllerPolicy,
    schedule_retry: RetryState,
    /// Modules waiting for a partial re-plan.
    displaced: BTreeSet<String>,
    failure: Option<Failure>,
    next_poll_at: Option<Instant>,
    poll_seq: u32,
}

impl DeploymentController {
    pub fn new(
        name: &str,
        specs: Vec<ModuleSpec>,
        scheduler: PlacementScheduler,
        policy: ControllerPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            phase: DeploymentPhase::Pending,
            generation: 0,
            modules: specs.into_iter().map(ModuleState::new).collect(),
            cache: scheduler.cache().clone(),
            scheduler,
            policy,
            schedule_retry: RetryState::default(),
            displaced: BTreeSet::new(),
            failure: None,
            next_poll_at: None,
            poll_seq: 0,
        }
    }

    pub fn from_manifest(
        manifest: &DeploymentManifest,
        scheduler: PlacementScheduler,
        policy: ControllerPolicy,
    ) -> ManifestResult<Self> {
        manifest.validate()?;
        let specs = manifest
            .modules
            .iter()
            .map(ModuleSpec::from_manifest)
            .collect::<ManifestResult<Vec<_>>>()?;
        Ok(Self::new(&manifest.name, specs, scheduler, policy))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn modules(&self) -> &[ModuleState] {
        &self.modules
    }

    pub fn module(&self, id: &str) -> Option<&ModuleState> {
        self.modules.iter().find(|m| m.id() == id)
    }

    pub fn owner(&self) -> OwnerRef {
        OwnerRef::Deployment(self.name.clone())
    }

    fn index(&self, id: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.id() == id)
    }

    fn set_phase(&mut self, next: DeploymentPhase) {
        if self.phase != next {
            info!(deployment = %self.name, from = %self.phase, to = %next, generation = self.generation, "phase change");
            self.phase = next;
        }
    }

    fn correlation(&self, unit: &str) -> Correlation {
        Correlation {
            owner: self.owner(),
            unit: unit.to_string(),
            generation: self.generation,
        }
    }

    fn namespace(&self, cluster: &str) -> String {
        self.cache
            .registration(cluster)
            .map(|r| r.namespace)
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string())
    }

    // ── Entry points ────────────────────────────────────────────

    /// Advance time-driven transitions: scheduling, backoff, drift
    /// detection, status polling.
    pub fn reconcile(&mut self, now: Instant) -> Vec<Command> {
        match self.phase {
            DeploymentPhase::Pending => {
                self.set_phase(DeploymentPhase::Scheduling);
                self.try_schedule(now)
            }
            DeploymentPhase::Scheduling if self.schedule_retry.is_due(now) => self.try_schedule(now),
            // Preserved modules stay supervised while a re-plan backs off;
            // `settle` retries the re-plan once it is due.
            DeploymentPhase::Deploying
            | DeploymentPhase::Running
            | DeploymentPhase::Degraded
            | DeploymentPhase::Rescheduling => self.supervise(now),
            _ => Vec::new(),
        }
    }

    /// Fold one task result into the deployment.
    pub fn on_result(&mut self, result: &TaskResult, now: Instant) -> Vec<Command> {
        if self.phase.is_terminal() {
            debug!(deployment = %self.name, task = %result.task_id, "result after terminal phase ignored");
            return Vec::new();
        }
        if result.correlation.generation < self.generation {
            debug!(
                deployment = %self.name,
                module = %result.correlation.unit,
                result_generation = result.correlation.generation,
                generation = self.generation,
                "stale result discarded"
            );
            return Vec::new();
        }
        let Some(idx) = self.index(&result.correlation.unit) else {
            return Vec::new();
        };
        let waiting = self.modules[idx]
            .pending
            .as_ref()
            .is_some_and(|p| p.key == result.idempotency_key);
        if !waiting {
            debug!(deployment = %self.name, module = %result.correlation.unit, op = %result.op, "result for superseded or handled task");
            return Vec::new();
        }
        let Some(pending) = self.modules[idx].pending.take() else {
            return Vec::new();
        };
        if result.late {
            info!(deployment = %self.name, module = %result.correlation.unit, "late result still current");
        }

        let mut commands = match (pending.op, &result.outcome) {
            (OpKind::Apply, TaskOutcome::Success(_)) => {
                self.on_applied(idx, now);
                Vec::new()
            }
            (OpKind::Apply, TaskOutcome::Failure { kind, message }) => {
                self.on_apply_failed(idx, *kind, message, pending.task, now)
            }
            (OpKind::FetchStatus, TaskOutcome::Success(TaskPayload::Status(status))) => {
                self.on_status(idx, status)
            }
            (OpKind::FetchStatus, TaskOutcome::Failure { kind, message }) => {
                self.on_status_unknown(idx, *kind, message, now);
                Vec::new()
            }
            _ => Vec::new(),
        };
        commands.extend(self.settle(now));
        commands
    }

    /// Stop the deployment: cancel its tasks, give back all capacity and
    /// delete its workloads. Idempotent.
    pub fn terminate(&mut self) -> Vec<Command> {
        if self.phase == DeploymentPhase::Terminated {
            return Vec::new();
        }
        self.generation += 1;
        let mut commands = vec![Command::Cancel {
            owner: self.owner(),
            unit: None,
        }];
        for idx in 0..self.modules.len() {
            self.release_hold(idx);
            let module = &mut self.modules[idx];
            module.pending = None;
            module.phase = ModulePhase::Unplaced;
            module.placement = None;
            let deployed = module.deployed.take();
            let id = module.id().to_string();
            if let Some((cluster, workload)) = deployed {
                commands.push(self.delete_command(&cluster, workload, &id));
            }
        }
        self.displaced.clear();
        self.set_phase(DeploymentPhase::Terminated);
        info!(deployment = %self.name, deletes = commands.len() - 1, "deployment terminated");
        commands
    }

    // ── Scheduling ──────────────────────────────────────────────

    fn try_schedule(&mut self, now: Instant) -> Vec<Command> {
        let requests: Vec<ModuleRequest> = self.modules.iter().map(|m| m.spec.request.clone()).collect();
        match self.scheduler.schedule(&requests, &PlacementContext::default(), now) {
            Ok(plan) => {
                self.schedule_retry.reset();
                self.generation += 1;
                for placement in plan.placements {
                    if let Some(idx) = self.index(&placement.module_id) {
                        let module = &mut self.modules[idx];
                        module.placement = Some(placement);
                        module.hold = Hold::Reserved;
                        module.recoveries = 0;
                    }
                }
                info!(deployment = %self.name, generation = self.generation, modules = self.modules.len(), "plan reserved");
                self.set_phase(DeploymentPhase::Deploying);
                (0..self.modules.len()).filter_map(|idx| self.apply_command(idx)).collect()
            }
            Err(err) => self.schedule_failed(err, now),
        }
    }

    /// Partial re-plan: only displaced modules move, the others keep
    /// their placement and capacity.
    fn try_reschedule(&mut self, now: Instant) -> Vec<Command> {
        let affected: Vec<usize> = (0..self.modules.len())
            .filter(|&idx| self.displaced.contains(self.modules[idx].id()))
            .collect();
        if affected.is_empty() {
            self.displaced.clear();
            self.set_phase(DeploymentPhase::Deploying);
            return Vec::new();
        }
        for &idx in &affected {
            self.release_hold(idx);
        }

        let excluded: BTreeSet<NodeRef> = affected
            .iter()
            .filter_map(|&idx| self.modules[idx].placement.as_ref().map(|p| p.node.clone()))
            .collect();
        let preserved: Vec<ModulePlacement> = self
            .modules
            .iter()
            .enumerate()
            .filter(|(idx, _)| !affected.contains(idx))
            .filter_map(|(_, m)| m.placement.clone())
            .collect();
        let requests: Vec<ModuleRequest> = affected
            .iter()
            .map(|&idx| self.modules[idx].spec.request.clone())
            .collect();

        let plan = match self.scheduler.schedule(&requests, &PlacementContext { preserved, excluded }, now) {
            Ok(plan) => plan,
            Err(err) => return self.schedule_failed(err, now),
        };

        self.schedule_retry.reset();
        self.generation += 1;
        self.displaced.clear();

        let mut commands = Vec::new();
        for placement in plan.placements {
            let Some(idx) = self.index(&placement.module_id) else {
                continue;
            };
            let id = placement.module_id.clone();
            // The old placement must stop being managed before the new one starts.
            commands.push(Command::Cancel {
                owner: self.owner(),
                unit: Some(id.clone()),
            });
            if let Some((cluster, workload)) = self.modules[idx].deployed.take() {
                commands.push(self.delete_command(&cluster, workload, &id));
            }
            info!(
                deployment = %self.name,
                module = %id,
                from = ?self.modules[idx].placement.as_ref().map(|p| p.node.to_string()),
                to = %placement.node,
                generation = self.generation,
                "module re-placed"
            );
            let module = &mut self.modules[idx];
            module.placement = Some(placement);
            module.hold = Hold::Reserved;
            module.recoveries = 0;
            module.unreachable_since = None;
            module.pending = None;
            module.attempt += 1;
            commands.extend(self.apply_command(idx));
        }

        for idx in 0..self.modules.len() {
            if affected.contains(&idx) {
                continue;
            }
            match self.modules[idx].pending.as_ref().map(|p| p.op) {
                // Re-issue under the new generation; the apply is idempotent.
                Some(OpKind::Apply) => commands.extend(self.apply_command(idx)),
                Some(_) => self.modules[idx].pending = None,
                None => {}
            }
        }

        self.set_phase(DeploymentPhase::Deploying);
        commands
    }

    fn schedule_failed(&mut self, err: PlacementError, now: Instant) -> Vec<Command> {
        match &err {
            PlacementError::InsufficientResources { .. } => {
                if self.schedule_retry.record_failure(&self.policy.schedule, now) {
                    warn!(
                        deployment = %self.name,
                        failures = self.schedule_retry.failures,
                        retry_in_ms = self.policy.schedule.delay(self.schedule_retry.failures).as_millis() as u64,
                        error = %err,
                        "placement failed, backing off"
                    );
                } else {
                    self.fail(ErrorDetail::new(err.reason(), err.to_string()), true);
                }
            }
            PlacementError::InvalidRequest(_) => {
                self.fail(ErrorDetail::new(err.reason(), err.to_string()), false);
            }
        }
        Vec::new()
    }

    fn fail(&mut self, detail: ErrorDetail, rejected: bool) {
        error!(deployment = %self.name, reason = %detail.reason, error = %detail.msg, "deployment failed");
        self.failure = Some(Failure { detail, rejected });
        self.set_phase(DeploymentPhase::Failed);
    }

    // ── Task construction ───────────────────────────────────────

    fn apply_command(&mut self, idx: usize) -> Option<Command> {
        let placement = self.modules[idx].placement.clone()?;
        let namespace = self.namespace(&placement.node.cluster);
        let module = &self.modules[idx];
        // A finished or failed object keeps its name on the cluster, so
        // every attempt applies under its own.
        let object = format!("{}-{}", module.id(), module.attempt);
        let workload = WorkloadRef::for_unit(&namespace, &self.name, &object);

        let labels = BTreeMap::from([
            (LABEL_OWNER.to_string(), self.name.clone()),
            (LABEL_UNIT.to_string(), module.id().to_string()),
            (LABEL_GENERATION.to_string(), self.generation.to_string()),
        ]);
        let manifest = WorkloadManifest {
            workload: workload.clone(),
            node: placement.node.node.clone(),
            image: module.spec.image.clone(),
            resources: module.spec.request.resources.clone(),
            env: module.spec.env.clone(),
            labels,
            image_pull_secret: module.spec.image_pull_secret.clone(),
            restart: RestartPolicy::Always,
        };
        let task = DispatchTask::new(
            &placement.node.cluster,
            TaskOp::Apply(manifest),
            self.correlation(module.id()),
            module.attempt,
        );
        debug!(deployment = %self.name, module = %module.id(), node = %placement.node, attempt = module.attempt, "apply");

        let module = &mut self.modules[idx];
        module.pending = Some(PendingTask {
            key: task.idempotency_key.clone(),
            op: OpKind::Apply,
            task: task.clone(),
        });
        module.phase = ModulePhase::Applying;
        module.deployed = Some((placement.node.cluster.clone(), workload));
        Some(Command::Submit(task))
    }

    fn status_command(&mut self, idx: usize) -> Option<Command> {
        let (cluster, workload) = self.modules[idx].deployed.clone()?;
        let task = DispatchTask::new(
            &cluster,
            TaskOp::FetchStatus(workload),
            self.correlation(self.modules[idx].id()),
            self.poll_seq,
        );
        self.modules[idx].pending = Some(PendingTask {
            key: task.idempotency_key.clone(),
            op: OpKind::FetchStatus,
            task: task.clone(),
        });
        Some(Command::Submit(task))
    }

    fn delete_command(&self, cluster: &str, workload: WorkloadRef, unit: &str) -> Command {
        Command::Submit(DispatchTask::new(
            cluster,
            TaskOp::Delete(workload),
            self.correlation(unit),
            0,
        ))
    }

    // ── Capacity ────────────────────────────────────────────────

    /// Give a module's capacity back. Safe to call twice.
    fn release_hold(&mut self, idx: usize) {
        let module = &mut self.modules[idx];
        if module.hold == Hold::Released {
            return;
        }
        if let Some(placement) = &module.placement {
            if let Err(err) = self.cache.release(placement.reservation) {
                debug!(deployment = %self.name, reservation = %placement.reservation, error = %err, "hold already gone");
            }
        }
        module.hold = Hold::Released;
    }

    fn displace(&mut self, idx: usize) {
        let module = &mut self.modules[idx];
        module.phase = ModulePhase::Lost;
        self.displaced.insert(module.spec.request.module_id.clone());
    }

    // ── Result handling ─────────────────────────────────────────

    fn on_applied(&mut self, idx: usize, now: Instant) {
        let module = &mut self.modules[idx];
        let id = module.spec.request.module_id.clone();
        module.phase = ModulePhase::Running;
        module.unreachable_since = None;
        module.last_error = None;

        if module.hold == Hold::Reserved {
            if let Some(placement) = module.placement.as_mut() {
                match self.cache.commit(placement.reservation, now) {
                    Ok(()) => module.hold = Hold::Committed,
                    Err(err) => {
                        warn!(deployment = %self.name, module = %id, error = %err, "reservation lost before commit, re-reserving");
                        let retaken = self
                            .cache
                            .reserve(&placement.node, &module.spec.request.resources, now)
                            .and_then(|r| self.cache.commit(r.id, now).map(|()| r));
                        match retaken {
                            Ok(reservation) => {
                                placement.reservation = reservation.id;
                                placement.generation = reservation.generation;
                                module.hold = Hold::Committed;
                            }
                            Err(err) => {
                                module.hold = Hold::Released;
                                module.phase = ModulePhase::Lost;
                                module.last_error = Some(err.to_string());
                                self.displaced.insert(id.clone());
                            }
                        }
                    }
                }
            }
        }
        info!(deployment = %self.name, module = %id, "module applied");
    }

    fn on_apply_failed(
        &mut self,
        idx: usize,
        kind: FailureKind,
        message: &str,
        task: DispatchTask,
        now: Instant,
    ) -> Vec<Command> {
        let id = self.modules[idx].id().to_string();
        self.modules[idx].last_error = Some(format!("{kind:?}: {message}"));
        if kind == FailureKind::Cancelled {
            return Vec::new();
        }
        if self.modules[idx].recoveries >= self.policy.recovery_attempts {
            warn!(deployment = %self.name, module = %id, failure = ?kind, "recovery budget spent, re-placing");
            self.displace(idx);
            return Vec::new();
        }
        self.modules[idx].recoveries += 1;

        if kind == FailureKind::Timeout {
            // Same key: if the first apply did land, the gateway replays it.
            let retry = task.retried();
            warn!(deployment = %self.name, module = %id, retries = retry.retries, "apply timed out, resubmitting");
            let module = &mut self.modules[idx];
            module.pending = Some(PendingTask {
                key: retry.idempotency_key.clone(),
                op: OpKind::Apply,
                task: retry.clone(),
            });
            module.phase = ModulePhase::Applying;
            return vec![Command::Submit(retry)];
        }

        self.release_hold(idx);
        let Some(node) = self.modules[idx].placement.as_ref().map(|p| p.node.clone()) else {
            self.displace(idx);
            return Vec::new();
        };
        match self.cache.reserve(&node, &self.modules[idx].spec.request.resources, now) {
            Ok(reservation) => {
                let module = &mut self.modules[idx];
                if let Some(placement) = module.placement.as_mut() {
                    placement.reservation = reservation.id;
                    placement.generation = reservation.generation;
                }
                module.hold = Hold::Reserved;
                warn!(deployment = %self.name, module = %id, %node, failure = ?kind, "apply failed, redeploying in place");
                self.redeploy(idx)
            }
            Err(err) => {
                warn!(deployment = %self.name, module = %id, %node, error = %err, "node cannot take module again, re-placing");
                self.displace(idx);
                Vec::new()
            }
        }
    }

    fn on_status(&mut self, idx: usize, status: &WorkloadStatus) -> Vec<Command> {
        let module = &mut self.modules[idx];
        match status {
            WorkloadStatus::Running | WorkloadStatus::Pending => {
                if module.phase != ModulePhase::Running {
                    info!(deployment = %self.name, module = %module.spec.request.module_id, "module healthy");
                }
                module.phase = ModulePhase::Running;
                module.unreachable_since = None;
                module.recoveries = 0;
                Vec::new()
            }
            WorkloadStatus::Succeeded | WorkloadStatus::Failed { .. } | WorkloadStatus::Absent => {
                warn!(deployment = %self.name, module = %module.spec.request.module_id, status = ?status, "module drifted");
                module.phase = ModulePhase::Lost;
                module.last_error = Some(format!("workload {status:?}"));
                self.recover_in_place(idx)
            }
        }
    }

    /// Re-apply on the same node, keeping the committed capacity.
    fn recover_in_place(&mut self, idx: usize) -> Vec<Command> {
        let reachable = self.modules[idx]
            .placement
            .as_ref()
            .and_then(|p| self.cache.handle(&p.node.cluster))
            .is_some_and(|h| h.reachability == Reachability::Reachable);
        if !reachable || self.modules[idx].recoveries >= self.policy.recovery_attempts {
            self.displace(idx);
            return Vec::new();
        }
        self.modules[idx].recoveries += 1;
        self.redeploy(idx)
    }

    /// Apply the next attempt on the current placement and delete the
    /// object of the previous one.
    fn redeploy(&mut self, idx: usize) -> Vec<Command> {
        let id = self.modules[idx].id().to_string();
        let mut commands = Vec::new();
        if let Some((cluster, workload)) = self.modules[idx].deployed.take() {
            commands.push(self.delete_command(&cluster, workload, &id));
        }
        self.modules[idx].attempt += 1;
        commands.extend(self.apply_command(idx));
        commands
    }

    fn on_status_unknown(&mut self, idx: usize, kind: FailureKind, message: &str, now: Instant) {
        if kind == FailureKind::Cancelled {
            return;
        }
        let module = &mut self.modules[idx];
        module.unreachable_since.get_or_insert(now);
        module.phase = ModulePhase::Unreachable;
        module.last_error = Some(format!("{kind:?}: {message}"));
    }

    // ── Supervision ─────────────────────────────────────────────

    fn supervise(&mut self, now: Instant) -> Vec<Command> {
        let snapshot = self.cache.snapshot(now);
        let grace = self.policy.unreachable_grace;

        for module in &mut self.modules {
            if matches!(module.phase, ModulePhase::Unplaced | ModulePhase::Applying | ModulePhase::Lost) {
                continue;
            }
            let Some(placement) = &module.placement else {
                continue;
            };
            let id = module.spec.request.module_id.clone();
            match snapshot.cluster(&placement.node.cluster) {
                None => {
                    warn!(deployment = %self.name, module = %id, cluster = %placement.node.cluster, "cluster deregistered");
                    module.phase = ModulePhase::Lost;
                    self.displaced.insert(id);
                    continue;
                }
                Some(view) if view.reachability == Reachability::Unreachable => {
                    if module.unreachable_since.is_none() {
                        warn!(deployment = %self.name, module = %id, cluster = %view.name, "module cluster unreachable");
                    }
                    module.unreachable_since.get_or_insert(now);
                    module.phase = ModulePhase::Unreachable;
                }
                Some(view) if !view.nodes.contains_key(&placement.node.node) => {
                    warn!(deployment = %self.name, module = %id, node = %placement.node, "node left the cluster");
                    module.phase = ModulePhase::Lost;
                    self.displaced.insert(id);
                    continue;
                }
                Some(_) => {}
            }
            if let Some(since) = module.unreachable_since {
                if now.duration_since(since) >= grace {
                    warn!(deployment = %self.name, module = %id, unreachable_s = now.duration_since(since).as_secs(), "unreachable past grace period");
                    module.phase = ModulePhase::Lost;
                    self.displaced.insert(id);
                }
            }
        }

        let mut commands = Vec::new();
        if self.next_poll_at.is_none_or(|at| at <= now) {
            self.poll_seq += 1;
            self.next_poll_at = Some(now + self.policy.status_poll_interval);
            for idx in 0..self.modules.len() {
                let module = &self.modules[idx];
                if matches!(module.phase, ModulePhase::Running | ModulePhase::Unreachable) && !module.has_pending() {
                    commands.extend(self.status_command(idx));
                }
            }
        }
        commands.extend(self.settle(now));
        commands
    }

    /// Derive the deployment phase from its modules.
    fn settle(&mut self, now: Instant) -> Vec<Command> {
        if self.phase.is_terminal()
            || matches!(self.phase, DeploymentPhase::Pending | DeploymentPhase::Scheduling)
        {
            return Vec::new();
        }
        if !self.displaced.is_empty() {
            self.set_phase(DeploymentPhase::Rescheduling);
            if self.schedule_retry.is_due(now) {
                return self.try_reschedule(now);
            }
            return Vec::new();
        }
        let all_running = self.modules.iter().all(|m| m.phase == ModulePhase::Running);
        let next = if all_running {
            DeploymentPhase::Running
        } else if matches!(self.phase, DeploymentPhase::Running | DeploymentPhase::Degraded) {
            DeploymentPhase::Degraded
        } else {
            DeploymentPhase::Deploying
        };
        self.set_phase(next);
        Vec::new()
    }

    // ── Views ───────────────────────────────────────────────────

    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            name: self.name.clone(),
            phase: self.phase,
            generation: self.generation,
            modules: self.modules.iter().map(ModuleStatus::from).collect(),
        }
    }

    pub fn outcome(&self) -> Outcome<DeploymentStatus> {
        match (self.phase, &self.failure) {
            (DeploymentPhase::Running | DeploymentPhase::Terminated, _) => Outcome::success(self.status()),
            (DeploymentPhase::Failed, Some(f)) if f.rejected => {
                Outcome::rejected(f.detail.reason.clone(), f.detail.msg.clone())
            }
            (DeploymentPhase::Failed, Some(f)) => Outcome::failed(f.detail.reason.clone(), f.detail.msg.clone()),
            (DeploymentPhase::Failed, None) => Outcome::failed("Failed", "deployment failed"),
            (phase, _) => Outcome::accepted(self.status()).with_msg(format!("deployment is {phase}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rosfleet_dispatch::TaskId;
    use rosfleet_state::{
        ClusterRegistration, NodeResourceSnapshot, ReservationState, ResourceAmount, SyncFailure,
    };

    use crate::backoff::RetryPolicy;

    const UNIT: u64 = 1000;

    fn node(id: &str, units: u64) -> NodeResourceSnapshot {
        NodeResourceSnapshot::new(id, ResourceAmount::new(units * UNIT, 16 << 30))
    }

    fn refresh(cache: &ResourceCache, cluster: &str, nodes: Vec<NodeResourceSnapshot>, now: Instant) {
        if cache.handle(cluster).is_none() {
            cache.register(ClusterRegistration::simulated(cluster, vec![])).unwrap();
        }
        cache.apply_refresh(cluster, nodes, now).unwrap();
    }

    fn policy() -> ControllerPolicy {
        ControllerPolicy {
            schedule: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
            recovery_attempts: 1,
            unreachable_grace: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(10),
        }
    }

    fn spec(id: &str, units: u64) -> ModuleSpec {
        ModuleSpec {
            request: ModuleRequest::new(id, ResourceAmount::new(units * UNIT, 1 << 30)),
            image: format!("registry.local/{id}:1"),
            env: BTreeMap::new(),
            image_pull_secret: None,
        }
    }

    fn controller(cache: &ResourceCache, specs: Vec<ModuleSpec>) -> DeploymentController {
        let scheduler = PlacementScheduler::new(cache.clone(), Duration::from_secs(30), 3);
        DeploymentController::new("warehouse", specs, scheduler, policy())
    }

    fn tasks(commands: &[Command]) -> Vec<DispatchTask> {
        commands.iter().filter_map(Command::task).cloned().collect()
    }

    fn applies(commands: &[Command]) -> Vec<DispatchTask> {
        tasks(commands)
            .into_iter()
            .filter(|t| t.op.kind() == OpKind::Apply)
            .collect()
    }

    fn reply(task: &DispatchTask, outcome: TaskOutcome) -> TaskResult {
        TaskResult::new(TaskId(1), task, outcome)
    }

    fn ok(task: &DispatchTask) -> TaskResult {
        reply(task, TaskOutcome::Success(TaskPayload::Applied))
    }

    fn status(task: &DispatchTask, status: WorkloadStatus) -> TaskResult {
        reply(task, TaskOutcome::Success(TaskPayload::Status(status)))
    }

    fn node_of(ctl: &DeploymentController, id: &str) -> NodeRef {
        ctl.module(id).unwrap().placement.as_ref().unwrap().node.clone()
    }

    #[test]
    fn schedules_deploys_and_commits() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4), node("n2", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2), spec("nav", 1)]);

        let commands = ctl.reconcile(now);
        assert_eq!(ctl.phase(), DeploymentPhase::Deploying);
        assert_eq!(ctl.generation(), 1);
        let applies = applies(&commands);
        assert_eq!(applies.len(), 2);
        assert!(ctl.outcome().status() == "accepted");

        for task in &applies {
            assert!(ctl.on_result(&ok(task), now).is_empty());
        }
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
        for module in ctl.modules() {
            assert_eq!(module.hold, Hold::Committed);
            let reservation = module.placement.as_ref().unwrap().reservation;
            assert_eq!(cache.reservation(reservation).unwrap().state, ReservationState::Committed);
        }
        assert_eq!(ctl.outcome().status(), "success");
    }

    #[test]
    fn replayed_results_change_nothing() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2)]);
        let apply = applies(&ctl.reconcile(now)).remove(0);

        ctl.on_result(&ok(&apply), now);
        let once = ctl.status();
        assert!(ctl.on_result(&ok(&apply), now).is_empty());
        let failure = reply(&apply, TaskOutcome::failure(FailureKind::Rejected, "late duplicate"));
        assert!(ctl.on_result(&failure, now).is_empty());
        assert_eq!(ctl.status(), once);
    }

    #[test]
    fn insufficient_resources_backs_off_then_rejects() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 2)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2), spec("nav", 1)]);

        assert!(ctl.reconcile(now).is_empty());
        assert_eq!(ctl.phase(), DeploymentPhase::Scheduling);
        // Not due yet.
        assert!(ctl.reconcile(now).is_empty());
        assert_eq!(cache.live_reservations(), 0);

        let mut t = now;
        for _ in 0..2 {
            t += Duration::from_secs(10);
            refresh(&cache, "lab", vec![node("n1", 2)], t);
            ctl.reconcile(t);
        }
        assert_eq!(ctl.phase(), DeploymentPhase::Failed);
        assert_eq!(cache.live_reservations(), 0);
        let outcome = ctl.outcome();
        assert_eq!(outcome.status(), "rejected");
        assert_eq!(outcome.errors()[0].reason, "InsufficientResources");
    }

    #[test]
    fn apply_failure_recovers_in_place_then_moves() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4), node("n2", 2)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2)]);
        let first = applies(&ctl.reconcile(now)).remove(0);
        assert_eq!(node_of(&ctl, "slam"), NodeRef::new("lab", "n1"));

        let rejected = TaskOutcome::failure(FailureKind::Rejected, "admission webhook");
        let redo = ctl.on_result(&reply(&first, rejected.clone()), now);
        let redo = applies(&redo).remove(0);
        assert_eq!(redo.attempt, 1);
        assert_ne!(redo.idempotency_key, first.idempotency_key);
        assert_eq!(node_of(&ctl, "slam"), NodeRef::new("lab", "n1"));
        assert_eq!(ctl.generation(), 1);

        let moved = ctl.on_result(&reply(&redo, rejected), now);
        assert_eq!(ctl.generation(), 2);
        assert_eq!(node_of(&ctl, "slam"), NodeRef::new("lab", "n2"));
        assert!(matches!(&moved[0], Command::Cancel { unit: Some(u), .. } if u == "slam"));
        let kinds: Vec<OpKind> = tasks(&moved).iter().map(|t| t.op.kind()).collect();
        assert_eq!(kinds, vec![OpKind::Delete, OpKind::Apply]);
        // Only the new placement holds capacity.
        assert_eq!(cache.live_reservations(), 1);
    }

    #[test]
    fn timeout_resubmits_same_operation() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2)]);
        let first = applies(&ctl.reconcile(now)).remove(0);

        let retry = ctl.on_result(&reply(&first, TaskOutcome::failure(FailureKind::Timeout, "deadline")), now);
        let retry = applies(&retry).remove(0);
        assert_eq!(retry.idempotency_key, first.idempotency_key);
        assert_eq!(retry.retries, 1);

        // The late result of the original counts.
        let mut late = ok(&first);
        late.late = true;
        ctl.on_result(&late, now);
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
    }

    /// Module `a` needs lidar (clusters a and c have it), `b` is pinned
    /// to cluster b.
    fn isolated_pair(now: Instant) -> (ResourceCache, DeploymentController, Vec<DispatchTask>) {
        let cache = ResourceCache::new(Duration::from_secs(120));
        refresh(&cache, "a", vec![node("a1", 4).with_capability("lidar")], now);
        refresh(&cache, "b", vec![node("b1", 4)], now);
        refresh(&cache, "c", vec![node("c1", 4).with_capability("lidar")], now);
        let mut a = spec("a", 2);
        a.request = a.request.with_capability("lidar");
        let mut b = spec("b", 1);
        b.request = b.request.pinned_to("b");
        let mut ctl = controller(&cache, vec![a, b]);
        let applies = applies(&ctl.reconcile(now));
        for task in &applies {
            ctl.on_result(&ok(task), now);
        }
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
        assert_eq!(node_of(&ctl, "a"), NodeRef::new("a", "a1"));
        (cache, ctl, applies)
    }

    #[test]
    fn unreachable_cluster_moves_only_its_module() {
        let now = Instant::now();
        let (cache, mut ctl, _) = isolated_pair(now);
        let b_before = ctl.module("b").unwrap().placement.clone();

        cache.mark_unreachable("a", SyncFailure::unreachable("connection refused")).unwrap();
        let t1 = now + Duration::from_secs(5);
        refresh(&cache, "b", vec![node("b1", 4)], t1);
        refresh(&cache, "c", vec![node("c1", 4).with_capability("lidar")], t1);
        ctl.reconcile(t1);
        assert_eq!(ctl.phase(), DeploymentPhase::Degraded);
        assert_eq!(ctl.module("a").unwrap().phase, ModulePhase::Unreachable);

        let t2 = now + Duration::from_secs(70);
        refresh(&cache, "b", vec![node("b1", 4)], t2);
        refresh(&cache, "c", vec![node("c1", 4).with_capability("lidar")], t2);
        let commands = ctl.reconcile(t2);
        assert_eq!(ctl.generation(), 2);
        assert_eq!(node_of(&ctl, "a"), NodeRef::new("c", "c1"));
        let moved = applies(&commands);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].cluster, "c");

        let b = ctl.module("b").unwrap();
        assert_eq!(b.placement, b_before);
        assert_eq!(b.phase, ModulePhase::Running);
        assert_eq!(b.hold, Hold::Committed);

        ctl.on_result(&ok(&moved[0]), t2);
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
    }

    #[test]
    fn results_from_older_generation_are_ignored() {
        let now = Instant::now();
        let (cache, mut ctl, first_applies) = isolated_pair(now);

        // Status poll issued under generation 1.
        let t1 = now + Duration::from_secs(1);
        let polls = tasks(&ctl.reconcile(t1));
        let b_poll = polls.iter().find(|t| t.correlation.unit == "b").unwrap().clone();

        cache.mark_unreachable("a", SyncFailure::unreachable("down")).unwrap();
        let t2 = now + Duration::from_secs(80);
        refresh(&cache, "b", vec![node("b1", 4)], t2);
        refresh(&cache, "c", vec![node("c1", 4).with_capability("lidar")], t2);
        ctl.reconcile(t2);
        let t3 = t2 + Duration::from_secs(61);
        refresh(&cache, "b", vec![node("b1", 4)], t3);
        refresh(&cache, "c", vec![node("c1", 4).with_capability("lidar")], t3);
        ctl.reconcile(t3);
        assert_eq!(ctl.generation(), 2);
        let before = ctl.status();

        assert!(ctl.on_result(&status(&b_poll, WorkloadStatus::Absent), t2).is_empty());
        let a_apply = first_applies.iter().find(|t| t.correlation.unit == "a").unwrap();
        assert!(ctl.on_result(&reply(a_apply, TaskOutcome::failure(FailureKind::Rejected, "x")), t2).is_empty());
        assert_eq!(ctl.status(), before);
    }

    #[test]
    fn preserved_modules_stay_supervised_while_replanning_backs_off() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "a", vec![node("a1", 4).with_capability("lidar")], now);
        refresh(&cache, "b", vec![node("b1", 4)], now);
        let mut a = spec("a", 2);
        a.request = a.request.with_capability("lidar");
        let mut b = spec("b", 1);
        b.request = b.request.pinned_to("b");
        let mut slow = policy();
        slow.schedule = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let scheduler = PlacementScheduler::new(cache.clone(), Duration::from_secs(30), 3);
        let mut ctl = DeploymentController::new("warehouse", vec![a, b], scheduler, slow);
        for task in applies(&ctl.reconcile(now)) {
            ctl.on_result(&ok(&task), now);
        }

        // `a` has nowhere else to go once its cluster is gone past grace.
        cache.mark_unreachable("a", SyncFailure::unreachable("down")).unwrap();
        let mut t = now;
        for secs in [5, 70] {
            t = now + Duration::from_secs(secs);
            refresh(&cache, "b", vec![node("b1", 4)], t);
            let polls = tasks(&ctl.reconcile(t));
            for poll in polls.iter().filter(|p| p.correlation.unit == "b") {
                ctl.on_result(&status(poll, WorkloadStatus::Running), t);
            }
        }
        assert_eq!(ctl.phase(), DeploymentPhase::Rescheduling);
        assert_eq!(ctl.generation(), 1);

        // Well inside the backoff, `b` is still polled and repaired.
        let t3 = t + Duration::from_secs(15);
        refresh(&cache, "b", vec![node("b1", 4)], t3);
        let polls = tasks(&ctl.reconcile(t3));
        let b_poll = polls
            .iter()
            .find(|p| p.correlation.unit == "b" && p.op.kind() == OpKind::FetchStatus)
            .unwrap()
            .clone();
        let redo = applies(&ctl.on_result(&status(&b_poll, WorkloadStatus::Absent), t3));
        assert_eq!(redo.len(), 1);
        assert_eq!(redo[0].cluster, "b");
        assert_eq!(ctl.phase(), DeploymentPhase::Rescheduling);
        assert_eq!(ctl.generation(), 1);
    }

    #[test]
    fn drift_triggers_local_redeploy() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2)]);
        let apply = applies(&ctl.reconcile(now)).remove(0);
        ctl.on_result(&ok(&apply), now);

        let poll = tasks(&ctl.reconcile(now)).remove(0);
        assert_eq!(poll.op.kind(), OpKind::FetchStatus);
        let commands = ctl.on_result(&status(&poll, WorkloadStatus::Absent), now);
        assert_eq!(ctl.phase(), DeploymentPhase::Degraded);
        let redo = applies(&commands).remove(0);
        assert_eq!(redo.cluster, "lab");
        assert_eq!(ctl.module("slam").unwrap().hold, Hold::Committed);

        ctl.on_result(&ok(&redo), now);
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
    }

    #[test]
    fn failed_workload_is_replaced_under_a_new_name() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2)]);
        let apply = applies(&ctl.reconcile(now)).remove(0);
        ctl.on_result(&ok(&apply), now);
        let TaskOp::Apply(first) = &apply.op else {
            panic!("expected an apply");
        };

        let poll = tasks(&ctl.reconcile(now)).remove(0);
        let dead = WorkloadStatus::Failed {
            reason: "OOMKilled".into(),
        };
        let commands = ctl.on_result(&status(&poll, dead), now);
        let sent = tasks(&commands);
        let kinds: Vec<OpKind> = sent.iter().map(|t| t.op.kind()).collect();
        assert_eq!(kinds, vec![OpKind::Delete, OpKind::Apply]);
        assert!(matches!(&sent[0].op, TaskOp::Delete(w) if *w == first.workload));
        let TaskOp::Apply(second) = &sent[1].op else {
            panic!("expected an apply");
        };
        assert_ne!(second.workload, first.workload);
        assert_eq!(second.node, first.node);

        ctl.on_result(&ok(&sent[1]), now);
        assert_eq!(ctl.phase(), DeploymentPhase::Running);
        let (_, deployed) = ctl.module("slam").unwrap().deployed.clone().unwrap();
        assert_eq!(deployed, second.workload);
    }

    #[test]
    fn terminate_releases_and_deletes() {
        let cache = ResourceCache::new(Duration::from_secs(120));
        let now = Instant::now();
        refresh(&cache, "lab", vec![node("n1", 4), node("n2", 4)], now);
        let mut ctl = controller(&cache, vec![spec("slam", 2), spec("nav", 1)]);
        let applies = applies(&ctl.reconcile(now));
        ctl.on_result(&ok(&applies[0]), now);
        assert_eq!(cache.live_reservations(), 2);

        let commands = ctl.terminate();
        assert!(matches!(&commands[0], Command::Cancel { unit: None, .. }));
        let deletes = tasks(&commands);
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|t| t.op.kind() == OpKind::Delete));
        assert_eq!(cache.live_reservations(), 0);
        assert_eq!(ctl.phase(), DeploymentPhase::Terminated);
        assert_eq!(ctl.outcome().status(), "success");

        assert!(ctl.terminate().is_empty());
        assert!(ctl.on_result(&ok(&applies[1]), now).is_empty());
        assert_eq!(cache.live_reservations(), 0);
    }
}
