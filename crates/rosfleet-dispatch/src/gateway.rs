//! Dispatch gateway.
//!
//! # Components
//!
//! - **busy / queued**: one outstanding task per [`ResourceKey`]; the
//!   rest wait FIFO and are promoted when the key frees.
//! - **by_key**: idempotency key → live task. Resubmitting a key that is
//!   queued or outstanding returns the existing handle.
//! - **completed**: successful mutations by idempotency key, kept for
//!   the configured TTL. A resubmission inside the window gets the
//!   recorded result back instead of running again.
//! - **deadlines**: a dispatched task with no report by its deadline is
//!   failed with `Timeout`. Its resource key stays busy until the late
//!   report arrives or a second timeout period has passed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rosfleet_core::DispatchSection;

use crate::executor::{ExecutionLayer, ExecutionReport};
use crate::lease::{InMemoryLeaseStore, LeaderLock};
use crate::periodic::{PeriodicFactory, PeriodicScheduler};
use crate::task::{
    DispatchTask, FailureKind, OwnerRef, ResourceKey, TaskId, TaskOutcome, TaskResult,
};

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Handed to the execution layer.
    Dispatched(TaskId),
    /// Waiting for another task on the same resource.
    Queued(TaskId),
    /// Same idempotency key is already queued or outstanding.
    Duplicate(TaskId),
    /// Same idempotency key already succeeded; this is its result.
    Completed(TaskResult),
}

impl Submission {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Dispatched(id) | Self::Queued(id) | Self::Duplicate(id) => *id,
            Self::Completed(result) => result.task_id,
        }
    }
}

struct Outstanding {
    task: DispatchTask,
    deadline: Instant,
    timed_out: bool,
    cancelled: bool,
}

struct CompletedRecord {
    result: TaskResult,
    expires_at: Instant,
}

struct GatewayState {
    next_id: u64,
    outstanding: BTreeMap<TaskId, Outstanding>,
    busy: BTreeMap<ResourceKey, TaskId>,
    queued: BTreeMap<ResourceKey, VecDeque<(TaskId, DispatchTask)>>,
    by_key: BTreeMap<String, TaskId>,
    completed: BTreeMap<String, CompletedRecord>,
    /// Results produced outside `poll_all`, delivered on the next poll.
    ready: Vec<TaskResult>,
    reports: mpsc::UnboundedReceiver<ExecutionReport>,
}

impl GatewayState {
    fn allocate(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    fn cached(&self, key: &str, now: Instant) -> Option<&TaskResult> {
        self.completed
            .get(key)
            .filter(|record| now < record.expires_at)
            .map(|record| &record.result)
    }

    fn start(&mut self, id: TaskId, task: &DispatchTask, deadline: Instant) {
        self.busy.insert(task.resource_key(), id);
        self.outstanding.insert(
            id,
            Outstanding {
                task: task.clone(),
                deadline,
                timed_out: false,
                cancelled: false,
            },
        );
    }

    fn free(&mut self, id: TaskId, task: &DispatchTask) {
        let key = task.resource_key();
        if self.busy.get(&key) == Some(&id) {
            self.busy.remove(&key);
        }
        if self.by_key.get(&task.idempotency_key) == Some(&id) {
            self.by_key.remove(&task.idempotency_key);
        }
    }
}

#[derive(Clone)]
pub struct DispatchGateway {
    executor: Arc<dyn ExecutionLayer>,
    state: Arc<Mutex<GatewayState>>,
    task_timeout: Duration,
    idempotency_ttl: Duration,
    periodic: PeriodicScheduler,
}

impl DispatchGateway {
    pub fn new(
        executor: Arc<dyn ExecutionLayer>,
        reports: mpsc::UnboundedReceiver<ExecutionReport>,
        task_timeout: Duration,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            executor,
            state: Arc::new(Mutex::new(GatewayState {
                next_id: 0,
                outstanding: BTreeMap::new(),
                busy: BTreeMap::new(),
                queued: BTreeMap::new(),
                by_key: BTreeMap::new(),
                completed: BTreeMap::new(),
                ready: Vec::new(),
                reports,
            })),
            task_timeout,
            idempotency_ttl,
            periodic: PeriodicScheduler::new("local", Arc::new(InMemoryLeaseStore::new())),
        }
    }

    pub fn from_config(
        executor: Arc<dyn ExecutionLayer>,
        reports: mpsc::UnboundedReceiver<ExecutionReport>,
        config: &DispatchSection,
    ) -> Self {
        Self::new(executor, reports, config.task_timeout, config.idempotency_ttl)
    }

    /// Share periodic-job leases with other instances through `lock`.
    pub fn with_leader_lock(mut self, holder: &str, lock: Arc<dyn LeaderLock>) -> Self {
        self.periodic = PeriodicScheduler::new(holder, lock);
        self
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    // ── Submission ──────────────────────────────────────────────

    pub async fn submit(&self, task: DispatchTask, now: Instant) -> Submission {
        let id = {
            let mut state = self.lock();
            if let Some(result) = state.cached(&task.idempotency_key, now) {
                debug!(key = %task.idempotency_key, "replayed completed task");
                return Submission::Completed(result.clone());
            }
            if let Some(&existing) = state.by_key.get(&task.idempotency_key) {
                debug!(task = %existing, "duplicate submission");
                return Submission::Duplicate(existing);
            }

            let id = state.allocate();
            state.by_key.insert(task.idempotency_key.clone(), id);
            let resource = task.resource_key();
            if state.busy.contains_key(&resource) {
                debug!(task = %id, resource = %resource, "resource busy, queued");
                state.queued.entry(resource).or_default().push_back((id, task));
                return Submission::Queued(id);
            }
            state.start(id, &task, now + self.task_timeout);
            id
        };

        debug!(task = %id, cluster = %task.cluster, op = %task.op.kind(), "dispatching");
        self.hand_off(id, task).await;
        Submission::Dispatched(id)
    }

    async fn hand_off(&self, id: TaskId, task: DispatchTask) {
        if let Err(e) = self.executor.submit(id, task.clone()).await {
            warn!(task = %id, error = %e, "execution layer refused task");
            let mut state = self.lock();
            state.outstanding.remove(&id);
            state.free(id, &task);
            let result = TaskResult::new(id, &task, TaskOutcome::failure(FailureKind::Refused, e.to_string()));
            state.ready.push(result);
        }
    }

    // ── Results ─────────────────────────────────────────────────

    /// Drain reports, apply deadlines, promote queued work. Returns every
    /// result that became available, in arrival order.
    pub async fn poll_all(&self, now: Instant) -> Vec<TaskResult> {
        let mut to_cancel = Vec::new();
        let mut to_dispatch = Vec::new();
        let mut results = {
            let mut state = self.lock();
            let mut results = std::mem::take(&mut state.ready);

            while let Ok(report) = state.reports.try_recv() {
                let Some(entry) = state.outstanding.remove(&report.task_id) else {
                    debug!(task = %report.task_id, "report for unknown task ignored");
                    continue;
                };
                state.free(report.task_id, &entry.task);
                let mut result = TaskResult::new(report.task_id, &entry.task, report.outcome);
                result.late = entry.timed_out;
                if result.outcome.is_success() && entry.task.op.is_mutation() {
                    state.completed.insert(
                        entry.task.idempotency_key.clone(),
                        CompletedRecord {
                            result: result.clone(),
                            expires_at: now + self.idempotency_ttl,
                        },
                    );
                }
                if result.late {
                    info!(task = %result.task_id, cluster = %result.cluster, "late result");
                }
                results.push(result);
            }

            let force_after = self.task_timeout;
            let mut abandoned = Vec::new();
            for (id, entry) in state.outstanding.iter_mut() {
                if !entry.timed_out && now >= entry.deadline {
                    entry.timed_out = true;
                    warn!(task = %id, cluster = %entry.task.cluster, "task timed out");
                    results.push(TaskResult::new(
                        *id,
                        &entry.task,
                        TaskOutcome::failure(FailureKind::Timeout, "no report before deadline"),
                    ));
                    to_cancel.push(*id);
                } else if entry.timed_out && now >= entry.deadline + force_after {
                    abandoned.push(*id);
                }
            }
            for id in &to_cancel {
                // A timed-out key may be resubmitted right away.
                if let Some(key) = state.outstanding.get(id).map(|e| e.task.idempotency_key.clone()) {
                    if state.by_key.get(&key) == Some(id) {
                        state.by_key.remove(&key);
                    }
                }
            }
            for id in abandoned {
                if let Some(entry) = state.outstanding.remove(&id) {
                    warn!(task = %id, "no late report, releasing resource");
                    state.free(id, &entry.task);
                }
            }

            let free_keys: Vec<ResourceKey> = state
                .queued
                .keys()
                .filter(|key| !state.busy.contains_key(*key))
                .cloned()
                .collect();
            for key in free_keys {
                while let Some((id, task)) = state.queued.get_mut(&key).and_then(VecDeque::pop_front) {
                    if let Some(cached) = state.cached(&task.idempotency_key, now) {
                        let mut replay = cached.clone();
                        replay.task_id = id;
                        replay.correlation = task.correlation.clone();
                        replay.late = false;
                        state.free(id, &task);
                        results.push(replay);
                        continue;
                    }
                    state.start(id, &task, now + self.task_timeout);
                    to_dispatch.push((id, task));
                    break;
                }
                if state.queued.get(&key).is_some_and(VecDeque::is_empty) {
                    state.queued.remove(&key);
                }
            }

            state.completed.retain(|_, record| now < record.expires_at);
            results
        };

        for id in to_cancel {
            self.executor.cancel(id).await;
        }
        for (id, task) in to_dispatch {
            debug!(task = %id, cluster = %task.cluster, "promoted from queue");
            self.hand_off(id, task).await;
        }
        results.extend(std::mem::take(&mut self.lock().ready));
        results
    }

    // ── Cancellation ────────────────────────────────────────────

    /// Cancel queued and outstanding tasks of `owner`, optionally only
    /// those of one unit. Outstanding tasks keep their resource busy
    /// until the execution layer confirms.
    pub async fn cancel(&self, owner: &OwnerRef, unit: Option<&str>) -> Vec<TaskId> {
        let matches = |task: &DispatchTask| {
            &task.correlation.owner == owner && unit.is_none_or(|u| task.correlation.unit == u)
        };

        let mut cancelled = Vec::new();
        let mut to_cancel = Vec::new();
        {
            let mut state = self.lock();
            let mut dropped = Vec::new();
            for queue in state.queued.values_mut() {
                queue.retain(|(id, task)| {
                    if matches(task) {
                        dropped.push((*id, task.idempotency_key.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            state.queued.retain(|_, queue| !queue.is_empty());
            for (id, key) in dropped {
                if state.by_key.get(&key) == Some(&id) {
                    state.by_key.remove(&key);
                }
                cancelled.push(id);
            }

            let mut keys = Vec::new();
            for (id, entry) in state.outstanding.iter_mut() {
                if !entry.cancelled && matches(&entry.task) {
                    entry.cancelled = true;
                    keys.push((*id, entry.task.idempotency_key.clone()));
                    to_cancel.push(*id);
                }
            }
            for (id, key) in keys {
                if state.by_key.get(&key) == Some(&id) {
                    state.by_key.remove(&key);
                }
                cancelled.push(id);
            }
        }

        for id in to_cancel {
            self.executor.cancel(id).await;
        }
        if !cancelled.is_empty() {
            info!(owner = %owner, unit = unit.unwrap_or("*"), count = cancelled.len(), "tasks cancelled");
        }
        cancelled
    }

    // ── Periodic jobs ───────────────────────────────────────────

    pub fn register_periodic(&self, name: &str, interval: Duration, factory: PeriodicFactory) {
        self.periodic.register(name, interval, factory);
    }

    pub fn periodic(&self) -> &PeriodicScheduler {
        &self.periodic
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn queued(&self) -> usize {
        self.lock().queued.values().map(VecDeque::len).sum()
    }

    pub fn is_busy(&self, key: &ResourceKey) -> bool {
        self.lock().busy.contains_key(key)
    }
}
