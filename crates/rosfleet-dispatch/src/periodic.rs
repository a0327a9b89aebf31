//! Periodic jobs with single-owner execution.
//!
//! Each registered job has a name, an interval, a run bound and a
//! factory producing the work for one run. On every due tick the
//! scheduler tries to take the job's lease; only the instance that gets
//! it runs the job. The lease is taken for interval + run bound and the
//! run is cut off at the bound, so it never outlives its lease. Once the
//! run ends the lease is moved to `start + interval` (or to the end of
//! the run, if that is later) and is not released: it keeps guarding the
//! rest of the interval against other instances.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::lease::LeaderLock;

pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Produces the work for one run of a periodic job.
pub type PeriodicFactory = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct PeriodicJob {
    name: String,
    interval: Duration,
    max_run: Duration,
    factory: PeriodicFactory,
    next_due: Option<Instant>,
}

#[derive(Clone)]
pub struct PeriodicScheduler {
    holder: String,
    lock: Arc<dyn LeaderLock>,
    jobs: Arc<Mutex<Vec<PeriodicJob>>>,
}

impl PeriodicScheduler {
    pub fn new(holder: &str, lock: Arc<dyn LeaderLock>) -> Self {
        Self {
            holder: holder.to_string(),
            lock,
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<PeriodicJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Register a job whose runs may take up to one interval; it is first
    /// due on the next tick. Re-registering a name replaces the previous
    /// job.
    pub fn register(&self, name: &str, interval: Duration, factory: PeriodicFactory) {
        self.register_bounded(name, interval, interval, factory);
    }

    /// Register a job whose runs are cancelled after `max_run`.
    pub fn register_bounded(
        &self,
        name: &str,
        interval: Duration,
        max_run: Duration,
        factory: PeriodicFactory,
    ) {
        let mut jobs = self.jobs();
        jobs.retain(|job| job.name != name);
        jobs.push(PeriodicJob {
            name: name.to_string(),
            interval,
            max_run,
            factory,
            next_due: None,
        });
        info!(
            job = name,
            interval_ms = interval.as_millis() as u64,
            max_run_ms = max_run.as_millis() as u64,
            "periodic job registered"
        );
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs().iter().map(|job| job.name.clone()).collect()
    }

    /// Smallest registered interval, used as the tick period.
    pub fn min_interval(&self) -> Option<Duration> {
        self.jobs().iter().map(|job| job.interval).min()
    }

    /// Run every due job this instance wins the lease for. Returns the
    /// names of the jobs that ran.
    pub async fn run_due(&self, now: Instant) -> Vec<String> {
        let due: Vec<(String, Duration, Duration, PeriodicFactory)> = {
            let mut jobs = self.jobs();
            jobs.iter_mut()
                .filter(|job| job.next_due.is_none_or(|at| at <= now))
                .map(|job| {
                    job.next_due = Some(now + job.interval);
                    (job.name.clone(), job.interval, job.max_run, Arc::clone(&job.factory))
                })
                .collect()
        };

        let mut ran = Vec::new();
        for (name, interval, max_run, factory) in due {
            match self.lock.try_acquire(&name, &self.holder, interval + max_run, now).await {
                Ok(Some(lease)) => {
                    debug!(job = %name, token = lease.token, "lease acquired");
                    let started = Instant::now();
                    match tokio::time::timeout(max_run, factory()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(job = %name, error = %e, "periodic job failed"),
                        Err(_) => warn!(
                            job = %name,
                            max_run_ms = max_run.as_millis() as u64,
                            "periodic job overran its bound, cancelled"
                        ),
                    }
                    let finished = now + started.elapsed();
                    let until = (now + interval).max(finished);
                    if let Err(e) = self.lock.renew(&lease, until).await {
                        warn!(job = %name, error = %e, "could not shorten lease after run");
                    }
                    ran.push(name);
                }
                Ok(None) => debug!(job = %name, "lease held elsewhere, skipping"),
                Err(e) => warn!(job = %name, error = %e, "lease store error, skipping"),
            }
        }
        ran
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self
            .min_interval()
            .map(|d| (d / 2).max(Duration::from_millis(100)))
            .unwrap_or(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(holder = %self.holder, period_ms = period.as_millis() as u64, "periodic scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due(Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(holder = %self.holder, "periodic scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use crate::lease::InMemoryLeaseStore;

    fn counting(counter: &Arc<AtomicUsize>) -> PeriodicFactory {
        let counter = Arc::clone(counter);
        Arc::new(move || -> BoxFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            })
        })
    }

    #[tokio::test]
    async fn one_run_per_interval_across_instances() {
        let store: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let interval = Duration::from_secs(10);

        let schedulers: Vec<PeriodicScheduler> = (0..4)
            .map(|i| {
                let s = PeriodicScheduler::new(&format!("ctl-{i}"), Arc::clone(&store));
                s.register("cluster-sync", interval, counting(&runs));
                s
            })
            .collect();

        let start = Instant::now();
        let handles: Vec<_> = schedulers
            .iter()
            .cloned()
            .map(|s| tokio::spawn(async move { s.run_due(start).await }))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Mid-interval: nobody is due, nobody runs.
        for s in &schedulers {
            assert!(s.run_due(start + interval / 2).await.is_empty());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Next interval: exactly one more.
        for s in &schedulers {
            s.run_due(start + interval).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn long_run_keeps_other_instances_out() {
        let store: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let interval = Duration::from_secs(10);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let job: PeriodicFactory = {
            let (active, peak, runs, gate) = (active.clone(), peak.clone(), runs.clone(), gate.clone());
            Arc::new(move || -> BoxFuture {
                let (active, peak, runs, gate) = (active.clone(), peak.clone(), runs.clone(), gate.clone());
                Box::pin(async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_active, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                })
            })
        };
        let a = PeriodicScheduler::new("ctl-a", Arc::clone(&store));
        let b = PeriodicScheduler::new("ctl-b", Arc::clone(&store));
        for s in [&a, &b] {
            s.register_bounded("cluster-sync", interval, Duration::from_secs(30), Arc::clone(&job));
        }

        let t0 = Instant::now();
        let first = tokio::spawn({
            let a = a.clone();
            async move { a.run_due(t0).await }
        });
        while active.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // A's run spans two of B's due points.
        assert!(b.run_due(t0 + interval).await.is_empty());
        assert!(b.run_due(t0 + interval * 2).await.is_empty());

        gate.notify_one();
        assert_eq!(first.await.unwrap(), vec!["cluster-sync".to_string()]);

        // Finished runs hand the next interval over as usual.
        gate.notify_one();
        assert_eq!(b.run_due(t0 + interval * 3).await, vec!["cluster-sync".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overrunning_job_is_cancelled_at_its_bound() {
        let store: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let s = PeriodicScheduler::new("ctl", store);
        s.register_bounded(
            "stuck",
            Duration::from_secs(10),
            Duration::from_millis(20),
            Arc::new(|| -> BoxFuture {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<(), anyhow::Error>(())
                })
            }),
        );

        let ran = tokio::time::timeout(Duration::from_secs(5), s.run_due(Instant::now()))
            .await
            .unwrap();
        assert_eq!(ran, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_others() {
        let store: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let s = PeriodicScheduler::new("ctl", store);
        s.register(
            "broken",
            Duration::from_secs(5),
            Arc::new(|| -> BoxFuture { Box::pin(async { Err(anyhow::anyhow!("boom")) }) }),
        );
        s.register("expiry", Duration::from_secs(5), counting(&runs));

        let ran = s.run_due(Instant::now()).await;
        assert_eq!(ran, vec!["broken".to_string(), "expiry".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let store: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let s = PeriodicScheduler::new("ctl", store);
        s.register("tick", Duration::from_millis(200), counting(&runs));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(s.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
