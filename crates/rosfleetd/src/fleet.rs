//! Wiring of the control-plane components from a `FleetConfig`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use rosfleet_cluster::{ClusterRegistry, ClusterSyncer};
use rosfleet_core::FleetConfig;
use rosfleet_dispatch::{
    BoxFuture, DispatchGateway, InMemoryLeaseStore, LeaderLock, LocalExecutor, PeriodicFactory,
};
use rosfleet_placement::{BatchScheduler, PlacementScheduler};
use rosfleet_reconcile::{ControllerPolicy, Supervisor};
use rosfleet_state::{ResourceAmount, ResourceCache};

/// Cadence of the `reconcile` periodic job.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

pub struct Fleet {
    pub cache: ResourceCache,
    pub syncer: ClusterSyncer,
    pub gateway: DispatchGateway,
    pub scheduler: PlacementScheduler,
    pub batch: BatchScheduler,
    pub supervisor: Supervisor,
}

impl Fleet {
    pub fn build(config: &FleetConfig) -> anyhow::Result<Self> {
        let cache = ResourceCache::new(config.scheduler.reservation_ttl)
            .with_log_capacity(config.sync.log_capacity);
        let registry = ClusterRegistry::new();
        let syncer = ClusterSyncer::new(cache.clone(), registry.clone());
        for registration in &config.clusters {
            syncer
                .register(registration.clone())
                .with_context(|| format!("registering cluster {}", registration.name))?;
            info!(cluster = %registration.name, kind = %registration.kind, "cluster registered");
        }

        let (executor, reports) = LocalExecutor::new(registry);
        let lock: Arc<dyn LeaderLock> = Arc::new(InMemoryLeaseStore::new());
        let gateway = DispatchGateway::from_config(executor, reports, &config.dispatch)
            .with_leader_lock(&config.dispatch.instance_id, lock);

        let headroom = ResourceAmount::new(
            config.batch.headroom_cpu_millis()?,
            config.batch.headroom_memory_bytes()?,
        );
        let scheduler = PlacementScheduler::from_config(cache.clone(), &config.scheduler);
        let batch = BatchScheduler::new(cache.clone(), config.scheduler.freshness_bound)
            .with_headroom(headroom);
        let supervisor = Supervisor::new(
            gateway.clone(),
            scheduler.clone(),
            batch.clone(),
            ControllerPolicy::from_config(&config.controller),
        );

        Ok(Self {
            cache,
            syncer,
            gateway,
            scheduler,
            batch,
            supervisor,
        })
    }

    /// Register `cluster-sync`, `reservation-expiry` and `reconcile` with
    /// the gateway's single-owner scheduler.
    pub fn register_periodic(&self, config: &FleetConfig) {
        let periodic = self.gateway.periodic();

        let syncer = self.syncer.clone();
        let sync: PeriodicFactory = Arc::new(move || -> BoxFuture {
            let syncer = syncer.clone();
            Box::pin(async move {
                let results = syncer.sync_all().await;
                for (cluster, result) in results {
                    match result {
                        Ok(_) => {
                            if let Err(e) = syncer.apply_node_labels(&cluster).await {
                                warn!(%cluster, error = %e, "node labels not applied");
                            }
                        }
                        Err(e) => warn!(%cluster, error = %e, "cluster sync failed"),
                    }
                }
                Ok::<(), anyhow::Error>(())
            })
        });
        periodic.register_bounded("cluster-sync", config.sync.interval, config.sync.timeout, sync);

        let cache = self.cache.clone();
        let expiry: PeriodicFactory = Arc::new(move || -> BoxFuture {
            let cache = cache.clone();
            Box::pin(async move {
                let expired = cache.expire(Instant::now());
                if !expired.is_empty() {
                    info!(count = expired.len(), "reservations expired");
                }
                Ok::<(), anyhow::Error>(())
            })
        });
        let expiry_interval = (config.scheduler.reservation_ttl / 2).max(RECONCILE_INTERVAL);
        periodic.register("reservation-expiry", expiry_interval, expiry);

        let supervisor = self.supervisor.clone();
        let reconcile: PeriodicFactory = Arc::new(move || -> BoxFuture {
            let supervisor = supervisor.clone();
            Box::pin(async move {
                let executed = supervisor.tick(Instant::now()).await;
                if executed > 0 {
                    debug!(commands = executed, "reconcile pass");
                }
                supervisor.retire();
                Ok::<(), anyhow::Error>(())
            })
        });
        periodic.register("reconcile", RECONCILE_INTERVAL, reconcile);
    }
}
