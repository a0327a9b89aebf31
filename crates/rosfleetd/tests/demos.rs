//! The shipped demo configuration and manifests load, sync against their
//! simulated clusters, and produce the expected placements.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rosfleet_cluster::{ClusterRegistry, ClusterSyncer};
use rosfleet_core::{ConfigError, FleetConfig};
use rosfleet_placement::{BatchScheduler, PlacementContext, PlacementScheduler};
use rosfleet_reconcile::DeploymentManifest;
use rosfleet_state::{NodeRef, ResourceCache};

fn demo(file: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos").join(file)
}

async fn synced(config: &FleetConfig) -> ResourceCache {
    let cache = ResourceCache::new(config.scheduler.reservation_ttl);
    let syncer = ClusterSyncer::new(cache.clone(), ClusterRegistry::new());
    for registration in &config.clusters {
        syncer.register(registration.clone()).unwrap();
    }
    for (cluster, result) in syncer.sync_all().await {
        assert!(result.is_ok(), "{cluster} failed to sync");
    }
    cache
}

#[tokio::test]
async fn warehouse_demo_plans_on_matching_nodes() {
    let config = FleetConfig::from_file(&demo("fleet.toml")).unwrap();
    assert_eq!(config.clusters.len(), 3);
    let cache = synced(&config).await;

    let manifest = DeploymentManifest::from_file(&demo("warehouse.toml")).unwrap();
    let scheduler = PlacementScheduler::from_config(cache.clone(), &config.scheduler);
    let plan = scheduler
        .schedule(&manifest.requests().unwrap(), &PlacementContext::default(), Instant::now())
        .unwrap();

    let slam = plan.placement("slam").unwrap();
    assert_eq!(slam.node.to_string(), "floor-1/agv-gw-1");
    assert_eq!(plan.placement("grasp-planner").unwrap().node.cluster, "floor-2");
    assert_eq!(plan.placement("fleet-bridge").unwrap().node.cluster, "floor-1");
    assert_eq!(cache.live_reservations(), 3);
}

#[tokio::test]
async fn sweep_demo_respects_per_node_cap() {
    let config = FleetConfig::from_file(&demo("fleet.toml")).unwrap();
    let cache = synced(&config).await;

    let manifest = DeploymentManifest::from_file(&demo("sweep.toml")).unwrap();
    let template = manifest.job_template().unwrap().unwrap();
    let count = manifest.sweep.as_ref().unwrap().instance_count() as u32;
    assert_eq!(count, 18);

    let batch = BatchScheduler::new(cache, config.scheduler.freshness_bound).schedule_batch(
        &template,
        count,
        &BTreeMap::new(),
        Instant::now(),
    );
    assert_eq!(batch.deficit, 0);
    let mut per_node: BTreeMap<String, u32> = BTreeMap::new();
    for p in &batch.placements {
        *per_node.entry(p.node.to_string()).or_default() += 1;
    }
    assert!(per_node.values().all(|&n| n <= 6));
    assert_eq!(per_node["sim-farm/farm-0"], 6);
    assert_eq!(per_node["sim-farm/farm-1"], 6);
}

#[tokio::test]
async fn demo_node_labels_are_pushed_to_their_node() {
    let config = FleetConfig::from_file(&demo("fleet.toml")).unwrap();
    let cache = ResourceCache::new(config.scheduler.reservation_ttl);
    let syncer = ClusterSyncer::new(cache.clone(), ClusterRegistry::new());
    for registration in &config.clusters {
        syncer.register(registration.clone()).unwrap();
    }
    syncer.sync_all().await;
    let node = NodeRef::new("floor-2", "arm-cell-1");
    assert!(!cache.snapshot(Instant::now()).node(&node).unwrap().node.capabilities.contains("5g"));

    assert_eq!(syncer.apply_node_labels("floor-1").await.unwrap(), 0);
    assert_eq!(syncer.apply_node_labels("floor-2").await.unwrap(), 1);

    let snapshot = cache.snapshot(Instant::now());
    let labelled = snapshot.node(&node).unwrap();
    assert_eq!(labelled.node.labels["rosfleet.io/network"], "5g");
    assert!(labelled.node.capabilities.contains("5g"));
}

#[test]
fn edited_config_is_validated_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");

    let raw = std::fs::read_to_string(demo("fleet.toml")).unwrap();
    std::fs::write(&path, raw.replace("interval = \"5s\"", "interval = \"0s\"")).unwrap();
    assert!(matches!(FleetConfig::from_file(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, raw.replace("\"floor-2\"", "\"floor-1\"")).unwrap();
    assert!(matches!(FleetConfig::from_file(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, &raw).unwrap();
    let config = FleetConfig::from_file(&path).unwrap();
    assert_eq!(config.dispatch.instance_id, "rosfleetd-demo");
    assert_eq!(config.controller.status_poll_interval, Duration::from_secs(5));
}
