//! `rosfleetd plan`: one sync and one dry-run placement.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use serde_json::json;
use tracing::warn;

use rosfleet_core::{FleetConfig, Outcome};
use rosfleet_placement::PlacementContext;
use rosfleet_reconcile::DeploymentManifest;

use crate::fleet::Fleet;

pub async fn run_plan(config_path: PathBuf, manifest_path: PathBuf) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(&config_path)?;
    let manifest = DeploymentManifest::from_file(&manifest_path)?;
    let fleet = Fleet::build(&config)?;

    for (cluster, result) in fleet.syncer.sync_all().await {
        if let Err(e) = result {
            warn!(%cluster, error = %e, "cluster not synced, excluded from plan");
        }
    }

    let outcome = dry_run(&fleet, &manifest)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn dry_run(fleet: &Fleet, manifest: &DeploymentManifest) -> anyhow::Result<Outcome<serde_json::Value>> {
    let now = Instant::now();

    if let (Some(template), Some(sweep)) = (manifest.job_template()?, &manifest.sweep) {
        let count = u32::try_from(sweep.instance_count())?;
        let batch = fleet.batch.schedule_batch(&template, count, &BTreeMap::new(), now);
        let mut per_node: BTreeMap<String, u32> = BTreeMap::new();
        for placement in &batch.placements {
            *per_node.entry(placement.node.to_string()).or_default() += 1;
            let _ = fleet.cache.release(placement.reservation);
        }
        let data = json!({
            "job": manifest.name,
            "instances": count,
            "placed": batch.placements.len(),
            "pending_capacity": batch.deficit,
            "nodes": per_node,
        });
        return Ok(Outcome::success(data));
    }

    let requests = manifest.requests()?;
    match fleet.scheduler.schedule(&requests, &PlacementContext::default(), now) {
        Ok(plan) => {
            for reservation in plan.reservations() {
                let _ = fleet.cache.release(reservation);
            }
            let placements: Vec<_> = plan
                .placements
                .iter()
                .map(|p| json!({ "module": p.module_id, "cluster": p.node.cluster, "node": p.node.node }))
                .collect();
            Ok(Outcome::success(json!({ "deployment": manifest.name, "placements": placements })))
        }
        Err(err) => Ok(Outcome::rejected(err.reason(), err.to_string())),
    }
}
