//! Deployment manifests.
//!
//! A manifest either lists long-running modules (scheduled all-or-nothing
//! as one deployment) or carries a `[sweep]` that turns its single module
//! into the template of a batch job.
//!
//! ```toml
//! name = "warehouse"
//!
//! [[module]]
//! id = "slam"
//! image = "registry.local/slam:2.1"
//! cpu = "2"
//! memory = "4Gi"
//! capabilities = ["lidar"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rosfleet_core::duration::serde_str;
use rosfleet_core::quantity::{parse_cpu_millis, parse_units};
use rosfleet_placement::{JobTemplate, ModuleRequest, PlacementConstraints};
use rosfleet_state::ResourceAmount;

use crate::error::{ManifestError, ManifestResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub name: String,
    #[serde(rename = "module", default)]
    pub modules: Vec<ModuleManifest>,
    #[serde(default)]
    pub sweep: Option<SweepSpec>,
}

fn default_cpu() -> String {
    "100m".into()
}

fn default_memory() -> String {
    "128Mi".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub id: String,
    pub image: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Extended resources such as `nvidia.com/gpu`, in whole units.
    #[serde(default)]
    pub custom: BTreeMap<String, u64>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Image pull secret already present in the target namespace.
    #[serde(default)]
    pub registry_secret: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ModuleManifest {
    pub fn resources(&self) -> ManifestResult<ResourceAmount> {
        let cpu = parse_cpu_millis(&self.cpu).ok_or_else(|| ManifestError::Quantity {
            module: self.id.clone(),
            field: "cpu",
            value: self.cpu.clone(),
        })?;
        let memory = parse_units(&self.memory).ok_or_else(|| ManifestError::Quantity {
            module: self.id.clone(),
            field: "memory",
            value: self.memory.clone(),
        })?;
        let mut amount = ResourceAmount::new(cpu, memory);
        amount.custom = self.custom.clone();
        Ok(amount)
    }

    pub fn constraints(&self) -> PlacementConstraints {
        PlacementConstraints {
            cluster: self.cluster.clone(),
            node_labels: self.node_labels.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    pub fn to_request(&self) -> ManifestResult<ModuleRequest> {
        Ok(ModuleRequest {
            module_id: self.id.clone(),
            resources: self.resources()?,
            constraints: self.constraints(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryingParam {
    pub name: String,
    pub values: Vec<String>,
}

fn default_repeat() -> u32 {
    1
}

fn default_max_retry() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Instances when no parameter varies.
    #[serde(default)]
    pub count: Option<u32>,
    /// Every parameter combination (or the plain count) runs this often.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default)]
    pub varying: Vec<VaryingParam>,
    #[serde(default)]
    pub max_per_node: Option<u32>,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_timeout", with = "serde_str")]
    pub startup_timeout: Duration,
    #[serde(default = "default_timeout", with = "serde_str")]
    pub running_timeout: Duration,
}

impl SweepSpec {
    /// One environment map per instance, in expansion order: the
    /// cartesian product of the varying parameters (first parameter
    /// varies slowest), each combination repeated `repeat` times.
    pub fn expand(&self) -> Vec<BTreeMap<String, String>> {
        let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
        if self.varying.is_empty() {
            combos = vec![BTreeMap::new(); self.count.unwrap_or(0) as usize];
        } else {
            for param in &self.varying {
                combos = combos
                    .into_iter()
                    .flat_map(|base| {
                        param.values.iter().map(move |value| {
                            let mut env = base.clone();
                            env.insert(param.name.clone(), value.clone());
                            env
                        })
                    })
                    .collect();
            }
        }

        combos
            .into_iter()
            .flat_map(|env| std::iter::repeat_n(env, self.repeat as usize))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        let base = if self.varying.is_empty() {
            self.count.unwrap_or(0) as usize
        } else {
            self.varying.iter().map(|p| p.values.len()).product()
        };
        base * self.repeat as usize
    }
}

impl DeploymentManifest {
    pub fn from_file(path: &Path) -> ManifestResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> ManifestResult<Self> {
        let manifest: Self = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn is_batch(&self) -> bool {
        self.sweep.is_some()
    }

    /// Checks the core relies on. Everything here is fatal and raised
    /// before any capacity is reserved.
    pub fn validate(&self) -> ManifestResult<()> {
        let invalid = |msg: String| -> ManifestResult<()> { Err(ManifestError::Invalid(msg)) };

        if self.name.trim().is_empty() {
            return invalid("manifest name is empty".into());
        }
        if self.modules.is_empty() {
            return invalid(format!("{}: no modules declared", self.name));
        }
        let mut seen = BTreeSet::new();
        for module in &self.modules {
            if module.id.trim().is_empty() {
                return invalid(format!("{}: module with empty id", self.name));
            }
            if !seen.insert(module.id.as_str()) {
                return invalid(format!("{}: duplicate module id {}", self.name, module.id));
            }
            if module.image.trim().is_empty() {
                return invalid(format!("{}: module {} has no image", self.name, module.id));
            }
            module.resources()?;
        }

        if let Some(sweep) = &self.sweep {
            if self.modules.len() != 1 {
                return invalid(format!(
                    "{}: a sweep manifest declares exactly one module, found {}",
                    self.name,
                    self.modules.len()
                ));
            }
            if let Some(param) = sweep.varying.iter().find(|p| p.values.is_empty()) {
                return invalid(format!("{}: varying parameter {} has no values", self.name, param.name));
            }
            if sweep.instance_count() == 0 {
                return invalid(format!("{}: sweep expands to zero instances", self.name));
            }
            if sweep.max_per_node == Some(0) {
                return invalid(format!("{}: max_per_node must be at least 1", self.name));
            }
        }
        Ok(())
    }

    pub fn requests(&self) -> ManifestResult<Vec<ModuleRequest>> {
        self.modules.iter().map(ModuleManifest::to_request).collect()
    }

    /// Batch template built from the sweep's module.
    pub fn job_template(&self) -> ManifestResult<Option<JobTemplate>> {
        let (Some(sweep), Some(module)) = (&self.sweep, self.modules.first()) else {
            return Ok(None);
        };
        Ok(Some(JobTemplate {
            resources: module.resources()?,
            constraints: module.constraints(),
            max_per_node: sweep.max_per_node,
        }))
    }
}
