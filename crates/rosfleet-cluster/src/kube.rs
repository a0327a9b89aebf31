//! REST adapter for Kubernetes-compatible control planes.
//!
//! Only the handful of core/v1 endpoints placement needs are used:
//! node and pod listing, pod create/delete/get, and node label patches.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use rosfleet_core::quantity::{parse_cpu_millis, parse_units};
use rosfleet_state::{ClusterKind, ClusterRegistration, NodeResourceSnapshot, ResourceAmount};

use crate::client::ClusterClient;
use crate::error::{ClientError, ClientResult};
use crate::profile::DistributionProfile;
use crate::registry::resolve_credential;
use crate::workload::{WorkloadManifest, WorkloadRef, WorkloadStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
];

/// Resource names that are not placement dimensions.
const IGNORED_RESOURCES: &[&str] = &["cpu", "memory", "pods", "ephemeral-storage"];

pub struct KubeApiClient {
    name: String,
    endpoint: String,
    http: reqwest::Client,
    /// Bearer token, or why none is usable. Reported on first use.
    token: Result<String, String>,
    profile: Box<dyn DistributionProfile>,
}

impl KubeApiClient {
    pub fn new(
        registration: &ClusterRegistration,
        profile: Box<dyn DistributionProfile>,
    ) -> ClientResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        let mut setup_error = None;
        if let Some(path) = &registration.ca_cert {
            let cert = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|pem| reqwest::Certificate::from_pem(&pem).map_err(|e| e.to_string()));
            match cert {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => setup_error = Some(format!("CA certificate {}: {e}", path.display())),
            }
        }
        let http = builder
            .build()
            .map_err(|e| ClientError::Unreachable(format!("http client: {e}")))?;

        let token = match (setup_error, &registration.credential) {
            (Some(err), _) => Err(err),
            (None, Some(credential)) => resolve_credential(credential),
            (None, None) => Err("no credential configured".to_string()),
        };
        if let Err(reason) = &token {
            warn!(cluster = %registration.name, %reason, "cluster credential unusable");
        }

        Ok(Self {
            name: registration.name.clone(),
            endpoint: registration.endpoint.trim_end_matches('/').to_string(),
            http,
            token,
            profile,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ClientResult<reqwest::Response> {
        let token = self
            .token
            .as_ref()
            .map_err(|reason| ClientError::AuthenticationFailed(reason.clone()))?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable(e.to_string()))
    }

    /// Map non-success statuses, leaving `allowed` through untouched.
    async fn check(
        &self,
        response: reqwest::Response,
        allowed: &[StatusCode],
    ) -> ClientResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() || allowed.contains(&status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(cluster = %self.name, %status, "cluster rejected credentials");
            return Err(ClientError::AuthenticationFailed(format!("{status}: {body}")));
        }
        if status.is_server_error() {
            return Err(ClientError::Unreachable(format!("{status}: {body}")));
        }
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> ClientResult<T> {
        let response = self.send(self.http.get(self.url(path)).query(query)).await?;
        let response = self.check(response, &[]).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ClusterClient for KubeApiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClusterKind {
        self.profile.kind()
    }

    async fn list_nodes(&self) -> ClientResult<Vec<NodeResourceSnapshot>> {
        let nodes: NodeList = self.get_json("/api/v1/nodes", &[]).await?;
        let pods: PodList = self
            .get_json(
                "/api/v1/pods",
                &[("fieldSelector", "status.phase!=Succeeded,status.phase!=Failed")],
            )
            .await?;
        let snapshots = build_snapshots(&nodes.items, &pods.items, self.profile.as_ref());
        debug!(cluster = %self.name, nodes = snapshots.len(), pods = pods.items.len(), "listed nodes");
        Ok(snapshots)
    }

    async fn apply(&self, manifest: &WorkloadManifest) -> ClientResult<()> {
        let path = format!("/api/v1/namespaces/{}/pods", manifest.workload.namespace);
        let request = self.http.post(self.url(&path)).json(&manifest.to_pod());
        let response = self.send(request).await?;
        let response = self.check(response, &[StatusCode::CONFLICT]).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(cluster = %self.name, workload = %manifest.workload, "workload already exists");
        }
        Ok(())
    }

    async fn delete(&self, workload: &WorkloadRef) -> ClientResult<()> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", workload.namespace, workload.name);
        let response = self.send(self.http.delete(self.url(&path))).await?;
        self.check(response, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }

    async fn workload_status(&self, workload: &WorkloadRef) -> ClientResult<WorkloadStatus> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", workload.namespace, workload.name);
        let response = self.send(self.http.get(self.url(&path))).await?;
        let response = self.check(response, &[StatusCode::NOT_FOUND]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(WorkloadStatus::Absent);
        }
        let pod: Pod = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(pod_status(&pod))
    }

    async fn label_node(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> ClientResult<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        let body = serde_json::to_vec(&patch).map_err(|e| ClientError::Decode(e.to_string()))?;
        let request = self
            .http
            .patch(self.url(&format!("/api/v1/nodes/{node}")))
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body);
        let response = self.send(request).await?;
        self.check(response, &[]).await?;
        debug!(cluster = %self.name, %node, labels = labels.len(), "node labels patched");
        Ok(())
    }
}

// ── Wire types ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeList {
    items: Vec<Node>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ObjectMeta {
    name: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Node {
    metadata: ObjectMeta,
    spec: NodeSpec,
    status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeSpec {
    unschedulable: bool,
    taints: Vec<Taint>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Taint {
    key: String,
    effect: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeStatus {
    capacity: BTreeMap<String, String>,
    allocatable: BTreeMap<String, String>,
    conditions: Vec<Condition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    spec: PodSpec,
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Container {
    resources: ContainerResources,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerResources {
    requests: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: String,
    reason: Option<String>,
    message: Option<String>,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerStatus {
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    waiting: Option<ContainerWaiting>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerWaiting {
    reason: String,
}

// ── Decoding ───────────────────────────────────────────────────

fn parse_resources(raw: &BTreeMap<String, String>) -> ResourceAmount {
    let mut amount = ResourceAmount::default();
    for (name, value) in raw {
        let parsed = match name.as_str() {
            "cpu" => parse_cpu_millis(value).map(|v| amount.cpu_millis = v),
            "memory" => parse_units(value).map(|v| amount.memory_bytes = v),
            n if IGNORED_RESOURCES.contains(&n) || n.starts_with("hugepages-") => Some(()),
            custom => parse_units(value).map(|v| {
                amount.custom.insert(custom.to_string(), v);
            }),
        };
        if parsed.is_none() {
            warn!(resource = %name, %value, "skipping unparseable quantity");
        }
    }
    amount
}

fn build_snapshots(
    nodes: &[Node],
    pods: &[Pod],
    profile: &dyn DistributionProfile,
) -> Vec<NodeResourceSnapshot> {
    let mut requested: BTreeMap<&str, ResourceAmount> = BTreeMap::new();
    for pod in pods {
        let Some(node) = pod.spec.node_name.as_deref() else {
            continue;
        };
        let slot = requested.entry(node).or_default();
        for container in &pod.spec.containers {
            *slot = slot.saturating_add(&parse_resources(&container.resources.requests));
        }
    }

    nodes
        .iter()
        .map(|node| {
            let labels = &node.metadata.labels;
            let reported = if node.status.allocatable.is_empty() {
                &node.status.capacity
            } else {
                &node.status.allocatable
            };
            let capacity = parse_resources(reported).saturating_sub(&profile.system_reserved(labels));
            let used = requested
                .get(node.metadata.name.as_str())
                .cloned()
                .unwrap_or_default();
            let available = capacity.saturating_sub(&used);

            let ready = node
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True");
            let tainted = node
                .spec
                .taints
                .iter()
                .any(|t| t.effect == "NoSchedule" || t.effect == "NoExecute");
            if tainted {
                debug!(node = %node.metadata.name, taints = ?node.spec.taints.iter().map(|t| &t.key).collect::<Vec<_>>(), "node tainted");
            }

            NodeResourceSnapshot {
                node_id: node.metadata.name.clone(),
                labels: labels.clone(),
                capabilities: profile.capability_tags(labels),
                schedulable: ready
                    && !tainted
                    && !node.spec.unschedulable
                    && profile.accepts_workloads(labels),
                capacity,
                available,
            }
        })
        .collect()
}

fn pod_status(pod: &Pod) -> WorkloadStatus {
    let fatal = pod
        .status
        .container_statuses
        .iter()
        .filter_map(|s| s.state.waiting.as_ref())
        .find(|w| FATAL_WAITING_REASONS.contains(&w.reason.as_str()));
    if let Some(waiting) = fatal {
        return WorkloadStatus::Failed {
            reason: waiting.reason.clone(),
        };
    }
    match pod.status.phase.as_str() {
        "Running" => WorkloadStatus::Running,
        "Succeeded" => WorkloadStatus::Succeeded,
        "Failed" => WorkloadStatus::Failed {
            reason: pod
                .status
                .reason
                .clone()
                .or_else(|| pod.status.message.clone())
                .unwrap_or_else(|| "Failed".to_string()),
        },
        _ => WorkloadStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{K3sProfile, KubernetesProfile};

    const NODES: &str = r#"{
      "items": [
        {
          "metadata": {"name": "cp-0", "labels": {"node-role.kubernetes.io/control-plane": ""}},
          "spec": {},
          "status": {
            "allocatable": {"cpu": "4", "memory": "8Gi", "pods": "110"},
            "conditions": [{"type": "Ready", "status": "True"}]
          }
        },
        {
          "metadata": {"name": "edge-1", "labels": {"rosfleet.io/capability.gpu": "true"}},
          "spec": {},
          "status": {
            "allocatable": {"cpu": "3800m", "memory": "16Gi", "nvidia.com/gpu": "1", "hugepages-2Mi": "0"},
            "conditions": [{"type": "Ready", "status": "True"}]
          }
        },
        {
          "metadata": {"name": "edge-2"},
          "spec": {"taints": [{"key": "node.kubernetes.io/unreachable", "effect": "NoExecute"}]},
          "status": {
            "allocatable": {"cpu": "2", "memory": "4Gi"},
            "conditions": [{"type": "Ready", "status": "Unknown"}]
          }
        }
      ]
    }"#;

    const PODS: &str = r#"{
      "items": [
        {
          "spec": {"nodeName": "edge-1", "containers": [
            {"resources": {"requests": {"cpu": "500m", "memory": "1Gi"}}},
            {"resources": {"requests": {"cpu": "300m", "nvidia.com/gpu": "1"}}}
          ]},
          "status": {"phase": "Running"}
        },
        {"spec": {"containers": [{"resources": {"requests": {"cpu": "1"}}}]}, "status": {"phase": "Pending"}}
      ]
    }"#;

    fn decode() -> (Vec<Node>, Vec<Pod>) {
        let nodes: NodeList = serde_json::from_str(NODES).unwrap();
        let pods: PodList = serde_json::from_str(PODS).unwrap();
        (nodes.items, pods.items)
    }

    #[test]
    fn snapshots_net_out_pod_requests() {
        let (nodes, pods) = decode();
        let snaps = build_snapshots(&nodes, &pods, &KubernetesProfile);
        let edge = snaps.iter().find(|s| s.node_id == "edge-1").unwrap();

        assert_eq!(edge.capacity.cpu_millis, 3800);
        assert_eq!(edge.capacity.custom.get("nvidia.com/gpu"), Some(&1));
        assert!(!edge.capacity.custom.contains_key("hugepages-2Mi"));
        assert_eq!(edge.available.cpu_millis, 3000);
        assert_eq!(edge.available.memory_bytes, 15 << 30);
        assert_eq!(edge.available.custom.get("nvidia.com/gpu"), Some(&0));
        assert!(edge.capabilities.contains("gpu"));
        assert!(edge.schedulable);
    }

    #[test]
    fn control_plane_and_unready_nodes_are_unschedulable() {
        let (nodes, pods) = decode();
        let snaps = build_snapshots(&nodes, &pods, &KubernetesProfile);
        let by_id = |id: &str| snaps.iter().find(|s| s.node_id == id).unwrap();
        assert!(!by_id("cp-0").schedulable);
        assert!(!by_id("edge-2").schedulable);
    }

    #[test]
    fn k3s_servers_keep_a_reserve() {
        let (nodes, pods) = decode();
        let snaps = build_snapshots(&nodes, &pods, &K3sProfile::default());
        let cp = snaps.iter().find(|s| s.node_id == "cp-0").unwrap();
        assert!(cp.schedulable);
        assert_eq!(cp.capacity.cpu_millis, 3800);
        assert!(cp.capabilities.contains("k3s"));
    }

    #[test]
    fn pod_phase_mapping() {
        let pod = |raw: &str| -> Pod { serde_json::from_str(raw).unwrap() };
        assert_eq!(pod_status(&pod(r#"{"status":{"phase":"Running"}}"#)), WorkloadStatus::Running);
        assert_eq!(pod_status(&pod(r#"{"status":{"phase":"Pending"}}"#)), WorkloadStatus::Pending);
        assert_eq!(pod_status(&pod(r#"{"status":{"phase":"Succeeded"}}"#)), WorkloadStatus::Succeeded);
        assert_eq!(
            pod_status(&pod(r#"{"status":{"phase":"Failed","reason":"OOMKilled"}}"#)),
            WorkloadStatus::Failed { reason: "OOMKilled".into() }
        );
        assert_eq!(
            pod_status(&pod(
                r#"{"status":{"phase":"Pending","containerStatuses":[{"state":{"waiting":{"reason":"ImagePullBackOff"}}}]}}"#
            )),
            WorkloadStatus::Failed { reason: "ImagePullBackOff".into() }
        );
    }

    #[tokio::test]
    async fn missing_credential_fails_authentication_on_first_use() {
        let registration = ClusterRegistration {
            name: "edge".into(),
            kind: ClusterKind::Kubernetes,
            endpoint: "https://127.0.0.1:1".into(),
            ca_cert: None,
            credential: None,
            namespace: "rosfleet".into(),
            nodes: vec![],
            node_labels: BTreeMap::new(),
        };
        let client = KubeApiClient::new(&registration, Box::new(KubernetesProfile)).unwrap();
        let err = client.list_nodes().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn unreadable_ca_is_reported_as_authentication_failure() {
        let registration = ClusterRegistration {
            name: "edge".into(),
            kind: ClusterKind::K3s,
            endpoint: "https://127.0.0.1:1".into(),
            ca_cert: Some("/nonexistent/ca.pem".into()),
            credential: Some(rosfleet_state::CredentialRef::Token("t".into())),
            namespace: "rosfleet".into(),
            nodes: vec![],
            node_labels: BTreeMap::new(),
        };
        let client = KubeApiClient::new(&registration, Box::new(K3sProfile::default())).unwrap();
        let err = client
            .delete(&WorkloadRef::new("rosfleet", "x"))
            .await
            .unwrap_err();
        match err {
            ClientError::AuthenticationFailed(reason) => assert!(reason.contains("CA certificate")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
