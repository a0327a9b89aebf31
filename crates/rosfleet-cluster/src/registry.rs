//! Cluster registry: registered name → live adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use rosfleet_state::{ClusterKind, ClusterRegistration, CredentialRef};

use crate::client::ClusterClient;
use crate::error::ClientResult;
use crate::kube::KubeApiClient;
use crate::memory::InMemoryCluster;
use crate::profile::profile_for;

/// Open an adapter for a registration. The variant follows the declared
/// cluster kind.
pub fn connect(registration: &ClusterRegistration) -> ClientResult<Arc<dyn ClusterClient>> {
    let client: Arc<dyn ClusterClient> = match registration.kind {
        ClusterKind::Simulated => Arc::new(InMemoryCluster::from_registration(registration)?),
        kind @ (ClusterKind::Kubernetes | ClusterKind::K3s) => {
            Arc::new(KubeApiClient::new(registration, profile_for(kind))?)
        }
    };
    info!(cluster = %registration.name, kind = %registration.kind, "cluster client opened");
    Ok(client)
}

/// Resolve a credential reference to a bearer token.
pub fn resolve_credential(credential: &CredentialRef) -> Result<String, String> {
    let token = match credential {
        CredentialRef::Token(token) => token.clone(),
        CredentialRef::Env(var) => {
            std::env::var(var).map_err(|_| format!("environment variable {var} is not set"))?
        }
        CredentialRef::File(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("credential file {}: {e}", path.display()))?,
    };
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err("credential is empty".to_string());
    }
    Ok(token)
}

#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clients: Arc<RwLock<BTreeMap<String, Arc<dyn ClusterClient>>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Arc<dyn ClusterClient>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.name().to_string(), client);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn ClusterClient>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ClusterClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_token_is_trimmed() {
        assert_eq!(
            resolve_credential(&CredentialRef::Token(" abc\n".into())),
            Ok("abc".to_string())
        );
    }

    #[test]
    fn missing_sources_are_reported() {
        let err = resolve_credential(&CredentialRef::Env("ROSFLEET_TEST_UNSET_TOKEN".into()))
            .unwrap_err();
        assert!(err.contains("ROSFLEET_TEST_UNSET_TOKEN"));

        let err = resolve_credential(&CredentialRef::File("/nonexistent/token".into())).unwrap_err();
        assert!(err.contains("/nonexistent/token"));

        assert!(resolve_credential(&CredentialRef::Token("  ".into())).is_err());
    }

    #[test]
    fn token_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s3cret\n").unwrap();
        assert_eq!(resolve_credential(&CredentialRef::File(path)), Ok("s3cret".to_string()));
    }

    #[test]
    fn connect_picks_variant_by_kind() {
        let sim = connect(&ClusterRegistration::simulated("sim", vec![])).unwrap();
        assert_eq!(sim.kind(), ClusterKind::Simulated);

        let mut k3s = ClusterRegistration::simulated("edge", vec![]);
        k3s.kind = ClusterKind::K3s;
        k3s.endpoint = "https://edge:6443".into();
        let client = connect(&k3s).unwrap();
        assert_eq!(client.kind(), ClusterKind::K3s);
        assert_eq!(client.name(), "edge");
    }

    #[test]
    fn registry_lookup() {
        let registry = ClusterRegistry::new();
        registry.insert(Arc::new(InMemoryCluster::new("a")));
        registry.insert(Arc::new(InMemoryCluster::new("b")));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
    }
}
