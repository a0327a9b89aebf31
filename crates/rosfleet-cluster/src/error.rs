//! Adapter and sync errors.

use thiserror::Error;

use rosfleet_state::CacheError;

pub type ClientResult<T> = Result<T, ClientError>;
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of a single call against a cluster's control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transient errors are worth retrying without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Decode(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("cluster {0} is not registered")]
    UnknownCluster(String),

    #[error("cluster {cluster} unreachable: {message}")]
    ClusterUnreachable { cluster: String, message: String },

    #[error("cluster {cluster} rejected credentials: {message}")]
    AuthenticationFailed { cluster: String, message: String },

    #[error("cluster {cluster}: {source}")]
    Client {
        cluster: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SyncError {
    pub fn from_client(cluster: &str, err: ClientError) -> Self {
        let cluster = cluster.to_string();
        match err {
            ClientError::Unreachable(message) | ClientError::Decode(message) => {
                Self::ClusterUnreachable { cluster, message }
            }
            ClientError::AuthenticationFailed(message) => {
                Self::AuthenticationFailed { cluster, message }
            }
            source @ ClientError::Rejected { .. } => Self::Client { cluster, source },
        }
    }
}
