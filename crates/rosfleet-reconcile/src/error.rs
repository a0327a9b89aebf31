//! Reconciliation errors.

use std::path::PathBuf;

use thiserror::Error;

pub type ManifestResult<T> = Result<T, ManifestError>;
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// A manifest the core cannot act on. Raised before anything is reserved.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("module {module}: invalid {field} quantity {value:?}")]
    Quantity {
        module: String,
        field: &'static str,
        value: String,
    },

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{kind} {name} already exists")]
    Exists { kind: &'static str, name: String },

    #[error("no deployment or batch job named {0}")]
    NotFound(String),
}

impl ReconcileError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "InvalidManifest",
            Self::Exists { .. } => "AlreadyExists",
            Self::NotFound(_) => "NotFound",
        }
    }
}
