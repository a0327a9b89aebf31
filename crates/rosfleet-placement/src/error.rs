//! Placement errors.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// No eligible node could hold the module. Retryable once capacity
    /// frees up or a cluster comes back.
    #[error("insufficient resources for module {module}: {detail}")]
    InsufficientResources { module: String, detail: String },

    #[error("invalid placement request: {0}")]
    InvalidRequest(String),
}

impl PlacementError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InsufficientResources { .. } => "InsufficientResources",
            Self::InvalidRequest(_) => "InvalidRequest",
        }
    }
}
