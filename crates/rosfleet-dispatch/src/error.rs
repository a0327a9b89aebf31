//! Dispatch errors.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The execution layer did not acknowledge the task.
    #[error("execution layer refused task: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("lease {name} is held by {holder}, not {requester}")]
    NotHolder {
        name: String,
        holder: String,
        requester: String,
    },

    #[error("lease {0} is no longer held")]
    Lost(String),

    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}
