//! What controllers ask the supervisor to do.

use rosfleet_dispatch::{DispatchTask, OwnerRef};

/// Side effects produced by a controller step. Executed in order, so a
/// `Cancel` ahead of a `Submit` for the same unit takes effect first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(DispatchTask),
    /// Cancel queued and outstanding tasks of `owner`; all units when
    /// `unit` is `None`.
    Cancel { owner: OwnerRef, unit: Option<String> },
}

impl Command {
    pub fn task(&self) -> Option<&DispatchTask> {
        match self {
            Self::Submit(task) => Some(task),
            Self::Cancel { .. } => None,
        }
    }
}
