//! Typed conditions reported by the resource cache.

use thiserror::Error;

use crate::reservation::ReservationId;
use crate::types::{NodeRef, ResourceAmount};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cluster {0} is not registered")]
    UnknownCluster(String),

    #[error("cluster {0} is already registered")]
    ClusterExists(String),

    #[error("node {0} is not in the current inventory")]
    UnknownNode(NodeRef),

    #[error("node {0} does not accept new workloads")]
    NodeUnschedulable(NodeRef),

    #[error("insufficient capacity on {node}: requested {requested}, free {free}")]
    InsufficientCapacity {
        node: NodeRef,
        requested: ResourceAmount,
        free: ResourceAmount,
    },

    #[error("reservation {0} does not exist")]
    UnknownReservation(ReservationId),

    #[error("reservation {0} was already released")]
    AlreadyReleased(ReservationId),

    #[error("reservation {0} expired before it was committed")]
    ReservationExpired(ReservationId),

    #[error("reservation {0} was invalidated by a refresh that dropped its node")]
    ReservationInvalidated(ReservationId),

    #[error("reservation {0} is already committed")]
    AlreadyCommitted(ReservationId),
}
