//! Leader leases for cluster-wide singleton work.
//!
//! A [`Lease`] names a job, the instance that holds it and an expiry.
//! While a lease is live nobody can acquire the same name again, the
//! holder included. The holder may move the expiry with
//! [`LeaderLock::renew`] until a later lease replaces it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::LeaseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    /// Strictly increasing per name; later holders see larger tokens.
    pub token: u64,
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Take `name` for `ttl` if no live lease exists. `Ok(None)` means
    /// someone (possibly `holder` itself) already holds it.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<Option<Lease>, LeaseError>;

    /// Move the expiry of a lease the caller still holds, forward or
    /// back. Fails once the name has been taken by a later lease.
    async fn renew(&self, lease: &Lease, expires_at: Instant) -> Result<Lease, LeaseError>;

    /// Give a lease back before it expires.
    async fn release(&self, lease: &Lease) -> Result<(), LeaseError>;
}

/// Process-local lease table. Controller instances in one process share
/// it through an `Arc`.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<LeaseTable>,
}

#[derive(Default)]
struct LeaseTable {
    leases: BTreeMap<String, Lease>,
    tokens: BTreeMap<String, u64>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LeaseTable> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self, name: &str, now: Instant) -> Option<Lease> {
        self.lock()
            .leases
            .get(name)
            .filter(|lease| !lease.is_expired(now))
            .cloned()
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<Option<Lease>, LeaseError> {
        let mut table = self.lock();
        if table.leases.get(name).is_some_and(|lease| !lease.is_expired(now)) {
            return Ok(None);
        }
        let token = table.tokens.entry(name.to_string()).or_insert(0);
        *token += 1;
        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            token: *token,
            expires_at: now + ttl,
        };
        table.leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, expires_at: Instant) -> Result<Lease, LeaseError> {
        let mut table = self.lock();
        match table.leases.get_mut(&lease.name) {
            Some(current) if current.token == lease.token && current.holder == lease.holder => {
                current.expires_at = expires_at;
                Ok(current.clone())
            }
            Some(current) => Err(LeaseError::NotHolder {
                name: lease.name.clone(),
                holder: current.holder.clone(),
                requester: lease.holder.clone(),
            }),
            None => Err(LeaseError::Lost(lease.name.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut table = self.lock();
        match table.leases.get(&lease.name) {
            Some(current) if current.token == lease.token && current.holder == lease.holder => {
                table.leases.remove(&lease.name);
                Ok(())
            }
            Some(current) => Err(LeaseError::NotHolder {
                name: lease.name.clone(),
                holder: current.holder.clone(),
                requester: lease.holder.clone(),
            }),
            None => Ok(()),
        }
    }
}
