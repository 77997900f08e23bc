//! Idempotency index: `(tenant, key) → job`.
//!
//! A submission first reserves its key. The reservation is a guard: it is
//! bound to the created job with [`Reservation::commit`], and released if it
//! is dropped uncommitted (validation or admission rejected the submission).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use orchestrator_core::{JobId, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    /// The key is bound to an existing job; the caller should replay it.
    #[error("idempotency key already used by job {0}")]
    AlreadyExists(JobId),
    /// Another submission with the same key is being processed right now.
    #[error("a submission with idempotency key {key:?} is already in progress")]
    InFlight { key: String },
    #[error("idempotency index unavailable: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Bound(JobId),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: Slot,
    at: DateTime<Utc>,
}

type TenantKeys = Arc<Mutex<HashMap<String, Entry>>>;

#[derive(Debug)]
pub struct IdempotencyIndex {
    tenants: RwLock<HashMap<TenantId, TenantKeys>>,
    ttl: chrono::Duration,
}

impl IdempotencyIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn keys(&self, tenant_id: &TenantId) -> Result<TenantKeys, IdempotencyError> {
        {
            let tenants = self.tenants.read().map_err(|_| poisoned())?;
            if let Some(keys) = tenants.get(tenant_id) {
                return Ok(keys.clone());
            }
        }
        let mut tenants = self.tenants.write().map_err(|_| poisoned())?;
        Ok(tenants.entry(tenant_id.clone()).or_default().clone())
    }

    fn expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.at > self.ttl
    }

    /// Claim `key` for a new submission.
    pub fn reserve(
        &self,
        tenant_id: &TenantId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation<'_>, IdempotencyError> {
        let keys = self.keys(tenant_id)?;
        let mut map = keys.lock().map_err(|_| poisoned())?;

        match map.get(key) {
            Some(entry) if !self.expired(entry, now) => match entry.slot {
                Slot::Bound(job_id) => return Err(IdempotencyError::AlreadyExists(job_id)),
                Slot::Pending => {
                    return Err(IdempotencyError::InFlight {
                        key: key.to_string(),
                    });
                }
            },
            _ => {}
        }

        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Pending,
                at: now,
            },
        );
        drop(map);

        Ok(Reservation {
            index: self,
            keys,
            key: key.to_string(),
            committed: false,
        })
    }

    /// Job bound to `key`, if retained.
    pub fn lookup(
        &self,
        tenant_id: &TenantId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>, IdempotencyError> {
        let keys = self.keys(tenant_id)?;
        let map = keys.lock().map_err(|_| poisoned())?;
        Ok(match map.get(key) {
            Some(entry) if !self.expired(entry, now) => match entry.slot {
                Slot::Bound(job_id) => Some(job_id),
                Slot::Pending => None,
            },
            _ => None,
        })
    }

    /// Drop entries older than the retention window. Returns how many went.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let all: Vec<TenantKeys> = {
            let tenants = self.tenants.read().map_err(|_| poisoned())?;
            tenants.values().cloned().collect()
        };

        let mut removed = 0;
        for keys in all {
            let mut map = keys.lock().map_err(|_| poisoned())?;
            let before = map.len();
            map.retain(|_, entry| !self.expired(entry, now));
            removed += before - map.len();
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        let Ok(tenants) = self.tenants.read() else {
            return 0;
        };
        tenants
            .values()
            .map(|keys| keys.lock().map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pending claim on an idempotency key.
#[derive(Debug)]
pub struct Reservation<'a> {
    index: &'a IdempotencyIndex,
    keys: TenantKeys,
    key: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bind the key to the job that was created for it.
    pub fn commit(mut self, job_id: JobId) -> Result<(), IdempotencyError> {
        let mut map = self.keys.lock().map_err(|_| poisoned())?;
        if let Some(entry) = map.get_mut(&self.key) {
            entry.slot = Slot::Bound(job_id);
        }
        drop(map);
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.keys.lock() {
            Ok(mut map) => {
                if map.get(&self.key).is_some_and(|e| e.slot == Slot::Pending) {
                    map.remove(&self.key);
                }
            }
            Err(_) => tracing::warn!(
                key = %self.key,
                ttl_secs = self.index.ttl.num_seconds(),
                "could not release idempotency reservation; it will expire"
            ),
        }
    }
}

fn poisoned() -> IdempotencyError {
    IdempotencyError::Storage("idempotency lock poisoned".to_string())
}
