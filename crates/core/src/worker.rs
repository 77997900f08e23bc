//! External worker record.
//!
//! The core never runs jobs; it only tracks which leases each worker holds
//! and when it was last heard from.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub concurrency: u32,
    pub active_slots: u32,
    pub state: WorkerState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub restart_count: u32,
    pub active_job_ids: BTreeSet<JobId>,
}

impl Worker {
    pub fn new(worker_id: WorkerId, concurrency: u32, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            concurrency: concurrency.max(1),
            active_slots: 0,
            state: WorkerState::Idle,
            last_heartbeat_at: now,
            restart_count: 0,
            active_job_ids: BTreeSet::new(),
        }
    }

    pub fn has_free_slot(&self) -> bool {
        self.state != WorkerState::Unhealthy && self.active_slots < self.concurrency
    }

    pub fn holds(&self, job_id: &JobId) -> bool {
        self.active_job_ids.contains(job_id)
    }

    /// Take a slot for `job_id`.
    pub fn reserve(&mut self, job_id: JobId) -> DomainResult<()> {
        if !self.has_free_slot() {
            return Err(DomainError::conflict(format!(
                "worker {} has no free slot ({}/{})",
                self.worker_id, self.active_slots, self.concurrency
            )));
        }
        if self.active_job_ids.insert(job_id) {
            self.active_slots += 1;
        }
        self.refresh_state();
        Ok(())
    }

    /// Give back the slot held for `job_id`. Returns whether it was held.
    pub fn release(&mut self, job_id: &JobId) -> bool {
        let held = self.active_job_ids.remove(job_id);
        if held {
            self.active_slots = self.active_slots.saturating_sub(1);
        }
        self.refresh_state();
        held
    }

    /// Drop every held job, e.g. when the worker is declared dead.
    pub fn drain(&mut self) -> Vec<JobId> {
        let jobs: Vec<JobId> = std::mem::take(&mut self.active_job_ids)
            .into_iter()
            .collect();
        self.active_slots = 0;
        jobs
    }

    /// Record contact from the worker. Returns `true` when this revived an
    /// unhealthy worker.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.last_heartbeat_at {
            self.last_heartbeat_at = now;
        }
        let revived = self.state == WorkerState::Unhealthy;
        if revived {
            self.restart_count += 1;
            self.state = WorkerState::Idle;
        }
        self.refresh_state();
        revived
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.state != WorkerState::Unhealthy && now - self.last_heartbeat_at > timeout
    }

    pub fn mark_unhealthy(&mut self) {
        self.state = WorkerState::Unhealthy;
    }

    /// Change the slot count. Slots already taken stay taken.
    pub fn set_concurrency(&mut self, concurrency: u32) -> DomainResult<()> {
        if concurrency == 0 {
            return Err(DomainError::validation("concurrency must be at least 1"));
        }
        self.concurrency = concurrency;
        self.refresh_state();
        Ok(())
    }

    fn refresh_state(&mut self) {
        if self.state == WorkerState::Unhealthy {
            return;
        }
        self.state = if self.active_slots > 0 {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        };
    }
}
