//! Per-backend admission control.
//!
//! Local inference servers are not safely reentrant: concurrent requests to
//! one server contend for KV-cache slots and can crash or corrupt each other's
//! output. Every backend call therefore acquires an [`AdmissionPermit`] for its
//! role first. The permit is released on drop, so success, error, timeout and
//! cancellation all give the slot back.
//!
//! Capacity defaults to 1 per role. Raising it (or running several backend
//! instances behind one role) is what makes MAKER candidate generation truly
//! parallel; with capacity 1 the fan-out degrades to serialized calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::BackendRole;

/// Error returned when a permit cannot be obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission gate for {0} is closed")]
    Closed(BackendRole),

    #[error("timed out after {waited_ms}ms waiting for a {role} slot")]
    WaitTimeout { role: BackendRole, waited_ms: u64 },
}

/// Counters for one role's gate.
struct RoleGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: AtomicUsize,
    waiting: AtomicUsize,
    peak_active: AtomicUsize,
    total: AtomicU64,
    rejected: AtomicU64,
}

impl RoleGate {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

/// Decrements the waiting counter even if the acquire future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scoped admission to one backend role. The slot is freed on drop.
pub struct AdmissionPermit {
    role: BackendRole,
    gate: Arc<RoleGate>,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn role(&self) -> BackendRole {
        self.role
    }

    /// Time the permit has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            role = %self.role,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "admission released"
        );
    }
}

/// Read-only snapshot of one role's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAdmissionStats {
    pub capacity: usize,
    pub active_request_count: usize,
    pub waiting_request_count: usize,
    pub peak_active_count: usize,
    pub total_request_count: u64,
    pub rejected_request_count: u64,
}

/// Concurrency gate bounding simultaneous in-flight requests per role.
pub struct AdmissionController {
    gates: HashMap<BackendRole, Arc<RoleGate>>,
    wait_timeout: Option<Duration>,
}

impl AdmissionController {
    /// Same capacity for every role.
    pub fn new(capacity: usize) -> Self {
        Self::with_overrides(capacity, &BTreeMap::new())
    }

    /// Default capacity plus per-role overrides. Zero capacities are raised to 1.
    pub fn with_overrides(default_capacity: usize, overrides: &BTreeMap<BackendRole, usize>) -> Self {
        let gates = BackendRole::ALL
            .iter()
            .map(|role| {
                let capacity = overrides
                    .get(role)
                    .copied()
                    .unwrap_or(default_capacity)
                    .max(1);
                (*role, Arc::new(RoleGate::new(capacity)))
            })
            .collect();
        Self {
            gates,
            wait_timeout: None,
        }
    }

    /// Bound how long `acquire` may queue before failing.
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    fn gate(&self, role: BackendRole) -> &Arc<RoleGate> {
        // Every role gets a gate in the constructor.
        &self.gates[&role]
    }

    /// Configured capacity for `role`.
    pub fn capacity(&self, role: BackendRole) -> usize {
        self.gate(role).capacity
    }

    /// Wait until a slot for `role` is free.
    pub async fn acquire(&self, role: BackendRole) -> Result<AdmissionPermit, AdmissionError> {
        let gate = self.gate(role).clone();
        let started = Instant::now();

        let permit = {
            gate.waiting.fetch_add(1, Ordering::SeqCst);
            let _waiting = WaitingGuard(&gate.waiting);
            let acquire = gate.semaphore.clone().acquire_owned();
            match self.wait_timeout {
                Some(limit) => match tokio::time::timeout(limit, acquire).await {
                    Ok(result) => result.map_err(|_| AdmissionError::Closed(role))?,
                    Err(_) => {
                        gate.rejected.fetch_add(1, Ordering::SeqCst);
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(role = %role, waited_ms, "admission wait timed out");
                        return Err(AdmissionError::WaitTimeout { role, waited_ms });
                    }
                },
                None => acquire.await.map_err(|_| AdmissionError::Closed(role))?,
            }
        };

        let active = gate.active.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak_active.fetch_max(active, Ordering::SeqCst);
        gate.total.fetch_add(1, Ordering::SeqCst);

        debug!(
            role = %role,
            active,
            capacity = gate.capacity,
            waited_ms = started.elapsed().as_millis() as u64,
            "admission granted"
        );

        Ok(AdmissionPermit {
            role,
            gate,
            acquired_at: Instant::now(),
            _permit: permit,
        })
    }

    /// Close every gate; pending and future `acquire` calls fail.
    pub fn close(&self) {
        for gate in self.gates.values() {
            gate.semaphore.close();
        }
    }

    /// Snapshot of one role. No side effects.
    pub fn role_stats(&self, role: BackendRole) -> RoleAdmissionStats {
        let gate = self.gate(role);
        RoleAdmissionStats {
            capacity: gate.capacity,
            active_request_count: gate.active.load(Ordering::SeqCst),
            waiting_request_count: gate.waiting.load(Ordering::SeqCst),
            peak_active_count: gate.peak_active.load(Ordering::SeqCst),
            total_request_count: gate.total.load(Ordering::SeqCst),
            rejected_request_count: gate.rejected.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of every role. No side effects.
    pub fn get_stats(&self) -> BTreeMap<BackendRole, RoleAdmissionStats> {
        BackendRole::ALL
            .iter()
            .map(|role| (*role, self.role_stats(*role)))
            .collect()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(1)
    }
}
