//! Per-disk admission gates for stream opens.
//!
//! Opening an overlay stream may copy records from the shared log into the
//! dedicated log. A `QuotaGate` bounds how many of those opens run at once
//! on one disk; further opens queue in FIFO order and fail with `Timeout`
//! if they wait too long.

use dashmap::DashMap;
use ktlog_core::{DiskId, LogError, LogResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct GateState {
    available: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// FIFO counting gate.
#[derive(Debug)]
pub struct QuotaGate {
    quota: usize,
    state: Mutex<GateState>,
    released: Condvar,
}

impl QuotaGate {
    /// Create a gate admitting `quota` holders at once
    pub fn new(quota: usize) -> Arc<Self> {
        Arc::new(QuotaGate {
            quota,
            state: Mutex::new(GateState {
                available: quota,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            released: Condvar::new(),
        })
    }

    /// Wait for admission.
    ///
    /// # Errors
    ///
    /// `Timeout` if not admitted within `timeout`.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> LogResult<QuotaGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.available > 0 {
            state.available -= 1;
            return Ok(QuotaGuard {
                gate: Arc::clone(self),
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        loop {
            if state.waiters.front() == Some(&ticket) && state.available > 0 {
                state.waiters.pop_front();
                state.available -= 1;
                self.released.notify_all();
                return Ok(QuotaGuard {
                    gate: Arc::clone(self),
                });
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                state.waiters.retain(|t| *t != ticket);
                self.released.notify_all();
                warn!(target: "ktlog::gate", quota = self.quota, "Open gate wait timed out");
                return Err(LogError::Timeout("waiting for the stream open gate".into()));
            }
        }
    }

    /// Holders currently admitted
    pub fn in_use(&self) -> usize {
        self.quota - self.state.lock().available
    }

    /// Requests waiting for admission
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Admission to a `QuotaGate`, returned on drop.
#[derive(Debug)]
pub struct QuotaGuard {
    gate: Arc<QuotaGate>,
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        assert!(
            state.available < self.gate.quota,
            "open gate released more than acquired"
        );
        state.available += 1;
        self.gate.released.notify_all();
    }
}

/// One open gate per disk, created on first use.
#[derive(Debug)]
pub struct GateRegistry {
    quota: usize,
    gates: DashMap<DiskId, Arc<QuotaGate>>,
}

impl GateRegistry {
    /// Create a registry whose gates admit `quota` opens each
    pub fn new(quota: usize) -> Self {
        GateRegistry {
            quota,
            gates: DashMap::new(),
        }
    }

    /// Gate of `disk`, creating it if needed
    pub fn gate_for(&self, disk: DiskId) -> Arc<QuotaGate> {
        let quota = self.quota;
        let gate = self
            .gates
            .entry(disk)
            .or_insert_with(|| {
                debug!(target: "ktlog::gate", disk = %disk, quota, "Created open gate");
                QuotaGate::new(quota)
            });
        Arc::clone(gate.value())
    }

    /// Number of disks with a gate
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether no gate has been created
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
