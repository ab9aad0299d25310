//! Process-wide write buffer throttling.
//!
//! Every destaging write pins a buffer until its dedicated copy is durable.
//! `ThrottleAllocator` bounds the total pinned bytes across all streams of
//! one overlay manager:
//! - Grants are rounded up to whole allocation extents
//! - The limit starts at the pool minimum and grows by a fixed amount for
//!   each open stream, up to the pool maximum
//! - Requests that do not fit wait in strict FIFO order, so a large request
//!   is never starved by smaller ones arriving later
//! - A waiting request fails with `Timeout` after the allocation timeout
//!
//! The allocator counts as under memory pressure while any request waits.

use ktlog_core::limits::round_to_extent;
use ktlog_core::{LogError, LogResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct PoolState {
    /// Bytes currently granted
    current: u64,
    /// None when the pool is unlimited
    limit: Option<u64>,
    /// Ceiling for per-stream growth
    max_limit: u64,
    per_stream: u64,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    granted_total: u64,
    timed_out_total: u64,
}

impl PoolState {
    fn free(&self) -> u64 {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.current),
            None => u64::MAX,
        }
    }
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleUsage {
    /// Bytes currently granted
    pub current_allocations: u64,
    /// Current pool limit (None: unlimited)
    pub total_allocation_limit: Option<u64>,
    /// Requests waiting for space
    pub waiting: usize,
    /// Whether any request is waiting
    pub is_under_memory_pressure: bool,
    /// Grants made since creation
    pub granted_total: u64,
    /// Requests that gave up waiting
    pub timed_out_total: u64,
}

/// FIFO allocator of pinned write buffer bytes.
#[derive(Debug)]
pub struct ThrottleAllocator {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl ThrottleAllocator {
    /// Create a pool of `min` bytes (None: unlimited) growing by
    /// `per_stream` per stream up to `max` (None: no ceiling).
    pub fn new(min: Option<u64>, max: Option<u64>, per_stream: u64) -> Arc<Self> {
        Arc::new(ThrottleAllocator {
            state: Mutex::new(PoolState {
                current: 0,
                limit: min,
                max_limit: max.unwrap_or(u64::MAX),
                per_stream,
                waiters: VecDeque::new(),
                next_ticket: 0,
                granted_total: 0,
                timed_out_total: 0,
            }),
            freed: Condvar::new(),
        })
    }

    /// Replace the pool bounds. Waiters are re-examined against the new limit.
    pub fn set_limits(&self, min: Option<u64>, max: Option<u64>, per_stream: u64) {
        let mut state = self.state.lock();
        state.limit = min;
        state.max_limit = max.unwrap_or(u64::MAX);
        state.per_stream = per_stream;
        self.freed.notify_all();
    }

    /// Grow the limit for a newly opened stream. Returns the bytes added,
    /// which the stream hands back through `remove_stream` when it closes.
    pub fn add_stream(&self) -> u64 {
        let mut state = self.state.lock();
        let added = match state.limit {
            Some(limit) if state.per_stream > 0 => {
                let grown = limit.saturating_add(state.per_stream);
                if grown <= state.max_limit {
                    state.limit = Some(grown);
                    state.per_stream
                } else {
                    0
                }
            }
            _ => 0,
        };
        if added > 0 {
            self.freed.notify_all();
        }
        added
    }

    /// Shrink the limit by what `add_stream` added. The pool may run above
    /// the new limit until grants are freed.
    pub fn remove_stream(&self, added: u64) {
        if added == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(limit) = state.limit {
            assert!(added <= limit, "pool limit released more than added");
            state.limit = Some(limit - added);
        }
    }

    /// Allocate `size` bytes, rounded up to whole extents.
    ///
    /// # Errors
    ///
    /// `BufferOverflow` if the request can never fit the pool, `Timeout` if
    /// it waited longer than `timeout`.
    pub fn allocate(self: &Arc<Self>, size: u64, timeout: Option<Duration>) -> LogResult<BufferGrant> {
        let size = round_to_extent(size.max(1));
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        if let Some(limit) = state.limit {
            if size > limit {
                return Err(LogError::BufferOverflow { size, max: limit });
            }
        }

        if state.waiters.is_empty() && size <= state.free() {
            return Ok(self.grant(&mut state, size));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        debug!(
            target: "ktlog::throttle",
            size,
            current = state.current,
            waiting = state.waiters.len(),
            "Buffer request queued"
        );

        loop {
            let at_head = state.waiters.front() == Some(&ticket);
            if at_head {
                if let Some(limit) = state.limit {
                    if size > limit {
                        state.waiters.pop_front();
                        self.freed.notify_all();
                        return Err(LogError::BufferOverflow { size, max: limit });
                    }
                }
                if size <= state.free() {
                    state.waiters.pop_front();
                    let grant = self.grant(&mut state, size);
                    // The next waiter may fit in what is left
                    self.freed.notify_all();
                    return Ok(grant);
                }
            }

            let timed_out = match deadline {
                Some(deadline) => self.freed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.freed.wait(&mut state);
                    false
                }
            };
            if timed_out {
                state.waiters.retain(|t| *t != ticket);
                state.timed_out_total += 1;
                self.freed.notify_all();
                warn!(
                    target: "ktlog::throttle",
                    size,
                    current = state.current,
                    limit = ?state.limit,
                    "Buffer request timed out"
                );
                return Err(LogError::Timeout(format!(
                    "waiting for {} bytes of write buffer",
                    size
                )));
            }
        }
    }

    fn grant(self: &Arc<Self>, state: &mut PoolState, size: u64) -> BufferGrant {
        state.current += size;
        state.granted_total += 1;
        BufferGrant {
            pool: Arc::clone(self),
            size,
        }
    }

    fn free(&self, size: u64) {
        let mut state = self.state.lock();
        assert!(state.current >= size, "buffer grant freed twice");
        state.current -= size;
        self.freed.notify_all();
    }

    /// Whether any request is waiting for space
    pub fn is_under_memory_pressure(&self) -> bool {
        !self.state.lock().waiters.is_empty()
    }

    /// Snapshot of the pool
    pub fn usage(&self) -> ThrottleUsage {
        let state = self.state.lock();
        ThrottleUsage {
            current_allocations: state.current,
            total_allocation_limit: state.limit,
            waiting: state.waiters.len(),
            is_under_memory_pressure: !state.waiters.is_empty(),
            granted_total: state.granted_total,
            timed_out_total: state.timed_out_total,
        }
    }
}

/// Bytes granted by a `ThrottleAllocator`. Returned to the pool on drop.
#[derive(Debug)]
pub struct BufferGrant {
    pool: Arc<ThrottleAllocator>,
    size: u64,
}

impl BufferGrant {
    /// Granted bytes, a whole number of extents
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for BufferGrant {
    fn drop(&mut self) {
        self.pool.free(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktlog_core::limits::ALLOCATION_EXTENT_SIZE;
    use std::thread;

    const EXTENT: u64 = ALLOCATION_EXTENT_SIZE;

    #[test]
    fn test_grants_round_to_extents() {
        let pool = ThrottleAllocator::new(Some(4 * EXTENT), None, 0);
        let grant = pool.allocate(10, None).unwrap();
        assert_eq!(grant.size(), EXTENT);
        assert_eq!(pool.usage().current_allocations, EXTENT);
        drop(grant);
        assert_eq!(pool.usage().current_allocations, 0);
    }

    #[test]
    fn test_unlimited_pool_never_waits() {
        let pool = ThrottleAllocator::new(None, None, EXTENT);
        let grants: Vec<_> = (0..100)
            .map(|_| pool.allocate(EXTENT, Some(Duration::ZERO)).unwrap())
            .collect();
        assert_eq!(pool.usage().current_allocations, 100 * EXTENT);
        assert_eq!(pool.add_stream(), 0);
        drop(grants);
    }

    #[test]
    fn test_oversized_request_fails_immediately() {
        let pool = ThrottleAllocator::new(Some(2 * EXTENT), None, 0);
        assert!(matches!(
            pool.allocate(3 * EXTENT, None),
            Err(LogError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_wait_times_out_and_leaves_queue() {
        let pool = ThrottleAllocator::new(Some(2 * EXTENT), None, 0);
        let _held = pool.allocate(2 * EXTENT, None).unwrap();
        let err = pool
            .allocate(EXTENT, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, LogError::Timeout(_)));
        let usage = pool.usage();
        assert_eq!(usage.waiting, 0);
        assert!(!usage.is_under_memory_pressure);
        assert_eq!(usage.timed_out_total, 1);
    }

    #[test]
    fn test_waiter_granted_when_space_freed() {
        let pool = ThrottleAllocator::new(Some(2 * EXTENT), None, 0);
        let held = pool.allocate(2 * EXTENT, None).unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            waiter_pool
                .allocate(EXTENT, Some(Duration::from_secs(5)))
                .map(|g| g.size())
        });
        while !pool.is_under_memory_pressure() {
            thread::yield_now();
        }
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), EXTENT);
    }

    #[test]
    fn test_fifo_large_request_not_starved() {
        let pool = ThrottleAllocator::new(Some(2 * EXTENT), None, 0);
        let first = pool.allocate(EXTENT, None).unwrap();
        let second = pool.allocate(EXTENT, None).unwrap();

        // A two-extent request queues first
        let large_pool = Arc::clone(&pool);
        let large = thread::spawn(move || {
            large_pool
                .allocate(2 * EXTENT, Some(Duration::from_secs(5)))
                .is_ok()
        });
        while pool.usage().waiting < 1 {
            thread::yield_now();
        }

        // A later small request must not jump the queue once one extent frees
        drop(first);
        assert!(matches!(
            pool.allocate(EXTENT, Some(Duration::from_millis(30))),
            Err(LogError::Timeout(_))
        ));

        drop(second);
        assert!(large.join().unwrap());
    }

    #[test]
    fn test_per_stream_growth_capped() {
        let pool = ThrottleAllocator::new(Some(2 * EXTENT), Some(3 * EXTENT), EXTENT);
        assert_eq!(pool.add_stream(), EXTENT);
        assert_eq!(pool.add_stream(), 0);
        assert_eq!(pool.usage().total_allocation_limit, Some(3 * EXTENT));
        pool.remove_stream(EXTENT);
        assert_eq!(pool.usage().total_allocation_limit, Some(2 * EXTENT));
    }

    #[test]
    fn test_growth_releases_waiters() {
        let pool = ThrottleAllocator::new(Some(EXTENT), None, EXTENT);
        let _held = pool.allocate(EXTENT, None).unwrap();
        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            waiter_pool
                .allocate(EXTENT, Some(Duration::from_secs(5)))
                .is_ok()
        });
        while !pool.is_under_memory_pressure() {
            thread::yield_now();
        }
        pool.add_stream();
        assert!(waiter.join().unwrap());
    }
}
