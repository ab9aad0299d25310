//! Overlay performance counters.
//!
//! Each overlay stream updates its own `StreamCounters`; containers and the
//! manager report `PerfCounters` snapshots summed over their streams.

use std::iter::Sum;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one overlay stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    bytes_written: AtomicU64,
    shared_bytes_written: AtomicU64,
    dedicated_bytes_written: AtomicU64,
    dedicated_bytes_outstanding: AtomicU64,
    throttled_writes: AtomicU64,
    shared_log_full_retries: AtomicU64,
    shared_write_failures: AtomicU64,
    coalesced_flushes: AtomicU64,
    records_copied: AtomicU64,
}

impl StreamCounters {
    pub(crate) fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_shared_bytes_written(&self, bytes: u64) {
        self.shared_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_dedicated_bytes_written(&self, bytes: u64) {
        self.dedicated_bytes_written
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_dedicated_outstanding(&self, bytes: u64) {
        self.dedicated_bytes_outstanding
            .fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn sub_dedicated_outstanding(&self, bytes: u64) {
        self.dedicated_bytes_outstanding
            .fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn dedicated_outstanding(&self) -> u64 {
        self.dedicated_bytes_outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn inc_throttled_writes(&self) {
        self.throttled_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_shared_log_full_retries(&self) {
        self.shared_log_full_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_shared_write_failures(&self) {
        self.shared_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_coalesced_flushes(&self) {
        self.coalesced_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_records_copied(&self, count: u64) {
        self.records_copied.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> PerfCounters {
        PerfCounters {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            shared_bytes_written: self.shared_bytes_written.load(Ordering::Relaxed),
            dedicated_bytes_written: self.dedicated_bytes_written.load(Ordering::Relaxed),
            dedicated_bytes_outstanding: self.dedicated_bytes_outstanding.load(Ordering::Acquire),
            throttled_writes: self.throttled_writes.load(Ordering::Relaxed),
            shared_log_full_retries: self.shared_log_full_retries.load(Ordering::Relaxed),
            shared_write_failures: self.shared_write_failures.load(Ordering::Relaxed),
            coalesced_flushes: self.coalesced_flushes.load(Ordering::Relaxed),
            records_copied: self.records_copied.load(Ordering::Relaxed),
        }
    }
}

/// Counter values of a stream, or summed over many streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    /// Payload bytes acknowledged to callers
    pub bytes_written: u64,
    /// Payload bytes that reached the shared log
    pub shared_bytes_written: u64,
    /// Payload bytes that reached the dedicated log
    pub dedicated_bytes_written: u64,
    /// Payload bytes accepted but not yet durable in the dedicated log
    pub dedicated_bytes_outstanding: u64,
    /// Writes held back by dedicated or shared log throttling
    pub throttled_writes: u64,
    /// Shared writes retried after the shared log reported full
    pub shared_log_full_retries: u64,
    /// Shared writes that failed for good
    pub shared_write_failures: u64,
    /// Coalesced records written to the dedicated log
    pub coalesced_flushes: u64,
    /// Records copied from the shared log while opening
    pub records_copied: u64,
}

impl AddAssign for PerfCounters {
    fn add_assign(&mut self, other: PerfCounters) {
        self.bytes_written += other.bytes_written;
        self.shared_bytes_written += other.shared_bytes_written;
        self.dedicated_bytes_written += other.dedicated_bytes_written;
        self.dedicated_bytes_outstanding += other.dedicated_bytes_outstanding;
        self.throttled_writes += other.throttled_writes;
        self.shared_log_full_retries += other.shared_log_full_retries;
        self.shared_write_failures += other.shared_write_failures;
        self.coalesced_flushes += other.coalesced_flushes;
        self.records_copied += other.records_copied;
    }
}

impl Sum for PerfCounters {
    fn sum<I: Iterator<Item = PerfCounters>>(iter: I) -> Self {
        iter.fold(PerfCounters::default(), |mut total, c| {
            total += c;
            total
        })
    }
}
