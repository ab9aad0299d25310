//! Default sizes, limits and timer settings
//!
//! Configuration structs in the physical and overlay crates take their
//! defaults and accepted ranges from here so that both layers agree.

use std::time::Duration;

/// Smallest container a caller may create (1MB)
pub const MIN_LOG_SIZE: u64 = 1024 * 1024;

/// Default container size when none is given (256MB)
pub const DEFAULT_LOG_SIZE: u64 = 256 * 1024 * 1024;

/// Default maximum number of streams per container
pub const DEFAULT_MAX_STREAMS: u32 = 3 * 512;

/// Upper bound on streams per container
pub const MAX_STREAMS_LIMIT: u32 = 3 * 8192;

/// Default maximum record size (metadata plus data) (1MB)
pub const DEFAULT_MAX_RECORD_SIZE: u64 = 1024 * 1024;

/// Smallest accepted maximum record size (4KB)
pub const MIN_MAX_RECORD_SIZE: u64 = 4 * 1024;

/// Default read cache budget per container (16MB)
pub const DEFAULT_CACHE_SIZE: u64 = 16 * 1024 * 1024;

/// Number of streams a dedicated container is created for
pub const DEDICATED_CONTAINER_STREAM_COUNT: u32 = 4;

/// Granularity of pinned buffer allocations (64KB)
pub const ALLOCATION_EXTENT_SIZE: u64 = 64 * 1024;

/// Default growth of the write buffer pool per open stream (1MB)
pub const DEFAULT_WRITE_BUFFER_POOL_PER_STREAM: u64 = 0x10_0000;

/// Default minimum write buffer pool (8GB)
pub const DEFAULT_WRITE_BUFFER_POOL_MIN: u64 = 0x2_0000_0000;

/// Smallest configurable minimum write buffer pool (16MB)
pub const WRITE_BUFFER_POOL_MIN_MIN: u64 = 0x100_0000;

/// Default idle time before a partially filled coalescing buffer is flushed
pub const DEFAULT_PERIODIC_FLUSH_TIME: Duration = Duration::from_secs(60);

/// Accepted range for the periodic flush time
pub const PERIODIC_FLUSH_TIME_RANGE: (Duration, Duration) =
    (Duration::from_secs(15), Duration::from_secs(5 * 60));

/// Default tick of the periodic flush timer
pub const DEFAULT_PERIODIC_TIMER_INTERVAL: Duration = Duration::from_secs(10);

/// Accepted range for the periodic timer interval
pub const PERIODIC_TIMER_INTERVAL_RANGE: (Duration, Duration) =
    (Duration::from_secs(1), Duration::from_secs(60));

/// Default bound on waiting for a pinned buffer
pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Largest configurable allocation timeout
pub const MAX_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Delay between retries of a shared write that hit a full shared log
pub const SHARED_LOG_FULL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Default number of shared-log-full retries before giving up on the shared copy
pub const DEFAULT_SHARED_LOG_FULL_RETRIES: u32 = 5;

/// Default number of concurrent stream opens admitted per disk
pub const DEFAULT_OPEN_GATE_QUOTA: usize = 4;

/// Default bound on waiting for the per-disk open gate
pub const DEFAULT_OPEN_GATE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Padding below which a coalescing buffer under memory pressure is flushed
pub const MAX_BYTES_PADDING_WHEN_UNDER_PRESSURE: u64 = 32;

/// Round `size` up to the next allocation extent
pub fn round_to_extent(size: u64) -> u64 {
    size.div_ceil(ALLOCATION_EXTENT_SIZE) * ALLOCATION_EXTENT_SIZE
}
