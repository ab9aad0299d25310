//! Overlay configuration.
//!
//! `OverlayConfig` bundles everything an overlay manager needs:
//! - `PhysicalConfig` for the physical manager it drives
//! - `MemoryThrottleLimits` for the process-wide buffer allocator and the
//!   coalescing flush timer
//! - `SharedLogSettings` for routing writes through the shared log
//! - `LogCreateOptions` used for every dedicated container
//!
//! Limits follow the builder pattern and are checked by `validate()` before
//! a manager accepts them.

use ktlog_core::limits::{
    DEDICATED_CONTAINER_STREAM_COUNT, DEFAULT_ALLOCATION_TIMEOUT, DEFAULT_OPEN_GATE_QUOTA,
    DEFAULT_OPEN_GATE_TIMEOUT, DEFAULT_PERIODIC_FLUSH_TIME, DEFAULT_PERIODIC_TIMER_INTERVAL,
    DEFAULT_SHARED_LOG_FULL_RETRIES, DEFAULT_WRITE_BUFFER_POOL_MIN,
    DEFAULT_WRITE_BUFFER_POOL_PER_STREAM, MAX_ALLOCATION_TIMEOUT, PERIODIC_FLUSH_TIME_RANGE,
    PERIODIC_TIMER_INTERVAL_RANGE, SHARED_LOG_FULL_RETRY_DELAY, WRITE_BUFFER_POOL_MIN_MIN,
};
use ktlog_core::LogError;
use ktlog_physical::{LogCreateOptions, PhysicalConfig};
use std::time::Duration;

/// Smallest accepted per-stream destaging backlog limit (16MB)
pub const MIN_DESTAGING_WRITE_OUTSTANDING: u64 = 16 * 1024 * 1024;

/// Shared log usage percentage meaning "never throttle"
pub const NO_SHARED_LOG_THROTTLE_LIMIT: u8 = 100;

/// Default shared log usage percentage at which writes are throttled
pub const DEFAULT_SHARED_LOG_THROTTLE_LIMIT: u8 = 90;

/// Limits of the process-wide write buffer pool and the flush timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryThrottleLimits {
    /// Upper bound the pool may grow to as streams open (None: no bound)
    pub write_buffer_pool_max: Option<u64>,

    /// Pool size before any stream opens (None: pool is unlimited)
    pub write_buffer_pool_min: Option<u64>,

    /// Bytes the pool grows by for every open stream (default: 1MB)
    pub write_buffer_pool_per_stream: u64,

    /// Age of buffered appends that forces a coalescing flush (default: 60s)
    pub periodic_flush_time: Duration,

    /// Tick of the flush timer (default: 10s)
    pub periodic_timer_interval: Duration,

    /// How long a buffer request waits in the pool queue (None: forever)
    pub allocation_timeout: Option<Duration>,

    /// Dedicated write backlog per stream above which writes are held back
    /// (None: no limit)
    pub maximum_destaging_write_outstanding: Option<u64>,

    /// Shared log usage percentage at which writes are throttled
    /// (100: never)
    pub shared_log_throttle_limit_percent: u8,
}

impl Default for MemoryThrottleLimits {
    fn default() -> Self {
        MemoryThrottleLimits {
            write_buffer_pool_max: None,
            write_buffer_pool_min: Some(DEFAULT_WRITE_BUFFER_POOL_MIN),
            write_buffer_pool_per_stream: DEFAULT_WRITE_BUFFER_POOL_PER_STREAM,
            periodic_flush_time: DEFAULT_PERIODIC_FLUSH_TIME,
            periodic_timer_interval: DEFAULT_PERIODIC_TIMER_INTERVAL,
            allocation_timeout: Some(DEFAULT_ALLOCATION_TIMEOUT),
            maximum_destaging_write_outstanding: None,
            shared_log_throttle_limit_percent: DEFAULT_SHARED_LOG_THROTTLE_LIMIT,
        }
    }
}

impl MemoryThrottleLimits {
    /// Create limits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pool bounds (builder pattern).
    pub fn with_write_buffer_pool(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.write_buffer_pool_min = min;
        self.write_buffer_pool_max = max;
        self
    }

    /// Set per-stream pool growth (builder pattern).
    pub fn with_write_buffer_pool_per_stream(mut self, bytes: u64) -> Self {
        self.write_buffer_pool_per_stream = bytes;
        self
    }

    /// Set flush timer settings (builder pattern).
    pub fn with_periodic_flush(mut self, flush_time: Duration, timer_interval: Duration) -> Self {
        self.periodic_flush_time = flush_time;
        self.periodic_timer_interval = timer_interval;
        self
    }

    /// Set pool wait bound (builder pattern).
    pub fn with_allocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.allocation_timeout = timeout;
        self
    }

    /// Set dedicated backlog limit (builder pattern).
    pub fn with_maximum_destaging_write_outstanding(mut self, bytes: Option<u64>) -> Self {
        self.maximum_destaging_write_outstanding = bytes;
        self
    }

    /// Set shared log throttle percentage (builder pattern).
    pub fn with_shared_log_throttle_limit_percent(mut self, percent: u8) -> Self {
        self.shared_log_throttle_limit_percent = percent;
        self
    }

    /// Validate limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(min) = self.write_buffer_pool_min {
            if min < WRITE_BUFFER_POOL_MIN_MIN {
                return Err(ConfigError::PoolMinTooSmall(min));
            }
            if let Some(max) = self.write_buffer_pool_max {
                if max < min {
                    return Err(ConfigError::PoolMaxBelowMin { max, min });
                }
            }
        }

        let (lo, hi) = PERIODIC_FLUSH_TIME_RANGE;
        if self.periodic_flush_time < lo || self.periodic_flush_time > hi {
            return Err(ConfigError::DurationOutOfRange(
                "periodic_flush_time",
                self.periodic_flush_time,
            ));
        }
        let (lo, hi) = PERIODIC_TIMER_INTERVAL_RANGE;
        if self.periodic_timer_interval < lo
            || self.periodic_timer_interval > hi
            || self.periodic_timer_interval > self.periodic_flush_time
        {
            return Err(ConfigError::DurationOutOfRange(
                "periodic_timer_interval",
                self.periodic_timer_interval,
            ));
        }

        if let Some(timeout) = self.allocation_timeout {
            if timeout > MAX_ALLOCATION_TIMEOUT {
                return Err(ConfigError::DurationOutOfRange(
                    "allocation_timeout",
                    timeout,
                ));
            }
        }

        if let Some(bytes) = self.maximum_destaging_write_outstanding {
            if bytes < MIN_DESTAGING_WRITE_OUTSTANDING {
                return Err(ConfigError::DestagingLimitTooSmall(bytes));
            }
        }

        if self.shared_log_throttle_limit_percent == 0
            || self.shared_log_throttle_limit_percent > NO_SHARED_LOG_THROTTLE_LIMIT
        {
            return Err(ConfigError::PercentOutOfRange(
                "shared_log_throttle_limit_percent",
                self.shared_log_throttle_limit_percent,
            ));
        }
        Ok(())
    }

    /// Small pool and a one second flush tick, for tests.
    pub fn for_testing() -> Self {
        MemoryThrottleLimits {
            write_buffer_pool_max: Some(64 * 1024 * 1024),
            write_buffer_pool_min: Some(WRITE_BUFFER_POOL_MIN_MIN),
            write_buffer_pool_per_stream: DEFAULT_WRITE_BUFFER_POOL_PER_STREAM,
            periodic_flush_time: PERIODIC_FLUSH_TIME_RANGE.0,
            periodic_timer_interval: PERIODIC_TIMER_INTERVAL_RANGE.0,
            allocation_timeout: Some(Duration::from_secs(5)),
            maximum_destaging_write_outstanding: None,
            shared_log_throttle_limit_percent: NO_SHARED_LOG_THROTTLE_LIMIT,
        }
    }
}

/// How writes use the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLogSettings {
    /// Delay between retries of a write the shared log reported full
    /// (default: 3s)
    pub full_retry_delay: Duration,

    /// Retries before a shared-log-full write gives up on the shared copy
    /// (default: 5)
    pub full_retries: u32,

    /// Open streams in write-only-to-dedicated mode (default: false)
    pub write_only_to_dedicated: bool,
}

impl Default for SharedLogSettings {
    fn default() -> Self {
        SharedLogSettings {
            full_retry_delay: SHARED_LOG_FULL_RETRY_DELAY,
            full_retries: DEFAULT_SHARED_LOG_FULL_RETRIES,
            write_only_to_dedicated: false,
        }
    }
}

impl SharedLogSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set shared-log-full retry policy (builder pattern).
    pub fn with_full_retry(mut self, delay: Duration, retries: u32) -> Self {
        self.full_retry_delay = delay;
        self.full_retries = retries;
        self
    }

    /// Bypass the shared log for new streams (builder pattern).
    pub fn with_write_only_to_dedicated(mut self, enabled: bool) -> Self {
        self.write_only_to_dedicated = enabled;
        self
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.full_retry_delay > Duration::from_secs(60) {
            return Err(ConfigError::DurationOutOfRange(
                "full_retry_delay",
                self.full_retry_delay,
            ));
        }
        Ok(())
    }

    /// Short retry delay for tests.
    pub fn for_testing() -> Self {
        SharedLogSettings {
            full_retry_delay: Duration::from_millis(20),
            full_retries: DEFAULT_SHARED_LOG_FULL_RETRIES,
            write_only_to_dedicated: false,
        }
    }
}

/// Configuration of an overlay manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Physical manager tuning
    pub physical: PhysicalConfig,

    /// Buffer pool and flush timer limits
    pub throttle: MemoryThrottleLimits,

    /// Shared log routing
    pub shared: SharedLogSettings,

    /// Options of every dedicated container. The stream count is always
    /// forced to the dedicated container stream count.
    pub dedicated_log: LogCreateOptions,

    /// Concurrent stream opens allowed per disk (default: 4)
    pub open_gate_quota: usize,

    /// How long a stream open waits for its disk gate (default: 2 min)
    pub open_gate_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            physical: PhysicalConfig::default(),
            throttle: MemoryThrottleLimits::default(),
            shared: SharedLogSettings::default(),
            dedicated_log: LogCreateOptions::default()
                .with_max_streams(DEDICATED_CONTAINER_STREAM_COUNT),
            open_gate_quota: DEFAULT_OPEN_GATE_QUOTA,
            open_gate_timeout: DEFAULT_OPEN_GATE_TIMEOUT,
        }
    }
}

impl OverlayConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set physical manager tuning (builder pattern).
    pub fn with_physical(mut self, physical: PhysicalConfig) -> Self {
        self.physical = physical;
        self
    }

    /// Set buffer pool limits (builder pattern).
    pub fn with_throttle(mut self, throttle: MemoryThrottleLimits) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set shared log routing (builder pattern).
    pub fn with_shared(mut self, shared: SharedLogSettings) -> Self {
        self.shared = shared;
        self
    }

    /// Set dedicated container options (builder pattern).
    pub fn with_dedicated_log(mut self, options: LogCreateOptions) -> Self {
        self.dedicated_log = options;
        self
    }

    /// Set per-disk open gate (builder pattern).
    pub fn with_open_gate(mut self, quota: usize, timeout: Duration) -> Self {
        self.open_gate_quota = quota;
        self.open_gate_timeout = timeout;
        self
    }

    /// Options used to create a dedicated container
    pub fn dedicated_options(&self) -> LogCreateOptions {
        self.dedicated_log
            .clone()
            .with_max_streams(DEDICATED_CONTAINER_STREAM_COUNT)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.physical.validate()?;
        self.throttle.validate()?;
        self.shared.validate()?;
        self.dedicated_options().validate()?;
        if self.open_gate_quota == 0 {
            return Err(ConfigError::ZeroOpenGateQuota);
        }
        Ok(())
    }

    /// Small containers, short timers and retries, for tests.
    pub fn for_testing() -> Self {
        OverlayConfig {
            physical: PhysicalConfig::for_testing(),
            throttle: MemoryThrottleLimits::for_testing(),
            shared: SharedLogSettings::for_testing(),
            dedicated_log: LogCreateOptions::for_testing()
                .with_max_streams(DEDICATED_CONTAINER_STREAM_COUNT),
            open_gate_quota: 2,
            open_gate_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Pool minimum below 16MB.
    #[error("Write buffer pool minimum {0} is below 16MB")]
    PoolMinTooSmall(u64),

    /// Pool maximum below its minimum.
    #[error("Write buffer pool maximum {max} is below the minimum {min}")]
    PoolMaxBelowMin {
        /// Configured maximum
        max: u64,
        /// Configured minimum
        min: u64,
    },

    /// Timer or timeout outside its accepted range.
    #[error("{0} of {1:?} is out of range")]
    DurationOutOfRange(&'static str, Duration),

    /// Destaging backlog limit below 16MB.
    #[error("Destaging write limit {0} is below 16MB")]
    DestagingLimitTooSmall(u64),

    /// Percentage outside 1..=100.
    #[error("{0} must be between 1 and 100, got {1}")]
    PercentOutOfRange(&'static str, u8),

    /// Open gate needs a quota of at least one.
    #[error("Open gate quota must be at least 1")]
    ZeroOpenGateQuota,

    /// Physical configuration error.
    #[error(transparent)]
    Physical(#[from] ktlog_physical::ConfigError),
}

impl From<ConfigError> for LogError {
    fn from(e: ConfigError) -> Self {
        LogError::InvalidParameter(e.to_string())
    }
}
