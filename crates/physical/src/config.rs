//! Physical log configuration.
//!
//! `LogCreateOptions` describes a container at creation time and is persisted
//! in the container header. `PhysicalConfig` tunes a manager instance and is
//! not persisted.

use ktlog_core::limits::{
    DEFAULT_CACHE_SIZE, DEFAULT_LOG_SIZE, DEFAULT_MAX_RECORD_SIZE, DEFAULT_MAX_STREAMS,
    MAX_STREAMS_LIMIT, MIN_LOG_SIZE, MIN_MAX_RECORD_SIZE,
};
use ktlog_core::LogError;

/// Parameters of a new log container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCreateOptions {
    /// Container capacity in bytes, header included (default: 256MB)
    pub log_size: u64,

    /// Maximum number of streams the container accepts (default: 1536)
    pub max_streams: u32,

    /// Maximum size of one record frame (default: 1MB)
    pub max_record_size: u64,

    /// Caller-defined flags stored in the header
    pub flags: u32,
}

impl Default for LogCreateOptions {
    fn default() -> Self {
        LogCreateOptions {
            log_size: DEFAULT_LOG_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            flags: 0,
        }
    }
}

impl LogCreateOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set container size (builder pattern).
    pub fn with_log_size(mut self, size: u64) -> Self {
        self.log_size = size;
        self
    }

    /// Set maximum stream count (builder pattern).
    pub fn with_max_streams(mut self, max_streams: u32) -> Self {
        self.max_streams = max_streams;
        self
    }

    /// Set maximum record size (builder pattern).
    pub fn with_max_record_size(mut self, size: u64) -> Self {
        self.max_record_size = size;
        self
    }

    /// Set header flags (builder pattern).
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Validate options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_size < MIN_LOG_SIZE {
            return Err(ConfigError::LogSizeTooSmall(self.log_size));
        }
        if self.max_streams == 0 || self.max_streams > MAX_STREAMS_LIMIT {
            return Err(ConfigError::MaxStreamsOutOfRange(self.max_streams));
        }
        if self.max_record_size < MIN_MAX_RECORD_SIZE {
            return Err(ConfigError::RecordSizeTooSmall(self.max_record_size));
        }
        // The container keeps two maximum records of headroom for itself
        if self.max_record_size > self.log_size / 4 {
            return Err(ConfigError::RecordSizeExceedsLog {
                record: self.max_record_size,
                log: self.log_size,
            });
        }
        Ok(())
    }

    /// Small container for tests (4MB, 64KB records).
    pub fn for_testing() -> Self {
        LogCreateOptions {
            log_size: 4 * 1024 * 1024,
            max_streams: 64,
            max_record_size: 64 * 1024,
            flags: 0,
        }
    }
}

/// Tuning of a physical log manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalConfig {
    /// Read cache budget per container in bytes (default: 16MB)
    pub cache_size: u64,

    /// Dead bytes, as a percentage of the container size, that trigger a
    /// compaction after truncation (default: 25)
    pub compaction_threshold_percent: u8,

    /// Free space, as a percentage of the container size, below which the
    /// container counts as short of space for truncation (default: 20)
    pub space_pressure_percent: u8,

    /// Worker threads running `start_*` operations (default: 4)
    pub dispatcher_threads: usize,
}

impl Default for PhysicalConfig {
    fn default() -> Self {
        PhysicalConfig {
            cache_size: DEFAULT_CACHE_SIZE,
            compaction_threshold_percent: 25,
            space_pressure_percent: 20,
            dispatcher_threads: 4,
        }
    }
}

impl PhysicalConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set read cache budget (builder pattern).
    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Set compaction threshold (builder pattern).
    pub fn with_compaction_threshold_percent(mut self, percent: u8) -> Self {
        self.compaction_threshold_percent = percent;
        self
    }

    /// Set space pressure threshold (builder pattern).
    pub fn with_space_pressure_percent(mut self, percent: u8) -> Self {
        self.space_pressure_percent = percent;
        self
    }

    /// Set dispatcher worker count (builder pattern).
    pub fn with_dispatcher_threads(mut self, threads: usize) -> Self {
        self.dispatcher_threads = threads;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compaction_threshold_percent == 0 || self.compaction_threshold_percent > 100 {
            return Err(ConfigError::PercentOutOfRange(
                "compaction_threshold_percent",
                self.compaction_threshold_percent,
            ));
        }
        if self.space_pressure_percent > 100 {
            return Err(ConfigError::PercentOutOfRange(
                "space_pressure_percent",
                self.space_pressure_percent,
            ));
        }
        if self.dispatcher_threads == 0 {
            return Err(ConfigError::NoDispatcherThreads);
        }
        Ok(())
    }

    /// Configuration for tests: small cache, two workers.
    pub fn for_testing() -> Self {
        PhysicalConfig {
            cache_size: 256 * 1024,
            compaction_threshold_percent: 25,
            space_pressure_percent: 20,
            dispatcher_threads: 2,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Container below the minimum size (1MB).
    #[error("Log size {0} is below the 1MB minimum")]
    LogSizeTooSmall(u64),

    /// Stream count is zero or above the supported limit.
    #[error("Max streams {0} is out of range")]
    MaxStreamsOutOfRange(u32),

    /// Record size below the minimum (4KB).
    #[error("Max record size {0} is below the 4KB minimum")]
    RecordSizeTooSmall(u64),

    /// Record size leaves no room in the container.
    #[error("Max record size {record} is too large for a log of {log} bytes")]
    RecordSizeExceedsLog {
        /// Requested maximum record size
        record: u64,
        /// Requested container size
        log: u64,
    },

    /// Percentage setting above 100 (or zero where not allowed).
    #[error("{0} must be a percentage, got {1}")]
    PercentOutOfRange(&'static str, u8),

    /// Dispatcher needs at least one worker.
    #[error("Dispatcher needs at least one worker thread")]
    NoDispatcherThreads,
}

impl From<ConfigError> for LogError {
    fn from(e: ConfigError) -> Self {
        LogError::InvalidParameter(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        assert!(LogCreateOptions::default().validate().is_ok());
        assert!(LogCreateOptions::for_testing().validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let options = LogCreateOptions::new()
            .with_log_size(10 * 1024 * 1024)
            .with_max_streams(8)
            .with_max_record_size(16 * 1024)
            .with_flags(3);
        assert_eq!(options.log_size, 10 * 1024 * 1024);
        assert_eq!(options.max_streams, 8);
        assert_eq!(options.max_record_size, 16 * 1024);
        assert_eq!(options.flags, 3);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_log_too_small() {
        let options = LogCreateOptions::new().with_log_size(512 * 1024);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::LogSizeTooSmall(_))
        ));
    }

    #[test]
    fn test_stream_count_range() {
        let options = LogCreateOptions::new().with_max_streams(0);
        assert!(options.validate().is_err());
        let options = LogCreateOptions::new().with_max_streams(MAX_STREAMS_LIMIT + 1);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::MaxStreamsOutOfRange(_))
        ));
    }

    #[test]
    fn test_record_size_bounds() {
        let options = LogCreateOptions::new().with_max_record_size(1024);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::RecordSizeTooSmall(1024))
        ));

        let options = LogCreateOptions::new()
            .with_log_size(MIN_LOG_SIZE)
            .with_max_record_size(MIN_LOG_SIZE / 2);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::RecordSizeExceedsLog { .. })
        ));
    }

    #[test]
    fn test_config_error_maps_to_invalid_parameter() {
        let err: LogError = ConfigError::NoDispatcherThreads.into();
        assert!(matches!(err, LogError::InvalidParameter(_)));
    }

    #[test]
    fn test_physical_config_validation() {
        assert!(PhysicalConfig::default().validate().is_ok());
        assert!(PhysicalConfig::for_testing().validate().is_ok());
        assert!(PhysicalConfig::new()
            .with_compaction_threshold_percent(0)
            .validate()
            .is_err());
        assert!(PhysicalConfig::new()
            .with_space_pressure_percent(101)
            .validate()
            .is_err());
        assert!(PhysicalConfig::new()
            .with_dispatcher_threads(0)
            .validate()
            .is_err());
    }
}
