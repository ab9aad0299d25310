//! Error types for the log engine
//!
//! Every operation in the physical and overlay layers terminates with a
//! `LogResult`. The variants mirror the status taxonomy that callers are
//! expected to branch on: space exhaustion, collisions, integrity failures,
//! lifecycle conditions and timeouts.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Error taxonomy for log, stream and record operations
#[derive(Debug, Error)]
pub enum LogError {
    /// Referenced log, stream or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create collides with an existing id, or an overwrite supplied a
    /// version that is not higher than the stored one
    #[error("Name collision: {0}")]
    NameCollision(String),

    /// Insufficient container space; the log remains usable and the
    /// operation's side effects were not applied
    #[error("Log full: requested {requested} bytes, {available} available")]
    LogFull {
        /// Bytes the operation needed
        requested: u64,
        /// Bytes that were available
        available: u64,
    },

    /// Record exceeds the configured maximum record size
    #[error("Buffer overflow: record of {size} bytes exceeds limit of {max} bytes")]
    BufferOverflow {
        /// Size of the rejected record
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Caller-supplied read limit is smaller than the record
    #[error("Buffer too small: record needs {needed} bytes, limit is {limit} bytes")]
    BufferTooSmall {
        /// Bytes required to return the record
        needed: u64,
        /// Limit supplied by the caller
        limit: u64,
    },

    /// Target is in the middle of being deleted
    #[error("Delete pending: {0}")]
    DeletePending(String),

    /// On-disk structural inconsistency; the instance is unusable for writes
    #[error("Log structure fault: {0}")]
    StructureFault(String),

    /// Recovered container carries a different log id than requested
    #[error("Invalid log id: expected {expected}, found {found}")]
    InvalidLogId {
        /// Requested log id
        expected: String,
        /// Log id found in the container header
        found: String,
    },

    /// Metadata failed its integrity check
    #[error("CRC error: {0}")]
    CrcError(String),

    /// Payload failed structural validation
    #[error("Data error: {0}")]
    DataError(String),

    /// Stream reservation is smaller than the amount a reserved write wants to use
    #[error("Reserve too small: requested {requested}, reserved {reserved}")]
    ReserveTooSmall {
        /// Reservation the write tried to draw down
        requested: u64,
        /// Reservation currently held by the stream
        reserved: u64,
    },

    /// Manager or container is shutting down; no side effects were applied
    #[error("Shutdown pending")]
    ShutdownPending,

    /// Gate, allocator or retry wait exceeded its bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Argument outside the accepted range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Resource is in use and cannot be removed
    #[error("Sharing violation: {0}")]
    SharingViolation(String),

    /// Operation was cancelled before it committed to I/O
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error from the underlying block device
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LogError {
    /// Build a `NotFound` from anything displayable
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        LogError::NotFound(what.to_string())
    }

    /// Build a `NameCollision` from anything displayable
    pub fn collision(what: impl std::fmt::Display) -> Self {
        LogError::NameCollision(what.to_string())
    }

    /// Build a `DeletePending` from anything displayable
    pub fn delete_pending(what: impl std::fmt::Display) -> Self {
        LogError::DeletePending(what.to_string())
    }

    /// Whether the overlay layer may retry the operation internally.
    ///
    /// Only timeouts and space exhaustion are transient. Structural and
    /// integrity failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Timeout(_) | LogError::LogFull { .. })
    }

    /// Whether the failing instance must be considered unusable afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::StructureFault(_) | LogError::InvalidLogId { .. }
        )
    }

    /// Whether the error reports an integrity failure on read
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, LogError::CrcError(_) | LogError::DataError(_))
    }

    /// Produce an equivalent error value.
    ///
    /// `io::Error` is not `Clone`; the copy keeps its kind and message so a
    /// single flush failure can be reported to every coalesced caller.
    pub fn duplicate(&self) -> Self {
        match self {
            LogError::NotFound(s) => LogError::NotFound(s.clone()),
            LogError::NameCollision(s) => LogError::NameCollision(s.clone()),
            LogError::LogFull {
                requested,
                available,
            } => LogError::LogFull {
                requested: *requested,
                available: *available,
            },
            LogError::BufferOverflow { size, max } => LogError::BufferOverflow {
                size: *size,
                max: *max,
            },
            LogError::BufferTooSmall { needed, limit } => LogError::BufferTooSmall {
                needed: *needed,
                limit: *limit,
            },
            LogError::DeletePending(s) => LogError::DeletePending(s.clone()),
            LogError::StructureFault(s) => LogError::StructureFault(s.clone()),
            LogError::InvalidLogId { expected, found } => LogError::InvalidLogId {
                expected: expected.clone(),
                found: found.clone(),
            },
            LogError::CrcError(s) => LogError::CrcError(s.clone()),
            LogError::DataError(s) => LogError::DataError(s.clone()),
            LogError::ReserveTooSmall {
                requested,
                reserved,
            } => LogError::ReserveTooSmall {
                requested: *requested,
                reserved: *reserved,
            },
            LogError::ShutdownPending => LogError::ShutdownPending,
            LogError::Timeout(s) => LogError::Timeout(s.clone()),
            LogError::InvalidParameter(s) => LogError::InvalidParameter(s.clone()),
            LogError::SharingViolation(s) => LogError::SharingViolation(s.clone()),
            LogError::Cancelled => LogError::Cancelled,
            LogError::Io(e) => LogError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}
