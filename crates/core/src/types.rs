//! Core identifier and record types
//!
//! This module defines the foundational types shared by every layer:
//! - DiskId / LogId / StreamId / StreamType: 128-bit identifiers
//! - Asn: application sequence number with Null/Max sentinels
//! - AtomicAsn: lock-free monotonic high-water mark
//! - RecordDisposition, ReadType: record state and read positioning
//! - Query result structs returned by streams and containers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id using UUID v4
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an id from raw bytes
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Create an id from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse an id from its string representation
            ///
            /// Returns None if the string is not a valid UUID.
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// The all-zero id
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Whether this is the all-zero id
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Get the raw bytes of this id
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a disk (storage root) holding log containers
    DiskId
);
uuid_id!(
    /// Identifies a log container, unique within a disk
    LogId
);
uuid_id!(
    /// Identifies a stream, unique within a log container
    StreamId
);
uuid_id!(
    /// Application-defined stream type tag
    StreamType
);

impl From<StreamId> for LogId {
    /// Dedicated containers are named after the stream they hold.
    fn from(id: StreamId) -> Self {
        LogId(id.0)
    }
}

/// Application sequence number: the logical per-stream record address.
///
/// `Asn::NULL` (0) means unset and `Asn::MAX` is an exclusive upper bound.
/// Valid record addresses lie strictly between the two.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Asn(u64);

impl Asn {
    /// Invalid / unset ASN
    pub const NULL: Asn = Asn(0);

    /// Exclusive upper bound
    pub const MAX: Asn = Asn(u64::MAX);

    /// Wrap a raw value
    pub const fn new(value: u64) -> Self {
        Asn(value)
    }

    /// Raw value
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Whether the ASN is a usable record address
    pub fn is_valid(&self) -> bool {
        *self > Asn::NULL && *self < Asn::MAX
    }

    /// Whether this is the null sentinel
    pub fn is_null(&self) -> bool {
        *self == Asn::NULL
    }

    /// Replace `self` with `other` if `other` is larger
    pub fn set_if_larger(&mut self, other: Asn) {
        if other > *self {
            *self = other;
        }
    }
}

impl From<u64> for Asn {
    fn from(value: u64) -> Self {
        Asn(value)
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ASN high-water mark updated from many writer threads
#[derive(Debug, Default)]
pub struct AtomicAsn(AtomicU64);

impl AtomicAsn {
    /// Create with an initial value
    pub fn new(asn: Asn) -> Self {
        AtomicAsn(AtomicU64::new(asn.get()))
    }

    /// Current value
    pub fn load(&self) -> Asn {
        Asn(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally store a value
    pub fn store(&self, asn: Asn) {
        self.0.store(asn.get(), Ordering::Release);
    }

    /// Raise the stored value to `asn` if it is larger.
    ///
    /// Returns true if this call changed the value.
    pub fn set_if_larger(&self, asn: Asn) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if asn.get() <= current {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                asn.get(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Durability state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordDisposition {
    /// No record at this address
    None,
    /// Being written
    Pending,
    /// Durable
    Persisted,
}

/// How a read positions itself relative to the supplied ASN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    /// The record at exactly this ASN
    Exact,
    /// The record after this ASN; the ASN itself must exist
    Next,
    /// The record before this ASN; the ASN itself must exist
    Previous,
    /// The record with the largest ASN not above this ASN
    Containing,
    /// The first record above this ASN, which need not exist
    NextFromSpecificAsn,
    /// The last record below this ASN, which need not exist
    PreviousFromSpecificAsn,
}

/// Queue a physical write is placed on before it reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WritePriority {
    /// Yields to normal priority writes
    Low,
    /// Default queue
    #[default]
    Normal,
}

/// Metadata-only view of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Record address
    pub asn: Asn,
    /// Stored version
    pub version: u64,
    /// Durability state
    pub disposition: RecordDisposition,
    /// Metadata plus data bytes
    pub size: u64,
    /// Physical sequence number of the frame that holds the record
    pub lsn: u64,
}

/// Result of a synchronous record query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Actual ASN of the record found
    pub asn: Asn,
    /// Stored version
    pub version: u64,
    /// Durability state
    pub disposition: RecordDisposition,
    /// Metadata plus data bytes
    pub size: u64,
    /// Implementation-defined locator (frame LSN)
    pub debug_info: u64,
}

/// A record returned by a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// Actual ASN of the record read
    pub asn: Asn,
    /// Version stored with the record
    pub version: u64,
    /// Metadata buffer
    pub metadata: Vec<u8>,
    /// Data buffer
    pub data: Vec<u8>,
}

/// Space accounting snapshot of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Configured container capacity
    pub total_space: u64,
    /// Bytes neither used by live frames nor reserved
    pub free_space: u64,
}

/// Result of a reserved write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedWriteOutcome {
    /// Configured container capacity
    pub log_size: u64,
    /// Free space after the write
    pub space_remaining: u64,
}

/// LSN span across all streams of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsnRange {
    /// Lowest LSN still referenced by a live record
    pub lowest_lsn: u64,
    /// Highest LSN assigned so far
    pub highest_lsn: u64,
    /// Stream owning the lowest LSN, the one holding back truncation
    pub lowest_lsn_stream: Option<StreamId>,
}

/// ASN span of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsnRange {
    /// Lowest live ASN (Null when empty)
    pub lowest: Asn,
    /// Highest live ASN (Null when empty)
    pub highest: Asn,
    /// Highest ASN truncated so far
    pub truncation: Asn,
}

/// Lifecycle flags of a stream inside its container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    /// At least one handle is open
    pub is_open: bool,
    /// Known to the container but no handle is open
    pub is_closed: bool,
    /// Delete has been requested
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_round_trip_through_string() {
        let id = LogId::new();
        let parsed = LogId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(LogId::from_string("not a uuid").is_none());
    }

    #[test]
    fn test_dedicated_log_id_follows_stream() {
        let stream = StreamId::new();
        let log: LogId = stream.into();
        assert_eq!(log.as_bytes(), stream.as_bytes());
    }

    #[test]
    fn test_asn_sentinels() {
        assert!(!Asn::NULL.is_valid());
        assert!(!Asn::MAX.is_valid());
        assert!(Asn::new(1).is_valid());
        assert!(Asn::new(u64::MAX - 1).is_valid());
        assert!(Asn::NULL.is_null());
    }

    #[test]
    fn test_asn_set_if_larger() {
        let mut asn = Asn::new(5);
        asn.set_if_larger(Asn::new(3));
        assert_eq!(asn, Asn::new(5));
        asn.set_if_larger(Asn::new(9));
        assert_eq!(asn, Asn::new(9));
    }

    #[test]
    fn test_atomic_asn_monotonic() {
        let asn = AtomicAsn::new(Asn::new(10));
        assert!(!asn.set_if_larger(Asn::new(10)));
        assert!(!asn.set_if_larger(Asn::new(2)));
        assert!(asn.set_if_larger(Asn::new(11)));
        assert_eq!(asn.load(), Asn::new(11));
    }

    #[test]
    fn test_atomic_asn_concurrent_updates() {
        let asn = Arc::new(AtomicAsn::default());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let asn = Arc::clone(&asn);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        asn.set_if_larger(Asn::new(i * 8 + t));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(asn.load(), Asn::new(999 * 8 + 7));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn set_if_larger_yields_max(values in proptest::collection::vec(0u64..1_000_000, 1..64)) {
                let asn = AtomicAsn::default();
                for v in &values {
                    asn.set_if_larger(Asn::new(*v));
                }
                prop_assert_eq!(asn.load().get(), *values.iter().max().unwrap());
            }
        }
    }
}
