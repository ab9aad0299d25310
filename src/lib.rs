//! KTLog - durable multi-stream write-ahead log
//!
//! KTLog stores many independent record streams inside shared log
//! containers. Records are addressed by an application sequence number
//! (ASN) and a version, and each stream is truncated from the front once
//! its owner no longer needs the old records.
//!
//! # Quick Start
//!
//! ```ignore
//! use ktlog::{OverlayConfig, OverlayManager, MemoryDeviceProvider, RecordStream};
//! use ktlog::{Asn, DiskId, LogCreateOptions, LogId, ReadType, StreamId, StreamType};
//!
//! let manager = OverlayManager::new(Arc::new(MemoryDeviceProvider::new()), OverlayConfig::new())?;
//! let log = manager.create_log(DiskId::new(), LogId::new(), StreamType::new(), &LogCreateOptions::new())?;
//! let stream = log.create_log_stream(StreamId::new(), StreamType::new())?;
//!
//! stream.write(Asn::new(1), 1, b"meta", b"data")?;
//! let record = stream.read(Asn::new(1), ReadType::Exact)?;
//! ```
//!
//! # Architecture
//!
//! - `ktlog-core`: identifiers, records, errors, the `RecordStream` trait
//!   and the synchronization primitives shared by both layers
//! - `ktlog-physical`: containers on a block device; one container holds
//!   many streams
//! - `ktlog-overlay`: gives every stream a dedicated container next to the
//!   shared one, coalesces writes into it and throttles writers

pub use ktlog_core::*;
pub use ktlog_overlay::{
    MemoryThrottleLimits, MemoryThrottleUsage, OpenReport, OverlayConfig, OverlayLog,
    OverlayManager, OverlayStream, PerfCounters, SharedLogSettings,
};
pub use ktlog_physical::{
    DeviceProvider, FileDeviceProvider, LogCreateOptions, MemoryDeviceProvider, PhysicalConfig,
    PhysicalLog, PhysicalLogManager, PhysicalStream, RecordVerifier,
};
