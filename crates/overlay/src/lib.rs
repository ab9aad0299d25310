//! Shared/dedicated log tiering for KTLog
//!
//! An overlay stream keeps every record twice for a short while: once in a
//! shared physical container that many streams write to, and once in a
//! dedicated container of its own. The shared copy is written straight
//! away and acknowledges the caller quickly; the dedicated copy goes through
//! a coalescer that packs many records into one physical record. Once a
//! record is durable in its dedicated log the shared copy is truncated.
//!
//! This crate provides:
//! - `OverlayManager`: composition root owning the buffer pool, open gates,
//!   flush timer and the container/stream tables
//! - `OverlayLog`: a shared container and its overlay streams
//! - `OverlayStream`: the `RecordStream` implementation over both tiers
//! - `throttle`: the process-wide write buffer pool
//! - `gate`: per-disk admission of stream opens
//!
//! # Recovery
//!
//! Opening a stream replays its dedicated log and copies in any record the
//! shared log holds that the dedicated log lacks, so a crash between the
//! two writes loses nothing that was acknowledged.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod coalesce;
pub mod config;
pub mod counters;
pub mod gate;
pub mod log;
pub mod manager;
pub mod open;
pub mod stream;
pub mod tables;
pub mod throttle;
pub mod timer;

pub use config::{ConfigError, MemoryThrottleLimits, OverlayConfig, SharedLogSettings};
pub use counters::PerfCounters;
pub use log::{LogKey, OverlayLog, StreamKey};
pub use manager::{MemoryThrottleUsage, OverlayManager};
pub use open::OpenReport;
pub use stream::OverlayStream;
pub use throttle::{BufferGrant, ThrottleAllocator, ThrottleUsage};
