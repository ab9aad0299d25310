//! Physical log containers for KTLog
//!
//! A physical log container multiplexes many append-only streams over one
//! block device. This crate provides:
//! - `PhysicalLogManager`: creates, opens, deletes and enumerates containers
//! - `PhysicalLog`: stream lifecycle plus space, reservation and LSN queries
//! - `PhysicalStream`: versioned records addressed by ASN
//! - `device`: the block storage seam, with file and in-memory providers
//! - `format`: the on-disk header and frame encoding
//!
//! # Durability
//!
//! Every mutation is one frame appended and synced before the operation
//! completes. Opening a container replays its frames; a torn final frame is
//! trimmed, any other damage fails the open.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
mod catalog;
mod compaction;
pub mod config;
pub mod device;
pub mod format;
pub mod log;
pub mod manager;
pub mod recovery;
pub mod stream;

pub use config::{ConfigError, LogCreateOptions, PhysicalConfig};
pub use device::{
    BlockDevice, DeviceFault, DeviceProvider, FileDevice, FileDeviceProvider, MemoryDevice,
    MemoryDeviceProvider,
};
pub use log::{PhysicalLog, StreamUsage};
pub use manager::{PhysicalLogManager, RecordVerifier};
pub use recovery::RecoveryStats;
pub use stream::PhysicalStream;
