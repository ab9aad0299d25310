//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use ktlog::{
    Asn, DiskId, Event, LogCreateOptions, LogId, MemoryDeviceProvider, OverlayConfig, OverlayLog,
    OverlayManager, OverlayStream, PhysicalConfig, PhysicalLog, PhysicalLogManager,
    PhysicalStream, RecordStream, RecordVerifier, StreamId, StreamType,
};
use std::sync::{Arc, Once};
use std::time::Duration;

// ============================================================================
// Initialization
// ============================================================================

static TRACING: Once = Once::new();

/// Route `ktlog::*` events to the test output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Fixtures
// ============================================================================

/// A physical container on an in-memory device.
pub struct PhysicalFixture {
    pub manager: PhysicalLogManager,
    pub disk: DiskId,
    pub log: PhysicalLog,
}

impl PhysicalFixture {
    pub fn new() -> Self {
        Self::with_options(LogCreateOptions::for_testing())
    }

    pub fn with_options(options: LogCreateOptions) -> Self {
        Self::with_config(PhysicalConfig::for_testing(), options)
    }

    pub fn with_config(config: PhysicalConfig, options: LogCreateOptions) -> Self {
        init_tracing();
        let manager =
            PhysicalLogManager::new(Arc::new(MemoryDeviceProvider::new()), config).unwrap();
        let disk = DiskId::new();
        let log = manager
            .create_log(disk, LogId::new(), StreamType::new(), &options)
            .unwrap();
        PhysicalFixture { manager, disk, log }
    }

    pub fn stream(&self) -> PhysicalStream {
        self.stream_of(StreamType::new())
    }

    pub fn stream_of(&self, stream_type: StreamType) -> PhysicalStream {
        self.log
            .create_log_stream(StreamId::new(), stream_type)
            .unwrap()
    }
}

/// An overlay container on an in-memory device.
pub struct OverlayFixture {
    pub manager: OverlayManager,
    pub disk: DiskId,
    pub log: OverlayLog,
}

impl OverlayFixture {
    pub fn new() -> Self {
        Self::with_options(LogCreateOptions::for_testing())
    }

    pub fn with_options(options: LogCreateOptions) -> Self {
        init_tracing();
        let manager = OverlayManager::new(
            Arc::new(MemoryDeviceProvider::new()),
            OverlayConfig::for_testing(),
        )
        .unwrap();
        let disk = DiskId::new();
        let log = manager
            .create_log(disk, LogId::new(), StreamType::new(), &options)
            .unwrap();
        OverlayFixture { manager, disk, log }
    }

    pub fn stream(&self) -> OverlayStream {
        self.stream_of(StreamType::new())
    }

    pub fn stream_of(&self, stream_type: StreamType) -> OverlayStream {
        self.log
            .create_log_stream(StreamId::new(), stream_type)
            .unwrap()
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn asn(n: u64) -> Asn {
    Asn::new(n)
}

pub fn payload(n: u64) -> Vec<u8> {
    format!("payload-{:08}", n).into_bytes()
}

/// Write `asns` at version 1 with generated payloads.
pub fn write_all(stream: &dyn RecordStream, asns: impl IntoIterator<Item = u64>) {
    for n in asns {
        stream.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
}

/// A verifier that signals `entered` and then holds the read until
/// `release` is set.
pub fn blocking_verifier(entered: Event, release: Event) -> RecordVerifier {
    Arc::new(move |_, _| {
        entered.set();
        release.wait(Duration::from_secs(10));
        true
    })
}
