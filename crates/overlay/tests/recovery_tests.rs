//! Overlay recovery on file-backed devices
//!
//! The manager is dropped and a new one claims the same root, so every
//! record read back comes from replayed containers.

use ktlog_core::{Asn, DiskId, LogError, LogId, ReadType, RecordStream, StreamId, StreamType};
use ktlog_overlay::{OverlayConfig, OverlayManager};
use ktlog_physical::LogCreateOptions;
use std::sync::Once;
use tempfile::TempDir;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .try_init();
    });
}

fn asn(n: u64) -> Asn {
    Asn::new(n)
}

fn open(dir: &TempDir) -> OverlayManager {
    OverlayManager::open_root(dir.path(), OverlayConfig::for_testing()).unwrap()
}

#[test]
fn test_records_survive_manager_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let disk = DiskId::new();
    let log_id = LogId::new();
    let id = StreamId::new();

    {
        let manager = open(&dir);
        let log = manager
            .create_log(disk, log_id, StreamType::new(), &LogCreateOptions::for_testing())
            .unwrap();
        let s = log.create_log_stream(id, StreamType::new()).unwrap();
        for n in 1..=30 {
            s.write(asn(n), 1, b"meta", format!("data-{}", n).as_bytes())
                .unwrap();
        }
        s.write(asn(7), 2, b"meta", b"data-7-v2").unwrap();
    }

    let manager = open(&dir);
    assert_eq!(manager.enumerate_logs(disk).unwrap(), vec![log_id]);
    let log = manager.open_log(disk, log_id).unwrap();
    let s = log.open_log_stream(id).unwrap();
    assert!(!s.open_report().created);
    assert_eq!(s.open_report().records_copied, 0);

    for n in (1..=30).filter(|n| *n != 7) {
        let record = s.read(asn(n), ReadType::Exact).unwrap();
        assert_eq!(record.data, format!("data-{}", n).into_bytes());
    }
    let record = s.read(asn(7), ReadType::Exact).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.data, b"data-7-v2");
}

#[test]
fn test_second_manager_on_root_is_refused() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let _manager = open(&dir);
    assert!(matches!(
        OverlayManager::open_root(dir.path(), OverlayConfig::for_testing()),
        Err(LogError::SharingViolation(_))
    ));
}

#[test]
fn test_shared_only_records_are_copied_on_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let disk = DiskId::new();
    let log_id = LogId::new();
    let id = StreamId::new();

    {
        let manager = open(&dir);
        let log = manager
            .create_log(disk, log_id, StreamType::new(), &LogCreateOptions::for_testing())
            .unwrap();
        let s = log.create_log_stream(id, StreamType::new()).unwrap();
        // Records that only ever reached the shared log
        for n in 1..=5 {
            s.shared_stream()
                .write(asn(n), 1, b"", format!("shared-{}", n).as_bytes())
                .unwrap();
        }
    }

    let manager = open(&dir);
    let log = manager.open_log(disk, log_id).unwrap();
    let s = log.open_log_stream(id).unwrap();
    assert_eq!(s.open_report().records_copied, 5);
    for n in 1..=5 {
        assert_eq!(
            s.read(asn(n), ReadType::Exact).unwrap().data,
            format!("shared-{}", n).into_bytes()
        );
    }
}
