//! Overlay stream behaviour
//!
//! Covers the dual write path, recovery from the shared log, truncation,
//! throttling and the container/stream lifecycle.

use ktlog_core::{
    Asn, Completion, DiskId, Event, LogError, LogId, LogResult, ReadType, RecordDisposition,
    RecordStream, StreamId, StreamType,
};
use ktlog_overlay::open::{dedicated_disk_id, dedicated_log_id};
use ktlog_overlay::{OverlayConfig, OverlayLog, OverlayManager, OverlayStream, SharedLogSettings};
use ktlog_physical::{DeviceFault, LogCreateOptions, MemoryDeviceProvider, PhysicalConfig};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

struct Fixture {
    manager: OverlayManager,
    disk: DiskId,
    log_id: LogId,
    log: OverlayLog,
}

fn fixture_with(config: OverlayConfig, options: LogCreateOptions) -> Fixture {
    let manager = OverlayManager::new(Arc::new(MemoryDeviceProvider::new()), config).unwrap();
    let disk = DiskId::new();
    let log_id = LogId::new();
    let log = manager
        .create_log(disk, log_id, StreamType::new(), &options)
        .unwrap();
    Fixture {
        manager,
        disk,
        log_id,
        log,
    }
}

fn fixture() -> Fixture {
    fixture_with(OverlayConfig::for_testing(), LogCreateOptions::for_testing())
}

fn stream(log: &OverlayLog) -> OverlayStream {
    log.create_log_stream(StreamId::new(), StreamType::new())
        .unwrap()
}

fn asn(n: u64) -> Asn {
    Asn::new(n)
}

fn payload(n: u64) -> Vec<u8> {
    format!("record-{}", n).into_bytes()
}

// ============================================================================
// Write path
// ============================================================================

#[test]
fn test_read_after_write() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.write(asn(1), 1, b"meta", b"data").unwrap();

    let record = s.read(asn(1), ReadType::Exact).unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.metadata, b"meta");
    assert_eq!(record.data, b"data");

    s.flush().unwrap();
    let record = s.read(asn(1), ReadType::Exact).unwrap();
    assert_eq!(record.data, b"data");
    assert_eq!(s.pending_appends(), 0);
}

#[test]
fn test_write_lands_in_both_tiers() {
    let fx = fixture();
    let s = stream(&fx.log);
    for n in 1..=5 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    s.flush().unwrap();

    assert!(!s.dedicated_batches().unwrap().is_empty());
    let counters = s.query_perf_counters();
    assert!(counters.shared_bytes_written > 0);
    assert!(counters.dedicated_bytes_written > 0);
    assert_eq!(counters.bytes_written, counters.dedicated_bytes_written);
}

#[test]
fn test_lower_or_equal_version_is_refused() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.write(asn(5), 2, b"", b"v2").unwrap();

    assert!(matches!(
        s.write(asn(5), 2, b"", b"again"),
        Err(LogError::NameCollision(_))
    ));
    assert!(matches!(
        s.write(asn(5), 1, b"", b"older"),
        Err(LogError::NameCollision(_))
    ));

    s.write(asn(5), 3, b"", b"v3").unwrap();
    s.flush().unwrap();
    let record = s.read(asn(5), ReadType::Exact).unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.data, b"v3");
}

#[test]
fn test_read_types_span_memory_and_dedicated() {
    let fx = fixture();
    let s = stream(&fx.log);
    for n in [10, 20] {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    s.flush().unwrap();
    s.write(asn(30), 1, b"", &payload(30)).unwrap();

    let at = |n: u64, rt: ReadType| s.read(asn(n), rt).map(|r| r.asn.get());
    assert_eq!(at(20, ReadType::Next).unwrap(), 30);
    assert_eq!(at(30, ReadType::Previous).unwrap(), 20);
    assert_eq!(at(25, ReadType::Containing).unwrap(), 20);
    assert_eq!(at(15, ReadType::NextFromSpecificAsn).unwrap(), 20);
    assert_eq!(at(15, ReadType::PreviousFromSpecificAsn).unwrap(), 10);
    assert!(matches!(at(15, ReadType::Exact), Err(LogError::NotFound(_))));
    assert!(matches!(at(30, ReadType::Next), Err(LogError::NotFound(_))));
}

#[test]
fn test_oversized_record_is_refused() {
    let fx = fixture();
    let s = stream(&fx.log);
    let big = vec![0u8; 1024 * 1024];
    assert!(matches!(
        s.write(asn(1), 1, b"", &big),
        Err(LogError::BufferOverflow { .. })
    ));
}

#[test]
fn test_write_only_to_dedicated_skips_shared_log() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.set_write_only_to_dedicated(true);
    assert!(s.is_write_only_to_dedicated());

    s.write(asn(1), 1, b"", b"only-dedicated").unwrap();
    assert_eq!(s.query_perf_counters().shared_bytes_written, 0);
    assert_eq!(s.read(asn(1), ReadType::Exact).unwrap().data, b"only-dedicated");

    let mut shared = Vec::new();
    s.shared_stream()
        .query_records(asn(1), asn(100), &mut shared)
        .unwrap();
    assert!(shared.is_empty());

    s.set_write_only_to_dedicated(false);
    s.write(asn(2), 1, b"", b"both").unwrap();
    assert!(s.query_perf_counters().shared_bytes_written > 0);
}

#[test]
fn test_full_shared_log_falls_back_to_dedicated() {
    let fx = fixture_with(
        OverlayConfig::for_testing(),
        LogCreateOptions::for_testing().with_log_size(1024 * 1024),
    );
    let s = stream(&fx.log);
    let data = vec![7u8; 32 * 1024];
    for n in 1..=48 {
        s.write(asn(n), 1, b"", &data).unwrap();
    }
    s.flush().unwrap();

    for n in 1..=48 {
        assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data.len(), data.len());
    }
}

#[test]
fn test_full_dedicated_log_reports_log_full_and_recovers() {
    let config = OverlayConfig::for_testing()
        .with_dedicated_log(LogCreateOptions::for_testing().with_log_size(1024 * 1024));
    let fx = fixture_with(config, LogCreateOptions::for_testing());
    let s = stream(&fx.log);
    let data = vec![3u8; 32 * 1024];

    let mut full = 0;
    for n in 1..=80 {
        match s.write(asn(n), 1, b"", &data) {
            Ok(()) => {}
            Err(LogError::LogFull { .. }) => full += 1,
            Err(e) => panic!("write {} failed: {}", n, e),
        }
    }
    assert!(full > 0);

    // Truncation reclaims dedicated space and the stream takes writes again
    s.truncate(asn(29), asn(29)).unwrap();
    for n in 81..=90 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    s.flush().unwrap();
    assert_eq!(s.read(asn(90), ReadType::Exact).unwrap().data, payload(90));
    assert!(matches!(
        s.read(asn(29), ReadType::Exact),
        Err(LogError::NotFound(_))
    ));
    assert_eq!(s.query_asn_range().unwrap().truncation, asn(29));
}

#[test]
fn test_dedicated_backlog_throttles_writers() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.set_write_throttle_threshold(Some(1));
    assert_eq!(s.write_throttle_threshold(), Some(1));

    for n in 1..=4 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    assert!(s.query_perf_counters().throttled_writes > 0);
    for n in 1..=4 {
        assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data, payload(n));
    }

    s.set_write_throttle_threshold(None);
    s.write(asn(5), 1, b"", &payload(5)).unwrap();
}

#[test]
fn test_concurrent_writers() {
    let fx = fixture();
    let s = stream(&fx.log);
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let s = s.clone();
            thread::spawn(move || {
                for i in 0..25u64 {
                    let n = 1 + t * 25 + i;
                    s.write(asn(n), 1, b"", &payload(n)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    s.flush().unwrap();

    let mut out = Vec::new();
    s.query_records(asn(1), asn(100), &mut out).unwrap();
    assert_eq!(out.len(), 100);
    assert!(out.windows(2).all(|w| w[0].asn < w[1].asn));
}

// ============================================================================
// Queries and deletes
// ============================================================================

#[test]
fn test_query_records_reports_dispositions() {
    let fx = fixture();
    let s = stream(&fx.log);
    for n in 1..=3 {
        s.write(asn(n), 1, b"m", &payload(n)).unwrap();
    }
    let info = s.query_record(asn(2), ReadType::Exact).unwrap();
    assert_eq!(info.asn, asn(2));
    assert_eq!(info.disposition, RecordDisposition::Persisted);

    let mut out = Vec::new();
    s.query_records(asn(1), asn(3), &mut out).unwrap();
    assert_eq!(out.len(), 3);
    assert!(out
        .iter()
        .all(|r| r.disposition == RecordDisposition::Persisted));

    let range = s.query_asn_range().unwrap();
    assert_eq!(range.lowest, asn(1));
    assert_eq!(range.highest, asn(3));
}

#[test]
fn test_delete_record() {
    let fx = fixture();
    let s = stream(&fx.log);
    for n in 1..=3 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    s.flush().unwrap();

    s.delete_record(asn(2), 1).unwrap();
    assert!(matches!(
        s.read(asn(2), ReadType::Exact),
        Err(LogError::NotFound(_))
    ));
    assert_eq!(
        s.read(asn(1), ReadType::NextFromSpecificAsn).unwrap().asn,
        asn(3)
    );
    assert!(matches!(
        s.delete_record(asn(9), 1),
        Err(LogError::NotFound(_))
    ));
}

#[test]
fn test_delete_record_reports_failed_dedicated_batch() {
    let provider = Arc::new(MemoryDeviceProvider::new());
    let config = OverlayConfig::for_testing()
        .with_shared(SharedLogSettings::for_testing().with_full_retry(Duration::from_secs(1), 1));
    let manager = OverlayManager::new(provider.clone(), config).unwrap();
    let disk = DiskId::new();
    let log = manager
        .create_log(disk, LogId::new(), StreamType::new(), &LogCreateOptions::for_testing())
        .unwrap();
    let s = stream(&log);

    // Holding every free shared byte keeps the shared copy retrying
    let free = s.shared_stream().log().query_space_information().free_space;
    s.shared_stream().update_reservation(free as i64).unwrap();
    provider
        .device(dedicated_disk_id(disk), dedicated_log_id(s.stream_id()))
        .unwrap()
        .inject_fault(DeviceFault::FailAppend);

    let writer = {
        let s = s.clone();
        thread::spawn(move || s.write(asn(1), 1, b"", b"lost"))
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    let deleted = loop {
        match s.delete_record(asn(1), 1) {
            Err(LogError::NotFound(_)) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            other => break other,
        }
    };
    assert!(matches!(deleted, Err(LogError::Io(_))));
    assert!(writer.join().unwrap().is_err());
}

// ============================================================================
// Truncation and reservations
// ============================================================================

#[test]
fn test_truncation_signals_event() {
    let fx = fixture();
    let s = stream(&fx.log);
    let event = Event::new();
    s.set_truncation_completion_event(event.clone());
    for n in 1..=10 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }

    s.truncate(asn(5), asn(5)).unwrap();
    assert!(event.wait(Duration::from_secs(5)));

    assert!(matches!(
        s.read(asn(3), ReadType::Exact),
        Err(LogError::NotFound(_))
    ));
    assert_eq!(s.read(asn(6), ReadType::Exact).unwrap().data, payload(6));
    assert_eq!(s.query_asn_range().unwrap().truncation, asn(5));
    assert!(matches!(
        s.write(asn(4), 2, b"", b"late"),
        Err(LogError::InvalidParameter(_))
    ));
}

#[test]
fn test_truncation_below_current_point_is_a_no_op() {
    let fx = fixture();
    let s = stream(&fx.log);
    for n in 1..=4 {
        s.write(asn(n), 1, b"", &payload(n)).unwrap();
    }
    s.flush().unwrap();
    s.truncate(asn(3), asn(3)).unwrap();
    let event = Event::new();
    s.set_truncation_completion_event(event.clone());
    s.truncate(asn(2), asn(2)).unwrap();
    assert!(event.is_set());
    assert_eq!(s.read(asn(4), ReadType::Exact).unwrap().data, payload(4));
}

#[test]
fn test_reservations_are_conserved() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.update_reservation(1000).unwrap();
    assert_eq!(s.query_reservation(), 1000);

    assert!(matches!(
        s.reserved_write(2000, asn(1), 1, b"", b"x"),
        Err(LogError::ReserveTooSmall { .. })
    ));
    s.reserved_write(400, asn(1), 1, b"", b"x").unwrap();
    assert_eq!(s.query_reservation(), 600);
    s.flush().unwrap();
    assert_eq!(s.query_reservation(), 600);

    assert!(s.update_reservation(-700).is_err());
    s.update_reservation(-600).unwrap();
    assert_eq!(s.query_reservation(), 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn test_reopen_recovers_dedicated_records() {
    let fx = fixture();
    let id = StreamId::new();
    {
        let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
        for n in 1..=20 {
            s.write(asn(n), 1, b"", &payload(n)).unwrap();
        }
    }

    let s = fx.log.open_log_stream(id).unwrap();
    assert_eq!(s.open_report().records_copied, 0);
    assert_eq!(s.open_report().dedicated_records, 20);
    for n in 1..=20 {
        assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data, payload(n));
    }
}

#[test]
fn test_reopen_copies_records_only_in_shared_log() {
    let fx = fixture();
    let id = StreamId::new();
    {
        let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
        for n in 1..=5 {
            s.write(asn(n), 1, b"", &payload(n)).unwrap();
        }
        s.flush().unwrap();
        // A shared write whose dedicated copy never happened
        s.shared_stream()
            .write(asn(10), 1, b"m", &payload(10))
            .unwrap();
    }

    let s = fx.log.open_log_stream(id).unwrap();
    assert_eq!(s.open_report().records_copied, 1);
    assert!(!s.open_report().created);
    let record = s.read(asn(10), ReadType::Exact).unwrap();
    assert_eq!(record.metadata, b"m");
    assert_eq!(record.data, payload(10));
    assert_eq!(s.query_perf_counters().records_copied, 1);
}

#[test]
fn test_open_reuses_live_stream() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.write(asn(1), 1, b"", b"live").unwrap();

    let again = fx.log.open_log_stream(s.stream_id()).unwrap();
    assert_eq!(again.read(asn(1), ReadType::Exact).unwrap().data, b"live");
    assert!(matches!(
        fx.log.create_log_stream(s.stream_id(), StreamType::new()),
        Err(LogError::NameCollision(_))
    ));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_delete_stream_waits_for_handles() {
    let fx = fixture();
    let s = stream(&fx.log);
    let id = s.stream_id();
    s.write(asn(1), 1, b"", b"doomed").unwrap();

    let holder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(s);
    });
    fx.log.delete_log_stream(id).unwrap();
    holder.join().unwrap();

    assert!(!fx.log.is_stream_id_valid(id));
    assert!(matches!(
        fx.log.open_log_stream(id),
        Err(LogError::NotFound(_))
    ));
    assert!(matches!(
        fx.log.delete_log_stream(id),
        Err(LogError::NotFound(_))
    ));
}

#[test]
fn test_stream_id_can_be_reused_after_delete() {
    let fx = fixture();
    let id = StreamId::new();
    drop(fx.log.create_log_stream(id, StreamType::new()).unwrap());
    fx.log.delete_log_stream(id).unwrap();

    let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
    assert!(s.open_report().created);
    assert!(matches!(
        s.read(asn(1), ReadType::Exact),
        Err(LogError::NotFound(_))
    ));
}

#[test]
fn test_get_streams_lists_created_streams() {
    let fx = fixture();
    let a = stream(&fx.log);
    let b = stream(&fx.log);
    let streams = fx.log.get_streams();
    assert!(streams.contains(&a.stream_id()));
    assert!(streams.contains(&b.stream_id()));
    assert!(fx.manager.open_streams() >= 2);
}

#[test]
fn test_delete_log_removes_dedicated_containers() {
    let fx = fixture();
    let id = StreamId::new();
    {
        let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
        s.write(asn(1), 1, b"", b"x").unwrap();
    }
    let Fixture {
        manager,
        disk,
        log_id,
        log,
    } = fx;
    drop(log);

    manager.delete_log(disk, log_id).unwrap();
    assert!(manager.enumerate_logs(disk).unwrap().is_empty());
    assert!(matches!(
        manager.open_log(disk, log_id),
        Err(LogError::NotFound(_))
    ));
}

#[test]
fn test_perf_counters_roll_up() {
    let fx = fixture();
    let a = stream(&fx.log);
    let b = stream(&fx.log);
    a.write(asn(1), 1, b"", b"aaaa").unwrap();
    b.write(asn(1), 1, b"", b"bb").unwrap();

    assert_eq!(fx.log.query_perf_counters().bytes_written, 6);
    drop(b);
    assert_eq!(fx.manager.query_perf_counters().bytes_written, 6);
}

#[test]
fn test_deactivate_refuses_new_streams() {
    let fx = fixture();
    let s = stream(&fx.log);
    s.write(asn(1), 1, b"", b"before").unwrap();
    fx.manager.deactivate();
    assert!(!fx.manager.is_active());
    assert!(matches!(
        fx.log.create_log_stream(StreamId::new(), StreamType::new()),
        Err(LogError::ShutdownPending)
    ));
    assert_eq!(s.read(asn(1), ReadType::Exact).unwrap().data, b"before");
}

#[test]
fn test_pending_stream_deletes_do_not_hold_the_only_worker() {
    let config = OverlayConfig::for_testing()
        .with_physical(PhysicalConfig::for_testing().with_dispatcher_threads(1));
    let fx = fixture_with(config, LogCreateOptions::for_testing());
    let h0 = stream(&fx.log);
    let h1 = stream(&fx.log);
    let (s0, s1) = (h0.stream_id(), h1.stream_id());
    let (tx, rx) = mpsc::channel();

    let done = tx.clone();
    fx.log.start_delete_log_stream(s0, move |r| {
        let _ = done.send((s0, r));
    });
    // The queued truncation keeps h1 alive until the worker runs it
    h1.start_truncate(asn(1), asn(1), |_| {});
    drop(h1);
    let done = tx.clone();
    fx.log.start_delete_log_stream(s1, move |r| {
        let _ = done.send((s1, r));
    });

    let (first, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, s1);
    result.unwrap();

    drop(h0);
    let (second, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, s0);
    result.unwrap();
    assert!(!fx.log.is_stream_id_valid(s0));
    assert!(!fx.log.is_stream_id_valid(s1));
}

// ============================================================================
// Asynchronous forms
// ============================================================================

#[test]
fn test_async_stream_lifecycle() {
    let fx = fixture();
    let id = StreamId::new();

    let created: Completion<LogResult<OverlayStream>> = Completion::new();
    let signal = created.clone();
    fx.log
        .start_create_log_stream(id, StreamType::new(), move |r| {
            signal.complete(r);
        });
    let s = created
        .wait(Some(Duration::from_secs(5)))
        .unwrap()
        .unwrap();
    s.write(asn(1), 1, b"", b"async").unwrap();
    drop(s);

    let deleted: Completion<LogResult<()>> = Completion::new();
    let signal = deleted.clone();
    fx.log.start_delete_log_stream(id, move |r| {
        signal.complete(r);
    });
    deleted
        .wait(Some(Duration::from_secs(5)))
        .unwrap()
        .unwrap();
    assert!(!fx.log.is_stream_id_valid(id));
}
