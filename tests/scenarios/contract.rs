//! Worked scenarios, run on the physical and the overlay layer

use crate::common::*;
use ktlog::{
    Event, LogCreateOptions, LogError, LogResult, PhysicalConfig, ReadRecord, ReadType,
    RecordStream, StreamId, StreamType,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Scenario bodies
// ============================================================================

fn read_after_write(s: &dyn RecordStream) {
    s.write(asn(1), 1, b"meta", b"data").unwrap();
    let record = s.read(asn(1), ReadType::Exact).unwrap();
    assert_eq!(record.asn, asn(1));
    assert_eq!(record.version, 1);
    assert_eq!(record.metadata, b"meta");
    assert_eq!(record.data, b"data");
}

fn lower_version_is_refused(s: &dyn RecordStream) {
    s.write(asn(5), 2, b"m2", b"v2").unwrap();
    let err = s.write(asn(5), 1, b"m1", b"v1").unwrap_err();
    assert!(matches!(err, LogError::NameCollision(_)));

    let record = s.read(asn(5), ReadType::Exact).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.data, b"v2");
}

fn overflow_leaves_reservation_untouched(s: &dyn RecordStream) {
    s.update_reservation(1000).unwrap();
    let before = s.query_reservation();

    let oversized = vec![0u8; 1024 * 1024];
    let err = s
        .reserved_write(100, asn(1), 1, b"meta", &oversized)
        .unwrap_err();
    assert!(matches!(err, LogError::BufferOverflow { .. }));
    assert_eq!(s.query_reservation(), before);

    s.reserved_write(100, asn(1), 1, b"meta", b"fits").unwrap();
    assert_eq!(s.query_reservation(), before - 100);
}

fn truncation_keeps_records_above_point(s: &dyn RecordStream) {
    write_all(s, 1..=20);
    s.truncate(asn(10), asn(10)).unwrap();

    for n in 11..=20 {
        assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data, payload(n));
    }
}

fn first_record_after_truncation(s: &dyn RecordStream) -> u64 {
    s.read(asn(1), ReadType::NextFromSpecificAsn).unwrap().asn.get()
}

// ============================================================================
// Scenario A: read after write
// ============================================================================

#[test]
fn test_physical_read_after_write() {
    let fx = PhysicalFixture::with_options(
        LogCreateOptions::for_testing().with_log_size(10 * 1024 * 1024),
    );
    read_after_write(&fx.stream());
}

#[test]
fn test_overlay_read_after_write() {
    let fx = OverlayFixture::with_options(
        LogCreateOptions::for_testing().with_log_size(10 * 1024 * 1024),
    );
    let s = fx.stream();
    read_after_write(&s);
    s.flush().unwrap();
    assert_eq!(s.read(asn(1), ReadType::Exact).unwrap().data, b"data");
}

// ============================================================================
// Scenario B: lower version refused
// ============================================================================

#[test]
fn test_physical_lower_version_is_refused() {
    let fx = PhysicalFixture::new();
    lower_version_is_refused(&fx.stream());
}

#[test]
fn test_overlay_lower_version_is_refused() {
    let fx = OverlayFixture::new();
    lower_version_is_refused(&fx.stream());
}

// ============================================================================
// Scenario C: a full log stays usable
// ============================================================================

#[test]
fn test_physical_full_log_stays_usable() {
    let fx = PhysicalFixture::with_options(
        LogCreateOptions::for_testing().with_log_size(1024 * 1024),
    );
    let s = fx.stream();
    let data = vec![1u8; 32 * 1024];

    let mut written = 0u64;
    let err = loop {
        match s.write(asn(written + 1), 1, b"", &data) {
            Ok(()) => written += 1,
            Err(e) => break e,
        }
        assert!(written < 1000, "log never filled");
    };
    assert!(matches!(err, LogError::LogFull { .. }));
    assert!(written > 0);
    assert_eq!(s.read(asn(1), ReadType::Exact).unwrap().data.len(), data.len());

    // Truncation gives the space back
    s.truncate(asn(written), asn(written)).unwrap();
    s.write(asn(written + 1), 1, b"", &data).unwrap();
}

#[test]
fn test_overlay_shared_log_full_stays_usable() {
    let fx = OverlayFixture::with_options(
        LogCreateOptions::for_testing().with_log_size(1024 * 1024),
    );
    let s = fx.stream();
    let data = vec![1u8; 32 * 1024];
    write_all_sized(&s, 1..=48, &data);
    assert_eq!(s.read(asn(1), ReadType::Exact).unwrap().data.len(), data.len());
    assert_eq!(s.read(asn(48), ReadType::Exact).unwrap().data.len(), data.len());
}

fn write_all_sized(s: &dyn RecordStream, asns: std::ops::RangeInclusive<u64>, data: &[u8]) {
    for n in asns {
        s.write(asn(n), 1, b"", data).unwrap();
    }
}

// ============================================================================
// Scenario D: failed reserved writes leave the reservation alone
// ============================================================================

#[test]
fn test_physical_overflow_leaves_reservation_untouched() {
    let fx = PhysicalFixture::new();
    overflow_leaves_reservation_untouched(&fx.stream());
}

#[test]
fn test_overlay_overflow_leaves_reservation_untouched() {
    let fx = OverlayFixture::new();
    let s = fx.stream();
    overflow_leaves_reservation_untouched(&s);
    s.flush().unwrap();
    assert_eq!(s.query_reservation(), 900);
}

// ============================================================================
// Scenario E: delete waits for an in-flight read
// ============================================================================

fn expect_delete_pending<T: std::fmt::Debug>(result: LogResult<T>) {
    assert!(matches!(result, Err(LogError::DeletePending(_))), "{:?}", result);
}

#[test]
fn test_physical_delete_waits_for_in_flight_read() {
    // Cached reads skip verification
    let fx = PhysicalFixture::with_config(
        PhysicalConfig::for_testing().with_cache_size(0),
        LogCreateOptions::for_testing(),
    );
    let entered = Event::new();
    let release = Event::new();
    let stream_type = StreamType::new();
    fx.manager
        .register_verification_callback(
            stream_type,
            blocking_verifier(entered.clone(), release.clone()),
        )
        .unwrap();

    let s1 = fx.stream_of(stream_type);
    let id = s1.stream_id();
    s1.write(asn(1), 1, b"meta", b"data").unwrap();

    let (read_tx, read_rx) = mpsc::channel::<LogResult<ReadRecord>>();
    s1.start_read(asn(1), ReadType::Exact, move |r| read_tx.send(r).unwrap());
    assert!(entered.wait(Duration::from_secs(5)));
    drop(s1);

    let (delete_tx, delete_rx) = mpsc::channel();
    let log = fx.log.clone();
    let deleter = thread::spawn(move || delete_tx.send(log.delete_log_stream(id)).unwrap());

    assert!(delete_rx.recv_timeout(Duration::from_millis(200)).is_err());
    expect_delete_pending(fx.log.open_log_stream(id));

    release.set();
    read_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    delete_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    deleter.join().unwrap();

    assert!(matches!(fx.log.open_log_stream(id), Err(LogError::NotFound(_))));
}

#[test]
fn test_overlay_delete_waits_for_in_flight_read() {
    let fx = OverlayFixture::new();
    let entered = Event::new();
    let release = Event::new();
    let stream_type = StreamType::new();
    fx.manager
        .register_verification_callback(
            stream_type,
            blocking_verifier(entered.clone(), release.clone()),
        )
        .unwrap();

    let s1 = fx.stream_of(stream_type);
    let id = s1.stream_id();
    s1.write(asn(1), 1, b"meta", b"data").unwrap();
    // Verification runs when a record is unpacked from the dedicated log
    s1.flush().unwrap();

    let (read_tx, read_rx) = mpsc::channel::<LogResult<ReadRecord>>();
    s1.start_read(asn(1), ReadType::Exact, move |r| read_tx.send(r).unwrap());
    assert!(entered.wait(Duration::from_secs(5)));
    drop(s1);

    let (delete_tx, delete_rx) = mpsc::channel();
    let log = fx.log.clone();
    let deleter = thread::spawn(move || delete_tx.send(log.delete_log_stream(id)).unwrap());

    assert!(delete_rx.recv_timeout(Duration::from_millis(200)).is_err());
    expect_delete_pending(fx.log.open_log_stream(id));
    expect_delete_pending(fx.log.create_log_stream(id, stream_type));

    release.set();
    let record = read_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(record.data, b"data");
    delete_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    deleter.join().unwrap();

    assert!(matches!(fx.log.open_log_stream(id), Err(LogError::NotFound(_))));
    assert!(!fx.log.get_streams().contains(&id));
}

// ============================================================================
// Truncation, both layers
// ============================================================================

#[test]
fn test_physical_truncation_keeps_records_above_point() {
    let fx = PhysicalFixture::new();
    let s = fx.stream();
    truncation_keeps_records_above_point(&s);
    assert_eq!(first_record_after_truncation(&s), 11);
}

#[test]
fn test_overlay_truncation_keeps_records_above_point() {
    let fx = OverlayFixture::new();
    let s = fx.stream();
    let done = Event::new();
    s.set_truncation_completion_event(done.clone());
    truncation_keeps_records_above_point(&s);
    assert!(done.wait(Duration::from_secs(5)));
    assert_eq!(s.query_asn_range().unwrap().truncation, asn(10));
    assert_eq!(first_record_after_truncation(&s), 11);
}

// ============================================================================
// Overlay recovery
// ============================================================================

#[test]
fn test_overlay_records_survive_close_and_reopen() {
    let fx = OverlayFixture::new();
    let id = StreamId::new();
    {
        let s = fx.log.create_log_stream(id, StreamType::new()).unwrap();
        write_all(&s, 1..=50);
        s.truncate(asn(10), asn(10)).unwrap();
    }

    let s = fx.log.open_log_stream(id).unwrap();
    let range = s.query_asn_range().unwrap();
    assert_eq!(range.truncation, asn(10));
    assert_eq!(range.lowest, asn(11));
    assert_eq!(range.highest, asn(50));
    for n in 11..=50 {
        assert_eq!(s.read(asn(n), ReadType::Exact).unwrap().data, payload(n));
    }
}
