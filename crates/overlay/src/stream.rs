//! Overlay stream.
//!
//! An overlay stream is backed by two physical streams: a stream of the
//! shared container (low latency, contended by every stream of the log) and
//! the single stream of its own dedicated container. Every write is destaged
//! to the dedicated log through the coalescer and, while the shared log is
//! healthy, also written straight to the shared stream. The caller is
//! acknowledged by whichever copy becomes durable first.
//!
//! ```text
//! write ─┬─> coalescer ──> dedicated batch ──> index
//!        └─> shared stream (unless full, truncated or bypassed)
//! ```
//!
//! The shared copy only bridges the time until the dedicated copy lands:
//! once a record is durable in the dedicated log the shared stream may be
//! truncated past it, never past a record still waiting for its dedicated
//! copy.
//!
//! # Failure policy
//!
//! - Shared log full: the write is retried after `full_retry_delay`, at most
//!   `full_retries` times, while the dedicated copy has not acknowledged the
//!   caller. Later writes skip the shared log until shared space is
//!   reclaimed.
//! - Other shared failures switch the stream to write-only-to-dedicated.
//! - A record acknowledged from the shared copy whose dedicated copy then
//!   fails is stranded: it stays readable from memory and is appended to the
//!   dedicated log again after the next truncation or successful batch.
//! - Dedicated log full: later writes skip the shared log, so callers see
//!   `LogFull` until a truncation reclaims dedicated space.
//! - Only a fatal dedicated failure refuses further writes, with the error
//!   it reported. Reopening the stream copies stranded records from the
//!   shared log again.

use crate::coalesce::{Append, Coalescer, DedicatedIndex, EntryKind, EntryLocation, FlushReason};
use crate::config::SharedLogSettings;
use crate::counters::{PerfCounters, StreamCounters};
use crate::log::{LogShared, OverlayLog, StreamKey};
use crate::open::OpenReport;
use crate::tables::{Retire, TableLease};
use crate::throttle::BufferGrant;
use crate::timer::PeriodicTarget;
use ktlog_core::{
    ActivityGate, ActivityGuard, Asn, AsnRange, AtomicAsn, Completion, Dispatcher, Event,
    LogError, LogResult, ReadRecord, ReadType, RecordDisposition, RecordInfo, RecordMetadata,
    RecordStream, ReservedWriteOutcome, StreamId, StreamType, WritePriority,
};
use ktlog_physical::{PhysicalLog, PhysicalStream};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Recheck interval of writers parked by throttling
const THROTTLE_RECHECK: Duration = Duration::from_millis(50);

// ============================================================================
// Destaging write
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Shared,
    Dedicated,
}

#[derive(Debug)]
struct Sides {
    /// Copies still in flight
    outstanding: u8,
    shared: Option<LogResult<()>>,
    dedicated: Option<LogResult<()>>,
    grant: Option<BufferGrant>,
}

/// One write on its way to the shared and dedicated logs.
struct Destaging {
    asn: Asn,
    version: u64,
    metadata: Arc<[u8]>,
    data: Arc<[u8]>,
    reserve: u64,
    caller: Completion<LogResult<()>>,
    /// Set once the caller has been answered
    acknowledged: Event,
    sides: Mutex<Sides>,
}

impl fmt::Debug for Destaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destaging")
            .field("asn", &self.asn)
            .field("version", &self.version)
            .field("size", &self.size())
            .field("acknowledged", &self.acknowledged.is_set())
            .finish()
    }
}

impl Destaging {
    fn new(asn: Asn, version: u64, metadata: &[u8], data: &[u8], reserve: u64, to_shared: bool) -> Self {
        Destaging {
            asn,
            version,
            metadata: Arc::from(metadata),
            data: Arc::from(data),
            reserve,
            caller: Completion::new(),
            acknowledged: Event::new(),
            sides: Mutex::new(Sides {
                outstanding: if to_shared { 2 } else { 1 },
                shared: None,
                dedicated: None,
                grant: None,
            }),
        }
    }

    fn size(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }

    fn set_grant(&self, grant: BufferGrant) {
        self.sides.lock().grant = Some(grant);
    }

    fn release_grant(&self) {
        let grant = self.sides.lock().grant.take();
        drop(grant);
    }

    /// Record the result of one copy. The first success answers the
    /// caller; if both copies fail the dedicated error is reported.
    ///
    /// Returns true once no copy is in flight.
    fn complete_side(&self, side: Side, result: LogResult<()>) -> bool {
        let mut sides = self.sides.lock();
        let stored = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.duplicate()),
        };
        match side {
            Side::Shared => sides.shared = Some(stored),
            Side::Dedicated => sides.dedicated = Some(stored),
        }
        sides.outstanding = sides.outstanding.saturating_sub(1);
        let finished = sides.outstanding == 0;

        if !self.caller.is_complete() {
            let answer = match result {
                Ok(()) => Some(Ok(())),
                Err(e) if finished => Some(Err(match &sides.dedicated {
                    Some(Err(dedicated)) => dedicated.duplicate(),
                    _ => e,
                })),
                Err(_) => None,
            };
            if let Some(answer) = answer {
                self.caller.complete(answer);
                self.acknowledged.set();
            }
        }
        finished
    }

    fn dedicated_settled(&self) -> bool {
        self.sides.lock().dedicated.is_some()
    }

    fn dedicated_error(&self) -> Option<LogError> {
        match &self.sides.lock().dedicated {
            Some(Err(e)) => Some(e.duplicate()),
            _ => None,
        }
    }

    fn dedicated_durable(&self) -> bool {
        matches!(self.sides.lock().dedicated, Some(Ok(())))
    }

    /// Acknowledged from the shared copy but lost its dedicated copy
    fn is_stranded(&self) -> bool {
        let sides = self.sides.lock();
        matches!(sides.dedicated, Some(Err(_))) && matches!(sides.shared, Some(Ok(())))
    }

    /// Put a stranded write back in flight for another dedicated append.
    /// Returns false if it is not stranded or already restaging.
    fn begin_restage(&self) -> bool {
        let mut sides = self.sides.lock();
        let stranded = matches!(sides.dedicated, Some(Err(_))) && matches!(sides.shared, Some(Ok(())));
        if !stranded {
            return false;
        }
        sides.dedicated = None;
        sides.outstanding = 1;
        true
    }

    fn wait(&self) -> LogResult<()> {
        self.caller
            .wait(None)
            .unwrap_or(Err(LogError::ShutdownPending))
    }
}

// ============================================================================
// Stream core
// ============================================================================

/// Health of the shared stream as seen by the last shared write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SharedStatus {
    Healthy,
    Full,
    Faulted,
}

enum Located {
    Memory(Arc<Destaging>),
    Dedicated(EntryLocation),
}

impl Located {
    fn version(&self) -> u64 {
        match self {
            Located::Memory(d) => d.version,
            Located::Dedicated(loc) => loc.version,
        }
    }
}

struct CoreState {
    /// Writes not yet settled on both sides, keyed by (ASN, version)
    outstanding: BTreeMap<(Asn, u64), Arc<Destaging>>,
    index: DedicatedIndex,
    truncation: Asn,
    pending_truncation: Option<Asn>,
    /// Writers parked by the dedicated backlog limit
    throttled: BTreeSet<(Asn, u64)>,
    /// Reservation promised to writes not yet flushed
    pending_reserve: u64,
    shared_status: SharedStatus,
    /// Last dedicated write failed `LogFull`
    dedicated_full: bool,
    failure: Option<LogError>,
}

impl CoreState {
    fn eligible(d: &Destaging, include_pending: bool) -> bool {
        include_pending || d.acknowledged.is_set()
    }

    /// Latest visible version at exactly `asn`
    fn find(&self, asn: Asn, include_pending: bool) -> Option<Located> {
        let memory = self
            .outstanding
            .range((asn, 0)..=(asn, u64::MAX))
            .rev()
            .map(|(_, d)| d)
            .find(|d| Self::eligible(d, include_pending));
        match (memory, self.index.get(asn)) {
            (Some(d), Some(loc)) if loc.version > d.version => Some(Located::Dedicated(*loc)),
            (Some(d), _) => Some(Located::Memory(Arc::clone(d))),
            (None, Some(loc)) => Some(Located::Dedicated(*loc)),
            (None, None) => None,
        }
    }

    fn first_after(&self, asn: Asn, include_pending: bool) -> Option<(Asn, Located)> {
        let mut cursor = asn;
        loop {
            let memory = self
                .outstanding
                .range((Bound::Excluded((cursor, u64::MAX)), Bound::Unbounded))
                .map(|((a, _), _)| *a)
                .next();
            let dedicated = self
                .index
                .records()
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .map(|(a, _)| *a)
                .next();
            let next = match (memory, dedicated) {
                (Some(m), Some(d)) => m.min(d),
                (Some(m), None) => m,
                (None, Some(d)) => d,
                (None, None) => return None,
            };
            if let Some(found) = self.find(next, include_pending) {
                return Some((next, found));
            }
            cursor = next;
        }
    }

    fn last_before(&self, asn: Asn, include_pending: bool) -> Option<(Asn, Located)> {
        let mut cursor = asn;
        loop {
            let memory = self
                .outstanding
                .range(..(cursor, 0))
                .map(|((a, _), _)| *a)
                .next_back();
            let dedicated = self
                .index
                .records()
                .range(..cursor)
                .map(|(a, _)| *a)
                .next_back();
            let prev = match (memory, dedicated) {
                (Some(m), Some(d)) => m.max(d),
                (Some(m), None) => m,
                (None, Some(d)) => d,
                (None, None) => return None,
            };
            if let Some(found) = self.find(prev, include_pending) {
                return Some((prev, found));
            }
            cursor = prev;
        }
    }

    /// Position a lookup relative to `asn`
    fn locate(&self, asn: Asn, read_type: ReadType, include_pending: bool) -> LogResult<(Asn, Located)> {
        let exact = || self.find(asn, include_pending).map(|l| (asn, l));
        let found = match read_type {
            ReadType::Exact => exact(),
            ReadType::Next => exact().and_then(|_| self.first_after(asn, include_pending)),
            ReadType::Previous => exact().and_then(|_| self.last_before(asn, include_pending)),
            ReadType::Containing => {
                exact().or_else(|| self.last_before(asn, include_pending))
            }
            ReadType::NextFromSpecificAsn => self.first_after(asn, include_pending),
            ReadType::PreviousFromSpecificAsn => self.last_before(asn, include_pending),
        };
        found.ok_or_else(|| LogError::not_found(format!("record {:?} {}", read_type, asn)))
    }

    /// Lowest ASN whose dedicated copy is not durable
    fn lowest_not_durable(&self) -> Option<Asn> {
        self.outstanding
            .iter()
            .find(|(_, d)| !d.dedicated_durable())
            .map(|((asn, _), _)| *asn)
    }

    /// Whether a write at or below `point` is still on its way to the
    /// dedicated log
    fn dedicated_pending_through(&self, point: Asn) -> bool {
        self.outstanding
            .range(..=(point, u64::MAX))
            .any(|(_, d)| !d.dedicated_settled())
            || self.throttled.iter().next().map_or(false, |(a, _)| *a <= point)
    }

    fn highest_version(&self, asn: Asn) -> Option<u64> {
        self.find(asn, true).map(|l| l.version())
    }

    fn has_stranded(&self) -> bool {
        self.outstanding.values().any(|d| d.is_stranded())
    }
}

/// Everything an opened stream is built from.
pub(crate) struct CoreParts {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub log: Arc<LogShared>,
    pub shared: PhysicalStream,
    pub coalescer: Arc<Coalescer>,
    pub index: DedicatedIndex,
    pub settings: SharedLogSettings,
    pub throttle_threshold: Option<u64>,
    pub pool_added: u64,
    pub report: OpenReport,
    pub counters: StreamCounters,
}

/// Shared state of one open overlay stream.
pub(crate) struct StreamCore {
    this: Weak<StreamCore>,
    stream_id: StreamId,
    stream_type: StreamType,
    log: Arc<LogShared>,
    shared: PhysicalStream,
    coalescer: Arc<Coalescer>,
    settings: SharedLogSettings,
    counters: StreamCounters,
    state: Mutex<CoreState>,
    throttle_cond: Condvar,
    throttle_threshold: Mutex<Option<u64>>,
    reservation_lock: Mutex<()>,
    /// Serializes deferred truncation against close
    truncation_lock: Mutex<()>,
    /// Highest ASN durable in the dedicated log
    shared_truncation_asn: AtomicAsn,
    /// Point the shared stream has been truncated to
    shared_truncated: AtomicAsn,
    write_only_to_dedicated: AtomicBool,
    deleting: AtomicBool,
    closed: AtomicBool,
    truncation_event: Mutex<Option<Event>>,
    pool_added: u64,
    report: OpenReport,
}

impl fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCore")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StreamCore {
    pub(crate) fn new(parts: CoreParts) -> Arc<Self> {
        let truncation = parts.index.truncation();
        let durable_through = parts
            .index
            .records()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(truncation)
            .max(truncation);
        let core = Arc::new_cyclic(|this| StreamCore {
            this: this.clone(),
            stream_id: parts.stream_id,
            stream_type: parts.stream_type,
            log: parts.log,
            shared: parts.shared,
            coalescer: parts.coalescer,
            write_only_to_dedicated: AtomicBool::new(parts.settings.write_only_to_dedicated),
            settings: parts.settings,
            counters: parts.counters,
            state: Mutex::new(CoreState {
                outstanding: BTreeMap::new(),
                index: parts.index,
                truncation,
                pending_truncation: None,
                throttled: BTreeSet::new(),
                pending_reserve: 0,
                shared_status: SharedStatus::Healthy,
                dedicated_full: false,
                failure: None,
            }),
            throttle_cond: Condvar::new(),
            throttle_threshold: Mutex::new(parts.throttle_threshold),
            reservation_lock: Mutex::new(()),
            truncation_lock: Mutex::new(()),
            shared_truncation_asn: AtomicAsn::new(durable_through),
            shared_truncated: AtomicAsn::new(Asn::NULL),
            deleting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            truncation_event: Mutex::new(None),
            pool_added: parts.pool_added,
            report: parts.report,
        });

        let weak = Arc::downgrade(&core);
        core.coalescer.set_flush_hook(Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.on_batch_flushed();
            }
        }));
        core
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::Release);
    }

    fn dedicated(&self) -> &PhysicalStream {
        self.coalescer.dedicated()
    }

    fn dedicated_log(&self) -> &PhysicalLog {
        self.coalescer.dedicated().log()
    }

    fn check_readable(&self) -> LogResult<()> {
        if self.deleting.load(Ordering::Acquire) {
            return Err(LogError::delete_pending(format!("stream {}", self.stream_id)));
        }
        if self.is_closed() {
            return Err(LogError::ShutdownPending);
        }
        Ok(())
    }

    fn check_writable(&self) -> LogResult<()> {
        self.check_readable()?;
        match &self.state.lock().failure {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Whether a write should also go to the shared stream
    fn should_send_to_shared(&self, asn: Asn, size: u64) -> bool {
        if self.write_only_to_dedicated.load(Ordering::Acquire) {
            return false;
        }
        if asn <= self.shared_truncation_asn.load() {
            return false;
        }
        if size > self.shared.log().query_max_user_record_size() {
            return false;
        }
        let state = self.state.lock();
        state.shared_status == SharedStatus::Healthy && !state.dedicated_full
    }

    fn under_pressure(&self) -> bool {
        self.log.manager().allocator.is_under_memory_pressure()
            || self.log.is_throttling()
            || self.state.lock().shared_status == SharedStatus::Full
    }

    /// Validate and publish a write in the outstanding table
    fn admit(&self, d: &Arc<Destaging>) -> LogResult<()> {
        let _reservation = self.reservation_lock.lock();
        let mut state = self.state.lock();
        if d.asn <= state.truncation {
            return Err(LogError::InvalidParameter(format!(
                "ASN {} is at or below truncation point {}",
                d.asn, state.truncation
            )));
        }
        if let Some(stored) = state.highest_version(d.asn) {
            if stored >= d.version {
                return Err(LogError::collision(format!(
                    "ASN {} holds version {}, write supplied {}",
                    d.asn, stored, d.version
                )));
            }
        }
        if d.reserve > 0 {
            let available = self
                .dedicated()
                .query_reservation()
                .saturating_sub(state.pending_reserve);
            if d.reserve > available {
                return Err(LogError::ReserveTooSmall {
                    requested: d.reserve,
                    reserved: available,
                });
            }
        }
        state.pending_reserve += d.reserve;
        state.outstanding.insert((d.asn, d.version), Arc::clone(d));
        Ok(())
    }

    /// Withdraw a write that never reached the coalescer
    fn abandon(&self, d: &Arc<Destaging>) {
        let mut state = self.state.lock();
        if let Some(found) = state.outstanding.get(&(d.asn, d.version)) {
            if Arc::ptr_eq(found, d) {
                state.outstanding.remove(&(d.asn, d.version));
                state.pending_reserve = state.pending_reserve.saturating_sub(d.reserve);
            }
        }
        drop(state);
        d.release_grant();
    }

    /// Park the writer while the dedicated backlog is over its limit.
    /// Parked writers leave in (ASN, version) order.
    fn throttle_write_if_needed(&self, key: (Asn, u64)) -> LogResult<()> {
        let mut state = self.state.lock();
        let over = |threshold: Option<u64>| {
            threshold.map_or(false, |t| self.counters.dedicated_outstanding() >= t)
        };
        if state.throttled.is_empty() && !over(*self.throttle_threshold.lock()) {
            return Ok(());
        }

        state.throttled.insert(key);
        self.counters.inc_throttled_writes();
        debug!(
            target: "ktlog::overlay::throttle",
            stream = %self.stream_id,
            asn = %key.0,
            outstanding = self.counters.dedicated_outstanding(),
            "Write throttled"
        );
        loop {
            let at_head = state.throttled.iter().next() == Some(&key);
            if at_head && !over(*self.throttle_threshold.lock()) {
                state.throttled.remove(&key);
                self.throttle_cond.notify_all();
                return Ok(());
            }
            if self.is_closed() || self.deleting.load(Ordering::Acquire) {
                state.throttled.remove(&key);
                self.throttle_cond.notify_all();
                return Err(LogError::ShutdownPending);
            }
            self.coalescer.request_flush(FlushReason::Pressure);
            self.throttle_cond.wait_for(&mut state, THROTTLE_RECHECK);
        }
    }

    /// Release parked writers that now fit under the limit
    fn unthrottle_writes_if_possible(&self) {
        let _state = self.state.lock();
        self.throttle_cond.notify_all();
    }

    pub(crate) fn write_record(
        self: &Arc<Self>,
        reserve: u64,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
    ) -> LogResult<()> {
        self.check_writable()?;
        if !asn.is_valid() {
            return Err(LogError::InvalidParameter(format!("invalid ASN {}", asn)));
        }
        let size = (metadata.len() + data.len()) as u64;
        let max = self.coalescer.max_entry_payload();
        if size > max {
            return Err(LogError::BufferOverflow { size, max });
        }

        let to_shared = self.should_send_to_shared(asn, size);
        let d = Arc::new(Destaging::new(asn, version, metadata, data, reserve, to_shared));
        self.admit(&d)?;

        let manager = Arc::clone(self.log.manager());
        let timeout = manager.limits.read().allocation_timeout;
        let staged = manager
            .allocator
            .allocate(size, timeout)
            .map(|grant| d.set_grant(grant))
            .and_then(|_| self.log.throttle_shared_write(&self.coalescer, &self.counters))
            .and_then(|_| self.throttle_write_if_needed((asn, version)));
        if let Err(e) = staged {
            self.abandon(&d);
            return Err(e);
        }

        self.counters.add_dedicated_outstanding(size);
        let weak = Arc::downgrade(self);
        let pending = Arc::clone(&d);
        let append = Append {
            kind: EntryKind::Record,
            asn,
            version,
            metadata: Arc::clone(&d.metadata),
            data: Arc::clone(&d.data),
            reserve,
            done: Box::new(move |result| match weak.upgrade() {
                Some(core) => core.on_dedicated_complete(&pending, reserve, result),
                None => {
                    pending.complete_side(Side::Dedicated, result.map(|_| ()));
                }
            }),
        };
        let seq = match self.coalescer.append(append) {
            Ok(seq) => seq,
            Err(e) => {
                self.counters.sub_dedicated_outstanding(size);
                self.abandon(&d);
                return Err(e);
            }
        };

        if to_shared {
            self.write_to_shared(&d);
        }
        if !d.acknowledged.is_set() {
            // The dedicated copy is the only one left
            let _ = self.coalescer.flush_through(seq + 1, FlushReason::Forced);
        } else if self.under_pressure() {
            self.coalescer.request_flush(FlushReason::Pressure);
        }

        let result = d.wait();
        if result.is_ok() {
            self.counters.add_bytes_written(size);
        }
        result
    }

    fn set_shared_status(&self, status: SharedStatus) {
        let mut state = self.state.lock();
        if state.shared_status != SharedStatus::Faulted {
            state.shared_status = status;
        }
    }

    fn write_to_shared(self: &Arc<Self>, d: &Arc<Destaging>) {
        let mut retries = 0;
        let outcome = loop {
            match self.shared.write(d.asn, d.version, &d.metadata, &d.data) {
                Ok(()) => {
                    self.counters.add_shared_bytes_written(d.size());
                    break Ok(());
                }
                Err(e @ LogError::LogFull { .. }) => {
                    self.set_shared_status(SharedStatus::Full);
                    self.coalescer.request_flush(FlushReason::Pressure);
                    if retries >= self.settings.full_retries {
                        warn!(
                            target: "ktlog::overlay::shared",
                            stream = %self.stream_id,
                            asn = %d.asn,
                            retries,
                            "Shared log still full, leaving the write to the dedicated log"
                        );
                        break Err(e);
                    }
                    retries += 1;
                    self.counters.inc_shared_log_full_retries();
                    if d.acknowledged.wait(self.settings.full_retry_delay) {
                        // The dedicated copy answered the caller meanwhile
                        break Ok(());
                    }
                }
                Err(e) => {
                    self.counters.inc_shared_write_failures();
                    if matches!(e, LogError::StructureFault(_)) {
                        self.set_shared_status(SharedStatus::Faulted);
                    }
                    if !matches!(e, LogError::NameCollision(_) | LogError::InvalidParameter(_)) {
                        self.write_only_to_dedicated.store(true, Ordering::Release);
                        warn!(
                            target: "ktlog::overlay::shared",
                            stream = %self.stream_id,
                            error = %e,
                            "Shared write failed, writing only to the dedicated log"
                        );
                    }
                    break Err(e);
                }
            }
        };
        if d.complete_side(Side::Shared, outcome) {
            self.finish_destaging(d);
        }
    }

    fn on_dedicated_complete(&self, d: &Arc<Destaging>, reserve: u64, result: LogResult<EntryLocation>) {
        self.counters.sub_dedicated_outstanding(d.size());
        let side_result = {
            let mut state = self.state.lock();
            state.pending_reserve = state.pending_reserve.saturating_sub(reserve);
            let side_result = match result {
                Ok(location) => {
                    if d.asn > state.truncation {
                        state.index.insert(d.asn, location);
                    }
                    state.index.note_batch(location.batch);
                    state.dedicated_full = false;
                    self.counters.add_dedicated_bytes_written(d.size());
                    self.shared_truncation_asn.set_if_larger(d.asn);
                    Ok(())
                }
                Err(e) => {
                    if e.is_fatal() && state.failure.is_none() {
                        error!(
                            target: "ktlog::overlay",
                            stream = %self.stream_id,
                            error = %e,
                            "Dedicated log faulted"
                        );
                        state.failure = Some(e.duplicate());
                    } else if matches!(e, LogError::LogFull { .. }) && !state.dedicated_full {
                        warn!(
                            target: "ktlog::overlay",
                            stream = %self.stream_id,
                            asn = %d.asn,
                            "Dedicated log full, writes bypass the shared log until truncation"
                        );
                        state.dedicated_full = true;
                    }
                    Err(e)
                }
            };
            self.throttle_cond.notify_all();
            side_result
        };
        if d.complete_side(Side::Dedicated, side_result) {
            self.finish_destaging(d);
        }
    }

    /// Retire a write whose copies have all settled. A stranded write stays
    /// outstanding until its dedicated copy is restaged or truncated away.
    fn finish_destaging(&self, d: &Arc<Destaging>) {
        if d.is_stranded() {
            debug!(
                target: "ktlog::overlay",
                stream = %self.stream_id,
                asn = %d.asn,
                "Record reached only the shared log"
            );
        } else {
            let mut state = self.state.lock();
            if let Some(found) = state.outstanding.get(&(d.asn, d.version)) {
                if Arc::ptr_eq(found, d) {
                    state.outstanding.remove(&(d.asn, d.version));
                }
            }
        }
        d.release_grant();
    }

    /// Append every stranded write to the dedicated log again, in ASN order
    fn restage_stranded(&self) {
        if self.is_closed() {
            return;
        }
        let stranded: Vec<Arc<Destaging>> = {
            let state = self.state.lock();
            if state.dedicated_full || state.failure.is_some() {
                return;
            }
            state
                .outstanding
                .values()
                .filter(|d| d.asn > state.truncation && d.begin_restage())
                .cloned()
                .collect()
        };
        if stranded.is_empty() {
            return;
        }
        debug!(
            target: "ktlog::overlay",
            stream = %self.stream_id,
            records = stranded.len(),
            "Restaging records stranded in the shared log"
        );
        for d in stranded {
            self.counters.add_dedicated_outstanding(d.size());
            let weak = self.this.clone();
            let pending = Arc::clone(&d);
            let append = Append {
                kind: EntryKind::Record,
                asn: d.asn,
                version: d.version,
                metadata: Arc::clone(&d.metadata),
                data: Arc::clone(&d.data),
                reserve: 0,
                done: Box::new(move |result| {
                    if let Some(core) = weak.upgrade() {
                        core.on_dedicated_complete(&pending, 0, result);
                    }
                }),
            };
            if let Err(e) = self.coalescer.append(append) {
                self.on_dedicated_complete(&d, 0, Err(e));
            }
        }
        self.coalescer.request_flush(FlushReason::Forced);
    }

    fn on_batch_flushed(self: &Arc<Self>) {
        self.counters.inc_coalesced_flushes();
        self.unthrottle_writes_if_possible();
        self.truncate_shared_stream_if_possible();

        if self.is_closed() {
            return;
        }
        let (ready, restage) = {
            let state = self.state.lock();
            let ready = state
                .pending_truncation
                .map_or(false, |point| !state.dedicated_pending_through(point));
            (ready, !state.dedicated_full && state.has_stranded())
        };
        if restage {
            self.restage_stranded();
        }
        if ready {
            let core = Arc::clone(self);
            self.log.dispatcher().start(
                WritePriority::Low,
                move |_| core.apply_pending_truncation(),
                move |result| {
                    if let Err(e) = result {
                        warn!(target: "ktlog::overlay::truncate", error = %e, "Deferred truncation failed");
                    }
                },
            );
        }
    }

    /// Apply a deferred truncation whose writes have all reached the
    /// dedicated log
    fn apply_pending_truncation(&self) -> LogResult<()> {
        let _truncating = self.truncation_lock.lock();
        if self.is_closed() {
            return Ok(());
        }
        let ready = {
            let mut state = self.state.lock();
            match state.pending_truncation {
                Some(point) if !state.dedicated_pending_through(point) => {
                    state.pending_truncation = None;
                    Some(point)
                }
                _ => None,
            }
        };
        match ready {
            Some(point) => self.apply_truncation(point),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Truncation
    // ------------------------------------------------------------------------

    /// Advance the shared stream's truncation point to the highest ASN
    /// durable in the dedicated log, never past a write whose dedicated copy
    /// is still missing.
    pub(crate) fn truncate_shared_stream_if_possible(&self) {
        let cap = {
            let state = self.state.lock();
            if state.shared_status == SharedStatus::Faulted {
                return;
            }
            state.lowest_not_durable()
        };
        let mut point = self.shared_truncation_asn.load();
        if let Some(lowest) = cap {
            point = point.min(Asn::new(lowest.get() - 1));
        }
        if point.is_null() || point <= self.shared_truncated.load() {
            return;
        }

        match self.shared.truncate(point, point) {
            Ok(()) => {
                self.shared_truncated.set_if_larger(point);
                let mut state = self.state.lock();
                if state.shared_status == SharedStatus::Full {
                    state.shared_status = SharedStatus::Healthy;
                }
            }
            Err(e) => {
                warn!(
                    target: "ktlog::overlay::truncate",
                    stream = %self.stream_id,
                    point = %point,
                    error = %e,
                    "Shared stream truncation failed"
                );
                if matches!(e, LogError::StructureFault(_)) {
                    self.set_shared_status(SharedStatus::Faulted);
                }
            }
        }
    }

    pub(crate) fn truncate(&self, truncation_point: Asn, preferred: Asn) -> LogResult<()> {
        self.check_writable()?;
        if !truncation_point.is_valid() && !truncation_point.is_null() {
            return Err(LogError::InvalidParameter(format!(
                "invalid truncation point {}",
                truncation_point
            )));
        }

        let space = self.dedicated_log().query_space_information();
        let pressure = self.log.manager().physical.config().space_pressure_percent as u64;
        let under_pressure = space.free_space * 100 < space.total_space * pressure;
        let preferred = if preferred.is_null() { truncation_point } else { preferred };
        let effective = if under_pressure {
            truncation_point
        } else {
            truncation_point.min(preferred)
        };

        {
            let mut state = self.state.lock();
            if effective.is_null() || effective <= state.truncation {
                drop(state);
                self.signal_truncation();
                return Ok(());
            }
            if state.dedicated_pending_through(effective) {
                let pending = state.pending_truncation.get_or_insert(effective);
                *pending = (*pending).max(effective);
                drop(state);
                debug!(
                    target: "ktlog::overlay::truncate",
                    stream = %self.stream_id,
                    point = %effective,
                    "Truncation deferred behind pending writes"
                );
                self.coalescer.request_flush(FlushReason::Forced);
                return Ok(());
            }
        }
        self.apply_truncation(effective)
    }

    fn apply_truncation(&self, point: Asn) -> LogResult<()> {
        if point <= self.state.lock().truncation {
            return Ok(());
        }
        self.append_truncation_marker(point)?;

        let reclaim = {
            let mut state = self.state.lock();
            state.truncation = state.truncation.max(point);
            state.index.truncate(point);
            let keep = state.outstanding.split_off(&(Asn::new(point.get().saturating_add(1)), 0));
            state.outstanding = keep;
            if state.pending_truncation.map_or(false, |p| p <= point) {
                state.pending_truncation = None;
            }
            state.index.reclaimable_through()
        };

        if !reclaim.is_null() {
            if let Err(e) = self.dedicated().truncate(reclaim, reclaim) {
                warn!(
                    target: "ktlog::overlay::truncate",
                    stream = %self.stream_id,
                    batch = %reclaim,
                    error = %e,
                    "Dedicated batch truncation failed"
                );
            }
        }
        self.shared_truncation_asn.set_if_larger(point);
        self.truncate_shared_stream_if_possible();
        self.signal_truncation();
        debug!(
            target: "ktlog::overlay::truncate",
            stream = %self.stream_id,
            point = %point,
            reclaimed_batches = %reclaim,
            "Truncated stream"
        );
        self.state.lock().dedicated_full = false;
        self.restage_stranded();
        Ok(())
    }

    /// Log the truncation point. A full dedicated log first gives up the
    /// batches that only hold records at or below `point`.
    fn append_truncation_marker(&self, point: Asn) -> LogResult<()> {
        match self.append_marker(EntryKind::Truncate, point, 0) {
            Err(e @ LogError::LogFull { .. }) => {
                let reclaim = self.state.lock().index.reclaimable_after(point);
                if reclaim.is_null() {
                    return Err(e);
                }
                self.dedicated().truncate(reclaim, reclaim)?;
                info!(
                    target: "ktlog::overlay::truncate",
                    stream = %self.stream_id,
                    point = %point,
                    batch = %reclaim,
                    "Reclaimed dedicated batches to log truncation"
                );
                self.append_marker(EntryKind::Truncate, point, 0)
            }
            other => other,
        }
    }

    fn signal_truncation(&self) {
        if let Some(event) = self.truncation_event.lock().as_ref() {
            event.set();
        }
    }

    pub(crate) fn set_truncation_event(&self, event: Event) {
        *self.truncation_event.lock() = Some(event);
    }

    /// Log an index-only entry and wait for it to be durable
    fn append_marker(&self, kind: EntryKind, asn: Asn, version: u64) -> LogResult<()> {
        let done = Completion::new();
        let signal = done.clone();
        let seq = self.coalescer.append(Append::marker(
            kind,
            asn,
            version,
            Box::new(move |result| {
                signal.complete(result.map(|loc| loc.batch));
            }),
        ))?;
        let _ = self.coalescer.flush_through(seq + 1, FlushReason::Forced);
        let batch = done.wait(None).unwrap_or(Err(LogError::ShutdownPending))?;
        self.state.lock().index.note_batch(batch);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads and queries
    // ------------------------------------------------------------------------

    fn materialize(&self, asn: Asn, located: Located) -> LogResult<ReadRecord> {
        match located {
            Located::Memory(d) => Ok(ReadRecord {
                asn,
                version: d.version,
                metadata: d.metadata.to_vec(),
                data: d.data.to_vec(),
            }),
            Located::Dedicated(loc) => {
                let batch = self.dedicated().read(Asn::new(loc.batch), ReadType::Exact)?;
                let (metadata, data) = loc.slice(&batch)?;
                let verifier = self
                    .log
                    .manager()
                    .physical
                    .query_verification_callback(self.stream_type);
                if let Some(verify) = verifier {
                    if !verify(&metadata, &data) {
                        return Err(LogError::DataError(format!(
                            "record {} of stream {} failed verification",
                            asn, self.stream_id
                        )));
                    }
                }
                Ok(ReadRecord {
                    asn,
                    version: loc.version,
                    metadata,
                    data,
                })
            }
        }
    }

    pub(crate) fn read(&self, asn: Asn, read_type: ReadType) -> LogResult<ReadRecord> {
        self.check_readable()?;
        let (found, located) = self.state.lock().locate(asn, read_type, false)?;
        self.materialize(found, located)
    }

    pub(crate) fn query_record(&self, asn: Asn, read_type: ReadType) -> LogResult<RecordInfo> {
        self.check_readable()?;
        let (found, located) = self.state.lock().locate(asn, read_type, true)?;
        Ok(match located {
            Located::Memory(d) => RecordInfo {
                asn: found,
                version: d.version,
                disposition: disposition_of(&d),
                size: d.size(),
                debug_info: 0,
            },
            Located::Dedicated(loc) => RecordInfo {
                asn: found,
                version: loc.version,
                disposition: RecordDisposition::Persisted,
                size: loc.size(),
                debug_info: loc.batch,
            },
        })
    }

    pub(crate) fn query_records(&self, low: Asn, high: Asn, out: &mut Vec<RecordMetadata>) -> LogResult<()> {
        self.check_readable()?;
        out.clear();
        if low > high {
            return Ok(());
        }
        let state = self.state.lock();
        let mut merged: BTreeMap<Asn, RecordMetadata> = state
            .index
            .records()
            .range(low..=high)
            .map(|(asn, loc)| {
                (
                    *asn,
                    RecordMetadata {
                        asn: *asn,
                        version: loc.version,
                        disposition: RecordDisposition::Persisted,
                        size: loc.size(),
                        lsn: loc.batch,
                    },
                )
            })
            .collect();
        for ((asn, version), d) in state.outstanding.range((low, 0)..=(high, u64::MAX)) {
            if merged.get(asn).map_or(true, |m| m.version < *version) {
                merged.insert(
                    *asn,
                    RecordMetadata {
                        asn: *asn,
                        version: *version,
                        disposition: disposition_of(d),
                        size: d.size(),
                        lsn: 0,
                    },
                );
            }
        }
        out.extend(merged.into_values());
        Ok(())
    }

    pub(crate) fn query_asn_range(&self) -> LogResult<AsnRange> {
        self.check_readable()?;
        let state = self.state.lock();
        let lowest = state
            .first_after(Asn::NULL, false)
            .map(|(a, _)| a)
            .unwrap_or(Asn::NULL);
        let highest = state
            .last_before(Asn::MAX, false)
            .map(|(a, _)| a)
            .unwrap_or(Asn::NULL);
        Ok(AsnRange {
            lowest,
            highest,
            truncation: state.truncation,
        })
    }

    pub(crate) fn delete_record(&self, asn: Asn, version: u64) -> LogResult<()> {
        self.check_writable()?;
        let in_flight = self
            .state
            .lock()
            .outstanding
            .range((asn, 0)..=(asn, u64::MAX))
            .any(|(_, d)| !d.dedicated_settled());
        let flushed = if in_flight {
            self.coalescer.flush_all(FlushReason::Forced)
        } else {
            Ok(())
        };

        {
            let mut state = self.state.lock();
            let current = state.find(asn, true);
            let failed = match &current {
                Some(Located::Memory(d)) if d.version == version => d.dedicated_error(),
                _ => None,
            };
            match current {
                Some(Located::Dedicated(loc)) if loc.version == version => {}
                Some(Located::Memory(d)) if d.version == version && d.dedicated_durable() => {
                    state.outstanding.remove(&(asn, version));
                }
                Some(Located::Memory(d)) if d.version == version && d.is_stranded() => {
                    state.outstanding.remove(&(asn, version));
                    drop(state);
                    return self.delete_shared_copy(asn, version);
                }
                _ => {
                    // A record lost with a failed batch reports that failure
                    return Err(failed.or(flushed.err()).unwrap_or_else(|| {
                        LogError::not_found(format!("record {} at version {}", asn, version))
                    }));
                }
            }
        }

        self.append_marker(EntryKind::Delete, asn, version)?;
        self.state.lock().index.remove(asn, Some(version));
        self.delete_shared_copy(asn, version)
    }

    fn delete_shared_copy(&self, asn: Asn, version: u64) -> LogResult<()> {
        match self.shared.delete_record(asn, version) {
            Ok(()) | Err(LogError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(
                    target: "ktlog::overlay",
                    stream = %self.stream_id,
                    asn = %asn,
                    error = %e,
                    "Shared copy delete failed"
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------------

    pub(crate) fn update_reservation(&self, delta: i64) -> LogResult<()> {
        self.check_writable()?;
        let _reservation = self.reservation_lock.lock();
        if delta < 0 {
            let available = self.query_reservation();
            if delta.unsigned_abs() > available {
                return Err(LogError::InvalidParameter(format!(
                    "cannot release {} bytes, {} reserved",
                    delta.unsigned_abs(),
                    available
                )));
            }
        }
        self.dedicated().update_reservation(delta)
    }

    pub(crate) fn query_reservation(&self) -> u64 {
        let pending = self.state.lock().pending_reserve;
        self.dedicated().query_reservation().saturating_sub(pending)
    }

    pub(crate) fn reserved_outcome(&self) -> ReservedWriteOutcome {
        let space = self.dedicated_log().query_space_information();
        ReservedWriteOutcome {
            log_size: space.total_space,
            space_remaining: space.free_space,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Flush every buffered append and wait for it
    pub(crate) fn flush(&self) -> LogResult<()> {
        self.check_readable()?;
        self.coalescer.flush_all(FlushReason::Forced)
    }

    /// Flush everything and release the stream's share of the buffer pool.
    pub(crate) fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.coalescer.flush_all(FlushReason::Close) {
            warn!(target: "ktlog::overlay", stream = %self.stream_id, error = %e, "Final flush failed");
        }
        {
            let _truncating = self.truncation_lock.lock();
            let pending = self.state.lock().pending_truncation.take();
            if let Some(point) = pending {
                if let Err(e) = self.apply_truncation(point) {
                    warn!(target: "ktlog::overlay::truncate", stream = %self.stream_id, point = %point, error = %e, "Deferred truncation lost at close");
                }
            }
            if let Err(e) = self.coalescer.close() {
                warn!(target: "ktlog::overlay", stream = %self.stream_id, error = %e, "Final flush failed");
            }
            self.closed.store(true, Ordering::Release);
        }
        self.truncate_shared_stream_if_possible();
        {
            let _state = self.state.lock();
            self.throttle_cond.notify_all();
        }
        self.log.manager().allocator.remove_stream(self.pool_added);
        self.log.retire_counters(self.counters.snapshot());
        info!(
            target: "ktlog::overlay",
            stream = %self.stream_id,
            bytes_written = self.counters.snapshot().bytes_written,
            "Closed stream"
        );
    }
}

impl PeriodicTarget for StreamCore {
    fn on_tick(&self) {
        if self.is_closed() {
            return;
        }
        let age = self.log.manager().limits.read().periodic_flush_time;
        if self.coalescer.is_flush_due(age) {
            if let Err(e) = self.coalescer.flush_all(FlushReason::Periodic) {
                warn!(target: "ktlog::overlay", stream = %self.stream_id, error = %e, "Periodic flush failed");
            }
        } else if self.coalescer.pending() > 0 && self.under_pressure() {
            self.coalescer.request_flush(FlushReason::Pressure);
        }
    }
}

fn disposition_of(d: &Destaging) -> RecordDisposition {
    if d.acknowledged.is_set() {
        RecordDisposition::Persisted
    } else {
        RecordDisposition::Pending
    }
}

// ============================================================================
// Table slot
// ============================================================================

/// Stream table entry: the open core plus handle interest.
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    pub core: Mutex<Option<Arc<StreamCore>>>,
    pub gate: ActivityGate,
    pub deleting: AtomicBool,
}

impl Retire for StreamSlot {
    fn retire(&self) {
        let core = self.core.lock().take();
        if let Some(core) = core {
            core.close();
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to an open overlay stream.
///
/// Handles are cheap to clone. The stream stays open while any handle is
/// alive; deleting it waits for every handle to be dropped.
#[derive(Clone)]
pub struct OverlayStream {
    core: Arc<StreamCore>,
    log: OverlayLog,
    _lease: Arc<TableLease<StreamKey, StreamSlot>>,
    _interest: ActivityGuard,
}

impl fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStream")
            .field("log_id", &self.log.log_id())
            .field("stream_id", &self.core.stream_id)
            .finish()
    }
}

impl OverlayStream {
    pub(crate) fn new(
        core: Arc<StreamCore>,
        log: OverlayLog,
        lease: Arc<TableLease<StreamKey, StreamSlot>>,
        interest: ActivityGuard,
    ) -> Self {
        OverlayStream {
            core,
            log,
            _lease: lease,
            _interest: interest,
        }
    }

    /// Container holding this stream
    pub fn log(&self) -> &OverlayLog {
        &self.log
    }

    /// Type tag the stream was created with
    pub fn stream_type(&self) -> StreamType {
        self.core.stream_type
    }

    /// Write every buffered record to the dedicated log
    pub fn flush(&self) -> LogResult<()> {
        self.core.flush()
    }

    /// Dedicated backlog (bytes) above which writers are held back.
    /// None disables throttling.
    pub fn set_write_throttle_threshold(&self, threshold: Option<u64>) {
        *self.core.throttle_threshold.lock() = threshold;
        self.core.unthrottle_writes_if_possible();
    }

    /// Current dedicated backlog limit
    pub fn write_throttle_threshold(&self) -> Option<u64> {
        *self.core.throttle_threshold.lock()
    }

    /// Whether writes bypass the shared log
    pub fn is_write_only_to_dedicated(&self) -> bool {
        self.core.write_only_to_dedicated.load(Ordering::Acquire)
    }

    /// Make writes bypass the shared log, or use it again
    pub fn set_write_only_to_dedicated(&self, enabled: bool) {
        self.core
            .write_only_to_dedicated
            .store(enabled, Ordering::Release);
        if !enabled {
            self.core.set_shared_status(SharedStatus::Healthy);
        }
    }

    /// Counters of this stream
    pub fn query_perf_counters(&self) -> PerfCounters {
        self.core.counters.snapshot()
    }

    /// What happened when the stream was opened
    pub fn open_report(&self) -> &OpenReport {
        &self.core.report
    }

    /// Register an event signalled after every truncation of this stream
    pub fn set_truncation_completion_event(&self, event: Event) {
        self.core.set_truncation_event(event);
    }

    /// Physical stream of the dedicated container
    pub fn dedicated_stream(&self) -> &PhysicalStream {
        self.core.dedicated()
    }

    /// Physical stream of the shared container
    pub fn shared_stream(&self) -> &PhysicalStream {
        &self.core.shared
    }

    /// Records buffered in the coalescer
    pub fn pending_appends(&self) -> usize {
        self.core.coalescer.pending()
    }

    /// Batch records currently held by the dedicated stream
    pub fn dedicated_batches(&self) -> LogResult<Vec<RecordMetadata>> {
        self.core.coalescer.batches()
    }
}

impl RecordStream for OverlayStream {
    fn stream_id(&self) -> StreamId {
        self.core.stream_id()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.core.log.dispatcher()
    }

    fn write(&self, asn: Asn, version: u64, metadata: &[u8], data: &[u8]) -> LogResult<()> {
        self.core.write_record(0, asn, version, metadata, data)
    }

    fn reserved_write(
        &self,
        reserve_to_use: u64,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
    ) -> LogResult<ReservedWriteOutcome> {
        self.core
            .write_record(reserve_to_use, asn, version, metadata, data)?;
        Ok(self.core.reserved_outcome())
    }

    fn read(&self, asn: Asn, read_type: ReadType) -> LogResult<ReadRecord> {
        self.core.read(asn, read_type)
    }

    fn query_record(&self, asn: Asn, read_type: ReadType) -> LogResult<RecordInfo> {
        self.core.query_record(asn, read_type)
    }

    fn query_records(&self, low: Asn, high: Asn, out: &mut Vec<RecordMetadata>) -> LogResult<()> {
        self.core.query_records(low, high, out)
    }

    fn delete_record(&self, asn: Asn, version: u64) -> LogResult<()> {
        self.core.delete_record(asn, version)
    }

    fn truncate(&self, truncation_point: Asn, preferred_truncation_point: Asn) -> LogResult<()> {
        self.core.truncate(truncation_point, preferred_truncation_point)
    }

    fn update_reservation(&self, delta: i64) -> LogResult<()> {
        self.core.update_reservation(delta)
    }

    fn query_reservation(&self) -> u64 {
        self.core.query_reservation()
    }

    fn query_asn_range(&self) -> LogResult<AsnRange> {
        self.core.query_asn_range()
    }
}
