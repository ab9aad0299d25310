//! Overlay container.
//!
//! An overlay log wraps one shared physical container. Its streams are
//! overlay streams: each pairs a stream of the shared container with a
//! dedicated container of its own (see `stream`). Opening a stream id that
//! is already open returns another handle to the same instance.
//!
//! The container also owns the shared log throttle. While the shared
//! container is fuller than `shared_log_throttle_limit_percent`, writes
//! queue in FIFO order until enough shared records have reached their
//! dedicated logs and been truncated away.

use crate::coalesce::{Coalescer, FlushReason};
use crate::counters::{PerfCounters, StreamCounters};
use crate::manager::ManagerShared;
use crate::open::{dedicated_disk_id, dedicated_log_id, open_stream};
use crate::stream::{OverlayStream, StreamCore, StreamSlot};
use crate::tables::{Retire, TableLease};
use ktlog_core::{
    Dispatcher, DiskId, LogError, LogId, LogResult, OperationHandle, SpaceInfo, StreamId,
    StreamType, WritePriority,
};
use ktlog_physical::PhysicalLog;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Recheck interval of writes queued by the shared log throttle
const SHARED_THROTTLE_RECHECK: Duration = Duration::from_millis(50);

/// Attempts to delete a dedicated container still briefly held open
const DEDICATED_DELETE_ATTEMPTS: u32 = 50;
const DEDICATED_DELETE_BACKOFF: Duration = Duration::from_millis(20);

// ============================================================================
// Keys
// ============================================================================

/// Identity of a shared container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogKey {
    /// Disk holding the container
    pub disk: DiskId,
    /// Container id
    pub log: LogId,
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.disk, self.log)
    }
}

/// Identity of an overlay stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Container holding the stream
    pub log: LogKey,
    /// Stream id within the container
    pub stream: StreamId,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.log, self.stream)
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Default)]
struct SharedThrottle {
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// State of one open overlay container.
pub(crate) struct LogShared {
    key: LogKey,
    shared_log: PhysicalLog,
    manager: Arc<ManagerShared>,
    throttle: Mutex<SharedThrottle>,
    throttle_cond: Condvar,
    /// Counters of streams that have closed
    retired: Mutex<PerfCounters>,
    streams: Mutex<Vec<Weak<StreamCore>>>,
}

impl fmt::Debug for LogShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogShared").field("key", &self.key).finish()
    }
}

impl LogShared {
    pub(crate) fn new(key: LogKey, shared_log: PhysicalLog, manager: Arc<ManagerShared>) -> Self {
        LogShared {
            key,
            shared_log,
            manager,
            throttle: Mutex::new(SharedThrottle::default()),
            throttle_cond: Condvar::new(),
            retired: Mutex::new(PerfCounters::default()),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn key(&self) -> LogKey {
        self.key
    }

    pub(crate) fn shared_log(&self) -> &PhysicalLog {
        &self.shared_log
    }

    pub(crate) fn manager(&self) -> &Arc<ManagerShared> {
        &self.manager
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.shared_log.dispatcher()
    }

    /// Whether the shared container is fuller than the throttle limit
    pub(crate) fn is_throttling(&self) -> bool {
        let percent = self.manager.limits.read().shared_log_throttle_limit_percent as u64;
        if percent >= 100 {
            return false;
        }
        let space = self.shared_log.query_space_information();
        space.free_space < space.total_space / 100 * (100 - percent)
    }

    /// Hold a write back while the shared container is over its limit.
    /// Held writes leave in arrival order.
    pub(crate) fn throttle_shared_write(
        &self,
        coalescer: &Arc<Coalescer>,
        counters: &StreamCounters,
    ) -> LogResult<()> {
        let mut throttle = self.throttle.lock();
        if throttle.waiters.is_empty() && !self.is_throttling() {
            return Ok(());
        }

        let ticket = throttle.next_ticket;
        throttle.next_ticket += 1;
        throttle.waiters.push_back(ticket);
        counters.inc_throttled_writes();
        let deadline = self
            .manager
            .limits
            .read()
            .allocation_timeout
            .map(|t| Instant::now() + t);
        debug!(target: "ktlog::overlay::throttle", log = %self.key, ticket, "Shared log write throttled");

        loop {
            if throttle.waiters.front() == Some(&ticket) && !self.is_throttling() {
                throttle.waiters.pop_front();
                self.throttle_cond.notify_all();
                return Ok(());
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                throttle.waiters.retain(|t| *t != ticket);
                self.throttle_cond.notify_all();
                warn!(target: "ktlog::overlay::throttle", log = %self.key, ticket, "Shared log throttle timed out");
                return Err(LogError::Timeout(format!(
                    "shared log {} stayed above its throttle limit",
                    self.key
                )));
            }
            coalescer.request_flush(FlushReason::Pressure);
            self.throttle_cond
                .wait_for(&mut throttle, SHARED_THROTTLE_RECHECK);
        }
    }

    /// Writes currently held by the shared log throttle
    pub(crate) fn throttled_writes(&self) -> usize {
        self.throttle.lock().waiters.len()
    }

    pub(crate) fn register_stream(&self, core: Weak<StreamCore>) {
        let mut streams = self.streams.lock();
        streams.retain(|s| s.strong_count() > 0);
        streams.push(core);
    }

    pub(crate) fn retire_counters(&self, counters: PerfCounters) {
        *self.retired.lock() += counters;
    }

    /// Counters summed over open streams and streams that have closed
    pub(crate) fn perf_counters(&self) -> PerfCounters {
        let live: PerfCounters = self
            .streams
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|core| !core.is_closed())
            .map(|core| core.counters().snapshot())
            .sum();
        let mut total = *self.retired.lock();
        total += live;
        total
    }
}

/// Container table entry.
#[derive(Debug, Default)]
pub(crate) struct LogSlot {
    pub shared: Mutex<Option<Arc<LogShared>>>,
}

impl Retire for LogSlot {
    fn retire(&self) {
        let shared = self.shared.lock().take();
        if let Some(shared) = shared {
            debug!(target: "ktlog::overlay", log = %shared.key, "Closing overlay log");
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to an open overlay container.
#[derive(Clone)]
pub struct OverlayLog {
    shared: Arc<LogShared>,
    _lease: Arc<TableLease<LogKey, LogSlot>>,
}

impl fmt::Debug for OverlayLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayLog")
            .field("disk_id", &self.shared.key.disk)
            .field("log_id", &self.shared.key.log)
            .finish()
    }
}

impl OverlayLog {
    pub(crate) fn new(shared: Arc<LogShared>, lease: Arc<TableLease<LogKey, LogSlot>>) -> Self {
        OverlayLog {
            shared,
            _lease: lease,
        }
    }

    /// Disk holding the shared container
    pub fn disk_id(&self) -> DiskId {
        self.shared.key.disk
    }

    /// Container id
    pub fn log_id(&self) -> LogId {
        self.shared.key.log
    }

    /// Log type supplied at creation
    pub fn log_type(&self) -> StreamType {
        self.shared.shared_log.log_type()
    }

    /// The shared physical container
    pub fn shared_log(&self) -> &PhysicalLog {
        &self.shared.shared_log
    }

    /// Create a stream and open a handle to it.
    ///
    /// # Errors
    ///
    /// `NameCollision` if the stream exists, `DeletePending` while a stream
    /// of the same id is being deleted, `Timeout` if the disk's open gate
    /// stays busy.
    pub fn create_log_stream(&self, stream_id: StreamId, stream_type: StreamType) -> LogResult<OverlayStream> {
        self.acquire_stream(stream_id, Some(stream_type))
    }

    /// Open a handle to an existing stream, recovering it if it is not
    /// already open.
    pub fn open_log_stream(&self, stream_id: StreamId) -> LogResult<OverlayStream> {
        self.acquire_stream(stream_id, None)
    }

    fn acquire_stream(&self, stream_id: StreamId, create: Option<StreamType>) -> LogResult<OverlayStream> {
        if !self.shared.manager.physical.is_active() {
            return Err(LogError::ShutdownPending);
        }
        let key = StreamKey {
            log: self.shared.key,
            stream: stream_id,
        };
        let (lease, created) = self.shared.manager.streams.acquire(key, StreamSlot::default);
        let lease = Arc::new(lease);
        let slot = lease.value();
        if slot.deleting.load(Ordering::Acquire) {
            return Err(LogError::delete_pending(format!("stream {}", stream_id)));
        }
        let interest = slot
            .gate
            .try_acquire()
            .ok_or_else(|| LogError::delete_pending(format!("stream {}", stream_id)))?;

        let core = {
            let mut current = slot.core.lock();
            match current.as_ref() {
                Some(_) if create.is_some() => {
                    return Err(LogError::collision(format!("stream {}", stream_id)));
                }
                Some(core) => Arc::clone(core),
                None => {
                    let stream_type = create.unwrap_or_else(StreamType::nil);
                    let core = open_stream(&self.shared, stream_id, stream_type, create.is_some())?;
                    *current = Some(Arc::clone(&core));
                    core
                }
            }
        };
        debug!(
            target: "ktlog::overlay",
            stream = %stream_id,
            reused = !created,
            "Acquired overlay stream"
        );
        Ok(OverlayStream::new(core, self.clone(), lease, interest))
    }

    /// Delete a stream together with its dedicated container.
    ///
    /// New opens of the stream fail `DeletePending` at once. The call
    /// blocks until every handle to the stream has been dropped. A caller
    /// must not hold a handle to the stream it deletes.
    pub fn delete_log_stream(&self, stream_id: StreamId) -> LogResult<()> {
        let lease = self.begin_delete(stream_id)?;
        let slot = lease.value();
        slot.gate.wait_drained(None);
        close_deleted_core(slot);
        let result = self.shared.shared_log.delete_log_stream(stream_id);
        self.finish_delete(slot, stream_id, result)
    }

    /// Refuse new opens of the stream and close its gate
    fn begin_delete(&self, stream_id: StreamId) -> LogResult<TableLease<StreamKey, StreamSlot>> {
        let key = StreamKey {
            log: self.shared.key,
            stream: stream_id,
        };
        let (lease, _) = self.shared.manager.streams.acquire(key, StreamSlot::default);
        let slot = lease.value();
        if slot.deleting.swap(true, Ordering::AcqRel) {
            return Err(LogError::delete_pending(format!("stream {}", stream_id)));
        }
        if !self.shared.shared_log.is_stream_id_valid(stream_id) {
            slot.deleting.store(false, Ordering::Release);
            return Err(LogError::not_found(format!("stream {}", stream_id)));
        }
        if let Some(core) = slot.core.lock().as_ref() {
            core.mark_deleting();
        }
        slot.gate.close();
        Ok(lease)
    }

    /// Remove the dedicated container once the shared stream is gone, then
    /// let the slot accept opens again
    fn finish_delete(&self, slot: &StreamSlot, stream_id: StreamId, shared: LogResult<()>) -> LogResult<()> {
        let result = shared.and_then(|_| self.delete_dedicated_container(stream_id));
        slot.deleting.store(false, Ordering::Release);
        slot.gate.reopen();
        if result.is_ok() {
            info!(target: "ktlog::overlay", log = %self.shared.key, stream = %stream_id, "Deleted overlay stream");
        }
        result
    }

    fn delete_dedicated_container(&self, stream_id: StreamId) -> LogResult<()> {
        delete_dedicated_container(&self.shared.manager, self.shared.key.disk, stream_id)
    }

    /// Whether the shared container holds a stream of this id
    pub fn is_stream_id_valid(&self, stream_id: StreamId) -> bool {
        self.shared.shared_log.is_stream_id_valid(stream_id)
    }

    /// Ids of every stream in the container
    pub fn get_streams(&self) -> Vec<StreamId> {
        self.shared.shared_log.get_streams()
    }

    /// Total and free space of the shared container
    pub fn query_space_information(&self) -> SpaceInfo {
        self.shared.shared_log.query_space_information()
    }

    /// Whether writes are currently held back by the shared log throttle
    pub fn is_shared_log_throttled(&self) -> bool {
        self.shared.is_throttling()
    }

    /// Writes waiting on the shared log throttle
    pub fn shared_throttled_writes(&self) -> usize {
        self.shared.throttled_writes()
    }

    /// Counters summed over every stream opened in this container
    pub fn query_perf_counters(&self) -> PerfCounters {
        self.shared.perf_counters()
    }

    /// Dispatcher running `start_*` operations
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.shared.dispatcher()
    }

    /// Asynchronous `create_log_stream`
    pub fn start_create_log_stream<C>(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        callback: C,
    ) -> OperationHandle
    where
        C: FnOnce(LogResult<OverlayStream>) + Send + 'static,
    {
        let log = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| log.create_log_stream(stream_id, stream_type),
            callback,
        )
    }

    /// Asynchronous `open_log_stream`
    pub fn start_open_log_stream<C>(&self, stream_id: StreamId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<OverlayStream>) + Send + 'static,
    {
        let log = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| log.open_log_stream(stream_id),
            callback,
        )
    }

    /// Asynchronous `delete_log_stream`.
    ///
    /// No worker waits for the stream's handles: the remaining steps are
    /// queued when the last one is dropped.
    pub fn start_delete_log_stream<C>(&self, stream_id: StreamId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let log = self.clone();
        self.dispatcher().start_continued(
            WritePriority::Normal,
            move |_, done| {
                let lease = match log.begin_delete(stream_id) {
                    Ok(lease) => Arc::new(lease),
                    Err(e) => return done.complete(Err(e)),
                };
                let gate = lease.value().gate.clone();
                gate.on_drained(move || {
                    let closing = Arc::clone(&lease);
                    let dispatcher = Arc::clone(log.dispatcher());
                    dispatcher.start(
                        WritePriority::Normal,
                        move |_| {
                            close_deleted_core(closing.value());
                            Ok(())
                        },
                        move |closed: LogResult<()>| {
                            if let Err(e) = closed {
                                let result = log.finish_delete(lease.value(), stream_id, Err(e));
                                return done.complete(result);
                            }
                            let shared_log = log.shared.shared_log.clone();
                            shared_log.start_delete_log_stream(stream_id, move |result| {
                                let result = log.finish_delete(lease.value(), stream_id, result);
                                done.complete(result);
                            });
                        },
                    );
                });
            },
            callback,
        )
    }
}

/// Close the open instance of a stream being deleted
fn close_deleted_core(slot: &StreamSlot) {
    let core = slot.core.lock().take();
    if let Some(core) = core {
        core.close();
    }
}

/// Delete the dedicated container of `stream_id`. A container that is still
/// held open for a moment by a finishing background task is retried.
pub(crate) fn delete_dedicated_container(
    manager: &ManagerShared,
    disk: DiskId,
    stream_id: StreamId,
) -> LogResult<()> {
    let dedicated_disk = dedicated_disk_id(disk);
    let log_id = dedicated_log_id(stream_id);
    let mut attempt = 0;
    loop {
        match manager.physical.delete_log(dedicated_disk, log_id) {
            Ok(()) | Err(LogError::NotFound(_)) => return Ok(()),
            Err(LogError::SharingViolation(_)) if attempt + 1 < DEDICATED_DELETE_ATTEMPTS => {
                attempt += 1;
                thread::sleep(DEDICATED_DELETE_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}
