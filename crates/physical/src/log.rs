//! Physical log container.
//!
//! A container multiplexes many streams over one device. All mutations are
//! serialized through a write queue: a writer takes the queue slot, validates
//! against the catalog, appends and syncs its frame outside the catalog lock,
//! then applies the frame to the catalog. Readers and queries only take the
//! catalog lock, so they never wait on device I/O.
//!
//! # Space
//!
//! ```text
//! capacity = log_size - header - reserved_space
//! free     = capacity - live_bytes - reservations
//! ```
//!
//! `reserved_space` (two maximum records) is headroom the container keeps for
//! its own control frames, so truncation, record deletes and reservation
//! changes still commit when streams have used every free byte.
//!
//! # Faults
//!
//! A write whose append fails after changing the device leaves the tail in
//! an unknown state. The container is then faulted: every later mutation
//! fails `StructureFault` while reads keep working. Reopening the container
//! trims the torn tail and clears the fault.

use crate::cache::{CachedRecord, ReadCache};
use crate::catalog::{Applied, Catalog, RecordEntry, RecordView};
use crate::compaction;
use crate::device::BlockDevice;
use crate::format::{
    encode_frame, frame_len, parse_frame, ContainerHeader, FrameHeader, FrameKind,
    CONTAINER_HEADER_SIZE, FRAME_OVERHEAD,
};
use crate::manager::ManagerInner;
use crate::recovery::{Recovered, RecoveryStats};
use crate::stream::PhysicalStream;
use ktlog_core::{
    ActivityGate, ActivityGuard, Asn, AsnRange, DiskId, Dispatcher, Event, LogError, LogId, LogResult,
    LsnRange, OperationHandle, ReadRecord, ReadType, RecordDisposition, RecordInfo,
    RecordMetadata, ReservedWriteOutcome, SpaceInfo, StreamId, StreamState, StreamType,
    WritePriority,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Write queue
// ============================================================================

#[derive(Debug, Default)]
struct QueueState {
    writing: bool,
    normal_waiting: usize,
}

/// Serializes mutations. Low priority writers yield to waiting normal ones.
#[derive(Debug, Default)]
struct WriteQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WriteQueue {
    fn acquire(&self, priority: WritePriority) -> WriteSlot<'_> {
        let mut state = self.state.lock();
        match priority {
            WritePriority::Normal => {
                state.normal_waiting += 1;
                while state.writing {
                    self.cond.wait(&mut state);
                }
                state.normal_waiting -= 1;
            }
            WritePriority::Low => {
                while state.writing || state.normal_waiting > 0 {
                    self.cond.wait(&mut state);
                }
            }
        }
        state.writing = true;
        WriteSlot { queue: self }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.writing && state.normal_waiting == 0
    }
}

/// Exclusive right to mutate the container
struct WriteSlot<'a> {
    queue: &'a WriteQueue,
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.queue.state.lock().writing = false;
        self.queue.cond.notify_all();
    }
}

// ============================================================================
// Shared container state
// ============================================================================

struct LogState {
    device: Arc<dyn BlockDevice>,
    catalog: Catalog,
    faulted: Option<String>,
}

/// Per-stream usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamUsage {
    /// Visible records
    pub record_count: usize,
    /// Bytes of live record frames
    pub record_bytes: u64,
    /// Bytes reserved by the stream
    pub reservation: u64,
    /// Highest ASN truncated so far
    pub truncation_asn: Asn,
}

pub(crate) struct LogShared {
    disk_id: DiskId,
    header: ContainerHeader,
    recovery: RecoveryStats,
    manager: Arc<ManagerInner>,
    state: Mutex<LogState>,
    writer: WriteQueue,
    cache: ReadCache,
    shutdown_event: Mutex<Option<Event>>,
}

impl fmt::Debug for LogShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogShared")
            .field("disk_id", &self.disk_id)
            .field("log_id", &self.header.log_id)
            .finish()
    }
}

impl Drop for LogShared {
    fn drop(&mut self) {
        debug!(target: "ktlog::log", log = %self.header.log_id, "Container shut down");
        if let Some(event) = self.shutdown_event.lock().take() {
            event.set();
        }
    }
}

impl LogShared {
    pub(crate) fn new(
        disk_id: DiskId,
        device: Arc<dyn BlockDevice>,
        recovered: Recovered,
        manager: Arc<ManagerInner>,
    ) -> Self {
        let cache = ReadCache::new(manager.config.cache_size);
        LogShared {
            disk_id,
            header: recovered.header,
            recovery: recovered.stats,
            manager,
            state: Mutex::new(LogState {
                device,
                catalog: recovered.catalog,
                faulted: None,
            }),
            writer: WriteQueue::default(),
            cache,
            shutdown_event: Mutex::new(None),
        }
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.manager.dispatcher
    }

    fn reserved_space(&self) -> u64 {
        2 * self.header.max_record_size
    }

    fn capacity(&self) -> u64 {
        self.header
            .log_size
            .saturating_sub(CONTAINER_HEADER_SIZE as u64 + self.reserved_space())
    }

    fn max_user_record_size(&self) -> u64 {
        self.header.max_record_size - FRAME_OVERHEAD as u64
    }

    fn check_faulted(state: &LogState) -> LogResult<()> {
        match &state.faulted {
            Some(msg) => Err(LogError::StructureFault(msg.clone())),
            None => Ok(()),
        }
    }

    fn fault(&self, state: &mut LogState, msg: String) -> LogError {
        error!(target: "ktlog::log", log = %self.header.log_id, reason = %msg, "Container faulted");
        state.faulted = Some(msg.clone());
        LogError::StructureFault(msg)
    }

    /// Append and sync a frame that starts at `offset`.
    ///
    /// A failure that left the device unchanged is returned as is. A failure
    /// that changed the device faults the container and returns
    /// `StructureFault`.
    fn persist(&self, device: &Arc<dyn BlockDevice>, bytes: &[u8], offset: u64) -> LogResult<()> {
        let result = device.append(bytes).and_then(|_| device.sync());
        let Err(err) = result else {
            return Ok(());
        };
        let unchanged = matches!(device.size(), Ok(size) if size == offset);
        if unchanged {
            warn!(target: "ktlog::log", log = %self.header.log_id, error = %err, "Frame append failed");
            return Err(err);
        }
        let mut state = self.state.lock();
        Err(self.fault(
            &mut state,
            format!("append at offset {} left a partial frame: {}", offset, err),
        ))
    }

    /// Make room for a frame at the device tail, compacting if needed.
    fn ensure_room(&self, slot: &WriteSlot<'_>, frame_len: u64) -> LogResult<()> {
        let write_offset = self.state.lock().catalog.write_offset;
        if write_offset + frame_len <= self.header.log_size {
            return Ok(());
        }
        self.compact_with_slot(slot)?;
        let write_offset = self.state.lock().catalog.write_offset;
        if write_offset + frame_len > self.header.log_size {
            return Err(LogError::LogFull {
                requested: frame_len,
                available: self.header.log_size.saturating_sub(write_offset),
            });
        }
        Ok(())
    }

    fn compact_with_slot(&self, _slot: &WriteSlot<'_>) -> LogResult<()> {
        let (plan, device, dead_before) = {
            let state = self.state.lock();
            Self::check_faulted(&state)?;
            (
                compaction::plan(&state.catalog),
                Arc::clone(&state.device),
                state.catalog.dead_bytes,
            )
        };
        let image = compaction::build_image(&self.header, &plan, device.as_ref())?;
        let new_device =
            self.manager
                .provider
                .replace(self.disk_id, self.header.log_id, &image.bytes)?;

        let mut state = self.state.lock();
        state.device = new_device;
        state
            .catalog
            .install_compacted(&image, CONTAINER_HEADER_SIZE as u64);
        info!(
            target: "ktlog::compaction",
            log = %self.header.log_id,
            reclaimed = dead_before,
            size = image.bytes.len(),
            "Compacted container"
        );
        Ok(())
    }

    fn maybe_compact(&self, slot: &WriteSlot<'_>) {
        let dead = self.state.lock().catalog.dead_bytes;
        let threshold = self.manager.config.compaction_threshold_percent as u64;
        if dead * 100 > self.header.log_size * threshold {
            if let Err(e) = self.compact_with_slot(slot) {
                warn!(target: "ktlog::compaction", log = %self.header.log_id, error = %e, "Compaction failed");
            }
        }
    }

    /// Commit a frame without data. `build` validates against the catalog
    /// and returns the frame to write, or None when there is nothing to do.
    fn commit_control<F>(
        &self,
        slot: &WriteSlot<'_>,
        metadata: &[u8],
        build: F,
    ) -> LogResult<Option<Applied>>
    where
        F: FnOnce(&Catalog, u64) -> LogResult<Option<FrameHeader>>,
    {
        self.ensure_room(slot, frame_len(metadata.len(), 0))?;
        let (header, offset, device) = {
            let state = self.state.lock();
            Self::check_faulted(&state)?;
            let free = state.catalog.free_space(self.capacity());
            let Some(mut header) = build(&state.catalog, free)? else {
                return Ok(None);
            };
            header.lsn = state.catalog.next_lsn;
            (header, state.catalog.write_offset, Arc::clone(&state.device))
        };
        let bytes = encode_frame(&header, metadata, &[]);
        self.persist(&device, &bytes, offset)?;

        let mut state = self.state.lock();
        let parsed = FrameHeader {
            metadata_len: metadata.len() as u32,
            ..header
        };
        match state.catalog.apply(&parsed, offset, metadata) {
            Ok(applied) => Ok(Some(applied)),
            Err(msg) => Err(self.fault(&mut state, msg)),
        }
    }

    // ------------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------------

    fn create_stream(&self, id: StreamId, stream_type: StreamType) -> LogResult<ActivityGuard> {
        let max_streams = self.header.max_streams as usize;
        let slot = self.writer.acquire(WritePriority::Normal);
        self.commit_control(&slot, stream_type.as_bytes(), |catalog, free| {
            if let Some(existing) = catalog.streams.get(&id) {
                return Err(if existing.delete_pending {
                    LogError::delete_pending(format!("stream {}", id))
                } else {
                    LogError::collision(format!("stream {}", id))
                });
            }
            if catalog.streams.len() >= max_streams {
                return Err(LogError::InvalidParameter(format!(
                    "container already holds its maximum of {} streams",
                    max_streams
                )));
            }
            let needed = frame_len(16, 0);
            if needed > free {
                return Err(LogError::LogFull {
                    requested: needed,
                    available: free,
                });
            }
            Ok(Some(FrameHeader::new(FrameKind::StreamCreated, 0, id)))
        })?;
        drop(slot);

        debug!(target: "ktlog::log", log = %self.header.log_id, stream = %id, "Created stream");
        self.acquire_stream(id)
    }

    fn acquire_stream(&self, id: StreamId) -> LogResult<ActivityGuard> {
        let state = self.state.lock();
        let stream = state.catalog.live_stream(id)?;
        stream
            .gate
            .try_acquire()
            .ok_or_else(|| LogError::delete_pending(format!("stream {}", id)))
    }

    /// Mark a stream delete-pending and close its gate. New operations fail
    /// `DeletePending` from here on; the returned gate drains as existing
    /// handles are dropped.
    fn begin_delete(&self, id: StreamId) -> LogResult<ActivityGate> {
        let gate = {
            let mut state = self.state.lock();
            let stream = state.catalog.live_stream_mut(id)?;
            stream.delete_pending = true;
            stream.gate.close();
            stream.gate.clone()
        };
        debug!(
            target: "ktlog::log",
            log = %self.header.log_id,
            stream = %id,
            interest = gate.active(),
            "Waiting for stream interest to drain"
        );
        Ok(gate)
    }

    /// Log the stream-deleted frame once the stream's gate has drained
    fn commit_delete(&self, id: StreamId) -> LogResult<()> {
        let slot = self.writer.acquire(WritePriority::Normal);
        let result = self.commit_control(&slot, &[], |_, _| {
            Ok(Some(FrameHeader::new(FrameKind::StreamDeleted, 0, id)))
        });
        if let Err(e) = result {
            if !matches!(e, LogError::StructureFault(_)) {
                // The stream survives a failed delete
                let mut state = self.state.lock();
                if let Some(stream) = state.catalog.streams.get_mut(&id) {
                    stream.delete_pending = false;
                    stream.gate.reopen();
                }
            }
            return Err(e);
        }
        self.cache.invalidate_stream(id);
        self.maybe_compact(&slot);
        debug!(target: "ktlog::log", log = %self.header.log_id, stream = %id, "Deleted stream");
        Ok(())
    }

    fn delete_stream(&self, id: StreamId) -> LogResult<()> {
        let gate = self.begin_delete(id)?;
        gate.wait_drained(None);
        self.commit_delete(id)
    }

    // ------------------------------------------------------------------------
    // Record operations
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_record(
        &self,
        id: StreamId,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
        reserve_to_use: Option<u64>,
        priority: WritePriority,
    ) -> LogResult<ReservedWriteOutcome> {
        if !asn.is_valid() {
            return Err(LogError::InvalidParameter(format!("invalid ASN {}", asn)));
        }
        let size = (metadata.len() + data.len()) as u64;
        let record_len = frame_len(metadata.len(), data.len());
        if record_len > self.header.max_record_size {
            return Err(LogError::BufferOverflow {
                size,
                max: self.max_user_record_size(),
            });
        }

        let slot = self.writer.acquire(priority);
        self.ensure_room(&slot, record_len)?;
        let reserve = reserve_to_use.unwrap_or(0);

        // Requested -> Writing: validate and publish the pending entry
        let (header, offset, device) = {
            let mut state = self.state.lock();
            Self::check_faulted(&state)?;
            let free = state.catalog.free_space(self.capacity());
            let lsn = state.catalog.next_lsn;
            let offset = state.catalog.write_offset;
            let stream = state.catalog.live_stream_mut(id)?;
            if asn <= stream.truncation_asn {
                return Err(LogError::InvalidParameter(format!(
                    "ASN {} is at or below truncation point {}",
                    asn, stream.truncation_asn
                )));
            }
            if let Some(existing) = stream.records.get(&asn) {
                if existing.version >= version {
                    return Err(LogError::collision(format!(
                        "ASN {} holds version {}, write supplied {}",
                        asn, existing.version, version
                    )));
                }
            }
            if reserve > stream.reservation {
                return Err(LogError::ReserveTooSmall {
                    requested: reserve,
                    reserved: stream.reservation,
                });
            }
            if record_len > free + reserve {
                return Err(LogError::LogFull {
                    requested: record_len,
                    available: free + reserve,
                });
            }

            let superseded = stream.records.remove(&asn).map(Box::new);
            stream.records.insert(
                asn,
                RecordEntry {
                    version,
                    lsn,
                    offset,
                    frame_len: record_len,
                    size,
                    disposition: RecordDisposition::Pending,
                    superseded,
                },
            );
            let header = FrameHeader::new(FrameKind::Record, lsn, id)
                .with_asn(asn)
                .with_version(version)
                .with_value(reserve);
            (header, offset, Arc::clone(&state.device))
        };

        let bytes = encode_frame(&header, metadata, data);
        let persisted = self.persist(&device, &bytes, offset);

        // Writing -> Persisted | Rejected
        let mut state = self.state.lock();
        if let Some(stream) = state.catalog.streams.get_mut(&id) {
            if let Some(pending) = stream.records.remove(&asn) {
                if let Some(previous) = pending.superseded {
                    stream.records.insert(asn, *previous);
                }
            }
        }
        match persisted {
            Ok(()) => {
                let header = FrameHeader {
                    metadata_len: metadata.len() as u32,
                    data_len: data.len() as u32,
                    ..header
                };
                if let Err(msg) = state.catalog.apply(&header, offset, metadata) {
                    return Err(self.fault(&mut state, msg));
                }
                let space_remaining = state.catalog.free_space(self.capacity());
                drop(state);
                self.cache.insert(
                    id,
                    asn,
                    version,
                    CachedRecord {
                        metadata: metadata.to_vec(),
                        data: data.to_vec(),
                    },
                );
                Ok(ReservedWriteOutcome {
                    log_size: self.header.log_size,
                    space_remaining,
                })
            }
            Err(e @ LogError::StructureFault(_)) => {
                // A faulted reserved write consumes its reservation
                if let Some(stream) = state.catalog.streams.get_mut(&id) {
                    let consumed = reserve.min(stream.reservation);
                    stream.reservation -= consumed;
                    state.catalog.reserved_total -= consumed;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn read_record(
        &self,
        id: StreamId,
        asn: Asn,
        read_type: ReadType,
    ) -> LogResult<ReadRecord> {
        let (found, view, device, stream_type) = {
            let state = self.state.lock();
            let stream = state.catalog.live_stream(id)?;
            let (found, view) = stream.locate(asn, read_type, false)?;
            (found, view, Arc::clone(&state.device), stream.stream_type)
        };
        self.load_record(id, stream_type, found, view, device.as_ref())
    }

    fn load_record(
        &self,
        id: StreamId,
        stream_type: StreamType,
        asn: Asn,
        view: RecordView,
        device: &dyn BlockDevice,
    ) -> LogResult<ReadRecord> {
        if let Some(cached) = self.cache.get(id, asn, view.version) {
            return Ok(ReadRecord {
                asn,
                version: view.version,
                metadata: cached.metadata.clone(),
                data: cached.data.clone(),
            });
        }

        let mut buf = vec![0u8; view.frame_len as usize];
        device.read_at(view.offset, &mut buf)?;
        let frame = parse_frame(&buf)?;
        let header = &frame.header;
        if header.kind != FrameKind::Record
            || header.stream_id != id
            || header.asn != asn
            || header.version != view.version
        {
            return Err(LogError::CrcError(format!(
                "frame at offset {} does not hold record {} version {}",
                view.offset, asn, view.version
            )));
        }
        frame.verify_data()?;

        if let Some(verify) = self.manager.verifier(stream_type) {
            if !verify(frame.metadata, frame.data) {
                return Err(LogError::DataError(format!(
                    "record {} failed verification for stream type {}",
                    asn, stream_type
                )));
            }
        }

        let record = ReadRecord {
            asn,
            version: view.version,
            metadata: frame.metadata.to_vec(),
            data: frame.data.to_vec(),
        };
        self.cache.insert(
            id,
            asn,
            view.version,
            CachedRecord {
                metadata: record.metadata.clone(),
                data: record.data.clone(),
            },
        );
        Ok(record)
    }

    pub(crate) fn read_contiguous(
        &self,
        id: StreamId,
        asn: Asn,
        byte_budget: u64,
    ) -> LogResult<Vec<ReadRecord>> {
        let (views, device, stream_type) = {
            let state = self.state.lock();
            let stream = state.catalog.live_stream(id)?;
            let mut views = Vec::new();
            let mut total = 0;
            for (record_asn, entry) in stream.records.range(asn..) {
                if total >= byte_budget {
                    break;
                }
                if let Some(view) = entry.view(false) {
                    total += view.size;
                    views.push((*record_asn, view));
                }
            }
            (views, Arc::clone(&state.device), stream.stream_type)
        };
        if views.is_empty() {
            return Err(LogError::not_found(format!("records from {}", asn)));
        }
        views
            .into_iter()
            .map(|(asn, view)| self.load_record(id, stream_type, asn, view, device.as_ref()))
            .collect()
    }

    pub(crate) fn query_record(
        &self,
        id: StreamId,
        asn: Asn,
        read_type: ReadType,
    ) -> LogResult<RecordInfo> {
        let state = self.state.lock();
        let stream = state.catalog.live_stream(id)?;
        let (found, view) = stream.locate(asn, read_type, true)?;
        Ok(RecordInfo {
            asn: found,
            version: view.version,
            disposition: view.disposition,
            size: view.size,
            debug_info: view.lsn,
        })
    }

    pub(crate) fn query_records(
        &self,
        id: StreamId,
        low: Asn,
        high: Asn,
        out: &mut Vec<RecordMetadata>,
    ) -> LogResult<()> {
        let state = self.state.lock();
        state.catalog.live_stream(id)?.collect_metadata(low, high, out);
        Ok(())
    }

    pub(crate) fn delete_record(&self, id: StreamId, asn: Asn, version: u64) -> LogResult<()> {
        let slot = self.writer.acquire(WritePriority::Normal);
        self.commit_control(&slot, &[], |catalog, _| {
            let stream = catalog.live_stream(id)?;
            let matches = stream
                .records
                .get(&asn)
                .and_then(|e| e.view(false))
                .map(|v| v.version == version)
                .unwrap_or(false);
            if !matches {
                return Err(LogError::not_found(format!(
                    "record {} version {}",
                    asn, version
                )));
            }
            Ok(Some(
                FrameHeader::new(FrameKind::DeleteRecord, 0, id)
                    .with_asn(asn)
                    .with_version(version),
            ))
        })?;
        self.cache.invalidate_record(id, asn);
        self.maybe_compact(&slot);
        Ok(())
    }

    /// Truncate a stream.
    ///
    /// With `below_version` set the truncation is refused with
    /// `NameCollision` if a record at or below `point` carries that version
    /// or a higher one.
    pub(crate) fn truncate(
        &self,
        id: StreamId,
        point: Asn,
        preferred: Asn,
        below_version: Option<u64>,
    ) -> LogResult<()> {
        let slot = self.writer.acquire(WritePriority::Low);
        let log_size = self.header.log_size;
        let pressure_percent = self.manager.config.space_pressure_percent as u64;
        let mut effective = Asn::NULL;

        let applied = self.commit_control(&slot, &[], |catalog, free| {
            let stream = catalog.live_stream(id)?;
            if let Some(version) = below_version {
                if let Some((asn, entry)) = stream
                    .records
                    .range(..=point)
                    .find(|(_, e)| e.version >= version)
                {
                    return Err(LogError::collision(format!(
                        "record {} holds version {} at or above {}",
                        asn, entry.version, version
                    )));
                }
            }
            let under_pressure = free * 100 < log_size * pressure_percent;
            let preferred = if preferred.is_null() { point } else { preferred };
            effective = if under_pressure {
                point
            } else {
                point.min(preferred)
            };
            if effective.is_null() || effective <= stream.truncation_asn {
                return Ok(None);
            }
            Ok(Some(
                FrameHeader::new(FrameKind::Truncate, 0, id).with_asn(effective),
            ))
        })?;

        let event = {
            let state = self.state.lock();
            state
                .catalog
                .streams
                .get(&id)
                .and_then(|s| s.truncation_event.clone())
        };
        if let Some(applied) = applied {
            self.cache.invalidate_through(id, effective);
            debug!(
                target: "ktlog::truncate",
                log = %self.header.log_id,
                stream = %id,
                point = %effective,
                removed = applied.records_removed,
                "Truncated stream"
            );
            self.maybe_compact(&slot);
        }
        if let Some(event) = event {
            event.set();
        }
        Ok(())
    }

    pub(crate) fn update_reservation(&self, id: StreamId, delta: i64) -> LogResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let slot = self.writer.acquire(WritePriority::Normal);
        self.commit_control(&slot, &[], |catalog, free| {
            let stream = catalog.live_stream(id)?;
            let amount = delta.unsigned_abs();
            let reservation = if delta > 0 {
                if amount > free {
                    return Err(LogError::LogFull {
                        requested: amount,
                        available: free,
                    });
                }
                stream.reservation + amount
            } else {
                if amount > stream.reservation {
                    return Err(LogError::InvalidParameter(format!(
                        "cannot release {} bytes, stream holds {}",
                        amount, stream.reservation
                    )));
                }
                stream.reservation - amount
            };
            Ok(Some(
                FrameHeader::new(FrameKind::Reservation, 0, id).with_value(reservation),
            ))
        })?;
        Ok(())
    }

    pub(crate) fn query_reservation(&self, id: StreamId) -> u64 {
        self.state
            .lock()
            .catalog
            .streams
            .get(&id)
            .map(|s| s.reservation)
            .unwrap_or(0)
    }

    pub(crate) fn query_asn_range(&self, id: StreamId) -> LogResult<AsnRange> {
        let state = self.state.lock();
        let stream = state.catalog.live_stream(id)?;
        let (lowest, highest) = stream.asn_bounds();
        Ok(AsnRange {
            lowest,
            highest,
            truncation: stream.truncation_asn,
        })
    }

    pub(crate) fn set_truncation_event(&self, id: StreamId, event: Event) -> LogResult<()> {
        let mut state = self.state.lock();
        state.catalog.live_stream_mut(id)?.truncation_event = Some(event);
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock()
    }
}

// ============================================================================
// Public container handle
// ============================================================================

/// Handle to an open physical log container.
///
/// Handles are cheap to clone. The container shuts down when the last handle
/// (including stream handles and in-flight operations) is released.
#[derive(Clone)]
pub struct PhysicalLog {
    pub(crate) shared: Arc<LogShared>,
    _interest: ActivityGuard,
}

impl fmt::Debug for PhysicalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalLog")
            .field("disk_id", &self.shared.disk_id)
            .field("log_id", &self.shared.header.log_id)
            .finish()
    }
}

impl PhysicalLog {
    pub(crate) fn new(shared: Arc<LogShared>, interest: ActivityGuard) -> Self {
        PhysicalLog {
            shared,
            _interest: interest,
        }
    }

    /// Disk holding the container
    pub fn disk_id(&self) -> DiskId {
        self.shared.disk_id
    }

    /// Container id
    pub fn log_id(&self) -> LogId {
        self.shared.header.log_id
    }

    /// Log type supplied at creation
    pub fn log_type(&self) -> StreamType {
        self.shared.header.log_type
    }

    /// Flags supplied at creation
    pub fn flags(&self) -> u32 {
        self.shared.header.flags
    }

    /// What recovery found when the container was opened
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.shared.recovery
    }

    /// Dispatcher running this container's `start_*` operations
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.shared.dispatcher()
    }

    /// Create a stream and open a handle to it.
    ///
    /// # Errors
    ///
    /// `NameCollision` if the stream exists, `DeletePending` if it is being
    /// deleted, `LogFull` if the stream-created frame does not fit and
    /// `InvalidParameter` at the stream limit.
    pub fn create_log_stream(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> LogResult<PhysicalStream> {
        let interest = self.shared.create_stream(stream_id, stream_type)?;
        Ok(PhysicalStream::new(self.clone(), stream_id, interest))
    }

    /// Open a handle to an existing stream.
    pub fn open_log_stream(&self, stream_id: StreamId) -> LogResult<PhysicalStream> {
        let interest = self.shared.acquire_stream(stream_id)?;
        Ok(PhysicalStream::new(self.clone(), stream_id, interest))
    }

    /// Delete a stream.
    ///
    /// New operations on the stream fail `DeletePending` immediately. The
    /// call blocks until every handle and in-flight operation on the stream
    /// is released, then removes it. A caller must not hold a handle to the
    /// stream it deletes.
    pub fn delete_log_stream(&self, stream_id: StreamId) -> LogResult<()> {
        self.shared.delete_stream(stream_id)
    }

    /// Asynchronous `create_log_stream`
    pub fn start_create_log_stream<C>(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        callback: C,
    ) -> OperationHandle
    where
        C: FnOnce(LogResult<PhysicalStream>) + Send + 'static,
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
        C: FnOnce(LogResult<PhysicalStream>) + Send + 'static,
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
    /// No worker waits for the stream's handles: the delete is committed by
    /// a task queued when the last one is dropped.
    pub fn start_delete_log_stream<C>(&self, stream_id: StreamId, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let log = self.clone();
        self.dispatcher().start_continued(
            WritePriority::Normal,
            move |_, done| match log.shared.begin_delete(stream_id) {
                Err(e) => done.complete(Err(e)),
                Ok(gate) => gate.on_drained(move || {
                    let dispatcher = Arc::clone(log.dispatcher());
                    dispatcher.start(
                        WritePriority::Normal,
                        move |_| log.shared.commit_delete(stream_id),
                        move |result| done.complete(result),
                    );
                }),
            },
            callback,
        )
    }

    /// Total and free space
    pub fn query_space_information(&self) -> SpaceInfo {
        let state = self.shared.lock_state();
        SpaceInfo {
            total_space: self.shared.capacity(),
            free_space: state.catalog.free_space(self.shared.capacity()),
        }
    }

    /// Space the container keeps for its own control frames
    pub fn query_reserved_space(&self) -> u64 {
        self.shared.reserved_space()
    }

    /// Sum of all stream reservations
    pub fn query_current_reservation(&self) -> u64 {
        self.shared.lock_state().catalog.reserved_total
    }

    /// Maximum stream count
    pub fn query_max_allowed_streams(&self) -> u32 {
        self.shared.header.max_streams
    }

    /// Maximum frame size of one record
    pub fn query_max_record_size(&self) -> u64 {
        self.shared.header.max_record_size
    }

    /// Maximum metadata plus data bytes of one record
    pub fn query_max_user_record_size(&self) -> u64 {
        self.shared.max_user_record_size()
    }

    /// LSN span of live records and the stream holding the lowest one
    pub fn query_lsn_range_information(&self) -> LsnRange {
        let state = self.shared.lock_state();
        let highest_lsn = state.catalog.highest_lsn();
        match state.catalog.lowest_record_lsn() {
            Some((lowest_lsn, stream)) => LsnRange {
                lowest_lsn,
                highest_lsn,
                lowest_lsn_stream: Some(stream),
            },
            None => LsnRange {
                lowest_lsn: highest_lsn,
                highest_lsn,
                lowest_lsn_stream: None,
            },
        }
    }

    /// Read cache (limit, usage) in bytes
    pub fn query_cache_size(&self) -> (u64, u64) {
        self.shared.cache.size()
    }

    /// Change the read cache limit
    pub fn set_cache_size(&self, limit: u64) {
        self.shared.cache.set_limit(limit);
    }

    /// Whether `stream_id` names a stream in this container
    pub fn is_stream_id_valid(&self, stream_id: StreamId) -> bool {
        self.shared
            .lock_state()
            .catalog
            .streams
            .contains_key(&stream_id)
    }

    /// Open / closed / deleted flags of a stream
    pub fn get_stream_state(&self, stream_id: StreamId) -> LogResult<StreamState> {
        let state = self.shared.lock_state();
        let stream = state
            .catalog
            .streams
            .get(&stream_id)
            .ok_or_else(|| LogError::not_found(format!("stream {}", stream_id)))?;
        let is_open = stream.gate.active() > 0;
        Ok(StreamState {
            is_open,
            is_closed: !is_open && !stream.delete_pending,
            is_deleted: stream.delete_pending,
        })
    }

    /// Type tag a stream was created with
    pub fn get_stream_type(&self, stream_id: StreamId) -> LogResult<StreamType> {
        let state = self.shared.lock_state();
        Ok(state.catalog.live_stream(stream_id)?.stream_type)
    }

    /// Whether no mutation is queued or in progress
    pub fn is_log_flushed(&self) -> bool {
        self.shared.writer.is_idle()
    }

    /// Ids of all streams, including ones pending deletion
    pub fn get_streams(&self) -> Vec<StreamId> {
        self.shared
            .lock_state()
            .catalog
            .streams
            .keys()
            .copied()
            .collect()
    }

    /// Usage of one stream
    pub fn query_stream_usage(&self, stream_id: StreamId) -> LogResult<StreamUsage> {
        let state = self.shared.lock_state();
        let stream = state.catalog.live_stream(stream_id)?;
        Ok(StreamUsage {
            record_count: stream
                .records
                .values()
                .filter(|e| e.view(false).is_some())
                .count(),
            record_bytes: stream.record_bytes(),
            reservation: stream.reservation,
            truncation_asn: stream.truncation_asn,
        })
    }

    /// Register an event signalled when the container shuts down
    pub fn set_shutdown_event(&self, event: Event) {
        *self.shared.shutdown_event.lock() = Some(event);
    }

    /// Whether a structure fault made the container read-only
    pub fn is_faulted(&self) -> bool {
        self.shared.lock_state().faulted.is_some()
    }

    /// Dead bytes awaiting compaction
    pub fn query_dead_bytes(&self) -> u64 {
        self.shared.lock_state().catalog.dead_bytes
    }

    /// Rewrite the container as its live image
    pub fn compact(&self) -> LogResult<()> {
        let slot = self.shared.writer.acquire(WritePriority::Low);
        self.shared.compact_with_slot(&slot)
    }
}
