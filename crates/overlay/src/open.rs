//! Overlay stream open.
//!
//! Opening (or creating) an overlay stream walks a fixed sequence of states:
//!
//! ```text
//! Initial -> AllocateResources -> WaitForGate -> OpenSharedStream
//!   -> OpenDedicatedContainer -> OpenDedicatedStream
//!   -> CopyFromSharedToDedicated -> VerifyDedicatedSharedContiguousness
//!   -> FinishOpen
//! ```
//!
//! The copy step is the crash recovery of the overlay: every record the
//! shared stream still holds that the dedicated log does not (or holds at a
//! lower version) is appended to the dedicated log before the stream becomes
//! usable. The verify step then requires the dedicated log to cover every
//! shared record, so the shared copy may be truncated.
//!
//! Opens of streams on the same disk are bounded by that disk's quota gate,
//! held from `WaitForGate` until the open finishes.

use crate::coalesce::{
    batch_stream_type, Append, Coalescer, DedicatedIndex, EntryKind, EntryLocation, FlushReason,
};
use crate::counters::StreamCounters;
use crate::gate::QuotaGuard;
use crate::log::LogShared;
use crate::stream::{CoreParts, StreamCore};
use crate::timer::PeriodicTarget;
use ktlog_core::{
    Asn, DiskId, LogError, LogId, LogResult, ReadType, RecordMetadata, RecordStream, StreamId,
    StreamType,
};
use ktlog_physical::{PhysicalLog, PhysicalStream};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Copied records appended before an intermediate flush
const COPY_FLUSH_EVERY: usize = 64;

/// Mask applied to a disk id to name the disk holding dedicated containers
const DEDICATED_DISK_MASK: [u8; 16] = [
    0x5a, 0xa5, 0x5a, 0xa5, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

/// Disk whose namespace holds the dedicated containers of streams on `disk`.
///
/// Keeping them apart leaves `enumerate_logs(disk)` listing only shared
/// containers.
pub fn dedicated_disk_id(disk: DiskId) -> DiskId {
    let mut bytes = *disk.as_bytes();
    for (b, m) in bytes.iter_mut().zip(DEDICATED_DISK_MASK.iter()) {
        *b ^= m;
    }
    DiskId::from_bytes(bytes)
}

/// Id of the dedicated container of `stream`
pub fn dedicated_log_id(stream: StreamId) -> LogId {
    LogId::from(stream)
}

/// Summary of one stream open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Records copied from the shared log into the dedicated log
    pub records_copied: u64,
    /// Shared records checked against the dedicated log
    pub records_verified: u64,
    /// Records held by the dedicated log once open
    pub dedicated_records: usize,
    /// Truncation point of the stream once open
    pub truncation: Asn,
    /// Whether the dedicated container was created by this open
    pub created: bool,
    /// Time the open took
    pub elapsed: Duration,
}

/// States of the open state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenState {
    Initial,
    AllocateResources,
    WaitForGate,
    OpenSharedStream,
    OpenDedicatedContainer,
    OpenDedicatedStream,
    CopyFromSharedToDedicated,
    VerifyDedicatedSharedContiguousness,
    FinishOpen,
    Completed,
}

impl fmt::Display for OpenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Open in progress
struct OpenContext {
    log: Arc<LogShared>,
    stream_id: StreamId,
    stream_type: StreamType,
    create: bool,
    state: OpenState,
    started: Instant,
    pool_added: u64,
    gate: Option<QuotaGuard>,
    shared: Option<PhysicalStream>,
    dedicated_log: Option<PhysicalLog>,
    dedicated: Option<PhysicalStream>,
    index: Option<DedicatedIndex>,
    coalescer: Option<Arc<Coalescer>>,
    counters: StreamCounters,
    report: OpenReport,
    core: Option<Arc<StreamCore>>,
}

/// Run the open state machine for one stream.
///
/// With `create`, the shared stream must not exist yet and any stale
/// dedicated container left by an earlier stream of the same id is
/// replaced.
pub(crate) fn open_stream(
    log: &Arc<LogShared>,
    stream_id: StreamId,
    stream_type: StreamType,
    create: bool,
) -> LogResult<Arc<StreamCore>> {
    let mut ctx = OpenContext {
        log: Arc::clone(log),
        stream_id,
        stream_type,
        create,
        state: OpenState::Initial,
        started: Instant::now(),
        pool_added: 0,
        gate: None,
        shared: None,
        dedicated_log: None,
        dedicated: None,
        index: None,
        coalescer: None,
        counters: StreamCounters::default(),
        report: OpenReport::default(),
        core: None,
    };

    match ctx.run() {
        Ok(core) => Ok(core),
        Err(e) => {
            warn!(
                target: "ktlog::overlay::open",
                stream = %stream_id,
                state = %ctx.state,
                error = %e,
                "Stream open failed"
            );
            ctx.log.manager().allocator.remove_stream(ctx.pool_added);
            Err(e)
        }
    }
}

impl OpenContext {
    fn run(&mut self) -> LogResult<Arc<StreamCore>> {
        loop {
            let next = match self.state {
                OpenState::Initial => OpenState::AllocateResources,
                OpenState::AllocateResources => self.allocate_resources(),
                OpenState::WaitForGate => self.wait_for_gate()?,
                OpenState::OpenSharedStream => self.open_shared_stream()?,
                OpenState::OpenDedicatedContainer => self.open_dedicated_container()?,
                OpenState::OpenDedicatedStream => self.open_dedicated_stream()?,
                OpenState::CopyFromSharedToDedicated => self.copy_from_shared()?,
                OpenState::VerifyDedicatedSharedContiguousness => self.verify_contiguous()?,
                OpenState::FinishOpen => self.finish_open()?,
                OpenState::Completed => break,
            };
            debug!(
                target: "ktlog::overlay::open",
                stream = %self.stream_id,
                from = %self.state,
                to = %next,
                "Open state transition"
            );
            self.state = next;
        }
        self.core
            .take()
            .ok_or_else(|| LogError::StructureFault(format!("stream {} open left no core", self.stream_id)))
    }

    fn allocate_resources(&mut self) -> OpenState {
        self.pool_added = self.log.manager().allocator.add_stream();
        OpenState::WaitForGate
    }

    fn wait_for_gate(&mut self) -> LogResult<OpenState> {
        let manager = self.log.manager();
        let gate = manager.gates.gate_for(self.log.key().disk);
        self.gate = Some(gate.acquire(manager.config.open_gate_timeout)?);
        Ok(OpenState::OpenSharedStream)
    }

    fn open_shared_stream(&mut self) -> LogResult<OpenState> {
        let shared_log = self.log.shared_log();
        let stream = if self.create {
            shared_log.create_log_stream(self.stream_id, self.stream_type)?
        } else {
            let stream = shared_log.open_log_stream(self.stream_id)?;
            self.stream_type = shared_log.get_stream_type(self.stream_id)?;
            stream
        };
        self.shared = Some(stream);
        Ok(OpenState::OpenDedicatedContainer)
    }

    fn open_dedicated_container(&mut self) -> LogResult<OpenState> {
        let manager = self.log.manager();
        let disk = dedicated_disk_id(self.log.key().disk);
        let log_id = dedicated_log_id(self.stream_id);
        let options = manager.config.dedicated_options();
        let physical = &manager.physical;

        let create = |created: &mut bool| -> LogResult<PhysicalLog> {
            *created = true;
            physical.create_log(disk, log_id, self.stream_type, &options)
        };
        let mut created = false;
        let container = if self.create {
            match physical.delete_log(disk, log_id) {
                Ok(()) => {
                    info!(target: "ktlog::overlay::open", stream = %self.stream_id, "Replaced stale dedicated container");
                }
                Err(LogError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            create(&mut created)?
        } else {
            match physical.open_log(disk, log_id) {
                Ok(container) => container,
                Err(LogError::NotFound(_)) => create(&mut created)?,
                Err(e) => return Err(e),
            }
        };
        self.report.created = created;
        self.dedicated_log = Some(container);
        Ok(OpenState::OpenDedicatedStream)
    }

    fn open_dedicated_stream(&mut self) -> LogResult<OpenState> {
        let container = self
            .dedicated_log
            .as_ref()
            .ok_or_else(|| missing(self.stream_id, "dedicated container"))?;
        let stream = match container.open_log_stream(self.stream_id) {
            Ok(stream) => stream,
            Err(LogError::NotFound(_)) => container.create_log_stream(self.stream_id, batch_stream_type())?,
            Err(e) => return Err(e),
        };
        let index = DedicatedIndex::rebuild(&stream)?;
        self.coalescer = Some(Coalescer::new(
            stream.clone(),
            index.highest_batch() + 1,
            index.truncation(),
        ));
        self.index = Some(index);
        self.dedicated = Some(stream);
        Ok(OpenState::CopyFromSharedToDedicated)
    }

    fn copy_from_shared(&mut self) -> LogResult<OpenState> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| missing(self.stream_id, "shared stream"))?;
        let coalescer = self
            .coalescer
            .as_ref()
            .ok_or_else(|| missing(self.stream_id, "coalescer"))?;
        let index = self
            .index
            .as_mut()
            .ok_or_else(|| missing(self.stream_id, "dedicated index"))?;

        let mut records = Vec::new();
        shared.query_records(Asn::new(1), Asn::new(u64::MAX - 1), &mut records)?;
        let missing_records: Vec<&RecordMetadata> = records
            .iter()
            .filter(|r| r.asn > index.truncation())
            .filter(|r| index.get(r.asn).map_or(true, |loc| loc.version < r.version))
            .collect();
        if missing_records.is_empty() {
            return Ok(OpenState::VerifyDedicatedSharedContiguousness);
        }

        type CopySink = Arc<Mutex<Vec<(Asn, LogResult<EntryLocation>)>>>;
        let sink: CopySink = Arc::new(Mutex::new(Vec::new()));
        for (i, meta) in missing_records.iter().enumerate() {
            let record = shared.read(meta.asn, ReadType::Exact)?;
            let done_sink = Arc::clone(&sink);
            let asn = record.asn;
            coalescer.append(Append {
                kind: EntryKind::Record,
                asn,
                version: record.version,
                metadata: Arc::from(record.metadata),
                data: Arc::from(record.data),
                reserve: 0,
                done: Box::new(move |result| done_sink.lock().push((asn, result))),
            })?;
            if (i + 1) % COPY_FLUSH_EVERY == 0 {
                coalescer.flush_all(FlushReason::Forced)?;
            }
        }
        coalescer.flush_all(FlushReason::Forced)?;

        let results = std::mem::take(&mut *sink.lock());
        let mut copied = 0u64;
        for (asn, result) in results {
            index.insert(asn, result?);
            copied += 1;
        }
        self.counters.add_records_copied(copied);
        self.report.records_copied = copied;
        info!(
            target: "ktlog::overlay::open",
            stream = %self.stream_id,
            copied,
            "Copied shared records into the dedicated log"
        );
        Ok(OpenState::VerifyDedicatedSharedContiguousness)
    }

    fn verify_contiguous(&mut self) -> LogResult<OpenState> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| missing(self.stream_id, "shared stream"))?;
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| missing(self.stream_id, "dedicated index"))?;

        let mut records = Vec::new();
        shared.query_records(Asn::new(1), Asn::new(u64::MAX - 1), &mut records)?;
        let mut verified = 0u64;
        for record in records.iter().filter(|r| r.asn > index.truncation()) {
            match index.get(record.asn) {
                Some(loc) if loc.version >= record.version => verified += 1,
                _ => {
                    return Err(LogError::StructureFault(format!(
                        "stream {}: shared record {} v{} is missing from the dedicated log",
                        self.stream_id, record.asn, record.version
                    )))
                }
            }
        }
        self.report.records_verified = verified;

        let truncation = index.truncation();
        if !truncation.is_null() && shared.query_asn_range()?.truncation < truncation {
            shared.truncate(truncation, truncation)?;
        }
        Ok(OpenState::FinishOpen)
    }

    fn finish_open(&mut self) -> LogResult<OpenState> {
        let missing_part = |what| missing(self.stream_id, what);
        let shared = self.shared.take().ok_or_else(|| missing_part("shared stream"))?;
        let coalescer = self.coalescer.take().ok_or_else(|| missing_part("coalescer"))?;
        let index = self.index.take().ok_or_else(|| missing_part("dedicated index"))?;
        let manager = Arc::clone(self.log.manager());

        self.report.dedicated_records = index.records().len();
        self.report.truncation = index.truncation();
        self.report.elapsed = self.started.elapsed();

        let core = StreamCore::new(CoreParts {
            stream_id: self.stream_id,
            stream_type: self.stream_type,
            log: Arc::clone(&self.log),
            shared,
            coalescer,
            index,
            settings: manager.config.shared.clone(),
            throttle_threshold: manager.limits.read().maximum_destaging_write_outstanding,
            pool_added: self.pool_added,
            report: self.report.clone(),
            counters: std::mem::take(&mut self.counters),
        });
        // The core now owns the pool share
        self.pool_added = 0;

        let target: Arc<dyn PeriodicTarget> = core.clone();
        let weak: Weak<dyn PeriodicTarget> = Arc::downgrade(&target);
        manager.timer.register(weak);
        self.log.register_stream(Arc::downgrade(&core));
        core.truncate_shared_stream_if_possible();

        // Dedicated container handle lives on through the coalescer
        self.dedicated_log = None;
        self.dedicated = None;
        self.gate = None;

        info!(
            target: "ktlog::overlay::open",
            stream = %self.stream_id,
            created = self.create,
            copied = self.report.records_copied,
            records = self.report.dedicated_records,
            elapsed_ms = self.report.elapsed.as_millis() as u64,
            "Opened overlay stream"
        );
        self.core = Some(core);
        Ok(OpenState::Completed)
    }
}

fn missing(stream: StreamId, what: &str) -> LogError {
    LogError::StructureFault(format!("stream {} open is missing its {}", stream, what))
}
