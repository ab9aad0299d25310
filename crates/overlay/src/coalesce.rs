//! Record coalescing into the dedicated log.
//!
//! Destaged writes are appended to a FIFO list and flushed together as one
//! physical record of the dedicated stream. Batches take dense ASNs starting
//! at 1, each written at version 1. The physical record's metadata is a
//! MessagePack `BatchIndex` describing every entry; its data is the entries'
//! metadata and data concatenated in order, so a single record can later be
//! read back by offset.
//!
//! ```text
//! batch record:  metadata = BatchIndex { truncation, entries[..] }
//!                data     = meta(e0) data(e0) meta(e1) data(e1) ...
//! ```
//!
//! Deletes and truncations of the overlay stream are logged as index-only
//! entries so that `DedicatedIndex::rebuild` reproduces the logical stream
//! from the dedicated log alone.
//!
//! Only one flush runs at a time. A flush that fails fails every append it
//! carried; the appends are not retried and the next flush starts a fresh
//! batch.

use ktlog_core::{
    Asn, Dispatcher, LogError, LogResult, ReadRecord, ReadType, RecordMetadata, RecordStream,
    StreamType, WritePriority,
};
use ktlog_physical::PhysicalStream;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound of an encoded index without entries
pub(crate) const INDEX_BASE_OVERHEAD: u64 = 24;

/// Upper bound of one encoded index entry
pub(crate) const INDEX_ENTRY_OVERHEAD: u64 = 32;

/// Type tag of dedicated streams. Batches are not user records, so record
/// verifiers registered for the user's type must not see them.
pub(crate) fn batch_stream_type() -> StreamType {
    StreamType::from_bytes(*b"ktlog.dedicated!")
}

// ============================================================================
// Batch index
// ============================================================================

/// What an index entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EntryKind {
    /// A record whose bytes follow in the batch data
    Record,
    /// Removal of the record `asn` at `version`
    Delete,
    /// Logical truncation through `asn`
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BatchEntry {
    pub kind: EntryKind,
    pub asn: u64,
    pub version: u64,
    pub metadata_len: u32,
    pub data_len: u32,
}

/// Metadata of one dedicated batch record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BatchIndex {
    /// Logical truncation point when the batch was built
    pub truncation: u64,
    pub entries: Vec<BatchEntry>,
}

impl BatchIndex {
    pub fn to_bytes(&self) -> LogResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| LogError::DataError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> LogResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| LogError::DataError(e.to_string()))
    }
}

/// Where a record lives in the dedicated log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryLocation {
    /// ASN of the batch record
    pub batch: u64,
    /// Offset of the record's metadata in the batch data
    pub offset: u64,
    pub metadata_len: u32,
    pub data_len: u32,
    pub version: u64,
}

impl EntryLocation {
    pub fn size(&self) -> u64 {
        self.metadata_len as u64 + self.data_len as u64
    }

    /// Cut this record out of its batch
    pub fn slice(&self, batch: &ReadRecord) -> LogResult<(Vec<u8>, Vec<u8>)> {
        let start = self.offset as usize;
        let mid = start + self.metadata_len as usize;
        let end = mid + self.data_len as usize;
        if end > batch.data.len() {
            return Err(LogError::DataError(format!(
                "entry at {}..{} exceeds batch {} of {} bytes",
                start,
                end,
                self.batch,
                batch.data.len()
            )));
        }
        Ok((batch.data[start..mid].to_vec(), batch.data[mid..end].to_vec()))
    }
}

// ============================================================================
// Dedicated index
// ============================================================================

/// In-memory map of the records held by the dedicated log.
#[derive(Debug, Default)]
pub(crate) struct DedicatedIndex {
    records: BTreeMap<Asn, EntryLocation>,
    /// Live records per batch
    batch_refs: BTreeMap<u64, usize>,
    truncation: Asn,
    highest_batch: u64,
}

impl DedicatedIndex {
    /// Rebuild the index by replaying every batch of the dedicated stream.
    pub fn rebuild(dedicated: &PhysicalStream) -> LogResult<Self> {
        let mut batches = Vec::new();
        dedicated.query_records(Asn::new(1), Asn::new(u64::MAX - 1), &mut batches)?;

        let mut index = DedicatedIndex::default();
        for batch in &batches {
            let record = dedicated.read(batch.asn, ReadType::Exact)?;
            let decoded = BatchIndex::from_bytes(&record.metadata)?;
            index.apply_batch(batch.asn.get(), &decoded);
        }
        let truncation = index.truncation;
        index.truncate(truncation);

        debug!(
            target: "ktlog::coalesce",
            batches = batches.len(),
            records = index.records.len(),
            truncation = %index.truncation,
            "Rebuilt dedicated index"
        );
        Ok(index)
    }

    fn apply_batch(&mut self, batch: u64, decoded: &BatchIndex) {
        let mut offset = 0u64;
        for entry in &decoded.entries {
            let asn = Asn::new(entry.asn);
            match entry.kind {
                EntryKind::Record => {
                    self.insert(
                        asn,
                        EntryLocation {
                            batch,
                            offset,
                            metadata_len: entry.metadata_len,
                            data_len: entry.data_len,
                            version: entry.version,
                        },
                    );
                    offset += entry.metadata_len as u64 + entry.data_len as u64;
                }
                EntryKind::Delete => {
                    self.remove(asn, Some(entry.version));
                }
                EntryKind::Truncate => self.truncation.set_if_larger(asn),
            }
        }
        self.truncation.set_if_larger(Asn::new(decoded.truncation));
        self.highest_batch = self.highest_batch.max(batch);
    }

    /// Record a location, keeping the higher version if one is present
    pub fn insert(&mut self, asn: Asn, location: EntryLocation) {
        if let Some(existing) = self.records.get(&asn) {
            if existing.version >= location.version {
                return;
            }
        }
        if let Some(previous) = self.records.insert(asn, location) {
            self.unref(previous.batch);
        }
        *self.batch_refs.entry(location.batch).or_insert(0) += 1;
        self.highest_batch = self.highest_batch.max(location.batch);
    }

    /// Remove `asn`, only at `version` when one is given
    pub fn remove(&mut self, asn: Asn, version: Option<u64>) -> bool {
        let matches = self
            .records
            .get(&asn)
            .map_or(false, |loc| version.map_or(true, |v| v == loc.version));
        if !matches {
            return false;
        }
        if let Some(loc) = self.records.remove(&asn) {
            self.unref(loc.batch);
        }
        true
    }

    fn unref(&mut self, batch: u64) {
        if let Some(refs) = self.batch_refs.get_mut(&batch) {
            *refs -= 1;
            if *refs == 0 {
                self.batch_refs.remove(&batch);
            }
        }
    }

    /// Drop every record at or below `point`
    pub fn truncate(&mut self, point: Asn) {
        self.truncation.set_if_larger(point);
        let keep = self.records.split_off(&Asn::new(point.get().saturating_add(1)));
        let dropped = std::mem::replace(&mut self.records, keep);
        for loc in dropped.values() {
            self.unref(loc.batch);
        }
    }

    pub fn get(&self, asn: Asn) -> Option<&EntryLocation> {
        self.records.get(&asn)
    }

    pub fn records(&self) -> &BTreeMap<Asn, EntryLocation> {
        &self.records
    }

    pub fn truncation(&self) -> Asn {
        self.truncation
    }

    pub fn highest_batch(&self) -> u64 {
        self.highest_batch
    }

    pub fn note_batch(&mut self, batch: u64) {
        self.highest_batch = self.highest_batch.max(batch);
    }

    /// Highest dedicated batch ASN that may be physically truncated. The
    /// newest batch is always kept, it carries the truncation point.
    pub fn reclaimable_through(&self) -> Asn {
        if self.highest_batch == 0 {
            return Asn::NULL;
        }
        let lowest_live = self
            .batch_refs
            .keys()
            .next()
            .copied()
            .unwrap_or(self.highest_batch);
        Asn::new(lowest_live.min(self.highest_batch) - 1)
    }

    /// `reclaimable_through` as it will be once the index is truncated to
    /// `point`, without changing the index
    pub fn reclaimable_after(&self, point: Asn) -> Asn {
        if self.highest_batch == 0 {
            return Asn::NULL;
        }
        let lowest_live = self
            .records
            .range(Asn::new(point.get().saturating_add(1))..)
            .map(|(_, loc)| loc.batch)
            .min()
            .unwrap_or(self.highest_batch);
        Asn::new(lowest_live.min(self.highest_batch) - 1)
    }
}

// ============================================================================
// Coalescer
// ============================================================================

/// Completion of one coalesced append
pub(crate) type AppendDone = Box<dyn FnOnce(LogResult<EntryLocation>) + Send>;

/// One entry waiting to be flushed
pub(crate) struct Append {
    pub kind: EntryKind,
    pub asn: Asn,
    pub version: u64,
    pub metadata: Arc<[u8]>,
    pub data: Arc<[u8]>,
    /// Reservation the entry draws down when flushed
    pub reserve: u64,
    pub done: AppendDone,
}

impl Append {
    /// Index-only entry
    pub fn marker(kind: EntryKind, asn: Asn, version: u64, done: AppendDone) -> Self {
        Append {
            kind,
            asn,
            version,
            metadata: Arc::from(Vec::new()),
            data: Arc::from(Vec::new()),
            reserve: 0,
            done,
        }
    }

    fn payload_len(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }
}

impl fmt::Debug for Append {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Append")
            .field("kind", &self.kind)
            .field("asn", &self.asn)
            .field("version", &self.version)
            .field("size", &self.payload_len())
            .finish()
    }
}

/// Why a flush was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    Forced,
    Full,
    Periodic,
    Pressure,
    Close,
}

struct Queued {
    seq: u64,
    append: Append,
}

struct CoalesceState {
    pending: VecDeque<Queued>,
    pending_bytes: u64,
    oldest: Option<Instant>,
    next_seq: u64,
    /// Every append below this sequence has been written or failed
    flushed_through: u64,
    flushing: bool,
    flush_requested: bool,
    next_batch: u64,
    truncation: Asn,
    closed: bool,
}

/// Outcome of flushing one batch
struct BatchResult {
    batch: u64,
    locations: Vec<EntryLocation>,
}

/// FIFO write coalescer for one dedicated stream.
pub(crate) struct Coalescer {
    dedicated: PhysicalStream,
    dispatcher: Arc<Dispatcher>,
    max_batch_bytes: u64,
    state: Mutex<CoalesceState>,
    flushed: Condvar,
    flush_hook: Mutex<Option<FlushHook>>,
}

/// Runs after the appends of every written batch have been completed
pub(crate) type FlushHook = Arc<dyn Fn() + Send + Sync>;

impl fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coalescer")
            .field("pending", &state.pending.len())
            .field("pending_bytes", &state.pending_bytes)
            .field("next_batch", &state.next_batch)
            .finish()
    }
}

impl Coalescer {
    /// Coalescer writing batches from `next_batch` on.
    pub fn new(dedicated: PhysicalStream, next_batch: u64, truncation: Asn) -> Arc<Self> {
        let max_batch_bytes = dedicated.log().query_max_user_record_size();
        let dispatcher = Arc::clone(dedicated.log().dispatcher());
        Arc::new(Coalescer {
            dedicated,
            dispatcher,
            max_batch_bytes,
            state: Mutex::new(CoalesceState {
                pending: VecDeque::new(),
                pending_bytes: 0,
                oldest: None,
                next_seq: 0,
                flushed_through: 0,
                flushing: false,
                flush_requested: false,
                next_batch: next_batch.max(1),
                truncation,
                closed: false,
            }),
            flushed: Condvar::new(),
            flush_hook: Mutex::new(None),
        })
    }

    /// Install the hook run after every successful batch
    pub fn set_flush_hook(&self, hook: FlushHook) {
        *self.flush_hook.lock() = Some(hook);
    }

    /// Largest record payload one append may carry
    pub fn max_entry_payload(&self) -> u64 {
        self.max_batch_bytes
            .saturating_sub(INDEX_BASE_OVERHEAD + INDEX_ENTRY_OVERHEAD)
    }

    /// Dedicated stream written by this coalescer
    pub fn dedicated(&self) -> &PhysicalStream {
        &self.dedicated
    }

    /// Queue an append. Returns its sequence number for `flush_through`.
    pub fn append(self: &Arc<Self>, append: Append) -> LogResult<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::ShutdownPending);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending_bytes += append.payload_len() + INDEX_ENTRY_OVERHEAD;
        if state.oldest.is_none() {
            state.oldest = Some(Instant::now());
        }
        state.pending.push_back(Queued { seq, append });
        let full = state.pending_bytes + INDEX_BASE_OVERHEAD >= self.max_batch_bytes;
        drop(state);

        if full {
            self.request_flush(FlushReason::Full);
        }
        Ok(seq)
    }

    /// Flush in the background unless a flush is already requested
    pub fn request_flush(self: &Arc<Self>, reason: FlushReason) {
        {
            let mut state = self.state.lock();
            if state.flush_requested || state.pending.is_empty() {
                return;
            }
            state.flush_requested = true;
        }
        let coalescer = Arc::downgrade(self);
        self.dispatcher.start(
            WritePriority::Low,
            move |_| match coalescer.upgrade() {
                Some(coalescer) => {
                    coalescer.state.lock().flush_requested = false;
                    coalescer.flush_all(reason)
                }
                None => Ok(()),
            },
            |_| {},
        );
    }

    /// Flush every append queued so far
    pub fn flush_all(&self, reason: FlushReason) -> LogResult<()> {
        let target = self.state.lock().next_seq;
        self.flush_through(target, reason)
    }

    /// Flush until every append with a sequence below `target` is settled.
    ///
    /// Returns the error of the last batch this call wrote, if it failed.
    pub fn flush_through(&self, target: u64, reason: FlushReason) -> LogResult<()> {
        let mut outcome = Ok(());
        loop {
            let (batch, entries, truncation) = {
                let mut state = self.state.lock();
                while state.flushing {
                    self.flushed.wait(&mut state);
                }
                if state.flushed_through >= target || state.pending.is_empty() {
                    return outcome;
                }
                state.flushing = true;
                let entries = self.take_batch(&mut state);
                let truncation = entries
                    .iter()
                    .filter(|q| q.append.kind == EntryKind::Truncate)
                    .map(|q| q.append.asn)
                    .fold(state.truncation, Asn::max);
                (state.next_batch, entries, truncation)
            };

            let last_seq = entries.last().map(|q| q.seq).unwrap_or(0);
            let result = self.write_batch(batch, truncation, &entries);

            {
                let mut state = self.state.lock();
                state.flushing = false;
                state.flushed_through = state.flushed_through.max(last_seq + 1);
                if result.is_ok() {
                    state.next_batch = batch + 1;
                    state.truncation = truncation;
                }
                self.flushed.notify_all();
            }

            match result {
                Ok(written) => {
                    debug!(
                        target: "ktlog::coalesce",
                        batch = written.batch,
                        entries = entries.len(),
                        ?reason,
                        "Flushed batch"
                    );
                    for (queued, loc) in entries.into_iter().zip(written.locations) {
                        (queued.append.done)(Ok(loc));
                    }
                    let hook = self.flush_hook.lock().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                    outcome = Ok(());
                }
                Err(e) => {
                    warn!(
                        target: "ktlog::coalesce",
                        batch,
                        entries = entries.len(),
                        error = %e,
                        "Batch flush failed"
                    );
                    for queued in entries {
                        (queued.append.done)(Err(e.duplicate()));
                    }
                    outcome = Err(e);
                }
            }
        }
    }

    /// Take the longest FIFO prefix that fits one physical record
    fn take_batch(&self, state: &mut CoalesceState) -> Vec<Queued> {
        let mut taken = Vec::new();
        let mut bytes = INDEX_BASE_OVERHEAD;
        while let Some(front) = state.pending.front() {
            let cost = front.append.payload_len() + INDEX_ENTRY_OVERHEAD;
            if !taken.is_empty() && bytes + cost > self.max_batch_bytes {
                break;
            }
            bytes += cost;
            state.pending_bytes -= cost;
            if let Some(queued) = state.pending.pop_front() {
                taken.push(queued);
            }
        }
        state.oldest = if state.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        taken
    }

    fn write_batch(&self, batch: u64, truncation: Asn, entries: &[Queued]) -> LogResult<BatchResult> {
        let mut index = BatchIndex {
            truncation: truncation.get(),
            entries: Vec::with_capacity(entries.len()),
        };
        let mut data = Vec::new();
        let mut locations = Vec::with_capacity(entries.len());
        let mut reserve = 0u64;
        for queued in entries {
            let append = &queued.append;
            locations.push(EntryLocation {
                batch,
                offset: data.len() as u64,
                metadata_len: append.metadata.len() as u32,
                data_len: append.data.len() as u32,
                version: append.version,
            });
            index.entries.push(BatchEntry {
                kind: append.kind,
                asn: append.asn.get(),
                version: append.version,
                metadata_len: append.metadata.len() as u32,
                data_len: append.data.len() as u32,
            });
            data.extend_from_slice(&append.metadata);
            data.extend_from_slice(&append.data);
            reserve += append.reserve;
        }

        let metadata = index.to_bytes()?;
        let asn = Asn::new(batch);
        if reserve > 0 {
            self.dedicated
                .reserved_write(reserve, asn, 1, &metadata, &data)?;
        } else {
            self.dedicated.write(asn, 1, &metadata, &data)?;
        }
        Ok(BatchResult { batch, locations })
    }

    /// Whether the oldest queued append is older than `age`
    pub fn is_flush_due(&self, age: Duration) -> bool {
        self.state
            .lock()
            .oldest
            .map(|t| t.elapsed() >= age)
            .unwrap_or(false)
    }

    /// Appends waiting to be flushed
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Flush everything and refuse further appends
    pub fn close(&self) -> LogResult<()> {
        let result = self.flush_all(FlushReason::Close);
        self.state.lock().closed = true;
        result
    }

    /// Batch records currently held by the dedicated stream
    pub fn batches(&self) -> LogResult<Vec<RecordMetadata>> {
        let mut out = Vec::new();
        self.dedicated
            .query_records(Asn::new(1), Asn::new(u64::MAX - 1), &mut out)?;
        Ok(out)
    }
}
