//! In-memory catalog of a container.
//!
//! The catalog is the container state rebuilt by recovery and maintained by
//! every committed frame: streams, their records, truncation points,
//! reservations and byte accounting. `Catalog::apply` is the single place a
//! frame changes the catalog, so replay and live operation cannot diverge.
//!
//! Accounting: every byte after the header is either live (stream-created
//! frames and current record frames) or dead (everything else). Dead bytes
//! are reclaimed by compaction.

use crate::format::{FrameHeader, FrameKind};
use ktlog_core::{
    ActivityGate, Asn, Event, LogError, LogResult, ReadType, RecordDisposition, RecordMetadata,
    StreamId, StreamType,
};
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};

/// Location and state of one record version
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordEntry {
    pub version: u64,
    pub lsn: u64,
    pub offset: u64,
    pub frame_len: u64,
    pub size: u64,
    pub disposition: RecordDisposition,
    /// Persisted version a pending overwrite replaces
    pub superseded: Option<Box<RecordEntry>>,
}

/// Copyable view of a record entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordView {
    pub version: u64,
    pub lsn: u64,
    pub offset: u64,
    pub frame_len: u64,
    pub size: u64,
    pub disposition: RecordDisposition,
}

impl RecordEntry {
    fn as_view(&self) -> RecordView {
        RecordView {
            version: self.version,
            lsn: self.lsn,
            offset: self.offset,
            frame_len: self.frame_len,
            size: self.size,
            disposition: self.disposition,
        }
    }

    /// The version a reader sees. Pending writes are only visible to
    /// metadata queries; data readers see the version they supersede.
    pub fn view(&self, include_pending: bool) -> Option<RecordView> {
        match self.disposition {
            RecordDisposition::Pending if !include_pending => {
                self.superseded.as_ref().map(|e| e.as_view())
            }
            RecordDisposition::None => None,
            _ => Some(self.as_view()),
        }
    }
}

/// Catalog entry of one stream
#[derive(Debug)]
pub(crate) struct StreamEntry {
    pub stream_type: StreamType,
    pub created_lsn: u64,
    pub create_frame_len: u64,
    pub records: BTreeMap<Asn, RecordEntry>,
    pub truncation_asn: Asn,
    pub reservation: u64,
    pub gate: ActivityGate,
    pub delete_pending: bool,
    pub truncation_event: Option<Event>,
}

impl StreamEntry {
    fn new(stream_type: StreamType, created_lsn: u64, create_frame_len: u64) -> Self {
        StreamEntry {
            stream_type,
            created_lsn,
            create_frame_len,
            records: BTreeMap::new(),
            truncation_asn: Asn::NULL,
            reservation: 0,
            gate: ActivityGate::new(),
            delete_pending: false,
            truncation_event: None,
        }
    }

    fn first_in<R: RangeBounds<Asn>>(&self, range: R, pending: bool) -> Option<(Asn, RecordView)> {
        self.records
            .range(range)
            .find_map(|(asn, e)| e.view(pending).map(|v| (*asn, v)))
    }

    fn last_in<R: RangeBounds<Asn>>(&self, range: R, pending: bool) -> Option<(Asn, RecordView)> {
        self.records
            .range(range)
            .rev()
            .find_map(|(asn, e)| e.view(pending).map(|v| (*asn, v)))
    }

    /// Position a lookup relative to `asn`.
    pub fn locate(
        &self,
        asn: Asn,
        read_type: ReadType,
        include_pending: bool,
    ) -> LogResult<(Asn, RecordView)> {
        let exact = || {
            self.records
                .get(&asn)
                .and_then(|e| e.view(include_pending))
                .map(|v| (asn, v))
        };
        let after = (Bound::Excluded(asn), Bound::Unbounded);
        let found = match read_type {
            ReadType::Exact => exact(),
            ReadType::Next => exact().and_then(|_| self.first_in(after, include_pending)),
            ReadType::Previous => exact().and_then(|_| self.last_in(..asn, include_pending)),
            ReadType::Containing => self.last_in(..=asn, include_pending),
            ReadType::NextFromSpecificAsn => self.first_in(after, include_pending),
            ReadType::PreviousFromSpecificAsn => self.last_in(..asn, include_pending),
        };
        found.ok_or_else(|| LogError::not_found(format!("record {:?} {}", read_type, asn)))
    }

    /// Metadata of every visible record in `[low, high]`
    pub fn collect_metadata(&self, low: Asn, high: Asn, out: &mut Vec<RecordMetadata>) {
        out.clear();
        if low > high {
            return;
        }
        for (asn, entry) in self.records.range(low..=high) {
            if let Some(view) = entry.view(true) {
                out.push(RecordMetadata {
                    asn: *asn,
                    version: view.version,
                    disposition: view.disposition,
                    size: view.size,
                    lsn: view.lsn,
                });
            }
        }
    }

    /// Lowest and highest visible ASN
    pub fn asn_bounds(&self) -> (Asn, Asn) {
        let lowest = self.first_in(.., false).map(|(a, _)| a).unwrap_or(Asn::NULL);
        let highest = self.last_in(.., false).map(|(a, _)| a).unwrap_or(Asn::NULL);
        (lowest, highest)
    }

    /// Live record frame bytes
    pub fn record_bytes(&self) -> u64 {
        self.records
            .values()
            .filter_map(|e| e.view(false))
            .map(|v| v.frame_len)
            .sum()
    }
}

/// Effect of an applied frame, for the caller's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Applied {
    /// Records removed by the frame
    pub records_removed: usize,
}

/// Container catalog
#[derive(Debug)]
pub(crate) struct Catalog {
    pub streams: BTreeMap<StreamId, StreamEntry>,
    pub next_lsn: u64,
    pub write_offset: u64,
    pub live_bytes: u64,
    pub dead_bytes: u64,
    pub reserved_total: u64,
}

impl Catalog {
    /// Empty catalog for a container whose frames start at `data_start`
    pub fn new(data_start: u64) -> Self {
        Catalog {
            streams: BTreeMap::new(),
            next_lsn: 1,
            write_offset: data_start,
            live_bytes: 0,
            dead_bytes: 0,
            reserved_total: 0,
        }
    }

    /// Stream that accepts operations
    pub fn live_stream(&self, id: StreamId) -> LogResult<&StreamEntry> {
        match self.streams.get(&id) {
            None => Err(LogError::not_found(format!("stream {}", id))),
            Some(s) if s.delete_pending => Err(LogError::delete_pending(format!("stream {}", id))),
            Some(s) => Ok(s),
        }
    }

    /// Mutable stream that accepts operations
    pub fn live_stream_mut(&mut self, id: StreamId) -> LogResult<&mut StreamEntry> {
        match self.streams.get_mut(&id) {
            None => Err(LogError::not_found(format!("stream {}", id))),
            Some(s) if s.delete_pending => Err(LogError::delete_pending(format!("stream {}", id))),
            Some(s) => Ok(s),
        }
    }

    /// Apply a committed frame located at `offset`.
    ///
    /// A frame that contradicts the catalog is reported as an error message;
    /// callers turn it into `StructureFault`.
    pub fn apply(
        &mut self,
        header: &FrameHeader,
        offset: u64,
        metadata: &[u8],
    ) -> Result<Applied, String> {
        if header.lsn < self.next_lsn {
            return Err(format!(
                "frame LSN {} is not above previous LSN {}",
                header.lsn,
                self.next_lsn - 1
            ));
        }
        let frame_len = header.frame_len();
        let mut applied = Applied::default();

        match header.kind {
            FrameKind::StreamCreated => {
                if self.streams.contains_key(&header.stream_id) {
                    return Err(format!("stream {} created twice", header.stream_id));
                }
                let type_bytes: [u8; 16] = metadata
                    .try_into()
                    .map_err(|_| format!("stream {} has a malformed type", header.stream_id))?;
                let mut entry =
                    StreamEntry::new(StreamType::from_bytes(type_bytes), header.lsn, frame_len);
                entry.truncation_asn = header.asn;
                entry.reservation = header.value;
                self.streams.insert(header.stream_id, entry);
                self.reserved_total += header.value;
                self.live_bytes += frame_len;
            }
            FrameKind::StreamDeleted => {
                let entry = self
                    .streams
                    .remove(&header.stream_id)
                    .ok_or_else(|| format!("delete of unknown stream {}", header.stream_id))?;
                let freed = entry.create_frame_len + entry.record_bytes();
                applied.records_removed = entry.records.len();
                self.live_bytes -= freed;
                self.dead_bytes += freed + frame_len;
                self.reserved_total -= entry.reservation;
            }
            FrameKind::Record => {
                let stream = self.stream_for(header)?;
                if header.asn <= stream.truncation_asn || !header.asn.is_valid() {
                    return Err(format!(
                        "record {} is at or below truncation point {}",
                        header.asn, stream.truncation_asn
                    ));
                }
                if header.value > stream.reservation {
                    return Err(format!(
                        "record {} consumes {} reserved bytes, stream holds {}",
                        header.asn, header.value, stream.reservation
                    ));
                }
                let replaced = match stream.records.get(&header.asn) {
                    Some(old) if old.version >= header.version => {
                        return Err(format!(
                            "record {} version {} does not supersede version {}",
                            header.asn, header.version, old.version
                        ));
                    }
                    Some(old) => old.frame_len,
                    None => 0,
                };
                stream.reservation -= header.value;
                stream.records.insert(
                    header.asn,
                    RecordEntry {
                        version: header.version,
                        lsn: header.lsn,
                        offset,
                        frame_len,
                        size: (header.metadata_len + header.data_len) as u64,
                        disposition: RecordDisposition::Persisted,
                        superseded: None,
                    },
                );
                self.reserved_total -= header.value;
                self.live_bytes = self.live_bytes - replaced + frame_len;
                self.dead_bytes += replaced;
            }
            FrameKind::Truncate => {
                let stream = self.stream_for(header)?;
                let kept = stream.records.split_off(&Asn::new(header.asn.get().saturating_add(1)));
                let removed = std::mem::replace(&mut stream.records, kept);
                let freed: u64 = removed.values().map(|e| e.frame_len).sum();
                stream.truncation_asn.set_if_larger(header.asn);
                applied.records_removed = removed.len();
                self.live_bytes -= freed;
                self.dead_bytes += freed + frame_len;
            }
            FrameKind::DeleteRecord => {
                let stream = self.stream_for(header)?;
                let matches = stream
                    .records
                    .get(&header.asn)
                    .map(|e| e.version == header.version)
                    .unwrap_or(false);
                if !matches {
                    return Err(format!(
                        "delete of missing record {} version {}",
                        header.asn, header.version
                    ));
                }
                let freed = stream
                    .records
                    .remove(&header.asn)
                    .map(|e| e.frame_len)
                    .unwrap_or(0);
                applied.records_removed = 1;
                self.live_bytes -= freed;
                self.dead_bytes += freed + frame_len;
            }
            FrameKind::Reservation => {
                let stream = self.stream_for(header)?;
                let previous = std::mem::replace(&mut stream.reservation, header.value);
                self.reserved_total = self.reserved_total - previous + header.value;
                self.dead_bytes += frame_len;
            }
        }

        self.next_lsn = header.lsn + 1;
        self.write_offset = offset + frame_len;
        Ok(applied)
    }

    fn stream_for(&mut self, header: &FrameHeader) -> Result<&mut StreamEntry, String> {
        self.streams.get_mut(&header.stream_id).ok_or_else(|| {
            format!(
                "{:?} frame for unknown stream {}",
                header.kind, header.stream_id
            )
        })
    }

    /// Bytes available for new live frames and reservations
    pub fn free_space(&self, capacity: u64) -> u64 {
        capacity.saturating_sub(self.live_bytes + self.reserved_total)
    }

    /// Lowest LSN held by a live record and the stream holding it
    pub fn lowest_record_lsn(&self) -> Option<(u64, StreamId)> {
        self.streams
            .iter()
            .flat_map(|(id, s)| {
                s.records
                    .values()
                    .filter_map(|e| e.view(false))
                    .map(move |v| (v.lsn, *id))
            })
            .min()
    }

    /// Highest LSN assigned so far
    pub fn highest_lsn(&self) -> u64 {
        self.next_lsn - 1
    }
}
