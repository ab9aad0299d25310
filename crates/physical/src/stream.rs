//! Physical stream handle.

use crate::log::PhysicalLog;
use ktlog_core::{
    ActivityGuard, Asn, AsnRange, Dispatcher, Event, LogError, LogResult, OperationHandle,
    ReadRecord, ReadType, RecordInfo, RecordMetadata, RecordStream, ReservedWriteOutcome,
    StreamId, WritePriority,
};
use std::fmt;
use std::sync::Arc;

/// Handle to one stream of a physical container.
///
/// A handle keeps both its container and its stream alive: deleting the
/// stream waits for every handle to be dropped.
#[derive(Clone)]
pub struct PhysicalStream {
    log: PhysicalLog,
    stream_id: StreamId,
    _interest: ActivityGuard,
}

impl fmt::Debug for PhysicalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalStream")
            .field("log_id", &self.log.log_id())
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl PhysicalStream {
    pub(crate) fn new(log: PhysicalLog, stream_id: StreamId, interest: ActivityGuard) -> Self {
        PhysicalStream {
            log,
            stream_id,
            _interest: interest,
        }
    }

    /// Container holding this stream
    pub fn log(&self) -> &PhysicalLog {
        &self.log
    }

    /// Write on the given queue. Low priority writes yield to normal ones.
    pub fn write_with_priority(
        &self,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
        priority: WritePriority,
    ) -> LogResult<()> {
        self.log
            .shared
            .write_record(self.stream_id, asn, version, metadata, data, None, priority)
            .map(|_| ())
    }

    /// Truncate, unless a record at or below `truncation_point` carries
    /// `version` or a higher one (`NameCollision`).
    pub fn truncate_below_version(&self, truncation_point: Asn, version: u64) -> LogResult<()> {
        self.log
            .shared
            .truncate(self.stream_id, truncation_point, truncation_point, Some(version))
    }

    /// Read records from the first one at or above `asn` until `byte_budget`
    /// bytes of metadata and data have been returned. At least one record is
    /// returned.
    pub fn read_contiguous(&self, asn: Asn, byte_budget: u64) -> LogResult<Vec<ReadRecord>> {
        self.log
            .shared
            .read_contiguous(self.stream_id, asn, byte_budget)
    }

    /// Register an event signalled after every truncation of this stream
    pub fn set_truncation_completion_event(&self, event: Event) -> LogResult<()> {
        self.log.shared.set_truncation_event(self.stream_id, event)
    }

    /// Asynchronous `truncate_below_version`
    pub fn start_truncate_below_version<C>(
        &self,
        truncation_point: Asn,
        version: u64,
        callback: C,
    ) -> OperationHandle
    where
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Low,
            move |_| stream.truncate_below_version(truncation_point, version),
            callback,
        )
    }

    /// Asynchronous `read_contiguous`
    pub fn start_read_contiguous<C>(&self, asn: Asn, byte_budget: u64, callback: C) -> OperationHandle
    where
        C: FnOnce(LogResult<Vec<ReadRecord>>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| stream.read_contiguous(asn, byte_budget),
            callback,
        )
    }
}

impl RecordStream for PhysicalStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.log.dispatcher()
    }

    fn write(&self, asn: Asn, version: u64, metadata: &[u8], data: &[u8]) -> LogResult<()> {
        self.write_with_priority(asn, version, metadata, data, WritePriority::Normal)
    }

    fn reserved_write(
        &self,
        reserve_to_use: u64,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
    ) -> LogResult<ReservedWriteOutcome> {
        self.log.shared.write_record(
            self.stream_id,
            asn,
            version,
            metadata,
            data,
            Some(reserve_to_use),
            WritePriority::Normal,
        )
    }

    fn read(&self, asn: Asn, read_type: ReadType) -> LogResult<ReadRecord> {
        self.log.shared.read_record(self.stream_id, asn, read_type)
    }

    fn query_record(&self, asn: Asn, read_type: ReadType) -> LogResult<RecordInfo> {
        self.log.shared.query_record(self.stream_id, asn, read_type)
    }

    fn query_records(&self, low: Asn, high: Asn, out: &mut Vec<RecordMetadata>) -> LogResult<()> {
        self.log.shared.query_records(self.stream_id, low, high, out)
    }

    fn delete_record(&self, asn: Asn, version: u64) -> LogResult<()> {
        self.log.shared.delete_record(self.stream_id, asn, version)
    }

    fn truncate(&self, truncation_point: Asn, preferred_truncation_point: Asn) -> LogResult<()> {
        if !truncation_point.is_valid() && !truncation_point.is_null() {
            return Err(LogError::InvalidParameter(format!(
                "invalid truncation point {}",
                truncation_point
            )));
        }
        self.log.shared.truncate(
            self.stream_id,
            truncation_point,
            preferred_truncation_point,
            None,
        )
    }

    fn update_reservation(&self, delta: i64) -> LogResult<()> {
        self.log.shared.update_reservation(self.stream_id, delta)
    }

    fn query_reservation(&self) -> u64 {
        self.log.shared.query_reservation(self.stream_id)
    }

    fn query_asn_range(&self) -> LogResult<AsnRange> {
        self.log.shared.query_asn_range(self.stream_id)
    }
}
