//! Stream abstraction shared by the physical and overlay layers
//!
//! `RecordStream` is the record-level contract that both a physical stream
//! and an overlay stream honour. Layers above (and tests) program against the
//! trait so an in-memory or overlay implementation can be injected in place
//! of a physical one.
//!
//! Every operation also has a `start_*` form. The `start_*` methods are
//! provided: they clone the handle, run the synchronous operation on the
//! stream's dispatcher and deliver the result to the completion callback.
//! The cloned handle keeps the stream alive until the callback has run.

use std::sync::Arc;

use crate::dispatch::{Dispatcher, OperationHandle};
use crate::error::{LogError, LogResult};
use crate::types::{
    Asn, AsnRange, ReadRecord, ReadType, RecordInfo, RecordMetadata, ReservedWriteOutcome,
    StreamId, WritePriority,
};

/// Record-level operations on an append-only stream.
///
/// Thread safety: all methods may be called concurrently from many threads.
pub trait RecordStream: Send + Sync {
    /// Id of this stream within its container
    fn stream_id(&self) -> StreamId;

    /// Dispatcher running this stream's `start_*` operations
    fn dispatcher(&self) -> &Arc<Dispatcher>;

    /// Write a record.
    ///
    /// # Errors
    ///
    /// `LogFull`, `BufferOverflow`, `NameCollision` (a stored version is not
    /// lower than `version`), `DeletePending`, `StructureFault`.
    fn write(&self, asn: Asn, version: u64, metadata: &[u8], data: &[u8]) -> LogResult<()>;

    /// Write a record, drawing `reserve_to_use` bytes down from the stream's
    /// reservation.
    ///
    /// On any failure other than `StructureFault` the reservation is left
    /// untouched.
    fn reserved_write(
        &self,
        reserve_to_use: u64,
        asn: Asn,
        version: u64,
        metadata: &[u8],
        data: &[u8],
    ) -> LogResult<ReservedWriteOutcome>;

    /// Read the latest version of a record positioned by `read_type`
    fn read(&self, asn: Asn, read_type: ReadType) -> LogResult<ReadRecord>;

    /// Read a record, failing with `BufferTooSmall` if metadata plus data
    /// exceeds `limit` bytes.
    fn read_with_limit(&self, asn: Asn, read_type: ReadType, limit: u64) -> LogResult<ReadRecord> {
        let info = self.query_record(asn, read_type)?;
        if info.size > limit {
            return Err(LogError::BufferTooSmall {
                needed: info.size,
                limit,
            });
        }
        self.read(info.asn, ReadType::Exact)
    }

    /// Metadata-only lookup of a record
    fn query_record(&self, asn: Asn, read_type: ReadType) -> LogResult<RecordInfo>;

    /// Clear `out` and fill it with every record in `[low, high]`, ascending
    fn query_records(&self, low: Asn, high: Asn, out: &mut Vec<RecordMetadata>) -> LogResult<()>;

    /// Remove a record if its stored version equals `version`
    fn delete_record(&self, asn: Asn, version: u64) -> LogResult<()>;

    /// Discard records at or below `truncation_point`.
    ///
    /// Records above `preferred_truncation_point` are kept unless the
    /// container is short of space.
    fn truncate(&self, truncation_point: Asn, preferred_truncation_point: Asn) -> LogResult<()>;

    /// Grow (positive) or shrink (negative) the stream's reservation
    fn update_reservation(&self, delta: i64) -> LogResult<()>;

    /// Bytes currently reserved by this stream
    fn query_reservation(&self) -> u64;

    /// Lowest, highest and truncation ASN of the stream
    fn query_asn_range(&self) -> LogResult<AsnRange>;

    /// Asynchronous `write`
    fn start_write<C>(
        &self,
        asn: Asn,
        version: u64,
        metadata: Vec<u8>,
        data: Vec<u8>,
        priority: WritePriority,
        callback: C,
    ) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            priority,
            move |_| stream.write(asn, version, &metadata, &data),
            callback,
        )
    }

    /// Asynchronous `reserved_write`
    fn start_reserved_write<C>(
        &self,
        reserve_to_use: u64,
        asn: Asn,
        version: u64,
        metadata: Vec<u8>,
        data: Vec<u8>,
        callback: C,
    ) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<ReservedWriteOutcome>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| stream.reserved_write(reserve_to_use, asn, version, &metadata, &data),
            callback,
        )
    }

    /// Asynchronous `read`
    fn start_read<C>(&self, asn: Asn, read_type: ReadType, callback: C) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<ReadRecord>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| stream.read(asn, read_type),
            callback,
        )
    }

    /// Asynchronous `delete_record`
    fn start_delete_record<C>(&self, asn: Asn, version: u64, callback: C) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| stream.delete_record(asn, version),
            callback,
        )
    }

    /// Asynchronous `truncate`
    fn start_truncate<C>(
        &self,
        truncation_point: Asn,
        preferred_truncation_point: Asn,
        callback: C,
    ) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Low,
            move |_| stream.truncate(truncation_point, preferred_truncation_point),
            callback,
        )
    }

    /// Asynchronous `update_reservation`
    fn start_update_reservation<C>(&self, delta: i64, callback: C) -> OperationHandle
    where
        Self: Clone + Sized + 'static,
        C: FnOnce(LogResult<()>) + Send + 'static,
    {
        let stream = self.clone();
        self.dispatcher().start(
            WritePriority::Normal,
            move |_| stream.update_reservation(delta),
            callback,
        )
    }
}
