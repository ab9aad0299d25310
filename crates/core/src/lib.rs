//! Core types and traits for KTLog
//!
//! This crate defines the foundational pieces shared by the physical and
//! overlay layers:
//! - Identifiers: DiskId, LogId, StreamId, StreamType, Asn
//! - LogError: the status taxonomy every operation terminates with
//! - Limits: default sizes, ranges and timer settings
//! - Sync: events, counted-completion gates and one-shot completions
//! - Dispatch: worker pool behind the `start_*` completion contract
//! - RecordStream: record-level trait implemented by every stream type

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
pub mod limits;
pub mod sync;
pub mod traits;
pub mod types;

pub use dispatch::{CancelToken, Continuation, Dispatcher, DispatcherStats, OperationHandle};
pub use error::{LogError, LogResult};
pub use sync::{ActivityGate, ActivityGuard, Completion, Event};
pub use traits::RecordStream;
pub use types::{
    Asn, AsnRange, AtomicAsn, DiskId, LogId, LsnRange, ReadRecord, ReadType, RecordDisposition,
    RecordInfo, RecordMetadata, ReservedWriteOutcome, SpaceInfo, StreamId, StreamState,
    StreamType, WritePriority,
};
