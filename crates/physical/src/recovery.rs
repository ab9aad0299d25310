//! Container recovery.
//!
//! Recovery rebuilds the catalog by replaying every frame after the header:
//!
//! 1. The header must parse and verify (`CrcError` otherwise) and carry the
//!    requested log id (`InvalidLogId` otherwise).
//! 2. Frames are replayed in order through `Catalog::apply`. A frame whose
//!    checksums verify but which contradicts the catalog is a
//!    `StructureFault`.
//! 3. An incomplete or unverifiable frame at the end of the device is a torn
//!    write: it is trimmed with a warning. The same damage before the last
//!    frame is a `CrcError`.

use crate::catalog::Catalog;
use crate::device::BlockDevice;
use crate::format::{parse_frame, ContainerHeader, FormatError, CONTAINER_HEADER_SIZE};
use ktlog_core::{LogError, LogId, LogResult};
use tracing::{info, warn};

/// Outcome of replaying a container
#[derive(Debug)]
pub(crate) struct Recovered {
    pub header: ContainerHeader,
    pub catalog: Catalog,
    pub stats: RecoveryStats,
}

/// Recovery statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Frames replayed
    pub frames_replayed: usize,
    /// Streams in the recovered catalog
    pub streams_recovered: usize,
    /// Records in the recovered catalog
    pub records_recovered: usize,
    /// Bytes trimmed from a torn tail
    pub bytes_trimmed: u64,
}

/// Replay the container on `device`, which must belong to `expected`.
pub(crate) fn recover(device: &dyn BlockDevice, expected: LogId) -> LogResult<Recovered> {
    let len = device.size()?;
    if len < CONTAINER_HEADER_SIZE as u64 {
        return Err(LogError::CrcError(format!(
            "container of {} bytes has no complete header",
            len
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    device.read_at(0, &mut bytes)?;

    let header = ContainerHeader::from_bytes(&bytes[..CONTAINER_HEADER_SIZE])
        .map_err(|e| LogError::CrcError(format!("container header: {}", e)))?;
    if header.log_id != expected {
        return Err(LogError::InvalidLogId {
            expected: expected.to_string(),
            found: header.log_id.to_string(),
        });
    }

    let mut catalog = Catalog::new(CONTAINER_HEADER_SIZE as u64);
    let mut stats = RecoveryStats::default();
    let mut offset = CONTAINER_HEADER_SIZE;

    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        match parse_frame(remaining) {
            Ok(frame) => {
                let is_last = frame.consumed == remaining.len();
                if is_last && frame.verify_data().is_err() {
                    break;
                }
                catalog
                    .apply(&frame.header, offset as u64, frame.metadata)
                    .map_err(|msg| {
                        LogError::StructureFault(format!("{} at offset {}", msg, offset))
                    })?;
                stats.frames_replayed += 1;
                offset += frame.consumed;
            }
            Err(FormatError::Truncated) => break,
            Err(e) => {
                if !reaches_end(remaining) {
                    return Err(LogError::CrcError(format!(
                        "frame at offset {}: {}",
                        offset, e
                    )));
                }
                break;
            }
        }
    }

    if offset < bytes.len() {
        stats.bytes_trimmed = (bytes.len() - offset) as u64;
        warn!(
            target: "ktlog::recovery",
            log = %expected,
            offset,
            bytes_trimmed = stats.bytes_trimmed,
            "Trimming torn tail"
        );
        device.truncate(offset as u64)?;
    }

    if catalog.streams.len() > header.max_streams as usize {
        return Err(LogError::StructureFault(format!(
            "{} streams recovered, container allows {}",
            catalog.streams.len(),
            header.max_streams
        )));
    }

    stats.streams_recovered = catalog.streams.len();
    stats.records_recovered = catalog.streams.values().map(|s| s.records.len()).sum();
    info!(
        target: "ktlog::recovery",
        log = %expected,
        frames = stats.frames_replayed,
        streams = stats.streams_recovered,
        records = stats.records_recovered,
        "Recovery complete"
    );

    Ok(Recovered {
        header,
        catalog,
        stats,
    })
}

/// Whether a damaged frame claims to extend to (or past) the end of the
/// device, which makes it the torn tail rather than mid-log damage.
fn reaches_end(remaining: &[u8]) -> bool {
    if remaining.len() < 4 {
        return true;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&remaining[..4]);
    4 + u32::from_le_bytes(len) as usize >= remaining.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::{encode_frame, FrameHeader, FrameKind};
    use ktlog_core::{Asn, StreamId, StreamType};

    fn header(log_id: LogId) -> ContainerHeader {
        ContainerHeader {
            log_id,
            log_type: StreamType::nil(),
            log_size: 4 * 1024 * 1024,
            max_streams: 4,
            max_record_size: 64 * 1024,
            flags: 0,
        }
    }

    fn device_with(log_id: LogId, frames: &[Vec<u8>]) -> MemoryDevice {
        let device = MemoryDevice::new();
        device.append(&header(log_id).to_bytes()).unwrap();
        for frame in frames {
            device.append(frame).unwrap();
        }
        device
    }

    fn created(lsn: u64, id: StreamId) -> Vec<u8> {
        encode_frame(
            &FrameHeader::new(FrameKind::StreamCreated, lsn, id),
            StreamType::new().as_bytes(),
            &[],
        )
    }

    fn record(lsn: u64, id: StreamId, asn: u64, data: &[u8]) -> Vec<u8> {
        encode_frame(
            &FrameHeader::new(FrameKind::Record, lsn, id)
                .with_asn(Asn::new(asn))
                .with_version(1),
            b"m",
            data,
        )
    }

    #[test]
    fn test_recover_streams_and_records() {
        let log = LogId::new();
        let stream = StreamId::new();
        let device = device_with(
            log,
            &[created(1, stream), record(2, stream, 1, b"a"), record(3, stream, 2, b"b")],
        );
        let recovered = recover(&device, log).unwrap();
        assert_eq!(recovered.stats.frames_replayed, 3);
        assert_eq!(recovered.stats.records_recovered, 2);
        assert_eq!(recovered.catalog.next_lsn, 4);
        assert_eq!(recovered.catalog.write_offset, device.size().unwrap());
    }

    #[test]
    fn test_wrong_log_id() {
        let device = device_with(LogId::new(), &[]);
        assert!(matches!(
            recover(&device, LogId::new()),
            Err(LogError::InvalidLogId { .. })
        ));
    }

    #[test]
    fn test_corrupt_header_is_crc_error() {
        let log = LogId::new();
        let device = device_with(log, &[]);
        device.corrupt(30, 0x40);
        assert!(matches!(recover(&device, log), Err(LogError::CrcError(_))));
    }

    #[test]
    fn test_torn_tail_is_trimmed() {
        let log = LogId::new();
        let stream = StreamId::new();
        let device = device_with(log, &[created(1, stream), record(2, stream, 1, b"a")]);
        let good_len = device.size().unwrap();
        let torn = record(3, stream, 2, b"partial");
        device.append(&torn[..torn.len() / 2]).unwrap();

        let recovered = recover(&device, log).unwrap();
        assert_eq!(recovered.stats.records_recovered, 1);
        assert_eq!(recovered.stats.bytes_trimmed, (torn.len() / 2) as u64);
        assert_eq!(device.size().unwrap(), good_len);
    }

    #[test]
    fn test_tail_with_bad_data_is_trimmed() {
        let log = LogId::new();
        let stream = StreamId::new();
        let device = device_with(log, &[created(1, stream), record(2, stream, 1, b"tail")]);
        let last = device.size().unwrap() - 5;
        device.corrupt(last, 0x01);

        let recovered = recover(&device, log).unwrap();
        assert_eq!(recovered.stats.records_recovered, 0);
        assert!(recovered.stats.bytes_trimmed > 0);
    }

    #[test]
    fn test_mid_log_damage_is_crc_error() {
        let log = LogId::new();
        let stream = StreamId::new();
        let first = created(1, stream);
        let device = device_with(log, &[first.clone(), record(2, stream, 1, b"a")]);
        // Flip a metadata byte of the first frame
        device.corrupt((CONTAINER_HEADER_SIZE + 4 + 57) as u64, 0x01);
        assert!(matches!(recover(&device, log), Err(LogError::CrcError(_))));
    }

    #[test]
    fn test_contradicting_frame_is_structure_fault() {
        let log = LogId::new();
        let stream = StreamId::new();
        let device = device_with(log, &[created(1, stream), record(2, StreamId::new(), 1, b"a")]);
        assert!(matches!(
            recover(&device, log),
            Err(LogError::StructureFault(_))
        ));
    }

    #[test]
    fn test_too_many_streams_is_structure_fault() {
        let log = LogId::new();
        let frames: Vec<Vec<u8>> = (1..=5).map(|lsn| created(lsn, StreamId::new())).collect();
        let device = device_with(log, &frames);
        assert!(matches!(
            recover(&device, log),
            Err(LogError::StructureFault(_))
        ));
    }
}
