//! Container compaction.
//!
//! Compaction rewrites a container as its live image: the header, one
//! stream-created frame per stream (carrying the stream's truncation point
//! and reservation) and every live record frame, all in original LSN order.
//! Record frames are copied byte for byte except for their reservation
//! field, which is zeroed because the stream-created frame already carries
//! the remaining reservation. The image replaces the device atomically
//! through the provider.

use crate::catalog::Catalog;
use crate::device::BlockDevice;
use crate::format::{
    encode_frame, rewrite_frame_value, ContainerHeader, FrameHeader, FrameKind,
};
use ktlog_core::{Asn, LogResult, StreamId, StreamType};

/// One frame of the compacted image
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlannedFrame {
    Stream {
        id: StreamId,
        lsn: u64,
        stream_type: StreamType,
        truncation_asn: Asn,
        reservation: u64,
    },
    Record {
        stream: StreamId,
        asn: Asn,
        lsn: u64,
        offset: u64,
        frame_len: u64,
    },
}

impl PlannedFrame {
    fn lsn(&self) -> u64 {
        match self {
            PlannedFrame::Stream { lsn, .. } | PlannedFrame::Record { lsn, .. } => *lsn,
        }
    }
}

/// Compacted container contents
#[derive(Debug)]
pub(crate) struct CompactedImage {
    pub bytes: Vec<u8>,
    /// New frame offset of every record
    pub offsets: Vec<(StreamId, Asn, u64)>,
}

/// Live frames of the catalog in LSN order
pub(crate) fn plan(catalog: &Catalog) -> Vec<PlannedFrame> {
    let mut frames = Vec::new();
    for (id, stream) in &catalog.streams {
        frames.push(PlannedFrame::Stream {
            id: *id,
            lsn: stream.created_lsn,
            stream_type: stream.stream_type,
            truncation_asn: stream.truncation_asn,
            reservation: stream.reservation,
        });
        for (asn, entry) in &stream.records {
            if let Some(view) = entry.view(false) {
                frames.push(PlannedFrame::Record {
                    stream: *id,
                    asn: *asn,
                    lsn: view.lsn,
                    offset: view.offset,
                    frame_len: view.frame_len,
                });
            }
        }
    }
    frames.sort_by_key(PlannedFrame::lsn);
    frames
}

/// Build the compacted image, reading record frames from `device`.
pub(crate) fn build_image(
    header: &ContainerHeader,
    plan: &[PlannedFrame],
    device: &dyn BlockDevice,
) -> LogResult<CompactedImage> {
    let mut bytes = header.to_bytes().to_vec();
    let mut offsets = Vec::new();
    let mut frame = Vec::new();

    for planned in plan {
        match planned {
            PlannedFrame::Stream {
                id,
                lsn,
                stream_type,
                truncation_asn,
                reservation,
            } => {
                let header = FrameHeader::new(FrameKind::StreamCreated, *lsn, *id)
                    .with_asn(*truncation_asn)
                    .with_value(*reservation);
                bytes.extend(encode_frame(&header, stream_type.as_bytes(), &[]));
            }
            PlannedFrame::Record {
                stream,
                asn,
                offset,
                frame_len,
                ..
            } => {
                frame.resize(*frame_len as usize, 0);
                device.read_at(*offset, &mut frame)?;
                offsets.push((*stream, *asn, bytes.len() as u64));
                bytes.extend(rewrite_frame_value(&frame, 0)?);
            }
        }
    }

    Ok(CompactedImage { bytes, offsets })
}

impl Catalog {
    /// Point the catalog at a freshly installed compacted image.
    pub(crate) fn install_compacted(&mut self, image: &CompactedImage, data_start: u64) {
        for (stream, asn, offset) in &image.offsets {
            if let Some(entry) = self
                .streams
                .get_mut(stream)
                .and_then(|s| s.records.get_mut(asn))
            {
                entry.offset = *offset;
            }
        }
        self.write_offset = image.bytes.len() as u64;
        self.live_bytes = self.write_offset - data_start;
        self.dead_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::CONTAINER_HEADER_SIZE;
    use crate::recovery::recover;
    use ktlog_core::LogId;

    fn write(device: &MemoryDevice, catalog: &mut Catalog, header: FrameHeader, meta: &[u8], data: &[u8]) {
        let frame = encode_frame(&header, meta, data);
        let offset = catalog.write_offset;
        device.append(&frame).unwrap();
        let parsed = crate::format::parse_frame(&frame).unwrap();
        catalog.apply(&parsed.header, offset, meta).unwrap();
    }

    #[test]
    fn test_compacted_image_recovers_same_state() {
        let log_id = LogId::new();
        let header = ContainerHeader {
            log_id,
            log_type: StreamType::nil(),
            log_size: 4 * 1024 * 1024,
            max_streams: 8,
            max_record_size: 64 * 1024,
            flags: 0,
        };
        let device = MemoryDevice::new();
        device.append(&header.to_bytes()).unwrap();
        let mut catalog = Catalog::new(CONTAINER_HEADER_SIZE as u64);

        let a = StreamId::new();
        let b = StreamId::new();
        let ty = StreamType::new();
        write(&device, &mut catalog, FrameHeader::new(FrameKind::StreamCreated, 1, a), ty.as_bytes(), &[]);
        write(&device, &mut catalog, FrameHeader::new(FrameKind::Reservation, 2, a).with_value(1000), &[], &[]);
        write(&device, &mut catalog, FrameHeader::new(FrameKind::StreamCreated, 3, b), ty.as_bytes(), &[]);
        for (lsn, asn) in (4..9).zip(1..) {
            write(
                &device,
                &mut catalog,
                FrameHeader::new(FrameKind::Record, lsn, a)
                    .with_asn(Asn::new(asn))
                    .with_version(1)
                    .with_value(10),
                b"meta",
                b"data",
            );
        }
        write(&device, &mut catalog, FrameHeader::new(FrameKind::Truncate, 9, a).with_asn(Asn::new(2)), &[], &[]);
        assert!(catalog.dead_bytes > 0);

        let image = build_image(&header, &plan(&catalog), &device).unwrap();
        assert_eq!(image.offsets.len(), 3);
        assert!((image.bytes.len() as u64) < device.size().unwrap());

        catalog.install_compacted(&image, CONTAINER_HEADER_SIZE as u64);
        assert_eq!(catalog.dead_bytes, 0);

        let compacted = MemoryDevice::new();
        compacted.append(&image.bytes).unwrap();
        let recovered = recover(&compacted, log_id).unwrap();
        let stream = &recovered.catalog.streams[&a];
        assert_eq!(stream.truncation_asn, Asn::new(2));
        assert_eq!(stream.reservation, 1000 - 5 * 10);
        assert_eq!(stream.records.len(), 3);
        assert_eq!(recovered.catalog.reserved_total, catalog.reserved_total);
        assert_eq!(recovered.catalog.live_bytes, catalog.live_bytes);
        for (asn, entry) in &stream.records {
            assert_eq!(catalog.streams[&a].records[asn].offset, entry.offset);
        }
    }
}
