//! Container header and frame format.
//!
//! A container device is a fixed header followed by frames appended in LSN
//! order.
//!
//! # Container Header (72 bytes)
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ Magic (4)│ Ver (4)  │ LogId(16)│ Type (16)│ Size (8) │ MaxStr (4)│ MaxRec(8)│ Flags (4)│ CRC32 (4)│
//! └──────────┴──────────┴──────────┴──────────┴──────────┴───────────┴──────────┴──────────┴──────────┘
//!   + 4 reserved bytes (zero)
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! ┌────────────┬────────────────────────────────────────┬──────────┬─────────────┬───────────┐
//! │ Length (4) │ Fixed fields (57) + Metadata (var)     │ HCRC (4) │ Data (var)  │ DCRC (4)  │
//! └────────────┴────────────────────────────────────────┴──────────┴─────────────┴───────────┘
//!
//! Fixed fields:
//! ┌──────────┬──────────┬─────────────┬──────────┬──────────────┬────────────┬────────────┬────────────┐
//! │ Kind (1) │ LSN (8)  │ Stream (16) │ Asn (8)  │ Version (8)  │ Value (8)  │ MetaLen (4)│ DataLen (4)│
//! └──────────┴──────────┴─────────────┴──────────┴──────────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! The header CRC covers the fixed fields and the metadata; the data CRC
//! covers the data. A header mismatch surfaces as `CrcError` and a data
//! mismatch as `DataError`.
//!
//! Field use per kind:
//!
//! | Kind           | Asn               | Version | Value                | Metadata     |
//! |----------------|-------------------|---------|----------------------|--------------|
//! | StreamCreated  | truncation ASN    | -       | reservation          | stream type  |
//! | StreamDeleted  | -                 | -       | -                    | -            |
//! | Record         | record ASN        | version | reservation consumed | user meta    |
//! | Truncate       | truncation point  | -       | -                    | -            |
//! | DeleteRecord   | record ASN        | version | -                    | -            |
//! | Reservation    | -                 | -       | new reservation      | -            |

use crc32fast::Hasher;
use ktlog_core::{Asn, LogError, LogId, StreamId, StreamType};

/// Magic bytes identifying a container: "KTLG"
pub const CONTAINER_MAGIC: [u8; 4] = *b"KTLG";

/// Current container format version
pub const CONTAINER_FORMAT_VERSION: u32 = 1;

/// Size of the container header in bytes
pub const CONTAINER_HEADER_SIZE: usize = 72;

/// Size of the length prefix of a frame
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the fixed frame fields
pub const FRAME_FIXED_SIZE: usize = 57;

/// Bytes a frame adds around its metadata and data
pub const FRAME_OVERHEAD: usize = FRAME_LENGTH_SIZE + FRAME_FIXED_SIZE + 4 + 4;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Stream added to the catalog
    StreamCreated = 1,
    /// Stream removed from the catalog
    StreamDeleted = 2,
    /// Record written
    Record = 3,
    /// Stream truncated
    Truncate = 4,
    /// Record removed
    DeleteRecord = 5,
    /// Stream reservation changed
    Reservation = 6,
}

impl FrameKind {
    /// Decode a kind byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::StreamCreated),
            2 => Some(FrameKind::StreamDeleted),
            3 => Some(FrameKind::Record),
            4 => Some(FrameKind::Truncate),
            5 => Some(FrameKind::DeleteRecord),
            6 => Some(FrameKind::Reservation),
            _ => None,
        }
    }
}

/// Container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Container id
    pub log_id: LogId,
    /// Caller-supplied log type
    pub log_type: StreamType,
    /// Configured capacity
    pub log_size: u64,
    /// Maximum stream count
    pub max_streams: u32,
    /// Maximum frame size
    pub max_record_size: u64,
    /// Caller flags
    pub flags: u32,
}

impl ContainerHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; CONTAINER_HEADER_SIZE] {
        let mut bytes = [0u8; CONTAINER_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&CONTAINER_MAGIC);
        bytes[4..8].copy_from_slice(&CONTAINER_FORMAT_VERSION.to_le_bytes());
        bytes[8..24].copy_from_slice(self.log_id.as_bytes());
        bytes[24..40].copy_from_slice(self.log_type.as_bytes());
        bytes[40..48].copy_from_slice(&self.log_size.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.max_streams.to_le_bytes());
        bytes[52..60].copy_from_slice(&self.max_record_size.to_le_bytes());
        bytes[60..64].copy_from_slice(&self.flags.to_le_bytes());
        let crc = compute_crc(&bytes[0..64]);
        bytes[64..68].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize and verify a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < CONTAINER_HEADER_SIZE {
            return Err(FormatError::Truncated);
        }
        if bytes[0..4] != CONTAINER_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let stored_crc = read_u32(bytes, 64);
        let computed_crc = compute_crc(&bytes[0..64]);
        if stored_crc != computed_crc {
            return Err(FormatError::HeaderChecksum {
                expected: stored_crc,
                computed: computed_crc,
            });
        }
        let version = read_u32(bytes, 4);
        if version != CONTAINER_FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        Ok(ContainerHeader {
            log_id: LogId::from_bytes(read_id(bytes, 8)),
            log_type: StreamType::from_bytes(read_id(bytes, 24)),
            log_size: read_u64(bytes, 40),
            max_streams: read_u32(bytes, 48),
            max_record_size: read_u64(bytes, 52),
            flags: read_u32(bytes, 60),
        })
    }
}

/// Decoded fixed fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind
    pub kind: FrameKind,
    /// Log sequence number
    pub lsn: u64,
    /// Stream the frame belongs to
    pub stream_id: StreamId,
    /// Record ASN or truncation point
    pub asn: Asn,
    /// Record version
    pub version: u64,
    /// Kind-specific value (reservation)
    pub value: u64,
    /// Metadata length
    pub metadata_len: u32,
    /// Data length
    pub data_len: u32,
}

impl FrameHeader {
    /// Header with zeroed kind-specific fields
    pub fn new(kind: FrameKind, lsn: u64, stream_id: StreamId) -> Self {
        FrameHeader {
            kind,
            lsn,
            stream_id,
            asn: Asn::NULL,
            version: 0,
            value: 0,
            metadata_len: 0,
            data_len: 0,
        }
    }

    /// Set the ASN field (builder pattern).
    pub fn with_asn(mut self, asn: Asn) -> Self {
        self.asn = asn;
        self
    }

    /// Set the version field (builder pattern).
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Set the value field (builder pattern).
    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    /// Total encoded size of this frame
    pub fn frame_len(&self) -> u64 {
        frame_len(self.metadata_len as usize, self.data_len as usize)
    }

    fn encode_fixed(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(self.stream_id.as_bytes());
        out.extend_from_slice(&self.asn.get().to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.metadata_len.to_le_bytes());
        out.extend_from_slice(&self.data_len.to_le_bytes());
    }

    fn decode_fixed(bytes: &[u8]) -> Result<Self, FormatError> {
        let kind = FrameKind::from_u8(bytes[0]).ok_or(FormatError::UnknownKind(bytes[0]))?;
        Ok(FrameHeader {
            kind,
            lsn: read_u64(bytes, 1),
            stream_id: StreamId::from_bytes(read_id(bytes, 9)),
            asn: Asn::new(read_u64(bytes, 25)),
            version: read_u64(bytes, 33),
            value: read_u64(bytes, 41),
            metadata_len: read_u32(bytes, 49),
            data_len: read_u32(bytes, 53),
        })
    }
}

/// Encoded size of a frame carrying `metadata_len` + `data_len` bytes
pub fn frame_len(metadata_len: usize, data_len: usize) -> u64 {
    (FRAME_OVERHEAD + metadata_len + data_len) as u64
}

/// Encode a frame. Lengths in `header` are taken from the buffers.
pub fn encode_frame(header: &FrameHeader, metadata: &[u8], data: &[u8]) -> Vec<u8> {
    let mut header = *header;
    header.metadata_len = metadata.len() as u32;
    header.data_len = data.len() as u32;

    let total = header.frame_len() as usize;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&((total - FRAME_LENGTH_SIZE) as u32).to_le_bytes());
    header.encode_fixed(&mut out);
    out.extend_from_slice(metadata);
    let header_crc = compute_crc(&out[FRAME_LENGTH_SIZE..]);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&compute_crc(data).to_le_bytes());
    out
}

/// Frame whose header has been verified and whose data has not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    /// Fixed fields
    pub header: FrameHeader,
    /// Metadata bytes
    pub metadata: &'a [u8],
    /// Data bytes
    pub data: &'a [u8],
    /// Stored data CRC
    pub data_crc: u32,
    /// Bytes consumed from the input
    pub consumed: usize,
}

impl ParsedFrame<'_> {
    /// Verify the data CRC.
    pub fn verify_data(&self) -> Result<(), FormatError> {
        let computed = compute_crc(self.data);
        if computed != self.data_crc {
            return Err(FormatError::DataChecksum {
                expected: self.data_crc,
                computed,
            });
        }
        Ok(())
    }
}

/// Parse the frame at the start of `bytes`, verifying its header CRC.
pub fn parse_frame(bytes: &[u8]) -> Result<ParsedFrame<'_>, FormatError> {
    if bytes.len() < FRAME_LENGTH_SIZE {
        return Err(FormatError::Truncated);
    }
    let length = read_u32(bytes, 0) as usize;
    if length < FRAME_OVERHEAD - FRAME_LENGTH_SIZE {
        return Err(FormatError::InvalidLength(length as u32));
    }
    let total = FRAME_LENGTH_SIZE + length;
    if bytes.len() < total {
        return Err(FormatError::Truncated);
    }
    let frame = &bytes[..total];

    let fixed_end = FRAME_LENGTH_SIZE + FRAME_FIXED_SIZE;
    let metadata_len = read_u32(frame, FRAME_LENGTH_SIZE + 49) as usize;
    let data_len = read_u32(frame, FRAME_LENGTH_SIZE + 53) as usize;
    if frame_len(metadata_len, data_len) as usize != total {
        return Err(FormatError::InvalidLength(length as u32));
    }

    let metadata_end = fixed_end + metadata_len;
    let stored_header_crc = read_u32(frame, metadata_end);
    let computed_header_crc = compute_crc(&frame[FRAME_LENGTH_SIZE..metadata_end]);
    if stored_header_crc != computed_header_crc {
        return Err(FormatError::HeaderChecksum {
            expected: stored_header_crc,
            computed: computed_header_crc,
        });
    }

    let header = FrameHeader::decode_fixed(&frame[FRAME_LENGTH_SIZE..fixed_end])?;
    let data_start = metadata_end + 4;
    let data_end = data_start + data_len;
    Ok(ParsedFrame {
        header,
        metadata: &frame[fixed_end..metadata_end],
        data: &frame[data_start..data_end],
        data_crc: read_u32(frame, data_end),
        consumed: total,
    })
}

/// Rewrite the value field of an encoded frame, recomputing only its header
/// CRC. Data and data CRC are carried over byte for byte.
pub fn rewrite_frame_value(frame: &[u8], value: u64) -> Result<Vec<u8>, FormatError> {
    let parsed = parse_frame(frame)?;
    let mut out = frame[..parsed.consumed].to_vec();
    let value_at = FRAME_LENGTH_SIZE + 41;
    out[value_at..value_at + 8].copy_from_slice(&value.to_le_bytes());
    let metadata_end = FRAME_LENGTH_SIZE + FRAME_FIXED_SIZE + parsed.header.metadata_len as usize;
    let crc = compute_crc(&out[FRAME_LENGTH_SIZE..metadata_end]);
    out[metadata_end..metadata_end + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Compute CRC32 checksum of data.
fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_id(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[at..at + 16]);
    buf
}

/// Frame and header parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Not enough bytes for a complete frame
    #[error("Insufficient data to parse frame")]
    Truncated,

    /// Length prefix inconsistent with the encoded lengths
    #[error("Invalid frame length: {0}")]
    InvalidLength(u32),

    /// Unrecognized frame kind
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    /// Container magic bytes missing
    #[error("Invalid container magic bytes")]
    BadMagic,

    /// Unsupported container format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Header or metadata checksum mismatch
    #[error("Header checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    HeaderChecksum {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Data checksum mismatch
    #[error("Data checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    DataChecksum {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        computed: u32,
    },
}

impl From<FormatError> for LogError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::DataChecksum { .. } | FormatError::Truncated => {
                LogError::DataError(e.to_string())
            }
            _ => LogError::CrcError(e.to_string()),
        }
    }
}
