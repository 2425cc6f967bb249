//! Basalt wire format — fixed-layout headers for the block transfer protocol.
//!
//! Every request and response on a data-transfer connection starts with a
//! `FrameHeader` followed by a serde-JSON body. Block bytes travel in
//! packets, each preceded by a `PacketHeader`. Block metadata files on disk
//! start with a `MetadataHeader`.
//!
//! All multi-byte integers are network byte order. The types use zerocopy
//! derives for allocation-free serialization. There is no unsafe code in
//! this module.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Precedes every request and every response message.
///
/// Requests carry the operation code; responses, pipeline acks and client
/// read statuses carry `OP_RESPONSE`.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Operation code (see `Op`), or `OP_RESPONSE`.
    pub op: u8,

    /// Reserved, must be zero.
    pub flags: U16,

    /// Length of the JSON body in bytes, not including this header.
    pub length: U32,
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(op: u8, length: usize) -> Self {
        Self {
            version: WIRE_VERSION,
            op,
            flags: U16::new(0),
            length: U32::new(length as u32),
        }
    }

    /// Check version, reserved bits and body length.
    pub fn validate(&self) -> Result<usize, WireError> {
        if self.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        let flags = self.flags.get();
        if flags != 0 {
            return Err(WireError::ReservedFlagsSet(flags));
        }
        let length = self.length.get() as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(WireError::MessageTooLarge(length));
        }
        Ok(length)
    }
}

// ── Packet Header ────────────────────────────────────────────────────────────

/// Precedes every data packet of a block stream.
///
/// Layout after the header: `checksum_len` checksum bytes, then `data_len`
/// data bytes. The checksums cover the data in checksum-unit order starting
/// at the first byte of the packet.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// Offset of the first data byte within the block.
    pub offset_in_block: U64,

    /// Sequence number, starting at 0 for each block stream.
    pub seqno: U64,

    /// Number of data bytes following the checksums.
    pub data_len: U32,

    /// Number of checksum bytes following the header.
    pub checksum_len: U32,

    /// Bit flags:
    ///   bit 0: last packet of the block stream
    ///   bits 1-7: reserved, must be zero
    pub flags: u8,

    pub reserved: [u8; 7],
}

assert_eq_size!(PacketHeader, [u8; 32]);

impl PacketHeader {
    pub fn new(offset_in_block: u64, seqno: u64, data_len: usize, checksum_len: usize, last: bool) -> Self {
        Self {
            offset_in_block: U64::new(offset_in_block),
            seqno: U64::new(seqno),
            data_len: U32::new(data_len as u32),
            checksum_len: U32::new(checksum_len as u32),
            flags: if last { PACKET_FLAG_LAST } else { 0 },
            reserved: [0u8; 7],
        }
    }

    pub fn is_last(&self) -> bool {
        self.flags & PACKET_FLAG_LAST != 0
    }
}

// ── Metadata Header ──────────────────────────────────────────────────────────

/// Header of a block's on-disk checksum file.
///
/// Followed by one checksum per `bytes_per_checksum` unit of block data.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MetadataHeader {
    pub version: U16,
    pub checksum_type: u8,
    pub bytes_per_checksum: U32,
}

assert_eq_size!(MetadataHeader, [u8; 7]);

/// Size of `MetadataHeader` on disk.
pub const METADATA_HEADER_LEN: usize = std::mem::size_of::<MetadataHeader>();

/// Current metadata file version.
pub const METADATA_VERSION: u16 = 1;

// ── Operations ───────────────────────────────────────────────────────────────

/// Operation codes. The first seven mirror the classic data-transfer
/// protocol numbering; the delta-sync extension lives at 90+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    WriteBlock = 80,
    ReadBlock = 81,
    ReplaceBlock = 83,
    CopyBlock = 84,
    BlockChecksum = 85,
    TransferBlock = 86,
    ChunksChecksum = 90,
    CalculateSegments = 91,
    SendSegment = 92,
    UpdateBlock = 93,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::WriteBlock => "WRITE_BLOCK",
            Op::ReadBlock => "READ_BLOCK",
            Op::ReplaceBlock => "REPLACE_BLOCK",
            Op::CopyBlock => "COPY_BLOCK",
            Op::BlockChecksum => "BLOCK_CHECKSUM",
            Op::TransferBlock => "TRANSFER_BLOCK",
            Op::ChunksChecksum => "CHUNKS_CHECKSUM",
            Op::CalculateSegments => "CALCULATE_SEGMENTS",
            Op::SendSegment => "SEND_SEGMENT",
            Op::UpdateBlock => "UPDATE_BLOCK",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Op {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            80 => Ok(Op::WriteBlock),
            81 => Ok(Op::ReadBlock),
            83 => Ok(Op::ReplaceBlock),
            84 => Ok(Op::CopyBlock),
            85 => Ok(Op::BlockChecksum),
            86 => Ok(Op::TransferBlock),
            90 => Ok(Op::ChunksChecksum),
            91 => Ok(Op::CalculateSegments),
            92 => Ok(Op::SendSegment),
            93 => Ok(Op::UpdateBlock),
            other => Err(WireError::UnknownOp(other)),
        }
    }
}

impl From<Op> for u8 {
    fn from(op: Op) -> u8 {
        op as u8
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Outcome carried by every response and pipeline ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Error,
    ErrorUnsupported,
    ErrorAccessToken,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Op code carried by response frames.
pub const OP_RESPONSE: u8 = 0x00;

/// Maximum JSON body size in bytes.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Largest data section a receiver accepts in one packet.
pub const MAX_PACKET_DATA: usize = 16 * 1024 * 1024;

/// Default data bytes per packet on the sending side.
pub const DEFAULT_PACKET_SIZE: usize = 64 * 1024;

/// Packet flag: last packet of the block stream.
pub const PACKET_FLAG_LAST: u8 = 0x01;

/// Trailing marker a copy source writes once it has released its resources.
/// Two bytes: the UTF-16 code unit for 'd'.
pub const COPY_COMPLETE_MARKER: [u8; 2] = [0x00, b'd'];

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown op code: {0}")]
    UnknownOp(u8),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:04x}")]
    ReservedFlagsSet(u16),

    #[error("message length {0} exceeds maximum {}", MAX_MESSAGE_LEN)]
    MessageTooLarge(usize),

    #[error("packet data length {0} exceeds maximum {}", MAX_PACKET_DATA)]
    PacketTooLarge(usize),

    #[error("expected a response frame, got op code {0}")]
    UnexpectedOp(u8),

    #[error("unknown checksum type id: {0}")]
    UnknownChecksumType(u8),

    #[error("metadata header too short: {0} bytes")]
    ShortMetadataHeader(usize),
}

impl WireError {
    /// True when the peer closed the stream before a complete frame arrived.
    pub fn is_eof(&self) -> bool {
        match self {
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
