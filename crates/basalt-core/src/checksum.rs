//! Checksum primitives for Basalt.
//!
//! Provides three things:
//!   1. Per-unit data checksums (CRC32 / CRC32C) — what block metadata
//!      files store and what data packets carry.
//!   2. Adler-32 — the weak, rollable checksum used by delta-sync.
//!   3. MD5 — the 128-bit strong digest used by delta-sync and the
//!      block-level checksum ops.
//!
//! There is no unsafe code in this module.

use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{MetadataHeader, WireError, METADATA_HEADER_LEN, METADATA_VERSION};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Size of one stored CRC in bytes.
pub const CRC_SIZE: usize = 4;

// ── Checksum spec ─────────────────────────────────────────────────────────────

/// Checksum algorithm of a block's metadata stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Null,
    Crc32,
    Crc32c,
}

impl ChecksumType {
    pub fn id(&self) -> u8 {
        match self {
            ChecksumType::Null => 0,
            ChecksumType::Crc32 => 1,
            ChecksumType::Crc32c => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, WireError> {
        match id {
            0 => Ok(ChecksumType::Null),
            1 => Ok(ChecksumType::Crc32),
            2 => Ok(ChecksumType::Crc32c),
            other => Err(WireError::UnknownChecksumType(other)),
        }
    }

    /// Bytes per stored checksum.
    pub fn size(&self) -> usize {
        match self {
            ChecksumType::Null => 0,
            ChecksumType::Crc32 | ChecksumType::Crc32c => CRC_SIZE,
        }
    }
}

/// Algorithm plus unit size. Fixed for the lifetime of a block's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub checksum_type: ChecksumType,
    pub bytes_per_checksum: u32,
}

/// A checksum unit whose stored and computed values differ.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("checksum mismatch in unit {unit}: expected {expected:08x}, computed {computed:08x}")]
pub struct ChecksumMismatch {
    pub unit: usize,
    pub expected: u32,
    pub computed: u32,
}

impl ChecksumSpec {
    pub fn new(checksum_type: ChecksumType, bytes_per_checksum: u32) -> Self {
        Self {
            checksum_type,
            bytes_per_checksum: bytes_per_checksum.max(1),
        }
    }

    pub fn checksum_size(&self) -> usize {
        self.checksum_type.size()
    }

    pub fn unit(&self) -> usize {
        self.bytes_per_checksum as usize
    }

    /// Number of checksum units covering `len` data bytes.
    pub fn num_units(&self, len: u64) -> u64 {
        let unit = self.bytes_per_checksum as u64;
        (len + unit - 1) / unit
    }

    /// Checksum bytes needed to cover `len` data bytes.
    pub fn checksum_len(&self, len: u64) -> usize {
        self.num_units(len) as usize * self.checksum_size()
    }

    /// Raw checksum value of one unit.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self.checksum_type {
            ChecksumType::Null => 0,
            ChecksumType::Crc32 => CRC32.checksum(data),
            ChecksumType::Crc32c => CRC32C.checksum(data),
        }
    }

    /// Append one big-endian checksum per unit of `data` to `out`.
    pub fn chunked_sums(&self, data: &[u8], out: &mut Vec<u8>) {
        if self.checksum_size() == 0 {
            return;
        }
        for unit in data.chunks(self.unit()) {
            out.extend_from_slice(&self.compute(unit).to_be_bytes());
        }
    }

    /// Verify `sums` against `data`, unit by unit.
    pub fn verify_chunked(&self, data: &[u8], sums: &[u8]) -> Result<(), ChecksumMismatch> {
        let size = self.checksum_size();
        if size == 0 {
            return Ok(());
        }
        for (unit, (chunk, stored)) in data.chunks(self.unit()).zip(sums.chunks(size)).enumerate() {
            let expected = u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
            let computed = self.compute(chunk);
            if expected != computed {
                return Err(ChecksumMismatch {
                    unit,
                    expected,
                    computed,
                });
            }
        }
        Ok(())
    }

    /// Metadata file header for this spec.
    pub fn header(&self) -> MetadataHeader {
        MetadataHeader {
            version: U16::new(METADATA_VERSION),
            checksum_type: self.checksum_type.id(),
            bytes_per_checksum: U32::new(self.bytes_per_checksum),
        }
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        self.header().as_bytes().to_vec()
    }

    /// Parse a metadata file header.
    pub fn from_header_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < METADATA_HEADER_LEN {
            return Err(WireError::ShortMetadataHeader(bytes.len()));
        }
        let header = MetadataHeader::read_from(&bytes[..METADATA_HEADER_LEN])
            .ok_or(WireError::ShortMetadataHeader(bytes.len()))?;
        let checksum_type = ChecksumType::from_id(header.checksum_type)?;
        Ok(Self::new(checksum_type, header.bytes_per_checksum.get()))
    }
}

impl Default for ChecksumSpec {
    fn default() -> Self {
        Self::new(ChecksumType::Crc32c, 512)
    }
}

// ── Chunked checksummer ───────────────────────────────────────────────────────

/// Computes per-unit checksums over data that arrives in arbitrary pieces.
///
/// Bytes of an incomplete trailing unit are held until more data arrives
/// or `finish` is called. Seed with `with_partial` when appending to a
/// replica whose last unit is incomplete on disk.
pub struct ChunkedChecksummer {
    spec: ChecksumSpec,
    partial: Vec<u8>,
    last: Vec<u8>,
}

impl ChunkedChecksummer {
    pub fn new(spec: ChecksumSpec) -> Self {
        Self::with_partial(spec, Vec::new())
    }

    pub fn with_partial(spec: ChecksumSpec, partial: Vec<u8>) -> Self {
        Self {
            spec,
            partial,
            last: Vec::new(),
        }
    }

    pub fn spec(&self) -> ChecksumSpec {
        self.spec
    }

    /// Bytes currently buffered in the incomplete trailing unit.
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    /// Feed data; append checksums of every unit it completes to `out`.
    pub fn update(&mut self, mut data: &[u8], out: &mut Vec<u8>) {
        let unit = self.spec.unit();
        if !self.partial.is_empty() {
            let take = (unit - self.partial.len()).min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() < unit {
                return;
            }
            let sum = self.spec.compute(&self.partial).to_be_bytes();
            self.push_sum(&sum, out);
            self.partial.clear();
        }
        let whole = data.len() - data.len() % unit;
        for chunk in data[..whole].chunks(unit) {
            let sum = self.spec.compute(chunk).to_be_bytes();
            self.push_sum(&sum, out);
        }
        self.partial.extend_from_slice(&data[whole..]);
    }

    /// Checksum of the trailing partial unit, if any.
    pub fn partial_checksum(&self) -> Option<Vec<u8>> {
        if self.partial.is_empty() || self.spec.checksum_size() == 0 {
            return None;
        }
        Some(self.spec.compute(&self.partial).to_be_bytes().to_vec())
    }

    /// Flush the trailing partial unit. Returns the checksum of the last
    /// unit written (partial or full), empty when nothing was written.
    pub fn finish(mut self, out: &mut Vec<u8>) -> Vec<u8> {
        if let Some(sum) = self.partial_checksum() {
            self.push_sum(&sum, out);
            self.partial.clear();
        }
        self.last
    }

    fn push_sum(&mut self, sum: &[u8], out: &mut Vec<u8>) {
        if self.spec.checksum_size() == 0 {
            return;
        }
        out.extend_from_slice(sum);
        self.last.clear();
        self.last.extend_from_slice(sum);
    }
}

// ── Adler-32 ──────────────────────────────────────────────────────────────────

const ADLER_MOD: u32 = 65521;

/// Adler-32 of a byte slice.
pub fn adler32(data: &[u8]) -> u32 {
    RollingChecksum::new(data).value()
}

/// Adler-32 over a fixed-size window that can slide one byte at a time.
///
/// `roll` produces exactly the value a fresh computation over the shifted
/// window would.
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingChecksum {
    pub fn new(window: &[u8]) -> Self {
        let mut sum = Self { a: 1, b: 0, window: 0 };
        sum.update(window);
        sum
    }

    /// Grow the window by appending `data` at the back.
    pub fn update(&mut self, data: &[u8]) {
        let (mut a, mut b) = (self.a, self.b);
        // 5552 is the largest n such that the sums cannot overflow u32.
        for block in data.chunks(5552) {
            for &byte in block {
                a += byte as u32;
                b += a;
            }
            a %= ADLER_MOD;
            b %= ADLER_MOD;
        }
        self.a = a;
        self.b = b;
        self.window = ((self.window as u64 + data.len() as u64) % ADLER_MOD as u64) as u32;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Slide the window: drop `out` from the front, append `inp` at the back.
    pub fn roll(&mut self, out: u8, inp: u8) {
        let m = ADLER_MOD as u64;
        let out = out as u64;
        let a = (self.a as u64 + m - out + inp as u64) % m;
        let drop = (self.window as u64 * out) % m;
        let b = (self.b as u64 + m - drop + a + m - 1) % m;
        self.a = a as u32;
        self.b = b as u32;
    }
}

// ── MD5 ───────────────────────────────────────────────────────────────────────

/// 128-bit strong digest.
pub type Digest = [u8; 16];

/// MD5 digest of a byte slice.
pub fn strong_digest(data: &[u8]) -> Digest {
    md5::compute(data).0
}

/// Incremental MD5 for data that arrives in pieces.
pub struct DigestHasher(md5::Context);

impl DigestHasher {
    pub fn new() -> Self {
        Self(md5::Context::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    pub fn finalize(self) -> Digest {
        self.0.compute().0
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
