//! Protocol messages — the typed bodies that follow a `FrameHeader`.
//!
//! Requests are a tagged enum keyed by `Op`; every response is a
//! `BlockOpResponse` whose optional sections depend on the operation.

use serde::{Deserialize, Serialize};

use crate::checksum::{ChecksumSpec, ChecksumType, Digest};
use crate::wire::{Op, Status, WireError};

// ── Block identity ────────────────────────────────────────────────────────────

/// A replica's identity plus its mutable version.
///
/// `pool_id` + `block_id` never change. `generation_stamp` and `num_bytes`
/// travel together; `num_bytes` is authoritative only once finalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentity {
    pub pool_id: String,
    pub block_id: u64,
    pub generation_stamp: u64,
    pub num_bytes: u64,
}

impl BlockIdentity {
    pub fn new(pool_id: impl Into<String>, block_id: u64, generation_stamp: u64, num_bytes: u64) -> Self {
        Self {
            pool_id: pool_id.into(),
            block_id,
            generation_stamp,
            num_bytes,
        }
    }

    /// On-disk block file name.
    pub fn block_name(&self) -> String {
        format!("blk_{}", self.block_id)
    }

    /// On-disk metadata file name.
    pub fn meta_name(&self) -> String {
        format!("blk_{}_{}.meta", self.block_id, self.generation_stamp)
    }
}

impl std::fmt::Display for BlockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:blk_{}_{}",
            self.pool_id, self.block_id, self.generation_stamp
        )
    }
}

// ── Access tokens ─────────────────────────────────────────────────────────────

/// What a token holder may do with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Read,
    Write,
    Copy,
    Replace,
}

/// The signed part of an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentifier {
    pub pool_id: String,
    pub block_id: u64,
    pub modes: Vec<AccessMode>,
    /// Milliseconds since the Unix epoch.
    pub expiry_ms: u64,
}

/// Opaque capability presented with every block operation.
/// The default token is empty and only passes when access control is off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub identifier: TokenIdentifier,
    /// Hex-encoded keyed hash of the identifier.
    pub password: String,
}

impl AccessToken {
    pub fn is_empty(&self) -> bool {
        self.password.is_empty()
    }
}

// ── Pipeline stage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    PipelineSetupCreate,
    PipelineSetupAppend,
    PipelineSetupAppendRecovery,
    DataStreaming,
    PipelineClose,
    PipelineCloseRecovery,
    TransferRbw,
    TransferFinalized,
}

impl PipelineStage {
    /// Transfer stages move an existing replica to one new node.
    pub fn is_transfer(&self) -> bool {
        matches!(self, PipelineStage::TransferRbw | PipelineStage::TransferFinalized)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::PipelineSetupCreate => "PIPELINE_SETUP_CREATE",
            PipelineStage::PipelineSetupAppend => "PIPELINE_SETUP_APPEND",
            PipelineStage::PipelineSetupAppendRecovery => "PIPELINE_SETUP_APPEND_RECOVERY",
            PipelineStage::DataStreaming => "DATA_STREAMING",
            PipelineStage::PipelineClose => "PIPELINE_CLOSE",
            PipelineStage::PipelineCloseRecovery => "PIPELINE_CLOSE_RECOVERY",
            PipelineStage::TransferRbw => "TRANSFER_RBW",
            PipelineStage::TransferFinalized => "TRANSFER_FINALIZED",
        };
        f.write_str(name)
    }
}

// ── Delta-sync values ─────────────────────────────────────────────────────────

/// Weak + strong checksum of one delta-sync chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDigestPair {
    pub rolling: u32,
    pub digest: Digest,
}

/// One range of a reconstruction plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub offset: u64,
    pub length: u64,
    /// Index of the requester's matching chunk; -1 for literal bytes.
    pub source_chunk_index: i32,
}

impl SegmentDescriptor {
    pub const LITERAL: i32 = -1;

    pub fn literal(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length,
            source_chunk_index: Self::LITERAL,
        }
    }

    pub fn matched(offset: u64, length: u64, index: usize) -> Self {
        Self {
            offset,
            length,
            source_chunk_index: index as i32,
        }
    }

    pub fn is_literal(&self) -> bool {
        self.source_chunk_index < 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    pub client_name: String,
    pub offset: u64,
    /// -1 reads to the end of the block.
    pub length: i64,
    pub send_checksum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    /// Empty when another storage node originated the write.
    pub client_name: String,
    /// Downstream nodes, nearest first.
    pub targets: Vec<String>,
    pub source: Option<String>,
    pub stage: PipelineStage,
    pub pipeline_size: u32,
    pub min_bytes_rcvd: u64,
    pub max_bytes_rcvd: u64,
    pub latest_generation_stamp: u64,
    pub requested_checksum: ChecksumSpec,
}

impl WriteBlockRequest {
    pub fn is_client(&self) -> bool {
        !self.client_name.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    pub client_name: String,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    /// Node whose replica may be deleted once this copy lands.
    pub del_hint: String,
    /// Node to copy the block from.
    pub proxy_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockChecksumRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunksChecksumRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateSegmentsRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    pub client_name: String,
    /// Weak checksum of the requester's chunk `i`.
    pub rolling: Vec<u32>,
    /// Strong digest of the requester's chunk `i`.
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSegmentRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
    pub client_name: String,
    pub offset: u64,
    pub length: u64,
    pub send_checksum: bool,
    /// True on the request that asks a source node to push the range;
    /// false on the request that carries the range to a target.
    pub is_client: bool,
    pub targets: Vec<String>,
    /// Offset the range lands at in the rebuilt block, when it differs
    /// from where it is read. Used to stage matched chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_offset: Option<u64>,
}

impl SendSegmentRequest {
    /// Offset that names the staged segment at the target.
    pub fn staging_offset(&self) -> u64 {
        self.target_offset.unwrap_or(self.offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBlockRequest {
    pub block: BlockIdentity,
    pub token: AccessToken,
}

/// One decoded operation.
#[derive(Debug, Clone)]
pub enum Request {
    ReadBlock(ReadBlockRequest),
    WriteBlock(WriteBlockRequest),
    TransferBlock(TransferBlockRequest),
    CopyBlock(CopyBlockRequest),
    ReplaceBlock(ReplaceBlockRequest),
    BlockChecksum(BlockChecksumRequest),
    ChunksChecksum(ChunksChecksumRequest),
    CalculateSegments(CalculateSegmentsRequest),
    SendSegment(SendSegmentRequest),
    UpdateBlock(UpdateBlockRequest),
}

impl Request {
    pub fn op(&self) -> Op {
        match self {
            Request::ReadBlock(_) => Op::ReadBlock,
            Request::WriteBlock(_) => Op::WriteBlock,
            Request::TransferBlock(_) => Op::TransferBlock,
            Request::CopyBlock(_) => Op::CopyBlock,
            Request::ReplaceBlock(_) => Op::ReplaceBlock,
            Request::BlockChecksum(_) => Op::BlockChecksum,
            Request::ChunksChecksum(_) => Op::ChunksChecksum,
            Request::CalculateSegments(_) => Op::CalculateSegments,
            Request::SendSegment(_) => Op::SendSegment,
            Request::UpdateBlock(_) => Op::UpdateBlock,
        }
    }

    pub fn block(&self) -> &BlockIdentity {
        match self {
            Request::ReadBlock(r) => &r.block,
            Request::WriteBlock(r) => &r.block,
            Request::TransferBlock(r) => &r.block,
            Request::CopyBlock(r) => &r.block,
            Request::ReplaceBlock(r) => &r.block,
            Request::BlockChecksum(r) => &r.block,
            Request::ChunksChecksum(r) => &r.block,
            Request::CalculateSegments(r) => &r.block,
            Request::SendSegment(r) => &r.block,
            Request::UpdateBlock(r) => &r.block,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>, WireError> {
        let body = match self {
            Request::ReadBlock(r) => serde_json::to_vec(r)?,
            Request::WriteBlock(r) => serde_json::to_vec(r)?,
            Request::TransferBlock(r) => serde_json::to_vec(r)?,
            Request::CopyBlock(r) => serde_json::to_vec(r)?,
            Request::ReplaceBlock(r) => serde_json::to_vec(r)?,
            Request::BlockChecksum(r) => serde_json::to_vec(r)?,
            Request::ChunksChecksum(r) => serde_json::to_vec(r)?,
            Request::CalculateSegments(r) => serde_json::to_vec(r)?,
            Request::SendSegment(r) => serde_json::to_vec(r)?,
            Request::UpdateBlock(r) => serde_json::to_vec(r)?,
        };
        Ok(body)
    }

    pub fn decode(op: Op, body: &[u8]) -> Result<Self, WireError> {
        let request = match op {
            Op::ReadBlock => Request::ReadBlock(serde_json::from_slice(body)?),
            Op::WriteBlock => Request::WriteBlock(serde_json::from_slice(body)?),
            Op::TransferBlock => Request::TransferBlock(serde_json::from_slice(body)?),
            Op::CopyBlock => Request::CopyBlock(serde_json::from_slice(body)?),
            Op::ReplaceBlock => Request::ReplaceBlock(serde_json::from_slice(body)?),
            Op::BlockChecksum => Request::BlockChecksum(serde_json::from_slice(body)?),
            Op::ChunksChecksum => Request::ChunksChecksum(serde_json::from_slice(body)?),
            Op::CalculateSegments => Request::CalculateSegments(serde_json::from_slice(body)?),
            Op::SendSegment => Request::SendSegment(serde_json::from_slice(body)?),
            Op::UpdateBlock => Request::UpdateBlock(serde_json::from_slice(body)?),
        };
        Ok(request)
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Checksum parameters a reader needs before block data arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOpChecksumInfo {
    pub checksum: ChecksumSpec,
    /// Offset of the first packet, aligned down to a checksum unit.
    pub chunk_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksumResponse {
    pub bytes_per_crc: u32,
    pub crc_per_block: u64,
    pub md5: Digest,
    pub crc_type: ChecksumType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunksChecksumResponse {
    pub bytes_per_crc: u32,
    pub crc_per_block: u64,
    pub bytes_per_chunk: u64,
    pub chunks_per_block: u64,
    pub checksums: Vec<ChunkDigestPair>,
    pub md5: Digest,
    pub crc_type: ChecksumType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculateSegmentsResponse {
    pub segments: Vec<SegmentDescriptor>,
}

/// The single response shape for every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOpResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// First unreachable node of a write pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_bad_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_info: Option<ReadOpChecksumInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_response: Option<BlockChecksumResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_checksum: Option<ChunksChecksumResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<CalculateSegmentsResponse>,
}

impl BlockOpResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            message: None,
            first_bad_link: None,
            checksum_info: None,
            checksum_response: None,
            chunks_checksum: None,
            segments: None,
        }
    }

    pub fn success() -> Self {
        Self::new(Status::Success)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_first_bad_link(mut self, link: impl Into<String>) -> Self {
        self.first_bad_link = Some(link.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `first_bad_link`, treating an empty string as absent.
    pub fn bad_link(&self) -> Option<&str> {
        self.first_bad_link.as_deref().filter(|l| !l.is_empty())
    }
}

/// Sent by a reader after it consumed an entire requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReadStatus {
    pub status: Status,
}

/// Per-packet acknowledgment travelling back up a write pipeline.
/// `replies[0]` is the acknowledging node; downstream replies follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineAck {
    pub seqno: u64,
    pub replies: Vec<Status>,
}

impl PipelineAck {
    pub fn is_success(&self) -> bool {
        self.replies.iter().all(Status::is_success)
    }
}
