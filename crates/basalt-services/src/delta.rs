//! Delta-Sync Engine — rsync-style reconciliation of a block between nodes.
//!
//! The exchange, driven by a client:
//!
//!   1. CHUNKS_CHECKSUM on the target returns a weak (Adler-32) and strong
//!      (MD5) checksum for every fixed-size chunk of its copy.
//!   2. CALCULATE_SEGMENTS on the source scans its copy with a window that
//!      slides one byte at a time and returns matched and literal ranges.
//!   3. SEND_SEGMENT pushes each range to the target, which stages it as
//!      `<data_root>/current/rsync_tmp/<id>_<gs>/<offset>_<length>`.
//!   4. UPDATE_BLOCK on the target rebuilds the block from the staged files.
//!
//! BLOCK_CHECKSUM, the whole-block metadata digest, lives here too.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use basalt_core::checksum::{
    adler32, strong_digest, ChecksumSpec, ChecksumType, ChunkedChecksummer, Digest, RollingChecksum,
};
use basalt_core::codec;
use basalt_core::message::{
    AccessMode, BlockChecksumRequest, BlockChecksumResponse, BlockIdentity, BlockOpResponse,
    CalculateSegmentsRequest, CalculateSegmentsResponse, ChunkDigestPair, ChunksChecksumRequest,
    ChunksChecksumResponse, Request, SegmentDescriptor, SendSegmentRequest, UpdateBlockRequest,
};
use basalt_core::wire::{Op, Status, WireError, METADATA_HEADER_LEN};

use crate::client::PeerConnection;
use crate::error::{timed, TransferError};
use crate::node::NodeContext;
use crate::storage::{BlockStore, STAGING_DIR};
use crate::xceiver::ConnState;

/// Copy buffer for staging and reassembly.
const SEGMENT_BUFFER: usize = 1 << 20;

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Weak and strong checksum of each `chunk_size` chunk of `input`. The last
/// chunk may be short.
pub fn chunk_digests<R: Read>(mut input: R, chunk_size: u64) -> std::io::Result<Vec<ChunkDigestPair>> {
    let mut out = Vec::new();
    let mut buf = Vec::with_capacity(chunk_size as usize);
    loop {
        buf.clear();
        let n = (&mut input).take(chunk_size).read_to_end(&mut buf)?;
        if n == 0 {
            break;
        }
        out.push(ChunkDigestPair {
            rolling: adler32(&buf),
            digest: strong_digest(&buf),
        });
        if (n as u64) < chunk_size {
            break;
        }
    }
    Ok(out)
}

/// Partition `data` into ranges that match one of the requester's chunks
/// and literal ranges that must be sent.
///
/// The window is always exactly `chunk_size` bytes, so a trailing partial
/// chunk is never matched. A weak hit is confirmed with the strong digest
/// before it counts. The result covers `[0, data.len())` in order with no
/// gaps or overlaps.
pub fn plan_segments(
    data: &[u8],
    chunk_size: usize,
    rolling: &[u32],
    digests: &[Digest],
) -> Vec<SegmentDescriptor> {
    let mut table: HashMap<u32, Vec<(usize, &Digest)>> = HashMap::new();
    for (index, (weak, strong)) in rolling.iter().zip(digests).enumerate() {
        table.entry(*weak).or_default().push((index, strong));
    }

    let mut segments = Vec::new();
    let len = data.len();
    if chunk_size == 0 || len < chunk_size {
        if len > 0 {
            segments.push(SegmentDescriptor::literal(0, len as u64));
        }
        return segments;
    }

    let mut literal_start = 0usize;
    let mut pos = 0usize;
    let mut window = RollingChecksum::new(&data[..chunk_size]);
    loop {
        let hit = table.get(&window.value()).and_then(|candidates| {
            let strong = strong_digest(&data[pos..pos + chunk_size]);
            candidates
                .iter()
                .find(|(_, digest)| **digest == strong)
                .map(|(index, _)| *index)
        });

        match hit {
            Some(index) => {
                if pos > literal_start {
                    segments.push(SegmentDescriptor::literal(
                        literal_start as u64,
                        (pos - literal_start) as u64,
                    ));
                }
                segments.push(SegmentDescriptor::matched(pos as u64, chunk_size as u64, index));
                pos += chunk_size;
                literal_start = pos;
                if pos + chunk_size > len {
                    break;
                }
                window = RollingChecksum::new(&data[pos..pos + chunk_size]);
            }
            None => {
                if pos + chunk_size >= len {
                    break;
                }
                window.roll(data[pos], data[pos + chunk_size]);
                pos += 1;
            }
        }
    }

    if len > literal_start {
        segments.push(SegmentDescriptor::literal(
            literal_start as u64,
            (len - literal_start) as u64,
        ));
    }
    segments
}

/// Staging directory for `block` under a store root.
pub fn staging_dir(root: &Path, block: &BlockIdentity) -> PathBuf {
    root.join("current")
        .join(STAGING_DIR)
        .join(format!("{}_{}", block.block_id, block.generation_stamp))
}

/// One staged segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSegment {
    pub offset: u64,
    pub length: u64,
    pub path: PathBuf,
}

/// Staged segments of a block in offset order. They must tile
/// `[0, total)` exactly.
pub fn staged_segments(dir: &Path) -> Result<Vec<StagedSegment>, TransferError> {
    let mut staged = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        std::io::Error::new(e.kind(), format!("no staged segments at {}: {e}", dir.display()))
    })?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((offset, length)) = name
            .split_once('_')
            .and_then(|(o, l)| Some((o.parse::<u64>().ok()?, l.parse::<u64>().ok()?)))
        else {
            tracing::debug!(file = %name, "ignoring stray file in staging area");
            continue;
        };
        let actual = entry.metadata()?.len();
        if actual != length {
            return Err(TransferError::Protocol(format!(
                "staged segment {name} holds {actual} bytes"
            )));
        }
        staged.push(StagedSegment {
            offset,
            length,
            path: entry.path(),
        });
    }
    staged.sort_by_key(|s| s.offset);

    let mut expected = 0u64;
    for segment in &staged {
        if segment.offset != expected {
            return Err(TransferError::Protocol(format!(
                "staged segments leave {} at offset {expected}, next starts at {}",
                if segment.offset > expected { "a gap" } else { "an overlap" },
                segment.offset
            )));
        }
        expected = segment.offset + segment.length;
    }
    if staged.is_empty() {
        return Err(TransferError::Protocol(format!(
            "no staged segments at {}",
            dir.display()
        )));
    }
    Ok(staged)
}

/// Checksum spec and raw checksum bytes of a replica's metadata.
fn read_metadata(store: &dyn BlockStore, block: &BlockIdentity) -> Result<(ChecksumSpec, Vec<u8>), TransferError> {
    let mut meta = store.metadata_input(block)?;
    let mut header = [0u8; METADATA_HEADER_LEN];
    meta.read_exact(&mut header)?;
    let spec = ChecksumSpec::from_header_bytes(&header)?;
    let mut sums = Vec::new();
    meta.read_to_end(&mut sums)?;
    Ok((spec, sums))
}

fn crc_per_block(spec: &ChecksumSpec, sums: &[u8]) -> u64 {
    match spec.checksum_size() {
        0 => 0,
        size => (sums.len() / size) as u64,
    }
}

/// Bytes `[offset, offset + length)` of the local replica.
fn read_range(store: &dyn BlockStore, block: &BlockIdentity, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
    let replica = store.replica(&block.pool_id, block.block_id).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("replica not found: {block}"))
    })?;
    let end = offset.checked_add(length).unwrap_or(u64::MAX);
    if end > replica.block.num_bytes {
        return Err(TransferError::Protocol(format!(
            "range [{offset}, {end}) is outside {block} of {} bytes",
            replica.block.num_bytes
        )));
    }
    let mut input = store.block_input(block, offset)?;
    let mut data = vec![0u8; length as usize];
    input.read_exact(&mut data)?;
    Ok(data)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// BLOCK_CHECKSUM handler.
pub async fn block_checksum<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: BlockChecksumRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::BlockChecksum, &req.token, &req.block, AccessMode::Read, &ctx.xfer_addr)
        .await?;

    let (spec, sums) = read_metadata(ctx.store.as_ref(), &req.block)?;
    let checksum = BlockChecksumResponse {
        bytes_per_crc: spec.bytes_per_checksum,
        crc_per_block: crc_per_block(&spec, &sums),
        md5: strong_digest(&sums),
        crc_type: spec.checksum_type,
    };
    tracing::debug!(
        block = %req.block,
        bytes_per_crc = checksum.bytes_per_crc,
        crc_per_block = checksum.crc_per_block,
        md5 = %hex::encode(checksum.md5),
        "block checksum"
    );

    let mut response = BlockOpResponse::success();
    response.checksum_response = Some(checksum);
    conn.respond(&response).await
}

/// CHUNKS_CHECKSUM handler.
pub async fn chunks_checksum<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: ChunksChecksumRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::ChunksChecksum, &req.token, &req.block, AccessMode::Read, &ctx.xfer_addr)
        .await?;

    let store = ctx.store.as_ref();
    let (spec, sums) = read_metadata(store, &req.block)?;
    let chunk = delta_chunk_size(ctx)?;
    let checksums = chunk_digests(store.block_input(&req.block, 0)?, chunk)?;
    let block_size = ctx.config.transfer.block_size;
    let chunks_per_block = (block_size.saturating_sub(METADATA_HEADER_LEN as u64) + chunk - 1) / chunk;

    tracing::debug!(block = %req.block, chunks = checksums.len(), chunk_size = chunk, "chunk checksums");

    let mut response = BlockOpResponse::success();
    response.chunks_checksum = Some(ChunksChecksumResponse {
        bytes_per_crc: spec.bytes_per_checksum,
        crc_per_block: crc_per_block(&spec, &sums),
        bytes_per_chunk: chunk,
        chunks_per_block,
        checksums,
        md5: strong_digest(&sums),
        crc_type: spec.checksum_type,
    });
    conn.respond(&response).await
}

fn delta_chunk_size(ctx: &NodeContext) -> Result<u64, TransferError> {
    match ctx.config.delta.chunk_size {
        0 => Err(TransferError::Protocol("delta chunk size is not configured".into())),
        n => Ok(n),
    }
}

/// CALCULATE_SEGMENTS handler.
pub async fn calculate_segments<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: CalculateSegmentsRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::CalculateSegments, &req.token, &req.block, AccessMode::Read, &ctx.xfer_addr)
        .await?;
    if req.rolling.len() != req.digests.len() {
        return Err(TransferError::Protocol(format!(
            "{} weak checksums but {} digests",
            req.rolling.len(),
            req.digests.len()
        )));
    }

    let mut data = Vec::new();
    ctx.store.block_input(&req.block, 0)?.read_to_end(&mut data)?;
    let chunk = delta_chunk_size(ctx)? as usize;
    let CalculateSegmentsRequest { rolling, digests, .. } = req.clone();
    let segments = tokio::task::spawn_blocking(move || plan_segments(&data, chunk, &rolling, &digests))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;

    let literal: u64 = segments.iter().filter(|s| s.is_literal()).map(|s| s.length).sum();
    tracing::info!(
        block = %req.block,
        client = %req.client_name,
        segments = segments.len(),
        literal_bytes = literal,
        "segments calculated"
    );

    let mut response = BlockOpResponse::success();
    response.segments = Some(CalculateSegmentsResponse { segments });
    conn.respond(&response).await
}

/// SEND_SEGMENT handler.
pub async fn send_segment<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: SendSegmentRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if req.is_client {
        push_segment(ctx, conn, req).await
    } else {
        stage_segment(ctx, conn, req).await
    }
}

/// Read the range locally and push it to every target in turn. A failing
/// target does not stop the others; the reply lists the ones that failed.
async fn push_segment<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: SendSegmentRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::SendSegment, &req.token, &req.block, AccessMode::Read, &ctx.xfer_addr)
        .await?;
    if req.targets.is_empty() {
        return Err(TransferError::Protocol("segment push names no targets".into()));
    }

    let data = read_range(ctx.store.as_ref(), &req.block, req.offset, req.length)?;
    let adler = adler32(&data);

    let mut failed = Vec::new();
    for target in &req.targets {
        match push_to(ctx, &req, target, &data, adler).await {
            Ok(()) => tracing::debug!(
                block = %req.block,
                target = %target,
                offset = req.offset,
                length = req.length,
                "segment pushed"
            ),
            Err(e) => {
                tracing::warn!(
                    block = %req.block,
                    target = %target,
                    offset = req.offset,
                    length = req.length,
                    error = %e,
                    "segment push failed"
                );
                failed.push(target.clone());
            }
        }
    }

    let response = if failed.is_empty() {
        BlockOpResponse::success()
    } else {
        BlockOpResponse::new(Status::Error).with_message(format!(
            "segment [{}, {}) of {} not stored on {}",
            req.offset,
            req.offset + req.length,
            req.block,
            failed.join(", ")
        ))
    };
    conn.respond(&response).await
}

async fn push_to(
    ctx: &NodeContext,
    req: &SendSegmentRequest,
    target: &str,
    data: &[u8],
    adler: u32,
) -> Result<(), TransferError> {
    let mut peer = PeerConnection::connect_with(target, &ctx.config.transfer, req.targets.len()).await?;
    let forwarded = SendSegmentRequest {
        is_client: false,
        targets: Vec::new(),
        target_offset: Some(req.staging_offset()),
        ..req.clone()
    };
    peer.send_request(&Request::SendSegment(forwarded)).await?;
    peer.send_segment(data, adler).await?;
    let reply = peer.read_response().await?;
    if !reply.is_success() {
        return Err(TransferError::downstream(
            target,
            format!(
                "segment rejected with {:?}{}",
                reply.status,
                reply.message.map(|m| format!(": {m}")).unwrap_or_default()
            ),
        ));
    }
    Ok(())
}

/// Receive one segment into the block's staging area. A file left by an
/// earlier attempt at the same range is replaced.
async fn stage_segment<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: SendSegmentRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::SendSegment, &req.token, &req.block, AccessMode::Write, &ctx.xfer_addr)
        .await?;

    let dir = staging_dir(ctx.store.data_root(), &req.block);
    let path = dir.join(format!("{}_{}", req.staging_offset(), req.length));
    let read_timeout = ctx.config.transfer.socket_timeout();
    let (length, adler) = timed(
        read_timeout,
        "reading segment header",
        codec::read_segment_header(&mut conn.reader),
    )
    .await?;
    if length != req.length {
        return Err(TransferError::Protocol(format!(
            "segment carries {length} bytes, request announced {}",
            req.length
        )));
    }

    tokio::fs::create_dir_all(&dir).await?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "replacing stale staged segment"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut file = tokio::fs::File::create(&path).await?;
    let mut sum = RollingChecksum::new(&[]);
    let mut buf = vec![0u8; SEGMENT_BUFFER.min(length as usize)];
    let mut remaining = length;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        let chunk = &mut buf[..n];
        timed(read_timeout, "reading segment data", async {
            conn.reader.read_exact(chunk).await.map_err(WireError::from)
        })
        .await?;
        sum.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    // Staged bytes are not checked against the planning digests; a
    // mismatch with the sender's Adler-32 is only reported.
    if sum.value() != adler {
        tracing::warn!(
            block = %req.block,
            offset = req.staging_offset(),
            length,
            expected = adler,
            computed = sum.value(),
            "staged segment checksum mismatch"
        );
    }
    tracing::debug!(block = %req.block, path = %path.display(), length, "segment staged");
    conn.respond(&BlockOpResponse::success()).await
}

/// UPDATE_BLOCK handler.
pub async fn update_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: UpdateBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::UpdateBlock, &req.token, &req.block, AccessMode::Write, &ctx.xfer_addr)
        .await?;

    let dir = staging_dir(ctx.store.data_root(), &req.block);
    let staged = staged_segments(&dir)?;

    let store = ctx.store.as_ref();
    if store.delete_finalized(&req.block)? {
        tracing::debug!(block = %req.block, "previous replica removed before rebuild");
    }

    // Segments are staged under the old identity; the rebuilt replica is a
    // new write and carries the next generation stamp.
    let mut target = req.block.clone();
    target.generation_stamp += 1;
    target.num_bytes = 0;

    let spec = ChecksumSpec::new(ChecksumType::Crc32, ctx.config.delta.reassembly_bytes_per_checksum);
    let mut writer = store.create_temporary(&target, spec)?;
    let mut summer = ChunkedChecksummer::new(spec);
    let mut buf = vec![0u8; SEGMENT_BUFFER];
    let mut sums = Vec::new();
    for segment in &staged {
        let mut file = std::fs::File::open(&segment.path)?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sums.clear();
            summer.update(&buf[..n], &mut sums);
            writer.write_data(&buf[..n])?;
            writer.write_checksums(&sums)?;
        }
    }
    sums.clear();
    let last_checksum = summer.finish(&mut sums);
    writer.write_checksums(&sums)?;
    let len = writer.bytes_on_disk();
    writer.set_last_checksum_and_len(len, &last_checksum)?;
    let rebuilt = writer.block().clone();
    writer.close()?;

    let finalized = ctx.close_block(&rebuilt, None)?;
    if let Err(e) = std::fs::remove_dir_all(&dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to clear staging area");
    }

    tracing::info!(block = %finalized, segments = staged.len(), bytes = len, "block rebuilt from segments");
    conn.respond(&BlockOpResponse::success()).await
}

/// Write `data` as a staged segment without going through the network.
#[cfg(test)]
pub(crate) fn stage_local(root: &Path, block: &BlockIdentity, offset: u64, data: &[u8]) {
    let dir = staging_dir(root, block);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{offset}_{}", data.len())), data).unwrap();
}
