//! Copy / Replace / Transfer — moving whole replicas between nodes.
//!
//! COPY_BLOCK serves a replica to another node, REPLACE_BLOCK pulls one
//! from a proxy source via COPY_BLOCK, and TRANSFER_BLOCK pushes a local
//! replica to a new pipeline member. Each holds a `MovePermit` for its
//! whole duration; a saturated node answers ERROR without moving bytes.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use basalt_core::checksum::ChecksumType;
use basalt_core::message::{
    AccessMode, BlockIdentity, BlockOpResponse, CopyBlockRequest, PipelineStage, ReplaceBlockRequest,
    Request, TransferBlockRequest, WriteBlockRequest,
};
use basalt_core::wire::{Op, Status, COPY_COMPLETE_MARKER};

use crate::client::PeerConnection;
use crate::error::TransferError;
use crate::node::NodeContext;
use crate::receiver::{BlockReceiver, MirrorLink};
use crate::sender::BlockSender;
use crate::storage::ReplicaState;
use crate::xceiver::ConnState;

/// COPY_BLOCK handler.
pub async fn copy_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: CopyBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::CopyBlock, &req.token, &req.block, AccessMode::Copy, &ctx.xfer_addr)
        .await?;

    let Some(_permit) = ctx.throttler.try_acquire() else {
        let msg = format!(
            "not able to copy block {} to {} because the move quota is exceeded",
            req.block.block_id,
            conn.peer()
        );
        tracing::info!(block = %req.block, active = ctx.throttler.active(), "{msg}");
        conn.respond(&BlockOpResponse::new(Status::Error).with_message(msg)).await?;
        return Ok(());
    };

    let mut sender = BlockSender::new(
        ctx.store.as_ref(),
        &req.block,
        0,
        -1,
        true,
        ctx.config.transfer.packet_size,
    )?;

    let mut response = BlockOpResponse::success();
    response.checksum_info = Some(sender.checksum_info());
    conn.respond(&response).await?;

    let sent = sender.send_block(&mut conn.writer, Some(&ctx.throttler)).await?;

    // Tells the receiver our permit is about to be released.
    conn.writer.write_all(&COPY_COMPLETE_MARKER).await?;
    conn.writer.flush().await?;

    tracing::info!(block = %req.block, peer = %conn.peer(), bytes = sent, "copied block");
    Ok(())
}

/// REPLACE_BLOCK handler.
pub async fn replace_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: ReplaceBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut block = req.block.clone();
    block.num_bytes = ctx.config.transfer.estimate_block_size;

    ctx.guard
        .check_and_reply(conn, Op::ReplaceBlock, &req.token, &req.block, AccessMode::Replace, &ctx.xfer_addr)
        .await?;

    let Some(_permit) = ctx.throttler.try_acquire() else {
        let msg = format!(
            "not able to receive block {} from {} because the move quota is exceeded",
            req.block.block_id,
            conn.peer()
        );
        tracing::warn!(block = %req.block, active = ctx.throttler.active(), "{msg}");
        conn.respond(&BlockOpResponse::new(Status::Error).with_message(msg)).await?;
        return Ok(());
    };

    match pull_from_proxy(ctx, &req, &block).await {
        Ok(moved) => {
            tracing::info!(
                block = %moved,
                peer = %conn.peer(),
                proxy = %req.proxy_source,
                del_hint = %req.del_hint,
                "moved block"
            );
            conn.respond(&BlockOpResponse::success()).await?;
            Ok(())
        }
        Err(e) => {
            let msg = format!("replace of {block} from {} failed: {e}", req.proxy_source);
            tracing::info!(block = %block, proxy = %req.proxy_source, error = %e, "replace failed");
            if let Err(reply_err) = conn
                .respond(&BlockOpResponse::new(Status::Error).with_message(msg))
                .await
            {
                tracing::warn!(peer = %conn.peer(), error = %reply_err, "could not deliver replace failure");
            }
            Err(e)
        }
    }
}

/// Copy `req.block` from the proxy source into a local replica.
async fn pull_from_proxy(
    ctx: &NodeContext,
    req: &ReplaceBlockRequest,
    block: &BlockIdentity,
) -> Result<BlockIdentity, TransferError> {
    let transfer = &ctx.config.transfer;
    let mut proxy = PeerConnection::connect(
        &req.proxy_source,
        transfer.socket_timeout(),
        transfer.socket_timeout(),
        transfer.write_timeout(),
    )
    .await?;

    let copy = CopyBlockRequest {
        block: req.block.clone(),
        token: req.token.clone(),
    };
    proxy.send_request(&Request::CopyBlock(copy)).await?;
    let response = proxy.read_response().await?;
    if !response.is_success() {
        let reason = if response.status == Status::ErrorAccessToken {
            "access token error".to_string()
        } else {
            response.message.unwrap_or_else(|| format!("{:?}", response.status))
        };
        return Err(TransferError::downstream(
            proxy.addr.clone(),
            format!("copy of {block} failed: {reason}"),
        ));
    }
    let info = response
        .checksum_info
        .ok_or_else(|| TransferError::Protocol("copy response carries no checksum info".into()))?;

    // A source that sends no checksums leaves us to choose our own.
    let stored = if info.checksum.checksum_type == ChecksumType::Null {
        transfer.checksum()
    } else {
        info.checksum
    };
    let writer = ctx.store.create_temporary(block, stored)?;
    let receiver = BlockReceiver::new(writer, info.checksum, transfer.socket_timeout(), MirrorLink::none())?;
    let received = receiver
        .receive(ctx, &mut proxy.reader, Some(&ctx.throttler))
        .await?;

    let del_hint = Some(req.del_hint.as_str()).filter(|h| !h.is_empty());
    let moved = ctx.close_block(&received.block, del_hint)?;

    if let Err(e) = proxy.read_copy_marker().await {
        tracing::debug!(block = %moved, proxy = %proxy.addr, error = %e, "no copy completion marker");
    }
    Ok(moved)
}

/// TRANSFER_BLOCK handler.
pub async fn transfer_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: TransferBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::TransferBlock, &req.token, &req.block, AccessMode::Copy, &ctx.xfer_addr)
        .await?;
    if req.targets.is_empty() {
        return Err(TransferError::Protocol(format!("transfer of {} names no targets", req.block)));
    }

    let Some(_permit) = ctx.throttler.try_acquire() else {
        let msg = format!(
            "not able to transfer block {} because the move quota is exceeded",
            req.block.block_id
        );
        tracing::warn!(block = %req.block, active = ctx.throttler.active(), "{msg}");
        conn.respond(&BlockOpResponse::new(Status::Error).with_message(msg)).await?;
        return Ok(());
    };

    match push_replica(ctx, &req).await {
        Ok(sent) => {
            tracing::info!(
                block = %req.block,
                target = %req.targets[0],
                bytes = sent,
                "transferred block"
            );
            conn.respond(&BlockOpResponse::success()).await?;
            Ok(())
        }
        Err(e) => {
            let msg = format!("transfer of {} to {} failed: {e}", req.block, req.targets[0]);
            if let Err(reply_err) = conn
                .respond(&BlockOpResponse::new(Status::Error).with_message(msg))
                .await
            {
                tracing::warn!(peer = %conn.peer(), error = %reply_err, "could not deliver transfer failure");
            }
            Err(e)
        }
    }
}

/// Stream the local replica to `targets[0]` in a transfer stage and wait
/// for its close-ack. The caller's token is forwarded and must also grant
/// WRITE on the target.
async fn push_replica(ctx: &NodeContext, req: &TransferBlockRequest) -> Result<u64, TransferError> {
    let replica = ctx
        .store
        .replica(&req.block.pool_id, req.block.block_id)
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("replica not found: {}", req.block))
        })?;
    let stage = match replica.state {
        ReplicaState::Finalized => PipelineStage::TransferFinalized,
        ReplicaState::Rbw => PipelineStage::TransferRbw,
        ReplicaState::Temporary => {
            return Err(TransferError::Protocol(format!(
                "cannot transfer temporary replica {}",
                replica.block
            )))
        }
    };

    let transfer = &ctx.config.transfer;
    let mut sender = BlockSender::new(ctx.store.as_ref(), &req.block, 0, -1, true, transfer.packet_size)?;

    let target = &req.targets[0];
    let mut peer = PeerConnection::connect_with(target, transfer, req.targets.len()).await?;
    let write = WriteBlockRequest {
        block: sender.block().clone(),
        token: req.token.clone(),
        client_name: req.client_name.clone(),
        targets: req.targets[1..].to_vec(),
        source: Some(ctx.xfer_addr.clone()),
        stage,
        pipeline_size: req.targets.len() as u32,
        min_bytes_rcvd: 0,
        max_bytes_rcvd: 0,
        latest_generation_stamp: sender.block().generation_stamp,
        requested_checksum: sender.checksum_info().checksum,
    };
    peer.send_request(&Request::WriteBlock(write)).await?;
    tracing::debug!(block = %sender.block(), target = %target, stage = %stage, "transfer started");

    let sent = sender.send_block(&mut peer.writer, Some(&ctx.throttler)).await?;

    let close_ack = peer.read_response().await?;
    if !close_ack.is_success() {
        return Err(TransferError::downstream(
            target.clone(),
            format!(
                "close-ack {:?}{}",
                close_ack.status,
                close_ack.message.map(|m| format!(": {m}")).unwrap_or_default()
            ),
        ));
    }
    Ok(sent)
}
