//! Write Pipeline — WRITE_BLOCK.
//!
//! Opens a local replica according to the pipeline stage, connects to the
//! first downstream target and forwards the request with the remaining
//! targets, then receives the block while mirroring it.
//!
//! Client writes (outside the transfer stages) get a connect-ack before any
//! data and a `PipelineAck` per packet. Node-originated writes and transfer
//! stages get neither; transfer stages end with an explicit close-ack.

use tokio::io::{AsyncRead, AsyncWrite};

use basalt_core::message::{
    AccessMode, BlockIdentity, BlockOpResponse, PipelineStage, Request, WriteBlockRequest,
};
use basalt_core::wire::{Op, Status};

use crate::client::PeerConnection;
use crate::error::TransferError;
use crate::node::NodeContext;
use crate::receiver::{BlockReceiver, MirrorLink};
use crate::storage::ReplicaWriter;
use crate::xceiver::ConnState;

/// WRITE_BLOCK handler.
pub async fn write_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: WriteBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let is_client = req.is_client();
    let is_transfer = req.stage.is_transfer();
    if is_transfer && req.targets.len() > 1 {
        return Err(TransferError::Protocol(format!(
            "{} does not support multiple targets {:?}",
            req.stage, req.targets
        )));
    }

    // Mirrors get the block exactly as requested; the local length is a
    // placeholder until the data has arrived.
    let original = req.block.clone();
    let mut block = req.block.clone();
    block.num_bytes = ctx.config.transfer.estimate_block_size;

    ctx.guard
        .check_and_reply(conn, Op::WriteBlock, &req.token, &original, AccessMode::Write, &ctx.xfer_addr)
        .await?;

    tracing::info!(
        block = %block,
        peer = %conn.peer(),
        stage = %req.stage,
        client = %req.client_name,
        targets = req.targets.len(),
        "receiving block"
    );

    let close_recovery = is_client && req.stage == PipelineStage::PipelineCloseRecovery;
    let writer = if close_recovery {
        block = ctx
            .store
            .recover_close(&block, req.latest_generation_stamp, req.min_bytes_rcvd)?;
        None
    } else {
        Some(open_replica(ctx, &req, &block)?)
    };

    let mut mirror = None;
    let mut mirror_status = Status::Success;
    let mut first_bad_link = String::new();
    if let Some(target) = req.targets.first() {
        match connect_mirror(ctx, &req, &original).await {
            Ok((peer, connect_ack)) => {
                if let Some(ack) = connect_ack {
                    mirror_status = ack.status;
                    first_bad_link = ack.bad_link().unwrap_or_default().to_string();
                    if !ack.is_success() {
                        tracing::info!(
                            block = %block,
                            mirror = %target,
                            first_bad_link = %first_bad_link,
                            "downstream connect ack reports failure"
                        );
                    }
                }
                mirror = Some(peer);
            }
            Err(e) if is_client => {
                tracing::error!(block = %block, mirror = %target, error = %e, "mirror setup failed");
                let response = BlockOpResponse::new(Status::Error).with_first_bad_link(target.clone());
                conn.respond(&response).await?;
                return Err(e);
            }
            Err(e) => {
                tracing::info!(
                    block = %block,
                    mirror = %target,
                    error = %e,
                    "mirror setup failed, continuing without the mirror"
                );
            }
        }
    }

    if is_client && !is_transfer {
        let mut connect_ack = BlockOpResponse::new(mirror_status);
        if !first_bad_link.is_empty() {
            connect_ack = connect_ack.with_first_bad_link(first_bad_link.clone());
        }
        conn.respond(&connect_ack).await?;
        if !mirror_status.is_success() {
            return Err(TransferError::downstream(
                first_bad_link,
                format!("connect ack {mirror_status:?}"),
            ));
        }
    }

    let Some(writer) = writer else {
        let closed = ctx.close_block(&block, None)?;
        tracing::info!(block = %closed, peer = %conn.peer(), "recovered block closed");
        return Ok(());
    };

    let receiver = BlockReceiver::new(
        writer,
        req.requested_checksum,
        ctx.config.transfer.socket_timeout(),
        MirrorLink::new(mirror),
    )?;

    let received = if is_client && !is_transfer {
        // Finalized by the receiver before the ack for LAST.
        receiver
            .receive_with_acks(ctx, &mut conn.reader, &mut conn.writer)
            .await?
    } else {
        let mut received = receiver.receive(ctx, &mut conn.reader, None).await?;
        received.block = match req.stage {
            PipelineStage::TransferRbw => ctx.store.convert_temporary_to_rbw(&received.block)?,
            _ => ctx.close_block(&received.block, None)?,
        };
        if is_transfer {
            await_mirror_close_ack(&mut received.mirror, &received.block).await;
            conn.respond(&BlockOpResponse::success()).await?;
        }
        received
    };

    tracing::info!(
        block = %received.block,
        peer = %conn.peer(),
        bytes = received.bytes,
        mirror_failed = received.mirror.is_failed(),
        "received block"
    );
    Ok(())
}

/// Open the local replica for `req.stage`.
fn open_replica(
    ctx: &NodeContext,
    req: &WriteBlockRequest,
    block: &BlockIdentity,
) -> Result<Box<dyn ReplicaWriter>, TransferError> {
    let store = ctx.store.as_ref();
    if !req.is_client() || req.stage.is_transfer() {
        return Ok(store.create_temporary(block, req.requested_checksum)?);
    }
    let writer = match req.stage {
        PipelineStage::PipelineSetupCreate => store.create_rbw(block, req.requested_checksum)?,
        PipelineStage::PipelineSetupAppend | PipelineStage::PipelineSetupAppendRecovery => {
            store.append(block, req.latest_generation_stamp)?
        }
        other => {
            return Err(TransferError::Unsupported(format!(
                "{other} cannot open a replica"
            )))
        }
    };
    Ok(writer)
}

/// Connect to `targets[0]` and forward the request with the rest of the
/// targets. Client writes outside the transfer stages also wait for the
/// downstream connect-ack.
async fn connect_mirror(
    ctx: &NodeContext,
    req: &WriteBlockRequest,
    original: &BlockIdentity,
) -> Result<(PeerConnection, Option<BlockOpResponse>), TransferError> {
    let target = &req.targets[0];
    let mut mirror = PeerConnection::connect_with(target, &ctx.config.transfer, req.targets.len()).await?;
    let forwarded = WriteBlockRequest {
        block: original.clone(),
        targets: req.targets[1..].to_vec(),
        ..req.clone()
    };
    mirror.send_request(&Request::WriteBlock(forwarded)).await?;
    let connect_ack = if req.is_client() && !req.stage.is_transfer() {
        Some(mirror.read_response().await?)
    } else {
        None
    };
    Ok((mirror, connect_ack))
}

async fn await_mirror_close_ack(mirror: &mut MirrorLink, block: &BlockIdentity) {
    let Some(peer) = mirror.conn_mut() else {
        return;
    };
    match peer.read_response().await {
        Ok(ack) if ack.is_success() => {}
        Ok(ack) => tracing::warn!(block = %block, mirror = %peer.addr, status = ?ack.status, "mirror close-ack failed"),
        Err(e) => tracing::warn!(block = %block, mirror = %peer.addr, error = %e, "no close-ack from mirror"),
    }
}
