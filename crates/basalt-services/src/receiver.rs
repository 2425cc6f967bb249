//! Block receiver — consumes a packet stream into a replica.
//!
//! Each packet is forwarded to the mirror (if any) before it is verified
//! and written locally. Checksums stored on disk are recomputed in the
//! replica's own checksum units, so a stream that starts inside a partial
//! unit (append) rewrites that unit's checksum.
//!
//! In ack mode every packet, including LAST, is answered upstream with a
//! `PipelineAck` whose first reply is this node's and whose remaining
//! replies come from the mirror. The replica is finalized before the ack
//! for LAST is sent.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use basalt_core::checksum::{ChecksumSpec, ChecksumType, ChunkedChecksummer};
use basalt_core::codec::{self, Packet};
use basalt_core::message::{BlockIdentity, PipelineAck};
use basalt_core::wire::Status;

use crate::client::PeerConnection;
use crate::error::{timed, TransferError};
use crate::node::NodeContext;
use crate::storage::ReplicaWriter;
use crate::throttle::BalanceThrottler;

/// Downstream half of a pipeline. A mirror that fails is dropped and
/// remembered as failed; the local write carries on.
pub struct MirrorLink {
    conn: Option<PeerConnection>,
    failed: bool,
}

impl MirrorLink {
    pub fn none() -> Self {
        Self {
            conn: None,
            failed: false,
        }
    }

    pub fn new(conn: Option<PeerConnection>) -> Self {
        Self { conn, failed: false }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn conn_mut(&mut self) -> Option<&mut PeerConnection> {
        self.conn.as_mut()
    }

    pub fn into_conn(self) -> Option<PeerConnection> {
        self.conn
    }

    fn fail(&mut self) {
        self.conn = None;
        self.failed = true;
    }

    async fn forward(&mut self, block: &BlockIdentity, packet: &Packet) {
        let Some(mirror) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = mirror.send_packet(packet).await {
            tracing::warn!(
                block = %block,
                mirror = %mirror.addr,
                seqno = packet.seqno,
                error = %e,
                "mirror write failed, continuing without mirror"
            );
            self.fail();
        }
    }

    /// Replies for `seqno` from the mirror onwards.
    async fn downstream_replies(&mut self, block: &BlockIdentity, seqno: u64) -> Vec<Status> {
        let Some(mirror) = self.conn.as_mut() else {
            return if self.failed { vec![Status::Error] } else { Vec::new() };
        };
        match mirror.read_ack().await {
            Ok(ack) if ack.seqno == seqno => ack.replies,
            Ok(ack) => {
                tracing::warn!(
                    block = %block,
                    mirror = %mirror.addr,
                    expected = seqno,
                    got = ack.seqno,
                    "mirror ack out of order"
                );
                self.fail();
                vec![Status::Error]
            }
            Err(e) => {
                tracing::warn!(block = %block, mirror = %mirror.addr, seqno, error = %e, "mirror ack failed");
                self.fail();
                vec![Status::Error]
            }
        }
    }
}

/// What a finished receive hands back to the caller.
pub struct ReceivedBlock {
    /// The replica as written: finalized in ack mode, otherwise still in
    /// its write state.
    pub block: BlockIdentity,
    pub bytes: u64,
    pub mirror: MirrorLink,
}

pub struct BlockReceiver {
    writer: Box<dyn ReplicaWriter>,
    /// Checksum the sender computed over each packet.
    incoming: ChecksumSpec,
    summer: ChunkedChecksummer,
    read_timeout: Duration,
    mirror: MirrorLink,
}

impl BlockReceiver {
    pub fn new(
        mut writer: Box<dyn ReplicaWriter>,
        incoming: ChecksumSpec,
        read_timeout: Duration,
        mirror: MirrorLink,
    ) -> Result<Self, TransferError> {
        let partial = writer.last_partial_unit()?;
        let summer = ChunkedChecksummer::with_partial(writer.checksum(), partial);
        Ok(Self {
            writer,
            incoming,
            summer,
            read_timeout,
            mirror,
        })
    }

    /// Receive without acknowledging packets.
    pub async fn receive<R>(
        self,
        ctx: &NodeContext,
        input: &mut R,
        throttler: Option<&BalanceThrottler>,
    ) -> Result<ReceivedBlock, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.run::<R, tokio::io::Sink>(ctx, input, None, throttler).await
    }

    /// Receive, acking every packet to `upstream` and finalizing the
    /// replica on LAST.
    pub async fn receive_with_acks<R, W>(
        self,
        ctx: &NodeContext,
        input: &mut R,
        upstream: &mut W,
    ) -> Result<ReceivedBlock, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.run(ctx, input, Some(upstream), None).await
    }

    async fn run<R, W>(
        mut self,
        ctx: &NodeContext,
        input: &mut R,
        mut upstream: Option<&mut W>,
        throttler: Option<&BalanceThrottler>,
    ) -> Result<ReceivedBlock, TransferError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let block = self.writer.block().clone();
        let mut received = 0u64;
        let mut sums = Vec::new();

        let last_seqno = loop {
            let packet = timed(self.read_timeout, "reading packet", codec::read_packet(input)).await?;
            self.mirror.forward(&block, &packet).await;
            if packet.last {
                break packet.seqno;
            }

            if let Err(e) = self.check(&packet) {
                if let Some(up) = upstream.as_deref_mut() {
                    let nack = PipelineAck {
                        seqno: packet.seqno,
                        replies: vec![Status::Error],
                    };
                    let _ = codec::write_message(up, &nack).await;
                }
                return Err(e);
            }

            sums.clear();
            self.summer.update(&packet.data, &mut sums);
            self.writer.write_data(&packet.data)?;
            self.writer.write_checksums(&sums)?;
            received += packet.data.len() as u64;
            tracing::trace!(block = %block, seqno = packet.seqno, len = packet.data.len(), "packet written");

            if let Some(throttler) = throttler {
                throttler.throttle(packet.data.len()).await;
            }
            if let Some(up) = upstream.as_deref_mut() {
                self.ack(up, &block, packet.seqno).await?;
            }
        };

        let BlockReceiver {
            mut writer,
            summer,
            mut mirror,
            ..
        } = self;
        sums.clear();
        let last_checksum = summer.finish(&mut sums);
        writer.write_checksums(&sums)?;
        let len = writer.bytes_on_disk();
        writer.set_last_checksum_and_len(len, &last_checksum)?;
        let mut written = writer.block().clone();
        writer.close()?;

        if let Some(up) = upstream {
            written = ctx.close_block(&written, None)?;
            let mut replies = vec![Status::Success];
            replies.extend(mirror.downstream_replies(&block, last_seqno).await);
            codec::write_message(up, &PipelineAck { seqno: last_seqno, replies }).await?;
        }

        tracing::debug!(block = %written, bytes = received, "receive complete");
        Ok(ReceivedBlock {
            block: written,
            bytes: received,
            mirror,
        })
    }

    fn check(&self, packet: &Packet) -> Result<(), TransferError> {
        let expected = self.writer.bytes_on_disk();
        if packet.offset_in_block != expected {
            return Err(TransferError::Protocol(format!(
                "packet {} starts at {} but replica has {expected} bytes",
                packet.seqno, packet.offset_in_block
            )));
        }
        if self.incoming.checksum_type == ChecksumType::Null {
            return Ok(());
        }
        let want = self.incoming.checksum_len(packet.data.len() as u64);
        if packet.checksums.len() != want {
            return Err(TransferError::Protocol(format!(
                "packet {} carries {} checksum bytes, expected {want}",
                packet.seqno,
                packet.checksums.len()
            )));
        }
        self.incoming.verify_chunked(&packet.data, &packet.checksums)?;
        Ok(())
    }

    async fn ack<W>(&mut self, upstream: &mut W, block: &BlockIdentity, seqno: u64) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut replies = vec![Status::Success];
        replies.extend(self.mirror.downstream_replies(block, seqno).await);
        codec::write_message(upstream, &PipelineAck { seqno, replies }).await?;
        Ok(())
    }
}
