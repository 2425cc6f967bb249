//! Block Reader — streams a replica's bytes as checksummed packets.
//!
//! Packets start on checksum-unit boundaries and carry the checksums stored
//! in the replica's metadata stream, not recomputed ones.

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use basalt_core::checksum::{ChecksumSpec, ChecksumType};
use basalt_core::codec::{self, Packet};
use basalt_core::message::{
    AccessMode, BlockIdentity, BlockOpResponse, ClientReadStatus, ReadBlockRequest,
    ReadOpChecksumInfo,
};
use basalt_core::wire::{Op, Status, METADATA_HEADER_LEN};

use crate::error::{timed, TransferError};
use crate::node::NodeContext;
use crate::storage::{BlockStore, ReadSeek};
use crate::throttle::BalanceThrottler;
use crate::xceiver::ConnState;

pub struct BlockSender {
    block: BlockIdentity,
    /// Checksum spec stored with the replica.
    stored: ChecksumSpec,
    send_checksum: bool,
    data: Box<dyn ReadSeek>,
    meta: Option<Box<dyn ReadSeek>>,
    /// First byte sent, aligned down to a checksum unit.
    start: u64,
    end: u64,
    replica_len: u64,
    packet_data: usize,
}

impl BlockSender {
    /// Open `block` for sending `[offset, offset + length)`; a negative
    /// length means to the end of the replica.
    pub fn new(
        store: &dyn BlockStore,
        block: &BlockIdentity,
        offset: u64,
        length: i64,
        send_checksum: bool,
        packet_size: usize,
    ) -> Result<Self, TransferError> {
        let replica = store
            .replica(&block.pool_id, block.block_id)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("replica not found: {block}"))
            })?;
        let replica_len = replica.block.num_bytes;

        let end = if length < 0 {
            replica_len
        } else {
            offset.saturating_add(length as u64)
        };
        if offset > replica_len || end > replica_len {
            return Err(TransferError::Protocol(format!(
                "offset {offset} and length {length} don't match {block} of {replica_len} bytes"
            )));
        }

        let mut meta = store.metadata_input(&replica.block)?;
        let mut header = [0u8; METADATA_HEADER_LEN];
        meta.read_exact(&mut header)?;
        let stored = ChecksumSpec::from_header_bytes(&header)?;
        let unit = stored.bytes_per_checksum as u64;

        let start = offset - offset % unit;
        // Round the end up to a unit boundary, but never past the replica.
        let end = if end % unit == 0 {
            end
        } else {
            (end + unit - end % unit).min(replica_len)
        };

        let data = store.block_input(block, start)?;
        let send_sums = send_checksum && stored.checksum_size() > 0;
        let meta = if send_sums {
            let sums_at = METADATA_HEADER_LEN as u64 + (start / unit) * stored.checksum_size() as u64;
            meta.seek(SeekFrom::Start(sums_at))?;
            Some(meta)
        } else {
            None
        };

        let packet_data = ((packet_size / unit as usize).max(1)) * unit as usize;
        Ok(Self {
            block: replica.block,
            stored,
            send_checksum: send_sums,
            data,
            meta,
            start,
            end,
            replica_len,
            packet_data,
        })
    }

    /// Checksum parameters the reader needs before data arrives.
    pub fn checksum_info(&self) -> ReadOpChecksumInfo {
        let checksum = if self.send_checksum {
            self.stored
        } else {
            ChecksumSpec::new(ChecksumType::Null, self.stored.bytes_per_checksum)
        };
        ReadOpChecksumInfo {
            checksum,
            chunk_offset: self.start,
        }
    }

    /// Checksum spec stored with the replica.
    pub fn stored_checksum(&self) -> ChecksumSpec {
        self.stored
    }

    pub fn block(&self) -> &BlockIdentity {
        &self.block
    }

    pub fn covers_whole_block(&self) -> bool {
        self.start == 0 && self.end == self.replica_len
    }

    /// Stream the range as packets, then the LAST packet. Returns data
    /// bytes sent.
    pub async fn send_block<W>(
        &mut self,
        out: &mut W,
        throttler: Option<&BalanceThrottler>,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut pos = self.start;
        let mut seqno = 0u64;
        let mut buf = vec![0u8; self.packet_data];

        while pos < self.end {
            let n = (self.end - pos).min(self.packet_data as u64) as usize;
            self.data.read_exact(&mut buf[..n])?;
            let checksums = match &mut self.meta {
                Some(meta) => {
                    let mut sums = vec![0u8; self.stored.checksum_len(n as u64)];
                    meta.read_exact(&mut sums)?;
                    Bytes::from(sums)
                }
                None => Bytes::new(),
            };
            let packet = Packet {
                offset_in_block: pos,
                seqno,
                last: false,
                checksums,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            codec::write_packet(out, &packet).await?;
            if let Some(throttler) = throttler {
                throttler.throttle(n).await;
            }
            tracing::trace!(block = %self.block, seqno, offset = pos, len = n, "packet sent");
            pos += n as u64;
            seqno += 1;
        }

        codec::write_packet(out, &Packet::last(pos, seqno)).await?;
        Ok(pos - self.start)
    }
}

/// READ_BLOCK handler.
pub async fn read_block<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    req: ReadBlockRequest,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    ctx.guard
        .check_and_reply(conn, Op::ReadBlock, &req.token, &req.block, AccessMode::Read, &ctx.xfer_addr)
        .await?;

    let mut sender = match BlockSender::new(
        ctx.store.as_ref(),
        &req.block,
        req.offset,
        req.length,
        req.send_checksum,
        ctx.config.transfer.packet_size,
    ) {
        Ok(sender) => sender,
        Err(e) => {
            let response = BlockOpResponse::new(Status::Error)
                .with_message(format!("opening {} for read failed: {e}", req.block));
            conn.respond(&response).await?;
            return Err(e);
        }
    };

    let mut response = BlockOpResponse::success();
    response.checksum_info = Some(sender.checksum_info());
    conn.respond(&response).await?;

    let sent = sender.send_block(&mut conn.writer, None).await?;

    // A reader that does not confirm the range with a SUCCESS status loses
    // the connection; whatever it sent instead is not served.
    let lapse = match timed(
        ctx.config.transfer.socket_timeout(),
        "reading client read status",
        codec::read_message::<_, ClientReadStatus>(&mut conn.reader),
    )
    .await
    {
        Ok(status) if status.status.is_success() => None,
        Ok(status) => Some(format!("client reported {:?}", status.status)),
        Err(e) => Some(e.to_string()),
    };

    tracing::info!(
        block = %req.block,
        peer = %conn.peer(),
        client = %req.client_name,
        offset = req.offset,
        bytes = sent,
        "served block"
    );

    if let Some(reason) = lapse {
        tracing::info!(block = %req.block, peer = %conn.peer(), reason = %reason, "no read status, closing");
        if let Err(e) = conn.writer.shutdown().await {
            tracing::debug!(peer = %conn.peer(), error = %e, "shutdown after read failed");
        }
        return Err(TransferError::Closed(format!("no read status for {}: {reason}", req.block)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{put_block, scratch_dir};
    use crate::storage::FsBlockStore;

    fn fixture(tag: &str, len: usize) -> (FsBlockStore, BlockIdentity, Vec<u8>) {
        let dir = scratch_dir(tag);
        let store = FsBlockStore::open(&dir).unwrap();
        let block = BlockIdentity::new("BP-1", 1, 1, 0);
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        put_block(&store, &block, ChecksumSpec::new(ChecksumType::Crc32c, 64), &data);
        (store, block, data)
    }

    async fn collect(mut sender: BlockSender) -> (Vec<Packet>, u64) {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let sent = sender.send_block(&mut a, None).await.unwrap();
        drop(a);
        let mut packets = Vec::new();
        loop {
            let p = codec::read_packet(&mut b).await.unwrap();
            let last = p.last;
            packets.push(p);
            if last {
                break;
            }
        }
        (packets, sent)
    }

    #[tokio::test]
    async fn whole_block_with_stored_checksums() {
        let (store, block, data) = fixture("sender-whole", 1000);
        let sender = BlockSender::new(&store, &block, 0, -1, true, 256).unwrap();
        assert!(sender.covers_whole_block());
        let info = sender.checksum_info();
        assert_eq!(info.chunk_offset, 0);

        let (packets, sent) = collect(sender).await;
        assert_eq!(sent, 1000);
        // 256-byte packets: 4 data packets + LAST.
        assert_eq!(packets.len(), 5);
        let mut joined = Vec::new();
        for p in &packets[..4] {
            info.checksum.verify_chunked(&p.data, &p.checksums).unwrap();
            joined.extend_from_slice(&p.data);
        }
        assert_eq!(joined, data);
        assert!(packets[4].data.is_empty());
        let _ = std::fs::remove_dir_all(store.data_root());
    }

    #[tokio::test]
    async fn range_is_unit_aligned() {
        let (store, block, data) = fixture("sender-range", 1000);
        let sender = BlockSender::new(&store, &block, 100, 50, true, 4096).unwrap();
        let info = sender.checksum_info();
        assert_eq!(info.chunk_offset, 64);
        assert!(!sender.covers_whole_block());

        let (packets, sent) = collect(sender).await;
        // [64, 192) covers the requested [100, 150).
        assert_eq!(sent, 128);
        assert_eq!(packets[0].offset_in_block, 64);
        assert_eq!(&packets[0].data[..], &data[64..192]);
        let _ = std::fs::remove_dir_all(store.data_root());
    }

    #[tokio::test]
    async fn without_checksums_reports_null_type() {
        let (store, block, _) = fixture("sender-nosum", 300);
        let sender = BlockSender::new(&store, &block, 0, -1, false, 4096).unwrap();
        assert_eq!(sender.checksum_info().checksum.checksum_type, ChecksumType::Null);
        let (packets, _) = collect(sender).await;
        assert!(packets[0].checksums.is_empty());
        let _ = std::fs::remove_dir_all(store.data_root());
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let (store, block, _) = fixture("sender-oob", 300);
        assert!(matches!(
            BlockSender::new(&store, &block, 200, 200, true, 4096),
            Err(TransferError::Protocol(_))
        ));
        assert!(BlockSender::new(&store, &block, 301, -1, true, 4096).is_err());
        let missing = BlockIdentity::new("BP-1", 2, 1, 0);
        assert!(matches!(
            BlockSender::new(&store, &missing, 0, -1, true, 4096),
            Err(TransferError::Io(_))
        ));
        let _ = std::fs::remove_dir_all(store.data_root());
    }

    #[tokio::test]
    async fn read_block_handler_round_trip() {
        use crate::node::tests::test_context;
        use basalt_core::config::NodeConfig;
        use basalt_core::message::AccessToken;

        let (ctx, store, _) = test_context("sender-handler", NodeConfig::default());
        let block = BlockIdentity::new("BP-1", 3, 1, 0);
        let data = vec![0x5au8; 5000];
        put_block(&store, &block, ChecksumSpec::default(), &data);

        let (client, server) = tokio::io::duplex(1 << 20);
        let (server_r, server_w) = tokio::io::split(server);
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let mut conn = ConnState::new(server_r, server_w, "test".into());

        let req = ReadBlockRequest {
            block: block.clone(),
            token: AccessToken::default(),
            client_name: "reader".into(),
            offset: 0,
            length: -1,
            send_checksum: true,
        };
        let server_task = tokio::spawn(async move { read_block(&ctx, &mut conn, req).await });

        let response: BlockOpResponse = codec::read_message(&mut client_r).await.unwrap();
        assert!(response.is_success());
        let info = response.checksum_info.unwrap();
        let mut got = Vec::new();
        loop {
            let p = codec::read_packet(&mut client_r).await.unwrap();
            if p.last {
                break;
            }
            info.checksum.verify_chunked(&p.data, &p.checksums).unwrap();
            got.extend_from_slice(&p.data);
        }
        codec::write_message(&mut client_w, &ClientReadStatus { status: Status::Success })
            .await
            .unwrap();
        server_task.await.unwrap().unwrap();
        assert_eq!(got, data);
        let _ = std::fs::remove_dir_all(store.data_root());
    }
}
