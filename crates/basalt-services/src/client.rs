//! Client role of the transfer protocol.
//!
//! Nodes use it to reach mirrors, proxy sources and segment targets; tools
//! and tests use it to read and write blocks.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use basalt_core::checksum::ChecksumSpec;
use basalt_core::codec::{self, Packet};
use basalt_core::config::TransferConfig;
use basalt_core::message::{BlockOpResponse, ClientReadStatus, PipelineAck, ReadOpChecksumInfo, Request};
use basalt_core::wire::{Status, WireError, COPY_COMPLETE_MARKER};

use crate::error::{timed, TransferError};

/// Outbound connection to another node.
pub struct PeerConnection {
    pub addr: String,
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: BufWriter<OwnedWriteHalf>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl PeerConnection {
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, TransferError> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransferError::downstream(addr, e)),
            Err(_) => return Err(TransferError::downstream(addr, "connect timed out")),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| TransferError::downstream(addr, e))?;
        let (r, w) = stream.into_split();
        tracing::debug!(peer = addr, "connected");
        Ok(Self {
            addr: addr.to_string(),
            reader: BufReader::new(r),
            writer: BufWriter::new(w),
            read_timeout,
            write_timeout,
        })
    }

    /// Connect with the node's timeouts, extended for `downstream` nodes
    /// behind the peer.
    pub async fn connect_with(
        addr: &str,
        transfer: &TransferConfig,
        downstream: usize,
    ) -> Result<Self, TransferError> {
        Self::connect(
            addr,
            transfer.socket_timeout(),
            transfer.mirror_read_timeout(downstream),
            transfer.mirror_write_timeout(downstream),
        )
        .await
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<(), TransferError> {
        timed(
            self.write_timeout,
            "sending request",
            codec::write_request(&mut self.writer, request),
        )
        .await
    }

    pub async fn read_response(&mut self) -> Result<BlockOpResponse, TransferError> {
        timed(
            self.read_timeout,
            "reading response",
            codec::read_message(&mut self.reader),
        )
        .await
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), TransferError> {
        timed(
            self.write_timeout,
            "sending packet",
            codec::write_packet(&mut self.writer, packet),
        )
        .await
    }

    pub async fn read_packet(&mut self) -> Result<Packet, TransferError> {
        timed(self.read_timeout, "reading packet", codec::read_packet(&mut self.reader)).await
    }

    pub async fn read_ack(&mut self) -> Result<PipelineAck, TransferError> {
        timed(self.read_timeout, "reading ack", codec::read_message(&mut self.reader)).await
    }

    /// Read the trailing marker a copy source sends after its data.
    pub async fn read_copy_marker(&mut self) -> Result<(), TransferError> {
        let mut marker = [0u8; 2];
        timed(self.read_timeout, "reading copy marker", async {
            self.reader.read_exact(&mut marker).await.map_err(WireError::from)
        })
        .await?;
        if marker != COPY_COMPLETE_MARKER {
            return Err(TransferError::Protocol(format!(
                "bad copy completion marker {marker:02x?}"
            )));
        }
        Ok(())
    }

    /// Push one delta-sync segment: length and Adler-32 prefix, then bytes.
    pub async fn send_segment(&mut self, data: &[u8], adler: u32) -> Result<(), TransferError> {
        timed(self.write_timeout, "sending segment", async {
            codec::write_segment_header(&mut self.writer, data.len() as u64, adler).await?;
            self.writer.write_all(data).await?;
            self.writer.flush().await?;
            Ok::<_, WireError>(())
        })
        .await
    }

    /// Read a block stream up to its LAST packet, verifying checksums
    /// against `info`. Returns the data and the offset of its first byte.
    pub async fn receive_block_data(
        &mut self,
        info: &ReadOpChecksumInfo,
    ) -> Result<(u64, Vec<u8>), TransferError> {
        let mut data = Vec::new();
        let mut start = None;
        loop {
            let packet = self.read_packet().await?;
            if packet.last {
                break;
            }
            start.get_or_insert(packet.offset_in_block);
            if !packet.checksums.is_empty() {
                info.checksum.verify_chunked(&packet.data, &packet.checksums)?;
            }
            data.extend_from_slice(&packet.data);
        }
        Ok((start.unwrap_or(info.chunk_offset), data))
    }

    /// Acknowledge a complete read.
    pub async fn send_read_status(&mut self, status: Status) -> Result<(), TransferError> {
        timed(
            self.write_timeout,
            "sending read status",
            codec::write_message(&mut self.writer, &ClientReadStatus { status }),
        )
        .await
    }

    /// Stream `data` as packets starting at `offset_in_block`, ending with
    /// an empty LAST packet. When `expect_acks` is set, one ack is read per
    /// packet and all are returned.
    pub async fn stream_block(
        &mut self,
        data: &[u8],
        offset_in_block: u64,
        spec: ChecksumSpec,
        packet_size: usize,
        expect_acks: bool,
    ) -> Result<Vec<PipelineAck>, TransferError> {
        let unit = spec.unit();
        let packet_size = (packet_size / unit).max(1) * unit;
        let mut acks = Vec::new();
        let mut offset = offset_in_block;
        let mut seqno = 0u64;

        for piece in data.chunks(packet_size) {
            let mut sums = Vec::with_capacity(spec.checksum_len(piece.len() as u64));
            spec.chunked_sums(piece, &mut sums);
            let packet = Packet {
                offset_in_block: offset,
                seqno,
                last: false,
                checksums: Bytes::from(sums),
                data: Bytes::copy_from_slice(piece),
            };
            self.send_packet(&packet).await?;
            if expect_acks {
                acks.push(self.read_ack().await?);
            }
            offset += piece.len() as u64;
            seqno += 1;
        }

        self.send_packet(&Packet::last(offset, seqno)).await?;
        if expect_acks {
            acks.push(self.read_ack().await?);
        }
        Ok(acks)
    }
}
