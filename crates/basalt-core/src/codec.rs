//! Async framing over any byte stream.
//!
//! A frame is a `FrameHeader` followed by a JSON body. Packets are a
//! `PacketHeader` followed by checksum bytes and data bytes. Every writer
//! flushes before returning so a peer blocked on a read always sees the
//! whole frame.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use crate::message::Request;
use crate::wire::{
    FrameHeader, Op, PacketHeader, WireError, MAX_PACKET_DATA, OP_RESPONSE, PACKET_FLAG_LAST,
};

const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();
const PACKET_HEADER_LEN: usize = std::mem::size_of::<PacketHeader>();

// ── Frames ────────────────────────────────────────────────────────────────────

async fn write_frame<W>(w: &mut W, op: u8, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader::new(op, body.len());
    w.write_all(header.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R>(r: &mut R) -> Result<(u8, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut buf).await?;
    let header = FrameHeader::read_from(&buf[..]).ok_or(WireError::MessageTooLarge(0))?;
    let len = header.validate()?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok((header.op, body))
}

/// Send one operation request.
pub async fn write_request<W>(w: &mut W, request: &Request) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = request.encode_body()?;
    write_frame(w, request.op().into(), &body).await
}

/// Read one operation request. An unknown op code is an error; the
/// caller decides whether the connection survives it.
pub async fn read_request<R>(r: &mut R) -> Result<Request, WireError>
where
    R: AsyncRead + Unpin,
{
    let (op, body) = read_frame(r).await?;
    let op = Op::try_from(op)?;
    Request::decode(op, &body)
}

/// Send a response, ack or read status.
pub async fn write_message<W, T>(w: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(w, OP_RESPONSE, &body).await
}

/// Read a response, ack or read status.
pub async fn read_message<R, T>(r: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let (op, body) = read_frame(r).await?;
    if op != OP_RESPONSE {
        return Err(WireError::UnexpectedOp(op));
    }
    Ok(serde_json::from_slice(&body)?)
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// One unit of a block data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub offset_in_block: u64,
    pub seqno: u64,
    pub last: bool,
    pub checksums: Bytes,
    pub data: Bytes,
}

impl Packet {
    /// The empty packet that terminates a stream.
    pub fn last(offset_in_block: u64, seqno: u64) -> Self {
        Self {
            offset_in_block,
            seqno,
            last: true,
            checksums: Bytes::new(),
            data: Bytes::new(),
        }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset_in_block + self.data.len() as u64
    }
}

pub async fn write_packet<W>(w: &mut W, packet: &Packet) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let header = PacketHeader::new(
        packet.offset_in_block,
        packet.seqno,
        packet.data.len(),
        packet.checksums.len(),
        packet.last,
    );
    w.write_all(header.as_bytes()).await?;
    w.write_all(&packet.checksums).await?;
    w.write_all(&packet.data).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_packet<R>(r: &mut R) -> Result<Packet, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PACKET_HEADER_LEN];
    r.read_exact(&mut buf).await?;
    let header = PacketHeader::read_from(&buf[..]).ok_or(WireError::PacketTooLarge(0))?;
    if header.flags & !PACKET_FLAG_LAST != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags as u16));
    }
    let data_len = header.data_len.get() as usize;
    let checksum_len = header.checksum_len.get() as usize;
    if data_len > MAX_PACKET_DATA {
        return Err(WireError::PacketTooLarge(data_len));
    }
    if checksum_len > MAX_PACKET_DATA {
        return Err(WireError::PacketTooLarge(checksum_len));
    }

    let mut checksums = vec![0u8; checksum_len];
    r.read_exact(&mut checksums).await?;
    let mut data = vec![0u8; data_len];
    r.read_exact(&mut data).await?;

    Ok(Packet {
        offset_in_block: header.offset_in_block.get(),
        seqno: header.seqno.get(),
        last: header.is_last(),
        checksums: Bytes::from(checksums),
        data: Bytes::from(data),
    })
}

// ── Segment payload ───────────────────────────────────────────────────────────

/// Prefix of a pushed segment: byte count, then the Adler-32 of the bytes.
pub async fn write_segment_header<W>(w: &mut W, length: u64, adler: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u64(length).await?;
    w.write_u64(adler as u64).await?;
    Ok(())
}

pub async fn read_segment_header<R>(r: &mut R) -> Result<(u64, u32), WireError>
where
    R: AsyncRead + Unpin,
{
    let length = r.read_u64().await?;
    let adler = r.read_u64().await?;
    Ok((length, adler as u32))
}
