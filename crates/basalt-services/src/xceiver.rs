//! Connection Dispatcher — one task per inbound connection.
//!
//! Reads one operation at a time, routes it to its handler and loops while
//! keep-alive is enabled. The first operation waits up to the socket
//! timeout; later ones up to the keep-alive timeout. A peer that hangs up
//! or idles out after at least one operation ends the loop quietly.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;

use basalt_core::codec;
use basalt_core::message::{BlockOpResponse, Request};
use basalt_core::wire::WireError;

use crate::error::{timed, TransferError};
use crate::node::NodeContext;
use crate::{delta, pipeline, proxy, sender};

/// Per-connection streams and response bookkeeping.
pub struct ConnState<R, W> {
    pub reader: R,
    pub writer: W,
    peer: String,
    responded: bool,
}

impl<R, W> ConnState<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, peer: String) -> Self {
        Self {
            reader,
            writer,
            peer,
            responded: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the current operation has written its response.
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Write the operation's response.
    pub async fn respond(&mut self, response: &BlockOpResponse) -> Result<(), TransferError> {
        self.responded = true;
        codec::write_message(&mut self.writer, response).await?;
        Ok(())
    }

    fn begin_op(&mut self) {
        self.responded = false;
    }
}

/// Serve one accepted TCP connection.
pub async fn serve_tcp(ctx: Arc<NodeContext>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    let conn = ConnState::new(BufReader::new(r), BufWriter::new(w), peer);
    run_connection(ctx, conn).await;
}

/// Operation loop over any stream pair.
pub async fn run_connection<R, W>(ctx: Arc<NodeContext>, mut conn: ConnState<R, W>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    // Released on every exit path.
    let handle = ctx.register_peer(conn.peer.clone());
    let transfer = &ctx.config.transfer;
    let mut ops = 0u64;

    loop {
        let wait = if ops == 0 {
            transfer.socket_timeout()
        } else {
            transfer.keepalive_timeout()
        };
        let request = match timed(wait, "waiting for op", codec::read_request(&mut conn.reader)).await {
            Ok(request) => request,
            Err(e) if ops > 0 && e.is_disconnect() => {
                tracing::debug!(peer = %conn.peer, ops, "connection closed by peer or idle");
                break;
            }
            Err(TransferError::Wire(WireError::UnknownOp(op))) => {
                tracing::warn!(peer = %conn.peer, op, "unsupported op code");
                let response = BlockOpResponse::new(basalt_core::wire::Status::ErrorUnsupported)
                    .with_message(format!("unsupported op code {op}"));
                let _ = conn.respond(&response).await;
                break;
            }
            Err(e) => {
                tracing::error!(peer = %conn.peer, ops, error = %e, "failed to read op");
                break;
            }
        };

        let op = request.op();
        handle.set_op(op);
        conn.begin_op();
        tracing::debug!(peer = %conn.peer, op = %op, block = %request.block(), "op received");

        let result = dispatch(&ctx, &mut conn, request).await;
        ops += 1;

        if let Err(e) = result {
            if !conn.responded() && !e.is_disconnect() {
                let response = BlockOpResponse::new(e.status()).with_message(e.to_string());
                if let Err(reply_err) = conn.respond(&response).await {
                    tracing::debug!(peer = %conn.peer, error = %reply_err, "could not deliver error response");
                }
            }
            if e.is_disconnect() {
                tracing::debug!(peer = %conn.peer, op = %op, error = %e, "connection dropped during op");
            } else {
                tracing::error!(peer = %conn.peer, op = %op, error = %e, "op failed");
            }
            break;
        }

        if transfer.keepalive_timeout_ms == 0 {
            break;
        }
    }

    tracing::debug!(peer = %conn.peer, ops, "connection finished");
}

async fn dispatch<R, W>(
    ctx: &NodeContext,
    conn: &mut ConnState<R, W>,
    request: Request,
) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match request {
        Request::ReadBlock(req) => sender::read_block(ctx, conn, req).await,
        Request::WriteBlock(req) => pipeline::write_block(ctx, conn, req).await,
        Request::TransferBlock(req) => proxy::transfer_block(ctx, conn, req).await,
        Request::CopyBlock(req) => proxy::copy_block(ctx, conn, req).await,
        Request::ReplaceBlock(req) => proxy::replace_block(ctx, conn, req).await,
        Request::BlockChecksum(req) => delta::block_checksum(ctx, conn, req).await,
        Request::ChunksChecksum(req) => delta::chunks_checksum(ctx, conn, req).await,
        Request::CalculateSegments(req) => delta::calculate_segments(ctx, conn, req).await,
        Request::SendSegment(req) => delta::send_segment(ctx, conn, req).await,
        Request::UpdateBlock(req) => delta::update_block(ctx, conn, req).await,
    }
}
