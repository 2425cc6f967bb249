//! Transfer listener.
//!
//! Accepts TCP connections on the transfer address and hands each one to
//! its own task running the operation loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::node::NodeContext;
use crate::xceiver::serve_tcp;

pub struct XferServer {
    listener: TcpListener,
}

impl XferServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind transfer listener on {addr}"))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires. Connections already accepted keep
    /// running on their own tasks.
    pub async fn run(self, ctx: Arc<NodeContext>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, advertised = %ctx.xfer_addr, "transfer listener started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(active = ctx.active_peers(), "transfer listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::trace!(peer = %peer, "connection accepted");
                    tokio::spawn(serve_tcp(ctx.clone(), stream));
                }
            }
        }
    }
}
