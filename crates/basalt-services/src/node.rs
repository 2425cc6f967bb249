//! Shared per-node state handed to every connection task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use basalt_core::config::NodeConfig;
use basalt_core::message::BlockIdentity;
use basalt_core::wire::Op;

use crate::error::TransferError;
use crate::storage::BlockStore;
use crate::throttle::BalanceThrottler;
use crate::token::{AccessGuard, TokenVerifier};

/// The node's block-announcement mechanism.
pub trait BlockAnnouncer: Send + Sync {
    /// A replica was finalized here. `del_hint` names a node whose copy
    /// may now be removed.
    fn block_received(&self, block: &BlockIdentity, del_hint: Option<&str>);
}

/// Announcer that only logs.
pub struct LogAnnouncer;

impl BlockAnnouncer for LogAnnouncer {
    fn block_received(&self, block: &BlockIdentity, del_hint: Option<&str>) {
        tracing::info!(block = %block, del_hint = del_hint.unwrap_or(""), "block received");
    }
}

/// One live data-transfer connection.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: String,
    pub since: Instant,
    pub op: Option<Op>,
}

pub struct NodeContext {
    pub config: NodeConfig,
    pub store: Arc<dyn BlockStore>,
    pub guard: AccessGuard,
    pub throttler: BalanceThrottler,
    pub announcer: Arc<dyn BlockAnnouncer>,
    /// Address advertised to peers and reported as `first_bad_link`.
    pub xfer_addr: String,
    peers: DashMap<u64, PeerEntry>,
    next_peer: AtomicU64,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn BlockStore>,
        verifier: Arc<dyn TokenVerifier>,
        announcer: Arc<dyn BlockAnnouncer>,
        bound: SocketAddr,
    ) -> Self {
        let xfer_addr = if config.node.xfer_addr.is_empty() {
            bound.to_string()
        } else {
            config.node.xfer_addr.clone()
        };
        let guard = AccessGuard::new(config.security.block_token_enabled, verifier);
        let throttler = BalanceThrottler::new(
            config.balancer.max_concurrent_moves,
            config.balancer.bandwidth_per_sec,
        );
        Self {
            config,
            store,
            guard,
            throttler,
            announcer,
            xfer_addr,
            peers: DashMap::new(),
            next_peer: AtomicU64::new(0),
        }
    }

    /// Register a connection. The returned handle releases it on drop.
    pub fn register_peer(self: &Arc<Self>, addr: String) -> PeerHandle {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.peers.insert(
            id,
            PeerEntry {
                addr,
                since: Instant::now(),
                op: None,
            },
        );
        PeerHandle {
            ctx: Arc::clone(self),
            id,
        }
    }

    pub fn active_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerEntry> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Finalize a replica and announce it.
    pub fn close_block(
        &self,
        block: &BlockIdentity,
        del_hint: Option<&str>,
    ) -> Result<BlockIdentity, TransferError> {
        let finalized = self.store.finalize_block(block)?;
        self.announcer.block_received(&finalized, del_hint);
        Ok(finalized)
    }
}

/// Registration of one connection in the node's peer table.
pub struct PeerHandle {
    ctx: Arc<NodeContext>,
    id: u64,
}

impl PeerHandle {
    pub fn set_op(&self, op: Op) {
        if let Some(mut entry) = self.ctx.peers.get_mut(&self.id) {
            entry.op = Some(op);
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.ctx.peers.remove(&self.id);
    }
}
