//! Basalt integration test harness.
//!
//! Each test starts its own nodes in-process on loopback ports and drives
//! them over real TCP with the same client the nodes use between
//! themselves:
//!
//!   cargo test --test integration
//!
//! Nodes shut down and remove their data directory when dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;

use basalt_core::checksum::ChecksumSpec;
use basalt_core::config::NodeConfig;
use basalt_core::message::{
    AccessToken, BlockIdentity, PipelineAck, PipelineStage, ReadBlockRequest, Request,
    WriteBlockRequest,
};
use basalt_core::wire::Status;
use basalt_services::{
    BlockAnnouncer, BlockTokenSecretManager, FsBlockStore, NodeContext, PeerConnection, XferServer,
};

mod balancing;
mod connections;
mod delta;
mod pipeline;
mod read;
mod tokens;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Token key shared by every test node.
pub const TOKEN_KEY: &str = "5f1c0e9a7b3d2c4e6f8a0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e";

pub const POOL: &str = "BP-it";

static NEXT_NODE: AtomicU64 = AtomicU64::new(0);

/// Announcer that keeps every finalized block for assertions.
#[derive(Default)]
pub struct RecordingAnnouncer {
    pub received: Mutex<Vec<(BlockIdentity, Option<String>)>>,
}

impl BlockAnnouncer for RecordingAnnouncer {
    fn block_received(&self, block: &BlockIdentity, del_hint: Option<&str>) {
        self.received
            .lock()
            .unwrap()
            .push((block.clone(), del_hint.map(str::to_string)));
    }
}

impl RecordingAnnouncer {
    pub fn hints(&self) -> Vec<Option<String>> {
        self.received.lock().unwrap().iter().map(|(_, h)| h.clone()).collect()
    }
}

/// One datanode running on a loopback port.
pub struct TestNode {
    pub addr: String,
    pub ctx: Arc<NodeContext>,
    pub store: Arc<FsBlockStore>,
    pub announcer: Arc<RecordingAnnouncer>,
    shutdown: broadcast::Sender<()>,
    root: PathBuf,
}

impl TestNode {
    pub async fn start(tag: &str) -> Self {
        Self::start_with(tag, |_| {}).await
    }

    pub async fn start_with(tag: &str, configure: impl FnOnce(&mut NodeConfig)) -> Self {
        let n = NEXT_NODE.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("basalt-it-{tag}-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);

        let mut config = NodeConfig::default();
        config.node.data_dir = root.clone();
        config.node.listen_addr = "127.0.0.1:0".into();
        config.node.xfer_addr = String::new();
        config.transfer.socket_timeout_ms = 5_000;
        config.transfer.socket_write_timeout_ms = 5_000;
        config.security.block_token_key = TOKEN_KEY.into();
        configure(&mut config);

        let store = Arc::new(FsBlockStore::open(root.clone()).expect("store should open"));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let server = XferServer::bind(&config.node.listen_addr)
            .await
            .expect("listener should bind");
        let bound = server.local_addr().expect("listener has an address");
        let ctx = Arc::new(NodeContext::new(
            config,
            store.clone(),
            Arc::new(secrets()),
            announcer.clone(),
            bound,
        ));

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(server.run(ctx.clone(), shutdown.subscribe()));

        Self {
            addr: ctx.xfer_addr.clone(),
            ctx,
            store,
            announcer,
            shutdown,
            root,
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Secret manager matching the test nodes' key.
pub fn secrets() -> BlockTokenSecretManager {
    BlockTokenSecretManager::from_hex(TOKEN_KEY).expect("test key is valid")
}

/// An address with nothing listening on it.
pub fn dead_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn block(id: u64) -> BlockIdentity {
    BlockIdentity::new(POOL, id, 1, 0)
}

/// Deterministic, non-repeating test data.
pub fn payload(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2654435761) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

pub async fn connect(addr: &str) -> Result<PeerConnection> {
    let t = Duration::from_secs(5);
    Ok(PeerConnection::connect(addr, t, t, t).await?)
}

pub fn write_request(
    block: BlockIdentity,
    client: &str,
    stage: PipelineStage,
    targets: Vec<String>,
) -> WriteBlockRequest {
    WriteBlockRequest {
        block,
        token: AccessToken::default(),
        client_name: client.into(),
        pipeline_size: targets.len() as u32 + 1,
        targets,
        source: None,
        stage,
        min_bytes_rcvd: 0,
        max_bytes_rcvd: 0,
        latest_generation_stamp: 0,
        requested_checksum: ChecksumSpec::default(),
    }
}

/// Write a new block through `addr` and its `targets` as a client.
/// Returns the acks, LAST included.
pub async fn write_block(
    addr: &str,
    block: &BlockIdentity,
    data: &[u8],
    targets: Vec<String>,
) -> Result<Vec<PipelineAck>> {
    let mut conn = connect(addr).await?;
    let req = write_request(block.clone(), "it-client", PipelineStage::PipelineSetupCreate, targets);
    conn.send_request(&Request::WriteBlock(req)).await?;
    let connect_ack = conn.read_response().await?;
    if !connect_ack.is_success() {
        bail!(
            "connect ack {:?}, first bad link {:?}",
            connect_ack.status,
            connect_ack.first_bad_link
        );
    }
    Ok(conn
        .stream_block(data, 0, ChecksumSpec::default(), 4096, true)
        .await?)
}

/// Read `[offset, offset + length)` of a block; `length` of -1 reads to
/// the end. Returns exactly the requested bytes.
pub async fn read_block(
    addr: &str,
    block: &BlockIdentity,
    token: AccessToken,
    offset: u64,
    length: i64,
) -> Result<Vec<u8>> {
    let mut conn = connect(addr).await?;
    let req = ReadBlockRequest {
        block: block.clone(),
        token,
        client_name: "it-client".into(),
        offset,
        length,
        send_checksum: true,
    };
    conn.send_request(&Request::ReadBlock(req)).await?;
    let response = conn.read_response().await?;
    if !response.is_success() {
        bail!("read refused: {:?} {:?}", response.status, response.message);
    }
    let info = response.checksum_info.context("read response has no checksum info")?;
    let (start, data) = conn.receive_block_data(&info).await?;
    conn.send_read_status(Status::Success).await?;

    if start > offset {
        bail!("stream starts at {start}, after the requested offset {offset}");
    }
    let skip = (offset - start) as usize;
    let end = if length < 0 { data.len() } else { skip + length as usize };
    if end > data.len() {
        bail!("stream [{start}, +{}) does not cover the requested range", data.len());
    }
    Ok(data[skip..end].to_vec())
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
