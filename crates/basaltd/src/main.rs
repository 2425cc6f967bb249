//! basaltd — Basalt block transfer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use basalt_core::config::NodeConfig;
use basalt_services::{BlockTokenSecretManager, FsBlockStore, LogAnnouncer, NodeContext, XferServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = NodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = NodeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NodeConfig::default()
    });
    tracing::info!(
        data_dir = %config.node.data_dir.display(),
        listen = %config.node.listen_addr,
        block_tokens = config.security.block_token_enabled,
        max_moves = config.balancer.max_concurrent_moves,
        bandwidth = config.balancer.bandwidth_per_sec,
        "basaltd starting"
    );

    // Storage
    let store = Arc::new(
        FsBlockStore::open(config.node.data_dir.clone()).context("failed to open block store")?,
    );

    // Block tokens
    let secrets = BlockTokenSecretManager::from_hex(&config.security.block_token_key)
        .context("invalid security.block_token_key")?;
    if config.security.block_token_enabled && config.security.block_token_key.is_empty() {
        tracing::warn!("block tokens enabled with a generated key, tokens minted elsewhere will be rejected");
    }

    let server = XferServer::bind(&config.node.listen_addr).await?;
    let bound = server.local_addr()?;
    let ctx = Arc::new(NodeContext::new(
        config,
        store,
        Arc::new(secrets),
        Arc::new(LogAnnouncer),
        bound,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server_task = tokio::spawn(server.run(ctx.clone(), shutdown_tx.subscribe()));

    let peer_printer = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::debug!(
                    count = ctx.active_peers(),
                    moves = ctx.throttler.active(),
                    "transfer connections snapshot"
                );
                for peer in ctx.peers() {
                    tracing::debug!(peer = %peer.addr, op = ?peer.op, "  connection");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task        => tracing::error!("transfer listener exited: {:?}", r),
        r = peer_printer       => tracing::error!("peer printer exited: {:?}", r),
    }

    Ok(())
}
