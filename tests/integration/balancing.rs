use crate::*;

use std::time::Instant;

use basalt_core::message::{
    AccessToken, CopyBlockRequest, ReplaceBlockRequest, Request, TransferBlockRequest,
};
use basalt_core::wire::Status;
use basalt_services::{BlockStore, ReplicaState};

fn copy(id: u64) -> Request {
    Request::CopyBlock(CopyBlockRequest {
        block: block(id),
        token: AccessToken::default(),
    })
}

#[tokio::test]
async fn test_copy_streams_replica_then_marker() {
    let source = TestNode::start("bal-copy").await;
    let data = payload(70_000, 9);
    write_block(&source.addr, &block(400), &data, vec![]).await.unwrap();

    let mut conn = connect(&source.addr).await.unwrap();
    conn.send_request(&copy(400)).await.unwrap();
    let response = conn.read_response().await.unwrap();
    assert!(response.is_success());
    let info = response.checksum_info.expect("copy response carries checksum info");
    let (start, copied) = conn.receive_block_data(&info).await.unwrap();
    assert_eq!(start, 0);
    assert_eq!(copied, data);
    conn.read_copy_marker().await.expect("marker follows the data");
    assert!(wait_for(Duration::from_secs(2), || source.ctx.throttler.active() == 0).await);
}

#[tokio::test]
async fn test_replace_pulls_from_proxy_with_delete_hint() {
    let proxy = TestNode::start("bal-proxy").await;
    let dest = TestNode::start("bal-dest").await;
    let data = payload(33_333, 10);
    write_block(&proxy.addr, &block(401), &data, vec![]).await.unwrap();

    let mut conn = connect(&dest.addr).await.unwrap();
    conn.send_request(&Request::ReplaceBlock(ReplaceBlockRequest {
        block: block(401),
        token: AccessToken::default(),
        del_hint: "10.0.0.9:9866".into(),
        proxy_source: proxy.addr.clone(),
    }))
    .await
    .unwrap();
    let response = conn.read_response().await.unwrap();
    assert!(response.is_success(), "{:?}", response.message);

    let replica = dest.store.replica(POOL, 401).unwrap();
    assert_eq!(replica.state, ReplicaState::Finalized);
    assert_eq!(replica.block.num_bytes, data.len() as u64);
    assert_eq!(dest.announcer.hints(), vec![Some("10.0.0.9:9866".to_string())]);
    let moved = read_block(&dest.addr, &block(401), AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(moved, data);
}

#[tokio::test]
async fn test_replace_from_unreachable_proxy_fails() {
    let dest = TestNode::start("bal-noproxy").await;
    let mut conn = connect(&dest.addr).await.unwrap();
    conn.send_request(&Request::ReplaceBlock(ReplaceBlockRequest {
        block: block(402),
        token: AccessToken::default(),
        del_hint: String::new(),
        proxy_source: dead_addr(),
    }))
    .await
    .unwrap();
    let response = conn.read_response().await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(dest.store.replica(POOL, 402).is_none());
    assert!(wait_for(Duration::from_secs(2), || dest.ctx.throttler.active() == 0).await);
}

#[tokio::test]
async fn test_transfer_pushes_replica_to_new_node() {
    let source = TestNode::start("bal-xfer-src").await;
    let target = TestNode::start("bal-xfer-dst").await;
    let data = payload(50_000, 11);
    write_block(&source.addr, &block(403), &data, vec![]).await.unwrap();

    let mut conn = connect(&source.addr).await.unwrap();
    conn.send_request(&Request::TransferBlock(TransferBlockRequest {
        block: block(403),
        token: AccessToken::default(),
        client_name: "it-client".into(),
        targets: vec![target.addr.clone()],
    }))
    .await
    .unwrap();
    let response = conn.read_response().await.unwrap();
    assert!(response.is_success(), "{:?}", response.message);

    let replica = target.store.replica(POOL, 403).unwrap();
    assert_eq!(replica.state, ReplicaState::Finalized);
    let pushed = read_block(&target.addr, &block(403), AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(pushed, data);
}

#[tokio::test]
async fn test_transfer_through_two_targets_does_not_wait_for_connect_ack() {
    let source = TestNode::start("bal-xfer2-src").await;
    let first = TestNode::start("bal-xfer2-a").await;
    let second = TestNode::start("bal-xfer2-b").await;
    let data = payload(40_000, 20);
    write_block(&source.addr, &block(406), &data, vec![]).await.unwrap();

    let started = Instant::now();
    let mut conn = connect(&source.addr).await.unwrap();
    conn.send_request(&Request::TransferBlock(TransferBlockRequest {
        block: block(406),
        token: AccessToken::default(),
        client_name: "it-client".into(),
        targets: vec![first.addr.clone(), second.addr.clone()],
    }))
    .await
    .unwrap();
    let response = conn.read_response().await.unwrap();
    assert!(response.is_success(), "{:?}", response.message);
    // Well inside the 5s socket timeout the nodes run with.
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    for node in [&first, &second] {
        let replica = node.store.replica(POOL, 406).unwrap();
        assert_eq!(replica.state, ReplicaState::Finalized);
        assert_eq!(replica.block.num_bytes, data.len() as u64);
    }
}

#[tokio::test]
async fn test_saturated_node_refuses_moves_without_data() {
    let node = TestNode::start_with("bal-quota", |c| c.balancer.max_concurrent_moves = 0).await;
    write_block(&node.addr, &block(404), &payload(1_000, 12), vec![]).await.unwrap();

    let mut conn = connect(&node.addr).await.unwrap();
    conn.send_request(&copy(404)).await.unwrap();
    let response = conn.read_response().await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(response.message.unwrap().contains("quota is exceeded"));

    // The refusal leaves the connection usable.
    conn.send_request(&Request::TransferBlock(TransferBlockRequest {
        block: block(404),
        token: AccessToken::default(),
        client_name: String::new(),
        targets: vec![dead_addr()],
    }))
    .await
    .unwrap();
    let response = conn.read_response().await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(response.message.unwrap().contains("quota is exceeded"));
}

#[tokio::test]
async fn test_bandwidth_limit_paces_copies() {
    let node = TestNode::start_with("bal-bw", |c| c.balancer.bandwidth_per_sec = 100_000).await;
    let data = payload(200_000, 13);
    write_block(&node.addr, &block(405), &data, vec![]).await.unwrap();

    let started = Instant::now();
    let mut conn = connect(&node.addr).await.unwrap();
    conn.send_request(&copy(405)).await.unwrap();
    let info = conn.read_response().await.unwrap().checksum_info.unwrap();
    let (_, copied) = conn.receive_block_data(&info).await.unwrap();
    assert_eq!(copied.len(), data.len());

    // One second of burst, then 100 KB/s for the rest.
    assert!(started.elapsed() >= Duration::from_millis(800), "{:?}", started.elapsed());
}
