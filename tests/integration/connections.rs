use crate::*;

use basalt_core::message::{AccessToken, BlockChecksumRequest, Request};

fn checksum_of(id: u64) -> Request {
    Request::BlockChecksum(BlockChecksumRequest {
        block: block(id),
        token: AccessToken::default(),
    })
}

#[tokio::test]
async fn test_keepalive_serves_ops_back_to_back_then_closes() {
    let node = TestNode::start_with("conn-keepalive", |c| c.transfer.keepalive_timeout_ms = 300).await;
    write_block(&node.addr, &block(600), &payload(3_000, 19), vec![]).await.unwrap();

    let mut conn = connect(&node.addr).await.unwrap();
    let mut digests = Vec::new();
    for _ in 0..3 {
        conn.send_request(&checksum_of(600)).await.unwrap();
        let response = conn.read_response().await.unwrap();
        digests.push(response.checksum_response.expect("checksum").md5);
    }
    assert!(digests.windows(2).all(|w| w[0] == w[1]));

    // Idle past the keep-alive window: the node hangs up.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(conn.read_response().await.is_err());
    assert!(wait_for(Duration::from_secs(2), || node.ctx.active_peers() == 0).await);
}

#[tokio::test]
async fn test_failed_op_closes_the_connection() {
    let node = TestNode::start("conn-fail").await;
    let mut conn = connect(&node.addr).await.unwrap();
    conn.send_request(&checksum_of(601)).await.unwrap();
    let response = conn.read_response().await.unwrap();
    assert!(!response.is_success());
    assert!(conn.read_response().await.is_err(), "connection should be closed");
}

#[tokio::test]
async fn test_live_connections_are_tracked() {
    let node = TestNode::start("conn-track").await;
    let first = connect(&node.addr).await.unwrap();
    let second = connect(&node.addr).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || node.ctx.active_peers() == 2).await);

    drop(first);
    drop(second);
    assert!(wait_for(Duration::from_secs(2), || node.ctx.active_peers() == 0).await);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let node = TestNode::start("conn-shutdown").await;
    let addr = node.addr.clone();
    drop(node);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connect(&addr).await.is_err());
}
