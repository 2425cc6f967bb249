use crate::*;

use basalt_core::message::{
    AccessMode, AccessToken, BlockChecksumRequest, BlockOpResponse, PipelineStage, Request,
};
use basalt_core::wire::Status;
use basalt_services::BlockStore;

const HOUR: Duration = Duration::from_secs(3600);

async fn secured(tag: &str) -> TestNode {
    TestNode::start_with(tag, |c| c.security.block_token_enabled = true).await
}

async fn write_with(node: &TestNode, token: AccessToken, id: u64, data: &[u8]) -> BlockOpResponse {
    let mut conn = connect(&node.addr).await.unwrap();
    let mut req = write_request(block(id), "it-client", PipelineStage::PipelineSetupCreate, vec![]);
    req.token = token;
    conn.send_request(&Request::WriteBlock(req)).await.unwrap();
    let connect_ack = conn.read_response().await.unwrap();
    if connect_ack.is_success() {
        conn.stream_block(data, 0, basalt_core::checksum::ChecksumSpec::default(), 4096, true)
            .await
            .unwrap();
    }
    connect_ack
}

#[tokio::test]
async fn test_tokens_gate_write_and_read() {
    let node = secured("tok-ok").await;
    let keys = secrets();
    let blk = block(300);
    let data = payload(2_000, 8);

    let write = keys.create_token(&blk, &[AccessMode::Write], HOUR);
    assert!(write_with(&node, write, 300, &data).await.is_success());

    let read = keys.create_token(&blk, &[AccessMode::Read], HOUR);
    let back = read_block(&node.addr, &blk, read, 0, -1).await.unwrap();
    assert_eq!(back, data);
}

#[tokio::test]
async fn test_missing_token_is_rejected_on_read() {
    let node = secured("tok-missing").await;
    let err = read_block(&node.addr, &block(301), AccessToken::default(), 0, -1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ErrorAccessToken"), "{err}");
}

#[tokio::test]
async fn test_write_with_read_token_names_this_node_as_bad_link() {
    let node = secured("tok-mode").await;
    let read_only = secrets().create_token(&block(302), &[AccessMode::Read], HOUR);
    let response = write_with(&node, read_only, 302, b"never stored").await;
    assert_eq!(response.status, Status::ErrorAccessToken);
    assert_eq!(response.bad_link(), Some(node.addr.as_str()));
    assert!(node.store.replica(POOL, 302).is_none());
}

#[tokio::test]
async fn test_token_for_another_block_is_rejected() {
    let node = secured("tok-block").await;
    let blk = block(303);
    let write = secrets().create_token(&blk, &[AccessMode::Write], HOUR);
    assert!(write_with(&node, write, 303, b"payload").await.is_success());

    let other = secrets().create_token(&block(999), &[AccessMode::Read], HOUR);
    let mut conn = connect(&node.addr).await.unwrap();
    conn.send_request(&Request::BlockChecksum(BlockChecksumRequest { block: blk, token: other }))
        .await
        .unwrap();
    let response = conn.read_response().await.unwrap();
    assert_eq!(response.status, Status::ErrorAccessToken);
    assert_eq!(response.bad_link(), None);
}

#[tokio::test]
async fn test_foreign_key_tokens_are_rejected() {
    let node = secured("tok-foreign").await;
    let stranger = basalt_services::BlockTokenSecretManager::generate();
    let token = stranger.create_token(&block(304), &[AccessMode::Write], HOUR);
    let response = write_with(&node, token, 304, b"x").await;
    assert_eq!(response.status, Status::ErrorAccessToken);
}
