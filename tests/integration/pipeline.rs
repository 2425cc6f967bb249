use crate::*;

use tokio::net::TcpListener;

use basalt_core::codec;
use basalt_core::message::{AccessToken, BlockOpResponse, PipelineStage, Request};
use basalt_core::wire::Status;
use basalt_services::{BlockStore, ReplicaState};

/// Accepts one connection, answers the forwarded request with a
/// successful connect-ack and hangs up.
async fn vanishing_mirror(ack: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = codec::read_request(&mut stream).await;
        if ack {
            let _ = codec::write_message(&mut stream, &BlockOpResponse::success()).await;
        }
    });
    addr
}

fn finalized_len(node: &TestNode, id: u64) -> Option<u64> {
    node.store
        .replica(POOL, id)
        .filter(|r| r.state == ReplicaState::Finalized)
        .map(|r| r.block.num_bytes)
}

#[tokio::test]
async fn test_three_node_pipeline_acks_every_hop() {
    let a = TestNode::start("pipe-a").await;
    let b = TestNode::start("pipe-b").await;
    let c = TestNode::start("pipe-c").await;
    let blk = block(200);
    let data = payload(20_000, 3);

    let acks = write_block(&a.addr, &blk, &data, vec![b.addr.clone(), c.addr.clone()])
        .await
        .expect("pipeline write");
    assert_eq!(acks.len(), 6, "five data packets and LAST");
    for (seqno, ack) in acks.iter().enumerate() {
        assert_eq!(ack.seqno, seqno as u64);
        assert_eq!(ack.replies, vec![Status::Success; 3]);
    }

    // The LAST ack is sent after finalize on every hop.
    for node in [&a, &b, &c] {
        assert_eq!(finalized_len(node, 200), Some(20_000));
        assert_eq!(node.announcer.received.lock().unwrap().len(), 1);
    }
    let copy = read_block(&c.addr, &blk, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(copy, data);
}

#[tokio::test]
async fn test_unreachable_mirror_is_first_bad_link() {
    let a = TestNode::start("pipe-dead").await;
    let dead = dead_addr();
    let mut conn = connect(&a.addr).await.unwrap();
    let req = write_request(block(201), "it-client", PipelineStage::PipelineSetupCreate, vec![dead.clone()]);
    conn.send_request(&Request::WriteBlock(req)).await.unwrap();

    let connect_ack = conn.read_response().await.unwrap();
    assert_eq!(connect_ack.status, Status::Error);
    assert_eq!(connect_ack.bad_link(), Some(dead.as_str()));
}

#[tokio::test]
async fn test_bad_link_two_hops_down_reaches_the_client() {
    let a = TestNode::start("pipe-hop-a").await;
    let b = TestNode::start("pipe-hop-b").await;
    let dead = dead_addr();
    let mut conn = connect(&a.addr).await.unwrap();
    let req = write_request(
        block(202),
        "it-client",
        PipelineStage::PipelineSetupCreate,
        vec![b.addr.clone(), dead.clone()],
    );
    conn.send_request(&Request::WriteBlock(req)).await.unwrap();

    let connect_ack = conn.read_response().await.unwrap();
    assert_eq!(connect_ack.status, Status::Error);
    assert_eq!(connect_ack.bad_link(), Some(dead.as_str()));
}

#[tokio::test]
async fn test_mirror_lost_mid_stream_degrades_to_local_write() {
    let a = TestNode::start("pipe-degrade").await;
    let mirror = vanishing_mirror(true).await;
    let blk = block(203);
    let data = payload(12_000, 4);

    let acks = write_block(&a.addr, &blk, &data, vec![mirror])
        .await
        .expect("write continues without the mirror");
    for ack in &acks {
        assert_eq!(ack.replies.len(), 2);
        assert_eq!(ack.replies[0], Status::Success);
        assert_eq!(ack.replies[1], Status::Error);
    }
    assert_eq!(finalized_len(&a, 203), Some(12_000));
    let local = read_block(&a.addr, &blk, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(local, data);
}

#[tokio::test]
async fn test_replication_hop_keeps_writing_when_mirror_is_gone() {
    let a = TestNode::start("pipe-repl").await;
    let mirror = vanishing_mirror(false).await;
    let blk = block(204);
    let data = payload(9_000, 5);

    // Node-originated write: no client name, no connect-ack, no acks.
    let mut conn = connect(&a.addr).await.unwrap();
    let req = write_request(blk.clone(), "", PipelineStage::PipelineSetupCreate, vec![mirror]);
    conn.send_request(&Request::WriteBlock(req)).await.unwrap();
    let acks = conn
        .stream_block(&data, 0, basalt_core::checksum::ChecksumSpec::default(), 4096, false)
        .await
        .unwrap();
    assert!(acks.is_empty());

    assert!(wait_for(Duration::from_secs(5), || finalized_len(&a, 204) == Some(9_000)).await);
    let local = read_block(&a.addr, &blk, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(local, data);
}

#[tokio::test]
async fn test_append_extends_a_finalized_block() {
    let a = TestNode::start("pipe-append").await;
    let blk = block(205);
    let first = payload(1_000, 6);
    write_block(&a.addr, &blk, &first, vec![]).await.unwrap();

    let mut grown = blk.clone();
    grown.num_bytes = 1_000;
    let mut req = write_request(grown, "it-client", PipelineStage::PipelineSetupAppend, vec![]);
    req.latest_generation_stamp = 2;
    let mut conn = connect(&a.addr).await.unwrap();
    conn.send_request(&Request::WriteBlock(req)).await.unwrap();
    assert!(conn.read_response().await.unwrap().is_success());
    let more = payload(700, 7);
    conn.stream_block(&more, 1_000, basalt_core::checksum::ChecksumSpec::default(), 4096, true)
        .await
        .unwrap();

    let replica = a.store.replica(POOL, 205).unwrap();
    assert_eq!(replica.block.generation_stamp, 2);
    let mut expected = first;
    expected.extend_from_slice(&more);
    let mut current = blk;
    current.generation_stamp = 2;
    let all = read_block(&a.addr, &current, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(all, expected);
}
