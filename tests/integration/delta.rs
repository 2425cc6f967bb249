use crate::*;

use basalt_core::checksum::strong_digest;
use basalt_core::message::{
    AccessToken, BlockIdentity, BlockOpResponse, CalculateSegmentsRequest, ChunksChecksumRequest,
    Request, SegmentDescriptor, SendSegmentRequest, UpdateBlockRequest,
};
use basalt_core::wire::Status;
use basalt_services::BlockStore;

const CHUNK: usize = 4096;

async fn delta_node(tag: &str) -> TestNode {
    TestNode::start_with(tag, |c| c.delta.chunk_size = CHUNK as u64).await
}

async fn ask(addr: &str, request: Request) -> BlockOpResponse {
    let mut conn = connect(addr).await.unwrap();
    conn.send_request(&request).await.unwrap();
    conn.read_response().await.unwrap()
}

fn push(blk: &BlockIdentity, offset: u64, length: u64, target: &str, target_offset: Option<u64>) -> Request {
    Request::SendSegment(SendSegmentRequest {
        block: blk.clone(),
        token: AccessToken::default(),
        client_name: "it-client".into(),
        offset,
        length,
        send_checksum: false,
        is_client: true,
        targets: vec![target.to_string()],
        target_offset,
    })
}

#[tokio::test]
async fn test_diverged_replica_is_rebuilt_from_matches_and_literals() {
    let source = delta_node("delta-src").await;
    let target = delta_node("delta-dst").await;
    let blk = block(500);

    // Target holds the old contents. The source has an insertion near the
    // front, a rewritten chunk in the middle and a longer tail.
    let old = payload(8 * CHUNK, 14);
    let mut new = b"inserted bytes".to_vec();
    new.extend_from_slice(&old[..3 * CHUNK]);
    new.extend_from_slice(&payload(CHUNK, 15));
    new.extend_from_slice(&old[4 * CHUNK..]);
    new.extend_from_slice(&payload(1_500, 16));
    write_block(&target.addr, &blk, &old, vec![]).await.unwrap();
    write_block(&source.addr, &blk, &new, vec![]).await.unwrap();

    // 1. What the target already has.
    let response = ask(
        &target.addr,
        Request::ChunksChecksum(ChunksChecksumRequest {
            block: blk.clone(),
            token: AccessToken::default(),
        }),
    )
    .await;
    let chunks = response.chunks_checksum.expect("chunk checksums");
    assert_eq!(chunks.bytes_per_chunk, CHUNK as u64);
    assert_eq!(chunks.checksums.len(), 8);

    // 2. How the source's copy maps onto it.
    let response = ask(
        &source.addr,
        Request::CalculateSegments(CalculateSegmentsRequest {
            block: blk.clone(),
            token: AccessToken::default(),
            client_name: "it-client".into(),
            rolling: chunks.checksums.iter().map(|c| c.rolling).collect(),
            digests: chunks.checksums.iter().map(|c| c.digest).collect(),
        }),
    )
    .await;
    let segments = response.segments.expect("segments").segments;
    let matched: Vec<i32> = segments
        .iter()
        .filter(|s| !s.is_literal())
        .map(|s| s.source_chunk_index)
        .collect();
    assert_eq!(matched, vec![0, 1, 2, 4, 5, 6, 7]);
    let mut at = 0;
    for s in &segments {
        assert_eq!(s.offset, at);
        at = s.end();
    }
    assert_eq!(at, new.len() as u64);

    // 3. Stage every range on the target: literals from the source,
    //    matches from the target's own copy.
    for SegmentDescriptor { offset, length, source_chunk_index } in &segments {
        let response = if *source_chunk_index == SegmentDescriptor::LITERAL {
            ask(&source.addr, push(&blk, *offset, *length, &target.addr, None)).await
        } else {
            let from = *source_chunk_index as u64 * CHUNK as u64;
            ask(&target.addr, push(&blk, from, *length, &target.addr, Some(*offset))).await
        };
        assert!(response.is_success(), "{:?}", response.message);
    }

    // 4. Rebuild.
    let response = ask(
        &target.addr,
        Request::UpdateBlock(UpdateBlockRequest {
            block: blk.clone(),
            token: AccessToken::default(),
        }),
    )
    .await;
    assert!(response.is_success(), "{:?}", response.message);

    let rebuilt = read_block(&target.addr, &blk, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(rebuilt.len(), new.len());
    assert_eq!(strong_digest(&rebuilt), strong_digest(&new));
    let replica = target.store.replica(POOL, 500).unwrap();
    assert_eq!(replica.block.num_bytes, new.len() as u64);
    assert_eq!(replica.block.generation_stamp, blk.generation_stamp + 1);
}

#[tokio::test]
async fn test_segment_push_names_unreachable_targets() {
    let source = delta_node("delta-dead").await;
    let blk = block(501);
    write_block(&source.addr, &blk, &payload(CHUNK, 17), vec![]).await.unwrap();

    let dead = dead_addr();
    let response = ask(&source.addr, push(&blk, 0, 100, &dead, None)).await;
    assert_eq!(response.status, Status::Error);
    assert!(response.message.unwrap().contains(&dead));
}

#[tokio::test]
async fn test_update_without_staged_segments_fails() {
    let target = delta_node("delta-empty").await;
    let blk = block(502);
    let old = payload(1_000, 18);
    write_block(&target.addr, &blk, &old, vec![]).await.unwrap();

    let response = ask(
        &target.addr,
        Request::UpdateBlock(UpdateBlockRequest {
            block: blk.clone(),
            token: AccessToken::default(),
        }),
    )
    .await;
    assert_eq!(response.status, Status::Error);
    // The existing replica is untouched.
    let still = read_block(&target.addr, &blk, AccessToken::default(), 0, -1).await.unwrap();
    assert_eq!(still, old);
}
