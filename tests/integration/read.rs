use crate::*;

use basalt_core::message::{AccessToken, ReadBlockRequest, Request};
use basalt_core::wire::Status;

#[tokio::test]
async fn test_written_block_reads_back_whole_and_in_part() {
    let node = TestNode::start("read").await;
    let blk = block(100);
    let data = payload(10_000, 1);
    write_block(&node.addr, &blk, &data, vec![]).await.expect("write should succeed");

    let whole = read_block(&node.addr, &blk, AccessToken::default(), 0, -1)
        .await
        .expect("whole read");
    assert_eq!(whole, data);

    // Starts and ends inside checksum units.
    let part = read_block(&node.addr, &blk, AccessToken::default(), 1000, 3000)
        .await
        .expect("ranged read");
    assert_eq!(part, &data[1000..4000]);

    let tail = read_block(&node.addr, &blk, AccessToken::default(), 9_990, 10)
        .await
        .expect("tail read");
    assert_eq!(tail, &data[9_990..]);
}

#[tokio::test]
async fn test_read_of_missing_block_is_refused() {
    let node = TestNode::start("read-missing").await;
    let mut conn = connect(&node.addr).await.unwrap();
    let req = ReadBlockRequest {
        block: block(404),
        token: AccessToken::default(),
        client_name: "it-client".into(),
        offset: 0,
        length: -1,
        send_checksum: true,
    };
    conn.send_request(&Request::ReadBlock(req)).await.unwrap();
    let response = conn.read_response().await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(response.message.unwrap_or_default().contains("not found"));
}

#[tokio::test]
async fn test_read_past_end_is_refused() {
    let node = TestNode::start("read-past-end").await;
    let blk = block(101);
    write_block(&node.addr, &blk, &payload(512, 2), vec![]).await.unwrap();
    let err = read_block(&node.addr, &blk, AccessToken::default(), 100, 1000)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("read refused"), "{err}");
}
