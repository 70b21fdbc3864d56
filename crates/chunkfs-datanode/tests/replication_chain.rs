//! Replication through a chain of DataNodes over loopback TCP.

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use chunkfs_datanode::{DataNodeConfig, DataNodeServer, Frame, StreamId, TcpConnector, TcpLink};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_node(dir: &Path, io_timeout_ms: u64) -> (Arc<DataNodeServer>, String) {
    let config = DataNodeConfig {
        data_dir: dir.to_path_buf(),
        connect_timeout_ms: 1_000,
        io_timeout_ms,
        ..Default::default()
    };
    let server = Arc::new(DataNodeServer::new(&config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, addr)
}

async fn wait_idle(nodes: &[&DataNodeServer]) {
    for _ in 0..300 {
        if nodes
            .iter()
            .all(|n| n.inbound().is_empty() && n.outbound().is_empty())
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replication streams were not unregistered");
}

async fn open_stream(addr: &str, chunk_id: u64, downstream: Vec<String>) -> (TcpLink, StreamId) {
    let link = TcpConnector::default().connect(addr).await.unwrap();
    match link
        .call(&Frame::Open { chunk_id, downstream }, TIMEOUT)
        .await
        .unwrap()
    {
        Frame::Opened { stream_id } => (link, stream_id),
        other => panic!("open failed: {:?}", other),
    }
}

fn chunk_bytes(dir: &Path, chunk_id: u64) -> Vec<u8> {
    std::fs::read(dir.join("chunks").join(chunk_id.to_string())).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_chain_replicates_every_byte() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let (primary, primary_addr) = start_node(dirs[0].path(), 2_000).await;
    let (second, second_addr) = start_node(dirs[1].path(), 2_000).await;
    let (third, third_addr) = start_node(dirs[2].path(), 2_000).await;

    let (link, stream_id) = open_stream(&primary_addr, 77, vec![second_addr, third_addr]).await;

    // Both legs are visible on the primary before any bytes move.
    assert!(primary.inbound().contains(stream_id));
    let outbound = primary.outbound().lookup(stream_id).unwrap();
    assert_eq!(outbound.chunk_id(), 77);
    assert_eq!(second.inbound().len(), 1);
    assert_eq!(second.outbound().len(), 1);
    assert_eq!(third.inbound().len(), 1);
    assert!(third.outbound().is_empty());
    drop(outbound);

    let mut expected = Vec::new();
    for (i, piece) in [&b"alpha-"[..], b"beta-", b"gamma"].iter().enumerate() {
        let offset = expected.len() as u64;
        expected.extend_from_slice(piece);
        let reply = link
            .call(
                &Frame::Data {
                    stream_id,
                    offset,
                    payload: Bytes::copy_from_slice(piece),
                },
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Frame::Ack {
                stream_id,
                offset,
                len: piece.len() as u64
            },
            "piece {}",
            i
        );
    }

    let reply = link.call(&Frame::Close { stream_id }, TIMEOUT).await.unwrap();
    assert_eq!(
        reply,
        Frame::Closed {
            stream_id,
            bytes: expected.len() as u64
        }
    );

    wait_idle(&[&primary, &second, &third]).await;
    for dir in &dirs {
        assert_eq!(chunk_bytes(dir.path(), 77), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_through_one_primary() {
    let primary_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let (primary, primary_addr) = start_node(primary_dir.path(), 2_000).await;
    let (second, second_addr) = start_node(second_dir.path(), 2_000).await;

    let mut tasks = Vec::new();
    for chunk_id in 0..16u64 {
        let primary_addr = primary_addr.clone();
        let second_addr = second_addr.clone();
        tasks.push(tokio::spawn(async move {
            let (link, stream_id) = open_stream(&primary_addr, chunk_id, vec![second_addr]).await;
            let payload = Bytes::from(vec![chunk_id as u8; 1024]);
            for block in 0..4u64 {
                let reply = link
                    .call(
                        &Frame::Data {
                            stream_id,
                            offset: block * 1024,
                            payload: payload.clone(),
                        },
                        TIMEOUT,
                    )
                    .await
                    .unwrap();
                assert!(matches!(reply, Frame::Ack { .. }));
            }
            let reply = link.call(&Frame::Close { stream_id }, TIMEOUT).await.unwrap();
            assert_eq!(
                reply,
                Frame::Closed {
                    stream_id,
                    bytes: 4096
                }
            );
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_idle(&[&primary, &second]).await;
    for chunk_id in 0..16u64 {
        let expected = vec![chunk_id as u8; 4096];
        assert_eq!(chunk_bytes(primary_dir.path(), chunk_id), expected);
        assert_eq!(chunk_bytes(second_dir.path(), chunk_id), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_replica_fails_stream_and_cleans_up() {
    let primary_dir = tempfile::tempdir().unwrap();
    let (primary, primary_addr) = start_node(primary_dir.path(), 200).await;

    // A replica that accepts the stream and then never acknowledges data.
    let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_addr = stalled.local_addr().unwrap().to_string();
    let replica = tokio::spawn(async move {
        let link = TcpConnector::default().accept(&stalled).await.unwrap();
        let open = link.recv().await.unwrap();
        assert!(matches!(open, Some(Frame::Open { .. })));
        link.send(&Frame::Opened { stream_id: 500 }).await.unwrap();
        // Swallow frames until the primary hangs up.
        while let Ok(Some(_)) = link.recv().await {}
    });

    let (link, stream_id) = open_stream(&primary_addr, 5, vec![stalled_addr]).await;
    assert_eq!(primary.outbound().lookup(stream_id).unwrap().wire_stream_id(), 500);

    let reply = link
        .call(
            &Frame::Data {
                stream_id,
                offset: 0,
                payload: Bytes::from_static(b"never acked"),
            },
            TIMEOUT,
        )
        .await
        .unwrap();
    assert!(matches!(reply, Frame::Error { stream_id: Some(id), .. } if id == stream_id));

    wait_idle(&[&primary]).await;
    replica.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_error_reaches_client() {
    let primary_dir = tempfile::tempdir().unwrap();
    let (primary, primary_addr) = start_node(primary_dir.path(), 2_000).await;

    let refusing = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let refusing_addr = refusing.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let link = TcpConnector::default().accept(&refusing).await.unwrap();
        let _ = link.recv().await;
        link.send(&Frame::Error {
            stream_id: None,
            reason: "disk full".to_string(),
        })
        .await
        .unwrap();
    });

    let link = TcpConnector::default().connect(&primary_addr).await.unwrap();
    let reply = link
        .call(
            &Frame::Open {
                chunk_id: 1,
                downstream: vec![refusing_addr],
            },
            TIMEOUT,
        )
        .await
        .unwrap();
    match reply {
        Frame::Error { reason, .. } => assert!(reason.contains("disk full")),
        other => panic!("unexpected reply {:?}", other),
    }
    wait_idle(&[&primary]).await;
}
