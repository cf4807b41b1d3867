//! End-to-end tests over TCP: one primary and two replica servers.

use bytes::Bytes;
use ds_config::Parameters;
use ds_network::DataStreamClient;
use ds_primary::{
    test_utils::{MemorySink, MockConsensusClient},
    DataStreamPrimary, ServerHandle, StreamRole,
};
use ds_primary_metrics::PrimaryMetrics;
use ds_types::{test_utils::init_test_tracing, GroupId, PacketKind, PeerAddress, RequestPacket};
use prometheus::Registry;
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

struct Server {
    primary: DataStreamPrimary,
    handle: ServerHandle,
    sink: Arc<MemorySink>,
    consensus: Arc<MockConsensusClient>,
}

fn parameters(replicas: Vec<PeerAddress>, replica_timeout: Duration) -> Parameters {
    Parameters {
        group_id: GroupId::new("it"),
        replicas,
        replica_timeout,
        commit_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn spawn_server(replicas: Vec<PeerAddress>, sink: MemorySink) -> Server {
    spawn_server_with(parameters(replicas, Duration::from_secs(5)), sink).await
}

async fn spawn_server_with(parameters: Parameters, sink: MemorySink) -> Server {
    let sink = Arc::new(sink);
    let consensus = Arc::new(MockConsensusClient::default());
    let metrics = Arc::new(PrimaryMetrics::new(&Registry::new()).unwrap());
    let primary =
        DataStreamPrimary::with_tcp_replicas(parameters, consensus.clone(), sink.clone(), metrics);
    let handle = primary.clone().spawn().await.expect("server starts");
    Server { primary, handle, sink, consensus }
}

/// Two replica servers and a primary that forwards to them.
async fn spawn_group(replica_sink: impl Fn(usize) -> MemorySink) -> (Server, Vec<Server>) {
    spawn_group_with(Duration::from_secs(5), replica_sink).await
}

async fn spawn_group_with(
    replica_timeout: Duration,
    replica_sink: impl Fn(usize) -> MemorySink,
) -> (Server, Vec<Server>) {
    let mut replicas = Vec::new();
    for i in 0..2 {
        replicas.push(spawn_server(vec![], replica_sink(i)).await);
    }
    let addresses = replicas.iter().map(|r| PeerAddress::new(r.handle.peer_address())).collect();
    let primary =
        spawn_server_with(parameters(addresses, replica_timeout), MemorySink::default()).await;
    (primary, replicas)
}

fn request(stream_id: u64, offset: u64, kind: PacketKind, data: &'static [u8]) -> RequestPacket {
    RequestPacket::new(stream_id, offset, kind, Bytes::from_static(data))
}

fn replica_streams(replicas: &[Server]) -> Vec<usize> {
    replicas.iter().map(|r| r.primary.registry(StreamRole::Replica).active_streams()).collect()
}

async fn wait_for_no_streams(server: &Server) {
    let registry = server.primary.registry(StreamRole::Primary);
    for _ in 0..100 {
        if registry.active_streams() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("streams still open: {}", registry.active_streams());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_replicated_and_committed() {
    init_test_tracing();
    let (primary, replicas) = spawn_group(|_| MemorySink::default()).await;

    let mut client =
        DataStreamClient::connect(primary.handle.client_address(), &Parameters::default())
            .await
            .unwrap();
    let mut stream = client.stream(42);
    assert!(stream.open(Bytes::from_static(b"file.bin")).await.unwrap().is_success());
    assert_eq!(stream.write(Bytes::from(vec![1u8; 100])).await.unwrap().bytes_written(), 100);
    assert_eq!(stream.write(Bytes::from(vec![2u8; 50])).await.unwrap().bytes_written(), 150);
    assert_eq!(stream.offset(), 150);

    let reply = stream.close().await.unwrap();
    assert!(reply.is_success());
    assert_eq!(reply.stream_id(), 42);
    assert_eq!(reply.bytes_written(), 150);

    for replica in &replicas {
        let stored = replica.sink.stream(42).expect("replica holds stream");
        assert_eq!(stored.metadata, Bytes::from_static(b"file.bin"));
        assert_eq!(stored.data.len(), 150);
        assert_eq!(&stored.data[100..], &[2u8; 50][..]);
        assert_eq!(stored.closed, Some(150));
        // only the primary commits
        assert!(replica.consensus.calls().is_empty());
    }
    assert_eq!(primary.consensus.calls().len(), 1);
    assert_eq!(primary.sink.stream(42).expect("local copy").closed, Some(150));

    client.shutdown().await.unwrap();
    primary.handle.shutdown().await;
    for replica in replicas {
        replica.handle.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_refusal_fails_stream() {
    let (primary, replicas) =
        spawn_group(|i| if i == 1 { MemorySink::failing() } else { MemorySink::default() }).await;

    let mut client =
        DataStreamClient::connect(primary.handle.client_address(), &Parameters::default())
            .await
            .unwrap();
    let mut stream = client.stream(42);
    assert!(stream.open(Bytes::new()).await.unwrap().is_success());

    let reply = stream.write(Bytes::from(vec![0u8; 100])).await.unwrap();
    assert!(!reply.is_success());
    assert_eq!(reply.bytes_written(), 0);
    assert!(reply.reason().unwrap().contains("local write failed"));
    assert_eq!(stream.offset(), 0);

    let reply = stream.close().await.unwrap();
    assert!(!reply.is_success());
    assert!(reply.reason().unwrap().contains("already terminated"));
    assert!(primary.consensus.calls().is_empty());

    // the connection survives for other streams
    let mut other = client.stream(43);
    assert!(other.open(Bytes::new()).await.unwrap().is_success());

    drop(replicas);
    primary.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_header_drops_connection() {
    let server = spawn_server(vec![], MemorySink::default()).await;

    let mut stream = tokio::net::TcpStream::connect(server.handle.client_address()).await.unwrap();
    stream.write_all(&[0, 0, 0, 0, 1, 2, 3, 4]).await.unwrap();

    let mut buf = Vec::new();
    let read = stream.read_to_end(&mut buf).await.unwrap_or(0);
    assert_eq!(read, 0, "no reply for a malformed frame");

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_aborts_open_streams() {
    let (primary, replicas) = spawn_group(|_| MemorySink::default()).await;

    let mut client =
        DataStreamClient::connect(primary.handle.client_address(), &Parameters::default())
            .await
            .unwrap();
    let mut stream = client.stream(5);
    stream.open(Bytes::new()).await.unwrap();
    stream.write(Bytes::from_static(b"partial")).await.unwrap();
    assert_eq!(primary.primary.registry(StreamRole::Primary).active_streams(), 1);

    drop(client);
    wait_for_no_streams(&primary).await;
    assert!(primary.sink.stream(5).expect("stream").aborted);
    assert!(primary.consensus.calls().is_empty());

    primary.handle.shutdown().await;
    for replica in replicas {
        replica.handle.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_stream_does_not_disturb_other_streams() {
    let (primary, replicas) = spawn_group_with(Duration::from_millis(500), |_| {
        MemorySink::default().with_slow_stream(1, Duration::from_secs(2))
    })
    .await;

    let mut client =
        DataStreamClient::connect(primary.handle.client_address(), &Parameters::default())
            .await
            .unwrap();
    assert!(client.send(request(2, 0, PacketKind::StreamHeader, b"")).await.unwrap().is_success());
    assert!(client.send(request(2, 0, PacketKind::StreamData, b"abcde")).await.unwrap().is_success());
    assert!(client.send(request(1, 0, PacketKind::StreamHeader, b"")).await.unwrap().is_success());

    let reply = client.send(request(1, 0, PacketKind::StreamData, b"slow")).await.unwrap();
    assert!(!reply.is_success());
    assert!(reply.reason().unwrap().contains("timed out"));

    // stream 2 keeps its own replica connections
    let reply = client.send(request(2, 5, PacketKind::StreamData, b"fghij")).await.unwrap();
    assert!(reply.is_success(), "{:?}", reply.reason());
    assert_eq!(reply.bytes_written(), 10);
    let reply = client.send(request(2, 10, PacketKind::StreamClose, b"")).await.unwrap();
    assert!(reply.is_success(), "{:?}", reply.reason());
    for replica in &replicas {
        assert_eq!(replica.sink.stream(2).expect("replica copy").closed, Some(10));
    }

    client.shutdown().await.unwrap();
    primary.handle.shutdown().await;
    for replica in replicas {
        replica.handle.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_stream_aborted_on_replicas() {
    let (primary, replicas) = spawn_group(|_| MemorySink::default()).await;

    let mut client =
        DataStreamClient::connect(primary.handle.client_address(), &Parameters::default())
            .await
            .unwrap();
    assert!(client.send(request(7, 0, PacketKind::StreamHeader, b"")).await.unwrap().is_success());
    assert_eq!(replica_streams(&replicas), vec![1, 1]);

    let reply = client.send(request(7, 99, PacketKind::StreamData, b"late")).await.unwrap();
    assert!(!reply.is_success());
    assert!(reply.reason().unwrap().contains("expected offset 0, received 99"));

    assert_eq!(primary.primary.registry(StreamRole::Primary).active_streams(), 0);
    assert_eq!(replica_streams(&replicas), vec![0, 0]);
    for replica in &replicas {
        assert!(replica.sink.stream(7).expect("replica copy").aborted);
    }

    // the id is free everywhere
    let reply = client.send(request(7, 0, PacketKind::StreamHeader, b"")).await.unwrap();
    assert!(reply.is_success(), "{:?}", reply.reason());
    assert_eq!(replica_streams(&replicas), vec![1, 1]);

    client.shutdown().await.unwrap();
    primary.handle.shutdown().await;
    for replica in replicas {
        replica.handle.shutdown().await;
    }
}
