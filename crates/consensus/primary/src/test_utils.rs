//! Mock collaborators for tests.

use crate::{DataStreamPrimary, StaticReplicaResolver};
use async_trait::async_trait;
use bytes::Bytes;
use ds_config::Parameters;
use ds_primary_metrics::PrimaryMetrics;
use ds_types::{
    CommitReply, CommitRequest, CommitTarget, ConsensusClient, ForwardError, GroupId,
    PacketHeader, PacketKind, PeerAddress, PeerId, ReplicaForwarder, RequestPacket, StreamId,
    StreamOffset, StreamSink, SubmitError,
};
use parking_lot::Mutex;
use prometheus::Registry;
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

/// Consensus client answering from a script.
///
/// Each submission takes the next scripted response; once the script runs out every
/// submission succeeds.
#[derive(Debug, Default)]
pub struct MockConsensusClient {
    responses: Mutex<VecDeque<Result<CommitReply, SubmitError>>>,
    calls: Mutex<Vec<(CommitTarget, CommitRequest)>>,
    delay: Option<Duration>,
}

impl MockConsensusClient {
    /// Append a response to the script.
    pub fn respond(self, response: Result<CommitReply, SubmitError>) -> Self {
        self.responses.lock().push_back(response);
        self
    }

    /// `k` servers in a row answer NotLeader, each naming the next one. Server `sk` commits.
    pub fn redirect_chain(k: usize) -> Self {
        let mut client = Self::default();
        for i in 0..k {
            client = client.respond(Err(SubmitError::NotLeader {
                server: PeerId::new(format!("s{i}")),
                suggested_leader: Some(PeerId::new(format!("s{}", i + 1))),
            }));
        }
        client.respond(Ok(CommitReply { server: PeerId::new(format!("s{k}")), committed_index: 1 }))
    }

    /// Wait `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every submission so far, in order.
    pub fn calls(&self) -> Vec<(CommitTarget, CommitRequest)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ConsensusClient for MockConsensusClient {
    async fn submit(
        &self,
        target: CommitTarget,
        request: CommitRequest,
    ) -> Result<CommitReply, SubmitError> {
        let index = {
            let mut calls = self.calls.lock();
            calls.push((target, request));
            calls.len() as u64
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.responses.lock().pop_front();
        scripted.unwrap_or(Ok(CommitReply { server: PeerId::new("s0"), committed_index: index }))
    }
}

/// Forwarder that records every packet and fails on request.
#[derive(Debug, Default)]
pub struct RecordingForwarder {
    sent: Mutex<Vec<(PeerAddress, RequestPacket)>>,
    /// Peer and the 1-based index of the data packet it rejects.
    failures: HashMap<PeerAddress, usize>,
    data_packets: Mutex<HashMap<PeerAddress, usize>>,
    released: Mutex<Vec<(PeerAddress, StreamId)>>,
    delay: Option<Duration>,
}

impl RecordingForwarder {
    /// Reject the `nth` data packet sent to `peer`.
    pub fn fail_data(mut self, peer: PeerAddress, nth: usize) -> Self {
        self.failures.insert(peer, nth);
        self
    }

    /// Wait `delay` before acknowledging.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every packet forwarded so far.
    pub fn sent(&self) -> Vec<(PeerAddress, RequestPacket)> {
        self.sent.lock().clone()
    }

    /// Headers of the packets forwarded to `peer`.
    pub fn sent_to(&self, peer: &PeerAddress) -> Vec<PacketHeader> {
        self.sent.lock().iter().filter(|(p, _)| p == peer).map(|(_, pkt)| *pkt.header()).collect()
    }

    /// Peers released for `stream_id`, in order.
    pub fn released(&self, stream_id: StreamId) -> Vec<PeerAddress> {
        self.released.lock().iter().filter(|(_, id)| *id == stream_id).map(|(p, _)| *p).collect()
    }
}

#[async_trait]
impl ReplicaForwarder for RecordingForwarder {
    async fn send(&self, peer: &PeerAddress, packet: RequestPacket) -> Result<(), ForwardError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let kind = packet.kind();
        self.sent.lock().push((*peer, packet));

        if kind == PacketKind::StreamData {
            let count = {
                let mut counts = self.data_packets.lock();
                let count = counts.entry(*peer).or_default();
                *count += 1;
                *count
            };
            if self.failures.get(peer) == Some(&count) {
                return Err(ForwardError::Rejected(format!("injected failure at {peer}")));
            }
        }
        Ok(())
    }

    async fn release(&self, peer: &PeerAddress, stream_id: StreamId) {
        self.released.lock().push((*peer, stream_id));
    }
}

/// What a [MemorySink] holds for one stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStream {
    pub metadata: Bytes,
    pub data: Vec<u8>,
    pub closed: Option<u64>,
    pub aborted: bool,
}

/// In-memory [StreamSink].
#[derive(Debug, Default)]
pub struct MemorySink {
    streams: Mutex<HashMap<StreamId, MemoryStream>>,
    /// Writes from this 1-based index on are refused.
    fail_from: Option<usize>,
    writes: Mutex<usize>,
    slow_stream: Option<(StreamId, Duration)>,
}

impl MemorySink {
    /// Sink that refuses every write.
    pub fn failing() -> Self {
        Self::failing_from(1)
    }

    /// Sink that refuses the `nth` write and every one after it.
    pub fn failing_from(nth: usize) -> Self {
        Self { fail_from: Some(nth), ..Default::default() }
    }

    /// Wait `delay` before every write to `stream_id`.
    pub fn with_slow_stream(mut self, stream_id: StreamId, delay: Duration) -> Self {
        self.slow_stream = Some((stream_id, delay));
        self
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<MemoryStream> {
        self.streams.lock().get(&stream_id).cloned()
    }
}

#[async_trait]
impl StreamSink for MemorySink {
    async fn open(&self, stream_id: StreamId, metadata: Bytes) -> eyre::Result<()> {
        self.streams.lock().insert(stream_id, MemoryStream { metadata, ..Default::default() });
        Ok(())
    }

    async fn write(
        &self,
        stream_id: StreamId,
        offset: StreamOffset,
        data: Bytes,
    ) -> eyre::Result<()> {
        if let Some((slow, delay)) = self.slow_stream {
            if slow == stream_id {
                tokio::time::sleep(delay).await;
            }
        }
        let nth = {
            let mut writes = self.writes.lock();
            *writes += 1;
            *writes
        };
        if self.fail_from.is_some_and(|from| nth >= from) {
            eyre::bail!("disk full");
        }
        let mut streams = self.streams.lock();
        let stream = streams.entry(stream_id).or_default();
        eyre::ensure!(
            offset == stream.data.len() as u64,
            "write at {offset} but stream {stream_id} holds {} bytes",
            stream.data.len()
        );
        stream.data.extend_from_slice(&data);
        Ok(())
    }

    async fn close(&self, stream_id: StreamId, total: u64) -> eyre::Result<()> {
        self.streams.lock().entry(stream_id).or_default().closed = Some(total);
        Ok(())
    }

    async fn abort(&self, stream_id: StreamId) {
        self.streams.lock().entry(stream_id).or_default().aborted = true;
    }
}

/// Loopback addresses that nothing listens on, usable as replica identities.
pub fn test_replicas(n: u16) -> Vec<PeerAddress> {
    (1..=n).map(|i| PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], 9000 + i)))).collect()
}

/// A primary wired to mock collaborators.
#[derive(Debug)]
pub struct TestPrimary {
    pub primary: DataStreamPrimary,
    pub replicas: Vec<PeerAddress>,
    pub forwarder: Arc<RecordingForwarder>,
    pub consensus: Arc<MockConsensusClient>,
    pub sink: Arc<MemorySink>,
    pub metrics: Arc<PrimaryMetrics>,
}

impl TestPrimary {
    /// Primary for group `test` with `num_replicas` replicas.
    pub fn new(
        num_replicas: u16,
        forwarder: RecordingForwarder,
        consensus: MockConsensusClient,
        sink: MemorySink,
    ) -> Self {
        let replicas = test_replicas(num_replicas);
        let parameters = Parameters {
            group_id: GroupId::new("test"),
            replicas: replicas.clone(),
            replica_timeout: Duration::from_secs(1),
            commit_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        Self::with_parameters(parameters, forwarder, consensus, sink)
    }

    /// Primary using `parameters`; replicas come from `parameters.replicas`.
    pub fn with_parameters(
        parameters: Parameters,
        forwarder: RecordingForwarder,
        consensus: MockConsensusClient,
        sink: MemorySink,
    ) -> Self {
        let replicas = parameters.replicas.clone();
        let forwarder = Arc::new(forwarder);
        let consensus = Arc::new(consensus);
        let sink = Arc::new(sink);
        let metrics = Arc::new(
            PrimaryMetrics::new(&Registry::new()).expect("metrics register on a fresh registry"),
        );
        let primary = DataStreamPrimary::new(
            parameters.clone(),
            Arc::new(StaticReplicaResolver::from_parameters(&parameters)),
            forwarder.clone(),
            consensus.clone(),
            sink.clone(),
            metrics.clone(),
        );
        Self { primary, replicas, forwarder, consensus, sink, metrics }
    }
}

impl Default for TestPrimary {
    fn default() -> Self {
        Self::new(
            3,
            RecordingForwarder::default(),
            MockConsensusClient::default(),
            MemorySink::default(),
        )
    }
}
