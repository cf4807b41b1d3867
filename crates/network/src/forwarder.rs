//! Forward request packets to replicas over TCP.

use crate::{FrameError, FrameResult, HeaderCodec, PacketReader, PacketWriter};
use async_trait::async_trait;
use dashmap::DashMap;
use ds_config::Parameters;
use ds_types::{ForwardError, PeerAddress, ReplicaForwarder, ReplyPacket, RequestPacket, StreamId};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};
use tracing::{debug, warn};

/// One connection to a replica's peer listener, carrying a single stream.
#[derive(Debug)]
struct PeerConnection {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    /// A request went out and its reply was never read.
    awaiting_reply: bool,
}

impl PeerConnection {
    async fn connect(peer: &PeerAddress, codec: HeaderCodec, capacity: usize) -> FrameResult<Self> {
        let stream = TcpStream::connect(peer.socket_addr()).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: PacketReader::new(read, codec, capacity),
            writer: PacketWriter::new(write, codec),
            awaiting_reply: false,
        })
    }

    /// Send one request and wait for its reply.
    async fn exchange(&mut self, packet: &RequestPacket) -> FrameResult<ReplyPacket> {
        self.awaiting_reply = true;
        self.writer.write_request(packet).await?;
        let reply = self.reader.read_reply().await?.ok_or(FrameError::Closed)?;
        self.awaiting_reply = false;
        Ok(reply)
    }

    /// Close the send side and wait until the replica closes its side.
    ///
    /// The replica aborts whatever stream the connection still holds before closing.
    async fn close(mut self) -> FrameResult<()> {
        self.writer.shutdown().await?;
        // a late reply may still be ahead of the end of stream
        while self.reader.read_reply().await?.is_some() {}
        Ok(())
    }
}

type ConnectionSlot = Arc<Mutex<Option<PeerConnection>>>;

/// [ReplicaForwarder] that opens one TCP connection per stream and replica.
///
/// Packets of a stream go out one at a time so replies line up with requests. Streams never
/// share a connection, so losing one connection only affects its own stream on the replica.
#[derive(Debug)]
pub struct TcpReplicaForwarder {
    codec: HeaderCodec,
    read_buffer_capacity: usize,
    /// How long [ReplicaForwarder::release] waits for the replica to close.
    release_timeout: Duration,
    connections: DashMap<(PeerAddress, StreamId), ConnectionSlot>,
}

impl TcpReplicaForwarder {
    /// Create a new instance of Self.
    pub fn new(parameters: &Parameters) -> Self {
        Self {
            codec: HeaderCodec::from_parameters(parameters),
            read_buffer_capacity: parameters.read_buffer_capacity,
            release_timeout: parameters.replica_timeout,
            connections: DashMap::new(),
        }
    }

    fn slot(&self, peer: &PeerAddress, stream_id: StreamId) -> ConnectionSlot {
        self.connections.entry((*peer, stream_id)).or_default().clone()
    }
}

#[async_trait]
impl ReplicaForwarder for TcpReplicaForwarder {
    async fn send(&self, peer: &PeerAddress, packet: RequestPacket) -> Result<(), ForwardError> {
        let stream_id = packet.stream_id();
        let slot = self.slot(peer, stream_id);
        let mut guard = slot.lock().await;

        if guard.as_ref().is_some_and(|conn| conn.awaiting_reply) {
            // an earlier exchange was cancelled and its reply would answer this request
            return Err(ForwardError::Network(format!(
                "connection for stream {stream_id} has an unanswered request"
            )));
        }
        if guard.is_none() {
            debug!(target: "datastream::replication", %peer, stream_id, "connecting to replica");
            let conn = PeerConnection::connect(peer, self.codec, self.read_buffer_capacity)
                .await
                .map_err(|e| ForwardError::Network(e.to_string()))?;
            *guard = Some(conn);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| ForwardError::Network(format!("no connection to {peer}")))?;

        let reply = match conn.exchange(&packet).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "datastream::replication", %peer, stream_id, ?e, "replica connection failed");
                guard.take();
                return Err(ForwardError::Network(e.to_string()));
            }
        };
        drop(packet);

        if reply.stream_id() != stream_id {
            warn!(
                target: "datastream::replication",
                %peer,
                expected = stream_id,
                received = reply.stream_id(),
                "reply for wrong stream"
            );
            guard.take();
            return Err(ForwardError::Network(format!(
                "reply for stream {} while forwarding stream {stream_id}",
                reply.stream_id()
            )));
        }

        match reply.reason() {
            None => Ok(()),
            Some(reason) => Err(ForwardError::Rejected(reason)),
        }
    }

    async fn release(&self, peer: &PeerAddress, stream_id: StreamId) {
        let Some((_, slot)) = self.connections.remove(&(*peer, stream_id)) else {
            return;
        };
        let Some(conn) = slot.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.release_timeout, conn.close()).await {
            Ok(Ok(())) => {
                debug!(target: "datastream::replication", %peer, stream_id, "released replica connection")
            }
            Ok(Err(e)) => {
                debug!(target: "datastream::replication", %peer, stream_id, ?e, "replica connection closed uncleanly")
            }
            Err(_) => warn!(
                target: "datastream::replication",
                %peer,
                stream_id,
                "replica did not close connection in time"
            ),
        }
    }
}
