//! Interfaces to the collaborators the data stream protocol relies on.
//!
//! Consensus, membership and local storage live outside these crates; the primary only sees
//! them through these traits.

use crate::{
    CommitReply, CommitRequest, CommitTarget, ForwardError, GroupId, PeerAddress, RequestPacket,
    StreamId, StreamOffset, SubmitError,
};
use async_trait::async_trait;
use bytes::Bytes;

/// Entry point for client requests into the consensus log.
#[async_trait]
pub trait ConsensusClient: Send + Sync + 'static {
    /// Submit `request` to `target`.
    ///
    /// Returns [SubmitError::NotLeader] when `target` is not the leader.
    async fn submit(
        &self,
        target: CommitTarget,
        request: CommitRequest,
    ) -> Result<CommitReply, SubmitError>;
}

/// Resolves the replicas of a group from its current configuration.
pub trait ReplicaResolver: Send + Sync + 'static {
    /// Data stream addresses of every member other than this server, in a stable order.
    fn current_replicas(&self, group_id: &GroupId) -> Vec<PeerAddress>;
}

/// Channel used by the primary to forward packets to a replica.
#[async_trait]
pub trait ReplicaForwarder: Send + Sync + 'static {
    /// Deliver `packet` to `peer` and wait for its acknowledgement.
    ///
    /// The forwarder owns `packet` from here on; the caller may drop its own views.
    async fn send(&self, peer: &PeerAddress, packet: RequestPacket) -> Result<(), ForwardError>;

    /// The stream ended on this server. Drop the channel to `peer` used for `stream_id`.
    ///
    /// A replica still holding the stream must abort it before this returns, so the id can
    /// be opened again right away.
    async fn release(&self, _peer: &PeerAddress, _stream_id: StreamId) {}
}

/// Local durable storage for stream data on this server.
#[async_trait]
pub trait StreamSink: Send + Sync + 'static {
    /// A stream was opened with optional metadata.
    async fn open(&self, _stream_id: StreamId, _metadata: Bytes) -> eyre::Result<()> {
        Ok(())
    }

    /// Persist a chunk of stream data.
    async fn write(&self, stream_id: StreamId, offset: StreamOffset, data: Bytes)
        -> eyre::Result<()>;

    /// The stream finished with `total` bytes.
    async fn close(&self, _stream_id: StreamId, _total: u64) -> eyre::Result<()> {
        Ok(())
    }

    /// The stream failed; anything written for it may be discarded.
    async fn abort(&self, _stream_id: StreamId) {}
}

/// Sink that accepts and discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl StreamSink for DiscardSink {
    async fn write(&self, _: StreamId, _: StreamOffset, _: Bytes) -> eyre::Result<()> {
        Ok(())
    }
}
