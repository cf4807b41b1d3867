//! Messages exchanged with the consensus layer when a stream closes.

use crate::{GroupId, PeerId, StreamId};
use serde::{Deserialize, Serialize};

/// Request to make a finished stream durable through consensus.
///
/// Only the commit decision travels through the log; the data is already on every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// The group the stream was written to.
    pub group_id: GroupId,
    /// The stream being committed.
    pub stream_id: StreamId,
    /// Total bytes acknowledged by every replica.
    pub bytes_written: u64,
    /// Call id for deduplication by the consensus layer.
    pub call_id: u64,
}

/// Where a commit request is submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitTarget {
    /// The local server's client-request entry point.
    Local,
    /// A remote server over the client protocol.
    Peer(PeerId),
}

/// Successful commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReply {
    /// The server that accepted the request.
    pub server: PeerId,
    /// Log index of the committed entry.
    pub committed_index: u64,
}
