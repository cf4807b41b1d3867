// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for the data stream protocol.
//!
//! Framing errors ([MalformedHeaderError]) are connection-fatal and never reach a reply.
//! Everything else is a [DataStreamError]: stream-fatal, reported to the client as a reply
//! with `success=false`.

use crate::{PeerAddress, PeerId, StreamId, StreamOffset};
use std::time::Duration;
use thiserror::Error;

/// Return an error if the condition is false.
#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e.into());
        }
    };
}

/// Result alias for stream-fatal failures.
pub type DataStreamResult<T> = Result<T, DataStreamError>;

/// The header of a frame could not be decoded or violates the wire limits.
///
/// Once this happens the framing of the connection is lost, so the connection is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedHeaderError {
    /// The length prefix is zero.
    #[error("header length prefix is zero")]
    EmptyHeader,
    /// The length prefix exceeds the configured maximum.
    #[error("header length {len} exceeds maximum {max}")]
    HeaderTooLong { len: usize, max: usize },
    /// Fewer bytes than the length prefix announced.
    #[error("header truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    /// The header record is not a valid encoding (unknown kind tag, trailing bytes, ...).
    #[error("undecodable header record: {0}")]
    Decode(String),
    /// The declared data length exceeds the configured maximum.
    #[error("data length {len} exceeds maximum {max}")]
    DataTooLong { len: u64, max: u64 },
    /// A `STREAM_DATA` packet must carry data.
    #[error("data packet for stream {0} has no data")]
    EmptyData(StreamId),
}

/// A well-formed packet that is invalid for the current state of its stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `STREAM_HEADER` for a stream id that already has a live session.
    #[error("stream {0} is already open")]
    StreamExists(StreamId),
    /// A data or close packet for a stream that was never opened.
    #[error("stream {0} is not open")]
    UnknownStream(StreamId),
    /// A packet for a stream that has already been closed or failed.
    #[error("stream {0} has already terminated")]
    Terminated(StreamId),
    /// The packet offset does not continue the stream.
    #[error("stream {stream_id} expected offset {expected}, received {received}")]
    OffsetMismatch { stream_id: StreamId, expected: StreamOffset, received: StreamOffset },
    /// The session is not accepting this kind of packet.
    #[error("stream {stream_id} cannot accept {kind} while {state}")]
    InvalidState { stream_id: StreamId, kind: &'static str, state: &'static str },
}

/// Stream-fatal failures.
#[derive(Debug, Error, Clone)]
pub enum DataStreamError {
    /// The packet is invalid for the stream state machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    /// A replica rejected or failed to receive a forwarded packet.
    #[error("replica {peer} failed: {reason}")]
    ReplicaForward { peer: PeerAddress, reason: String },
    /// The local sink refused a write.
    #[error("local write failed: {0}")]
    LocalWrite(String),
    /// Data was still unacknowledged when the stream closed.
    #[error("{0} bytes still awaiting replica acknowledgement")]
    PendingAcknowledgements(u64),
    /// The contacted server is not the leader.
    #[error("{server} is not the leader (suggested leader: {suggested_leader:?})")]
    NotLeader { server: PeerId, suggested_leader: Option<PeerId> },
    /// The commit bounced between servers more than allowed.
    #[error("commit redirected {0} times without reaching the leader")]
    RedirectsExhausted(usize),
    /// Consensus refused the commit.
    #[error("commit failed: {0}")]
    Commit(String),
    /// A replica forward or commit submission missed its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    /// The connection owning the stream closed before `STREAM_CLOSE`.
    #[error("connection closed before stream completed")]
    ConnectionClosed,
}

impl DataStreamError {
    /// True when the error comes from the session state machine rather than I/O.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}

/// Failure reported by a [crate::ReplicaForwarder].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The replica received the packet and answered `success=false`.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The packet could not be delivered or the answer was lost.
    #[error("network: {0}")]
    Network(String),
}

/// Failure reported by a [crate::ConsensusClient] submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The contacted server is not the leader.
    #[error("{server} is not the leader")]
    NotLeader { server: PeerId, suggested_leader: Option<PeerId> },
    /// Any other failure. Not retried.
    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn check_offset(expected: u64, received: u64) -> DataStreamResult<()> {
        ensure!(
            expected == received,
            ProtocolViolation::OffsetMismatch { stream_id: 1, expected, received }
        );
        Ok(())
    }

    #[test]
    fn test_ensure_converts_violation() {
        assert!(check_offset(3, 3).is_ok());
        let err = check_offset(3, 4).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_matches!(
            err,
            DataStreamError::ProtocolViolation(ProtocolViolation::OffsetMismatch {
                expected: 3,
                received: 4,
                ..
            })
        );
    }
}
