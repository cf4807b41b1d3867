//! Per-stream state machine.

use crate::registry::SessionStats;
use ds_types::{
    ensure, DataStreamError, DataStreamResult, PacketHeader, PacketKind, PeerAddress,
    ProtocolViolation, StreamId, StreamOffset,
};
use std::{fmt, sync::Arc};

/// Lifecycle of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting `STREAM_DATA`.
    Open,
    /// `STREAM_CLOSE` received, waiting for replicas and the commit.
    Closing,
    /// Committed. Terminal.
    Closed,
    /// Any error. Terminal.
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one stream on this server.
///
/// Owned by the connection driving the stream. The registry only sees the shared
/// [SessionStats].
#[derive(Debug)]
pub struct StreamSession {
    stream_id: StreamId,
    /// Replicas resolved when the stream opened.
    replicas: Vec<PeerAddress>,
    /// Offset the next data packet must carry.
    expected_next_offset: StreamOffset,
    /// Bytes acknowledged by every replica and the local sink.
    total_bytes_written: u64,
    state: SessionState,
    stats: Arc<SessionStats>,
}

impl StreamSession {
    /// Create a new instance of Self in [SessionState::Open].
    pub fn new(stream_id: StreamId, replicas: Vec<PeerAddress>, stats: Arc<SessionStats>) -> Self {
        Self {
            stream_id,
            replicas,
            expected_next_offset: 0,
            total_bytes_written: 0,
            state: SessionState::Open,
            stats,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn replicas(&self) -> &[PeerAddress] {
        &self.replicas
    }

    pub fn expected_next_offset(&self) -> StreamOffset {
        self.expected_next_offset
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes accepted from the client but not yet acknowledged everywhere.
    pub fn pending_bytes(&self) -> u64 {
        self.expected_next_offset - self.total_bytes_written
    }

    /// Accept the header of a data packet and advance the expected offset.
    ///
    /// The written total does not move until [Self::acknowledge].
    pub fn accept_data(&mut self, header: &PacketHeader) -> DataStreamResult<()> {
        self.ensure_state(PacketKind::StreamData, SessionState::Open)?;
        ensure!(
            header.stream_offset() == self.expected_next_offset,
            ProtocolViolation::OffsetMismatch {
                stream_id: self.stream_id,
                expected: self.expected_next_offset,
                received: header.stream_offset(),
            }
        );
        let next = self.expected_next_offset.checked_add(header.data_length()).ok_or(
            DataStreamError::ProtocolViolation(ProtocolViolation::OffsetMismatch {
                stream_id: self.stream_id,
                expected: self.expected_next_offset,
                received: header.stream_offset(),
            }),
        )?;
        self.expected_next_offset = next;
        self.stats.add_in_flight(header.data_length());
        Ok(())
    }

    /// Every replica and the local sink acknowledged `len` more bytes.
    pub fn acknowledge(&mut self, len: u64) {
        debug_assert!(len <= self.pending_bytes());
        self.total_bytes_written += len;
        self.stats.acknowledge(len);
    }

    /// Move to [SessionState::Closing] on `STREAM_CLOSE`.
    ///
    /// The close must continue the stream and nothing may be awaiting acknowledgement.
    pub fn begin_close(&mut self, header: &PacketHeader) -> DataStreamResult<()> {
        self.ensure_state(PacketKind::StreamClose, SessionState::Open)?;
        ensure!(
            header.stream_offset() == self.expected_next_offset,
            ProtocolViolation::OffsetMismatch {
                stream_id: self.stream_id,
                expected: self.expected_next_offset,
                received: header.stream_offset(),
            }
        );
        ensure!(
            self.pending_bytes() == 0,
            DataStreamError::PendingAcknowledgements(self.pending_bytes())
        );
        self.state = SessionState::Closing;
        Ok(())
    }

    /// The commit succeeded.
    pub fn complete(&mut self) {
        debug_assert_eq!(self.state, SessionState::Closing);
        self.state = SessionState::Closed;
    }

    /// The stream failed. Unacknowledged bytes are dropped from the in-flight count.
    pub fn fail(&mut self) {
        self.stats.release(self.pending_bytes());
        self.state = SessionState::Failed;
    }

    fn ensure_state(&self, kind: PacketKind, expected: SessionState) -> DataStreamResult<()> {
        ensure!(
            self.state == expected,
            ProtocolViolation::InvalidState {
                stream_id: self.stream_id,
                kind: kind.as_str(),
                state: self.state.as_str(),
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn data(offset: u64, len: u64) -> PacketHeader {
        PacketHeader::new(42, offset, PacketKind::StreamData, len)
    }

    fn close(offset: u64) -> PacketHeader {
        PacketHeader::new(42, offset, PacketKind::StreamClose, 0)
    }

    #[test]
    fn test_data_then_close() {
        let stats = Arc::new(SessionStats::default());
        let mut session = StreamSession::new(42, vec![], stats.clone());

        session.accept_data(&data(0, 100)).unwrap();
        assert_eq!(session.total_bytes_written(), 0);
        assert_eq!(stats.bytes_in_flight(), 100);
        session.acknowledge(100);

        session.accept_data(&data(100, 50)).unwrap();
        session.acknowledge(50);
        assert_eq!(session.total_bytes_written(), 150);
        assert_eq!(stats.bytes_in_flight(), 0);
        assert_eq!(stats.bytes_written(), 150);

        session.begin_close(&close(150)).unwrap();
        assert_eq!(session.state(), SessionState::Closing);
        session.complete();
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_offset_mismatch_leaves_total() {
        let mut session = StreamSession::new(42, vec![], Arc::default());
        session.accept_data(&data(0, 10)).unwrap();
        session.acknowledge(10);

        assert_matches!(
            session.accept_data(&data(20, 5)),
            Err(DataStreamError::ProtocolViolation(ProtocolViolation::OffsetMismatch {
                expected: 10,
                received: 20,
                ..
            }))
        );
        assert_eq!(session.total_bytes_written(), 10);
        assert_eq!(session.expected_next_offset(), 10);
    }

    #[test]
    fn test_close_with_pending_bytes() {
        let stats = Arc::new(SessionStats::default());
        let mut session = StreamSession::new(42, vec![], stats.clone());
        session.accept_data(&data(0, 10)).unwrap();

        assert_matches!(
            session.begin_close(&close(10)),
            Err(DataStreamError::PendingAcknowledgements(10))
        );
        session.fail();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(stats.bytes_in_flight(), 0);
    }

    #[test]
    fn test_close_at_wrong_offset() {
        let mut session = StreamSession::new(42, vec![], Arc::default());
        assert_matches!(
            session.begin_close(&close(3)),
            Err(DataStreamError::ProtocolViolation(ProtocolViolation::OffsetMismatch { .. }))
        );
    }

    #[test]
    fn test_data_after_close_is_invalid() {
        let mut session = StreamSession::new(42, vec![], Arc::default());
        session.begin_close(&close(0)).unwrap();
        assert_matches!(
            session.accept_data(&data(0, 1)),
            Err(DataStreamError::ProtocolViolation(ProtocolViolation::InvalidState {
                state: "CLOSING",
                ..
            }))
        );
    }
}
