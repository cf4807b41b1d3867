//! Per-connection packet handling.

use crate::{
    commit::commit_stream,
    primary::{PrimaryInner, StreamRole},
    replication::replicate,
    SessionRegistry, StreamSession,
};
use bytes::Bytes;
use ds_config::Parameters;
use ds_types::{
    CommitRequest, DataStreamError, PacketHeader, PacketKind, ProtocolViolation, ReplyPacket,
    RequestPacket, StreamId,
};
use futures::future::join_all;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

/// A stream-fatal error and the byte total durable when it happened.
#[derive(Debug, thiserror::Error)]
#[error("{error} (bytes written: {bytes_written})")]
pub struct StreamFailure {
    pub error: DataStreamError,
    pub bytes_written: u64,
}

impl StreamFailure {
    fn new(error: DataStreamError, bytes_written: u64) -> Self {
        Self { error, bytes_written }
    }
}

type HandlerResult = Result<u64, StreamFailure>;

/// Drives the streams of one connection.
///
/// Packets are handled one at a time in arrival order, so each reply follows the reply to
/// the previous request. Sessions belong to this handler; only their ids and counters are
/// shared through the registry.
pub struct StreamHandler {
    inner: Arc<PrimaryInner>,
    role: StreamRole,
    sessions: HashMap<StreamId, StreamSession>,
    /// Streams of this connection that closed or failed.
    terminated: HashSet<StreamId>,
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("role", &self.role)
            .field("sessions", &self.sessions.len())
            .field("terminated", &self.terminated.len())
            .finish()
    }
}

impl StreamHandler {
    pub(crate) fn new(inner: Arc<PrimaryInner>, role: StreamRole) -> Self {
        Self { inner, role, sessions: HashMap::new(), terminated: HashSet::new() }
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// Sessions currently open on this connection.
    pub fn open_streams(&self) -> usize {
        self.sessions.len()
    }

    /// Handle one request and produce its reply.
    ///
    /// Failures never escape: they become a reply with `success=false` of the same kind.
    pub async fn handle(&mut self, packet: RequestPacket) -> ReplyPacket {
        let header = *packet.header();
        debug!(target: "datastream::session", role = self.role.as_str(), %header, "handling packet");

        let result = match header.kind() {
            PacketKind::StreamHeader => self.open(packet).await,
            PacketKind::StreamData => self.write(packet).await,
            PacketKind::StreamClose => {
                drop(packet);
                self.close(&header).await
            }
        };
        if self.role == StreamRole::Primary {
            self.inner.refresh_gauges();
        }

        match result {
            Ok(bytes_written) => ReplyPacket::success(&header, bytes_written),
            Err(StreamFailure { error, bytes_written }) => {
                if error.is_protocol_violation() {
                    warn!(target: "datastream::session", %header, %error, "protocol violation");
                }
                ReplyPacket::failure(&header, bytes_written, &error.to_string())
            }
        }
    }

    /// Fail every open session. Called once the connection is gone.
    pub async fn abort_all(&mut self) {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for stream_id in ids {
            if let Some(session) = self.sessions.remove(&stream_id) {
                self.finish_failed(session, DataStreamError::ConnectionClosed).await;
            }
        }
        if self.role == StreamRole::Primary {
            self.inner.refresh_gauges();
        }
    }

    async fn open(&mut self, packet: RequestPacket) -> HandlerResult {
        let stream_id = packet.stream_id();
        if let Some(session) = self.sessions.remove(&stream_id) {
            let error = ProtocolViolation::StreamExists(stream_id).into();
            return Err(self.finish_failed(session, error).await);
        }

        let stats = self.registry().register(stream_id).map_err(|e| StreamFailure::new(e, 0))?;
        self.terminated.remove(&stream_id);

        let replicas = match self.role {
            StreamRole::Primary => {
                self.inner.resolver.current_replicas(&self.inner.parameters.group_id)
            }
            StreamRole::Replica => Vec::new(),
        };
        let session = StreamSession::new(stream_id, replicas, stats);
        info!(
            target: "datastream::session",
            role = self.role.as_str(),
            stream_id,
            replicas = ?session.replicas(),
            "stream opened"
        );

        let inner = self.inner.clone();
        let local = inner.sink.open(stream_id, packet.slice());
        let result = replicate(
            &*inner.forwarder,
            session.replicas(),
            packet,
            local,
            inner.parameters.replica_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                self.sessions.insert(stream_id, session);
                Ok(0)
            }
            Err(e) => {
                self.record_replication_failure(&e);
                Err(self.finish_failed(session, e).await)
            }
        }
    }

    async fn write(&mut self, packet: RequestPacket) -> HandlerResult {
        let header = *packet.header();
        let stream_id = header.stream_id();
        let Some(mut session) = self.sessions.remove(&stream_id) else {
            return Err(self.missing(stream_id));
        };
        if let Err(e) = session.accept_data(&header) {
            return Err(self.finish_failed(session, e).await);
        }

        let inner = self.inner.clone();
        let local = inner.sink.write(stream_id, header.stream_offset(), packet.slice());
        let result = replicate(
            &*inner.forwarder,
            session.replicas(),
            packet,
            local,
            inner.parameters.replica_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                session.acknowledge(header.data_length());
                let total = session.total_bytes_written();
                self.sessions.insert(stream_id, session);
                Ok(total)
            }
            Err(e) => {
                self.record_replication_failure(&e);
                Err(self.finish_failed(session, e).await)
            }
        }
    }

    async fn close(&mut self, header: &PacketHeader) -> HandlerResult {
        let stream_id = header.stream_id();
        let Some(mut session) = self.sessions.remove(&stream_id) else {
            return Err(self.missing(stream_id));
        };
        if let Err(e) = session.begin_close(header) {
            return Err(self.finish_failed(session, e).await);
        }
        let total = session.total_bytes_written();

        let inner = self.inner.clone();
        // replicas only need the close marker; the data is already there
        let packet = RequestPacket::new(
            stream_id,
            header.stream_offset(),
            PacketKind::StreamClose,
            Bytes::new(),
        );
        let local = inner.sink.close(stream_id, total);
        let replicated = replicate(
            &*inner.forwarder,
            session.replicas(),
            packet,
            local,
            inner.parameters.replica_timeout,
        )
        .await;
        if let Err(e) = replicated {
            self.record_replication_failure(&e);
            return Err(self.finish_failed(session, e).await);
        }

        if self.role == StreamRole::Primary {
            let request = CommitRequest {
                group_id: inner.parameters.group_id.clone(),
                stream_id,
                bytes_written: total,
                call_id: inner.next_call_id(),
            };
            let committed =
                commit_stream(&*inner.consensus, request, inner.commit_policy(), &inner.metrics)
                    .await;
            if let Err(e) = committed {
                return Err(self.finish_failed(session, e).await);
            }
        }

        session.complete();
        self.release_replicas(&session).await;
        self.registry().remove(stream_id);
        self.terminated.insert(stream_id);
        if self.role == StreamRole::Primary {
            self.inner.metrics.streams_closed.inc();
        }
        info!(
            target: "datastream::session",
            role = self.role.as_str(),
            stream_id,
            bytes_written = total,
            "stream closed"
        );
        Ok(total)
    }

    /// Reject a packet for a stream this connection has no session for.
    fn missing(&self, stream_id: StreamId) -> StreamFailure {
        let violation = if self.terminated.contains(&stream_id) {
            ProtocolViolation::Terminated(stream_id)
        } else {
            ProtocolViolation::UnknownStream(stream_id)
        };
        StreamFailure::new(violation.into(), 0)
    }

    /// Move `session` to FAILED and release its id.
    async fn finish_failed(
        &mut self,
        mut session: StreamSession,
        error: DataStreamError,
    ) -> StreamFailure {
        let stream_id = session.stream_id();
        session.fail();
        // every copy is dropped before the id is free again
        self.release_replicas(&session).await;
        self.inner.sink.abort(stream_id).await;
        self.registry().remove(stream_id);
        self.terminated.insert(stream_id);

        if self.role == StreamRole::Primary {
            self.inner.metrics.streams_failed.inc();
        }
        error!(
            target: "datastream::session",
            role = self.role.as_str(),
            stream_id,
            bytes_written = session.total_bytes_written(),
            %error,
            "stream failed"
        );
        StreamFailure::new(error, session.total_bytes_written())
    }

    /// Close the forwarding channels of `session`. Replicas still holding it abort it.
    async fn release_replicas(&self, session: &StreamSession) {
        let forwarder = &*self.inner.forwarder;
        let stream_id = session.stream_id();
        join_all(session.replicas().iter().map(|peer| forwarder.release(peer, stream_id))).await;
    }

    fn record_replication_failure(&self, error: &DataStreamError) {
        if self.role == StreamRole::Primary
            && matches!(
                error,
                DataStreamError::ReplicaForward { .. } | DataStreamError::Timeout { .. }
            )
        {
            self.inner.metrics.replica_failures.inc();
        }
    }

    fn registry(&self) -> &SessionRegistry {
        self.inner.registry(self.role)
    }
}

impl Drop for StreamHandler {
    fn drop(&mut self) {
        // sessions left here were never aborted; release their ids
        for (stream_id, mut session) in self.sessions.drain() {
            session.fail();
            self.inner.registry(self.role).remove(stream_id);
        }
        if self.role == StreamRole::Primary {
            self.inner.refresh_gauges();
        }
    }
}
