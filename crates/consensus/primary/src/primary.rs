//! The data stream primary: shared state for every connection it serves.

use crate::{
    commit::CommitPolicy, server::ServerHandle, SessionRegistry, StaticReplicaResolver,
    StreamHandler,
};
use ds_config::Parameters;
use ds_network::TcpReplicaForwarder;
use ds_primary_metrics::PrimaryMetrics;
use ds_types::{ConsensusClient, ReplicaForwarder, ReplicaResolver, StreamSink};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Which side of the protocol a connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    /// Client connections. Packets are forwarded to replicas and closes are committed.
    Primary,
    /// Packets forwarded by another primary. Stored locally only.
    Replica,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

pub(crate) struct PrimaryInner {
    pub(crate) parameters: Parameters,
    /// Sessions opened by clients.
    pub(crate) primary_sessions: SessionRegistry,
    /// Sessions opened by other primaries forwarding to this server.
    pub(crate) replica_sessions: SessionRegistry,
    pub(crate) resolver: Arc<dyn ReplicaResolver>,
    pub(crate) forwarder: Arc<dyn ReplicaForwarder>,
    pub(crate) consensus: Arc<dyn ConsensusClient>,
    pub(crate) sink: Arc<dyn StreamSink>,
    pub(crate) metrics: Arc<PrimaryMetrics>,
    /// Source of commit call ids.
    next_call_id: AtomicU64,
}

impl PrimaryInner {
    pub(crate) fn registry(&self, role: StreamRole) -> &SessionRegistry {
        match role {
            StreamRole::Primary => &self.primary_sessions,
            StreamRole::Replica => &self.replica_sessions,
        }
    }

    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            timeout: self.parameters.commit_timeout,
            max_redirects: self.parameters.max_redirects,
        }
    }

    /// Mirror the primary registry into the gauges.
    pub(crate) fn refresh_gauges(&self) {
        self.metrics.active_streams.set(self.primary_sessions.active_streams() as i64);
        self.metrics.bytes_in_flight.set(self.primary_sessions.bytes_in_flight() as i64);
    }
}

/// Runs the primary and replica roles of a data stream server.
///
/// Cheap to clone; all clones share the session tables.
#[derive(Clone)]
pub struct DataStreamPrimary {
    inner: Arc<PrimaryInner>,
}

impl std::fmt::Debug for DataStreamPrimary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStreamPrimary")
            .field("group_id", &self.inner.parameters.group_id)
            .field("active_streams", &self.inner.primary_sessions.active_streams())
            .finish()
    }
}

impl DataStreamPrimary {
    /// Create a new instance of Self.
    pub fn new(
        parameters: Parameters,
        resolver: Arc<dyn ReplicaResolver>,
        forwarder: Arc<dyn ReplicaForwarder>,
        consensus: Arc<dyn ConsensusClient>,
        sink: Arc<dyn StreamSink>,
        metrics: Arc<PrimaryMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(PrimaryInner {
                parameters,
                primary_sessions: SessionRegistry::new(),
                replica_sessions: SessionRegistry::new(),
                resolver,
                forwarder,
                consensus,
                sink,
                metrics,
                next_call_id: AtomicU64::new(0),
            }),
        }
    }

    /// Primary with replicas taken from `parameters` and reached over TCP.
    pub fn with_tcp_replicas(
        parameters: Parameters,
        consensus: Arc<dyn ConsensusClient>,
        sink: Arc<dyn StreamSink>,
        metrics: Arc<PrimaryMetrics>,
    ) -> Self {
        let resolver = Arc::new(StaticReplicaResolver::from_parameters(&parameters));
        let forwarder = Arc::new(TcpReplicaForwarder::new(&parameters));
        Self::new(parameters, resolver, forwarder, consensus, sink, metrics)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// Live sessions of `role`, for monitoring.
    pub fn registry(&self, role: StreamRole) -> &SessionRegistry {
        self.inner.registry(role)
    }

    /// Handler for a newly accepted connection.
    pub fn connection_handler(&self, role: StreamRole) -> StreamHandler {
        StreamHandler::new(self.inner.clone(), role)
    }

    /// Bind both listeners and serve until the returned handle is shut down.
    pub async fn spawn(self) -> eyre::Result<ServerHandle> {
        crate::server::spawn(self).await
    }
}
