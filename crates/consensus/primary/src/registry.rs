//! Table of live stream sessions.

use dashmap::{mapref::entry::Entry, DashMap};
use ds_types::{DataStreamResult, ProtocolViolation, StreamId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Counters of one session, readable from any thread.
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_in_flight: AtomicU64,
    bytes_written: AtomicU64,
}

impl SessionStats {
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn add_in_flight(&self, len: u64) {
        self.bytes_in_flight.fetch_add(len, Ordering::Relaxed);
    }

    pub(crate) fn acknowledge(&self, len: u64) {
        self.bytes_in_flight.fetch_sub(len, Ordering::Relaxed);
        self.bytes_written.fetch_add(len, Ordering::Relaxed);
    }

    pub(crate) fn release(&self, len: u64) {
        self.bytes_in_flight.fetch_sub(len, Ordering::Relaxed);
    }
}

/// Concurrent map of live stream ids.
///
/// Inserting and removing are the only structural changes. Session state itself stays with
/// the connection that owns the stream; this table holds each session's [SessionStats] for
/// monitoring.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<StreamId, Arc<SessionStats>>>,
}

impl SessionRegistry {
    /// Create a new instance of Self.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `stream_id` for a new session.
    pub fn register(&self, stream_id: StreamId) -> DataStreamResult<Arc<SessionStats>> {
        match self.sessions.entry(stream_id) {
            Entry::Occupied(_) => Err(ProtocolViolation::StreamExists(stream_id).into()),
            Entry::Vacant(entry) => {
                let stats = Arc::new(SessionStats::default());
                entry.insert(stats.clone());
                Ok(stats)
            }
        }
    }

    /// Release `stream_id`. The id may be registered again afterwards.
    pub fn remove(&self, stream_id: StreamId) -> Option<Arc<SessionStats>> {
        self.sessions.remove(&stream_id).map(|(_, stats)| stats)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.sessions.contains_key(&stream_id)
    }

    /// Number of live sessions.
    pub fn active_streams(&self) -> usize {
        self.sessions.len()
    }

    /// Bytes accepted by live sessions and not yet acknowledged by every replica.
    pub fn bytes_in_flight(&self) -> u64 {
        self.sessions.iter().map(|entry| entry.value().bytes_in_flight()).sum()
    }
}
