// SPDX-License-Identifier: Apache-2.0
//! Metrics for the data stream primary.

#![allow(missing_docs)]

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

#[derive(Clone, Debug)]
pub struct PrimaryMetrics {
    /// Streams with a live session.
    pub active_streams: IntGauge,
    /// Bytes accepted from clients that replicas have not acknowledged yet.
    pub bytes_in_flight: IntGauge,
    /// Streams that closed and committed.
    pub streams_closed: IntCounter,
    /// Streams that ended in failure.
    pub streams_failed: IntCounter,
    /// NotLeader redirects followed while committing.
    pub leader_redirects: IntCounter,
    /// Forwards to replicas that failed or timed out.
    pub replica_failures: IntCounter,
}

impl PrimaryMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            active_streams: register_int_gauge_with_registry!(
                "datastream_active_streams",
                "Number of streams with a live session",
                registry
            )?,
            bytes_in_flight: register_int_gauge_with_registry!(
                "datastream_bytes_in_flight",
                "Bytes accepted but not yet acknowledged by every replica",
                registry
            )?,
            streams_closed: register_int_counter_with_registry!(
                "datastream_streams_closed",
                "Number of streams closed and committed",
                registry
            )?,
            streams_failed: register_int_counter_with_registry!(
                "datastream_streams_failed",
                "Number of streams that failed",
                registry
            )?,
            leader_redirects: register_int_counter_with_registry!(
                "datastream_leader_redirects",
                "Number of NotLeader redirects followed during commit",
                registry
            )?,
            replica_failures: register_int_counter_with_registry!(
                "datastream_replica_failures",
                "Number of failed or timed out replica forwards",
                registry
            )?,
        })
    }
}
