//! Commit a closed stream through consensus, following leader redirects.

use ds_primary_metrics::PrimaryMetrics;
use ds_types::{
    CommitReply, CommitRequest, CommitTarget, ConsensusClient, DataStreamError, DataStreamResult,
    SubmitError,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounds for [commit_stream].
#[derive(Clone, Copy, Debug)]
pub(crate) struct CommitPolicy {
    /// Deadline of each submission.
    pub(crate) timeout: Duration,
    /// Redirects after which the commit gives up.
    pub(crate) max_redirects: usize,
}

/// Submit `request` locally, then to each suggested leader in turn.
///
/// Only the commit request travels; stream data is never re-sent. The chain of redirects is
/// bounded by [CommitPolicy::max_redirects] so an election in progress cannot bounce the
/// request forever.
pub(crate) async fn commit_stream(
    consensus: &dyn ConsensusClient,
    request: CommitRequest,
    policy: CommitPolicy,
    metrics: &PrimaryMetrics,
) -> DataStreamResult<CommitReply> {
    let stream_id = request.stream_id;
    let mut target = CommitTarget::Local;
    let mut redirects = 0;

    loop {
        debug!(target: "datastream::commit", stream_id, ?target, "submitting commit");
        let submission = consensus.submit(target.clone(), request.clone());
        let result = tokio::time::timeout(policy.timeout, submission).await.map_err(|_| {
            DataStreamError::Timeout {
                operation: format!("commit of stream {stream_id}"),
                after: policy.timeout,
            }
        })?;

        match result {
            Ok(reply) => {
                info!(
                    target: "datastream::commit",
                    stream_id,
                    server = %reply.server,
                    index = reply.committed_index,
                    redirects,
                    "stream committed"
                );
                return Ok(reply);
            }
            Err(SubmitError::NotLeader { server, suggested_leader: Some(leader) }) => {
                redirects += 1;
                metrics.leader_redirects.inc();
                if redirects >= policy.max_redirects {
                    warn!(
                        target: "datastream::commit",
                        stream_id,
                        %server,
                        redirects,
                        "giving up on leader redirects"
                    );
                    return Err(DataStreamError::RedirectsExhausted(redirects));
                }
                warn!(target: "datastream::commit", stream_id, %server, %leader, "redirecting commit");
                target = CommitTarget::Peer(leader);
            }
            Err(SubmitError::NotLeader { server, suggested_leader: None }) => {
                return Err(DataStreamError::NotLeader { server, suggested_leader: None });
            }
            Err(SubmitError::Failed(reason)) => return Err(DataStreamError::Commit(reason)),
        }
    }
}
