//! Fan a packet out to every replica and the local sink.

use ds_types::{
    DataStreamError, DataStreamResult, ForwardError, PeerAddress, ReplicaForwarder, RequestPacket,
};
use futures::{
    future::BoxFuture,
    stream::{futures_unordered::FuturesUnordered, StreamExt as _},
    FutureExt as _,
};
use std::{future::Future, time::Duration};
use tracing::{debug, error};

/// Forward `packet` to every replica while `local` persists it on this server.
///
/// Resolves once every acknowledgement arrived, or with the first failure. Forwards still
/// running after a failure are dropped.
///
/// The caller's view of the payload is released as soon as every forward has been issued;
/// from then on only the forwards hold it.
pub(crate) async fn replicate<'a, L>(
    forwarder: &'a dyn ReplicaForwarder,
    replicas: &'a [PeerAddress],
    packet: RequestPacket,
    local: L,
    timeout: Duration,
) -> DataStreamResult<()>
where
    L: Future<Output = eyre::Result<()>> + Send + 'a,
{
    let header = *packet.header();
    let mut waiting: FuturesUnordered<BoxFuture<'a, DataStreamResult<()>>> =
        FuturesUnordered::new();

    for peer in replicas {
        let forward = forwarder.send(peer, packet.clone());
        waiting.push(
            async move {
                match tokio::time::timeout(timeout, forward).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        let reason = match e {
                            ForwardError::Rejected(reason) => format!("rejected: {reason}"),
                            ForwardError::Network(reason) => reason,
                        };
                        Err(DataStreamError::ReplicaForward { peer: *peer, reason })
                    }
                    Err(_) => Err(DataStreamError::Timeout {
                        operation: format!("forward to replica {peer}"),
                        after: timeout,
                    }),
                }
            }
            .boxed(),
        );
    }
    drop(packet);

    waiting.push(
        async move {
            match tokio::time::timeout(timeout, local).await {
                Ok(res) => res.map_err(|e| DataStreamError::LocalWrite(e.to_string())),
                Err(_) => Err(DataStreamError::Timeout {
                    operation: "local write".to_string(),
                    after: timeout,
                }),
            }
        }
        .boxed(),
    );

    debug!(
        target: "datastream::replication",
        %header,
        replicas = replicas.len(),
        "waiting for acknowledgements"
    );

    while let Some(res) = waiting.next().await {
        if let Err(e) = res {
            error!(target: "datastream::replication", %header, ?e, "replication failed");
            return Err(e);
        }
    }
    Ok(())
}
