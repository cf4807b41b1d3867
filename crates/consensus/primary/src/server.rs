//! Accept loops and the per-connection read/handle/reply loop.

use crate::{DataStreamPrimary, StreamHandler, StreamRole};
use ds_network::{FrameResult, HeaderCodec, PacketReader, PacketWriter};
use eyre::WrapErr as _;
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, info, warn};

/// Handle to a running server.
///
/// Dropping the handle stops the server without waiting for connections to finish.
#[derive(Debug)]
pub struct ServerHandle {
    client_address: SocketAddr,
    peer_address: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl ServerHandle {
    /// Bound address of the client listener.
    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }

    /// Bound address of the replica listener.
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    /// Stop accepting, close every connection and wait for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(target: "datastream::server", ?e, "listener task failed");
            }
        }
        info!(target: "datastream::server", client_address = %self.client_address, "server stopped");
    }
}

pub(crate) async fn spawn(primary: DataStreamPrimary) -> eyre::Result<ServerHandle> {
    let parameters = primary.parameters().clone();
    parameters.tracing();

    let client_listener = TcpListener::bind(parameters.client_address)
        .await
        .wrap_err_with(|| format!("failed to bind client address {}", parameters.client_address))?;
    let peer_listener = TcpListener::bind(parameters.peer_address)
        .await
        .wrap_err_with(|| format!("failed to bind peer address {}", parameters.peer_address))?;
    let client_address = client_listener.local_addr()?;
    let peer_address = peer_listener.local_addr()?;

    let (shutdown, rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(accept_loop(client_listener, primary.clone(), StreamRole::Primary, rx.clone()));
    tasks.spawn(accept_loop(peer_listener, primary, StreamRole::Replica, rx));

    info!(
        target: "datastream::server",
        %client_address,
        %peer_address,
        "data stream server started"
    );
    Ok(ServerHandle { client_address, peer_address, shutdown, tasks })
}

async fn accept_loop(
    listener: TcpListener,
    primary: DataStreamPrimary,
    role: StreamRole,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(target: "datastream::server", role = role.as_str(), %remote, "accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(target: "datastream::server", %remote, ?e, "failed to set nodelay");
                    }
                    let handler = primary.connection_handler(role);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let (read, write) = stream.into_split();
                        if let Err(e) = serve_connection(read, write, handler, shutdown).await {
                            warn!(target: "datastream::server", %remote, %e, "connection dropped");
                        }
                    });
                }
                Err(e) => warn!(target: "datastream::server", role = role.as_str(), ?e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    debug!(target: "datastream::server", role = role.as_str(), "accept loop stopped");
}

/// Serve one connection until the peer closes it, framing fails or `shutdown` fires.
///
/// Requests are handled strictly in order. Whatever way the loop ends, the connection's open
/// sessions are aborted.
pub async fn serve_connection<R, W>(
    read: R,
    write: W,
    mut handler: StreamHandler,
    mut shutdown: watch::Receiver<bool>,
) -> FrameResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let parameters = handler.parameters();
    let codec = HeaderCodec::from_parameters(parameters);
    let mut reader = PacketReader::new(read, codec, parameters.read_buffer_capacity);
    let mut writer = PacketWriter::new(write, codec);

    let result = loop {
        let packet = tokio::select! {
            res = reader.read_request() => match res {
                Ok(Some(packet)) => packet,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = shutdown.changed() => break Ok(()),
        };

        let reply = handler.handle(packet).await;
        if let Err(e) = writer.write_reply(&reply).await {
            break Err(e);
        }
    };

    if handler.open_streams() > 0 {
        debug!(
            target: "datastream::server",
            role = handler.role().as_str(),
            open = handler.open_streams(),
            "aborting streams of closed connection"
        );
    }
    handler.abort_all().await;
    result
}
