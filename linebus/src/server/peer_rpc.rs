//! The peer RPC listener: Raft traffic and forwarded writes.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::network::ForwardOutcome;
use crate::network::PeerRequest;
use crate::network::PeerResponse;
use crate::server::ServerContext;
use crate::storage::LogStore;
use crate::ClientWriteError;

/// Spawn the accept loop for the peer RPC endpoint.
pub(super) fn spawn_listener<S: LogStore>(
    listener: TcpListener,
    ctx: Arc<ServerContext<S>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "peer connected");
                            let ctx = ctx.clone();
                            tokio::spawn(
                                async move {
                                    if let Err(err) = serve_peer(stream, ctx).await {
                                        tracing::debug!(%addr, error=%err, "peer connection closed");
                                    }
                                }
                                .instrument(tracing::debug_span!("peer-conn")),
                            );
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, "error accepting peer connection");
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("peer RPC listener shutting down");
                        return;
                    }
                }
            }
        }
        .instrument(tracing::debug_span!("peer-rpc")),
    )
}

/// Serve one peer connection: one JSON request line in, one JSON response
/// line out, until the peer hangs up.
async fn serve_peer<S: LogStore>(stream: TcpStream, ctx: Arc<ServerContext<S>>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<PeerRequest>(&line) {
            Ok(request) => dispatch(request, &ctx).await,
            Err(err) => PeerResponse::Error(format!("malformed peer request: {}", err)),
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch<S: LogStore>(request: PeerRequest, ctx: &Arc<ServerContext<S>>) -> PeerResponse {
    match request {
        PeerRequest::AppendEntries(rpc) => match ctx.raft.append_entries(rpc).await {
            Ok(resp) => PeerResponse::AppendEntries(resp),
            Err(err) => PeerResponse::Error(err.to_string()),
        },
        PeerRequest::Vote(rpc) => match ctx.raft.vote(rpc).await {
            Ok(resp) => PeerResponse::Vote(resp),
            Err(err) => PeerResponse::Error(err.to_string()),
        },
        PeerRequest::Forward(rpc) => match ctx.raft.client_write(rpc).await {
            Ok(resp) => PeerResponse::Forward(ForwardOutcome::Committed(resp)),
            Err(ClientWriteError::ForwardToLeader(leader)) => {
                PeerResponse::Forward(ForwardOutcome::NotLeader { leader })
            }
            Err(err) => PeerResponse::Error(err.to_string()),
        },
        PeerRequest::Probe => PeerResponse::Probe(ctx.identity()),
    }
}
