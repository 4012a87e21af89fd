//! The client TCP endpoint: publishers and subscribers.
//!
//! A connection opens with an exactly-seven-byte role tag, `PUBLISH` or
//! `SUBSCRI`; everything after it is LF-terminated text. Publishers send
//! `FORMAT:…|…` frames; subscribers send `SUBSCRIBE:`/`UNSUBSCRIBE:`
//! commands and `PING`, and receive message frames on the same
//! connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::error::ProtocolError;
use crate::message::Message;
use crate::message::ROLE_PUBLISHER;
use crate::message::ROLE_SUBSCRIBER;
use crate::message::ROLE_TAG_LEN;
use crate::raft::ClientWriteRequest;
use crate::raft::Subscription;
use crate::raft::Unsubscription;
use crate::server::ProposeError;
use crate::server::ServerContext;
use crate::storage::LogStore;
use crate::subscribers::OutboundQueue;

/// Spawn the accept loop for the client TCP endpoint.
pub(super) fn spawn_listener<S: LogStore>(
    listener: TcpListener,
    ctx: Arc<ServerContext<S>>,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let ctx = ctx.clone();
                            let conn_shutdown = shutdown_tx.subscribe();
                            tokio::spawn(
                                async move {
                                    if let Err(err) = serve_client(stream, ctx, conn_shutdown).await {
                                        tracing::debug!(%addr, error=%err, "client connection closed");
                                    }
                                }
                                .instrument(tracing::debug_span!("client-conn")),
                            );
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, "error accepting client connection");
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("client listener shutting down");
                        return;
                    }
                }
            }
        }
        .instrument(tracing::debug_span!("client-tcp")),
    )
}

/// Read the role tag and hand the connection to the matching loop.
async fn serve_client<S: LogStore>(
    mut stream: TcpStream,
    ctx: Arc<ServerContext<S>>,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut tag = [0u8; ROLE_TAG_LEN];
    stream.read_exact(&mut tag).await?;

    if &tag == ROLE_PUBLISHER {
        ctx.stats.publisher_connections.fetch_add(1, Ordering::Relaxed);
        let res = publisher_loop(stream, &ctx, shutdown_rx).await;
        ctx.stats.publisher_connections.fetch_sub(1, Ordering::Relaxed);
        return res;
    }
    if &tag == ROLE_SUBSCRIBER {
        ctx.stats.subscriber_connections.fetch_add(1, Ordering::Relaxed);
        let res = subscriber_loop(stream, &ctx, shutdown_rx).await;
        ctx.stats.subscriber_connections.fetch_sub(1, Ordering::Relaxed);
        return res;
    }

    // An invalid role tag is the one protocol error that closes the
    // connection outright.
    ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
    let err = ProtocolError::UnknownRoleTag(String::from_utf8_lossy(&tag).into_owned());
    tracing::warn!(%err, "rejecting client connection");
    Err(err.into())
}

/// Handle a publisher connection: one message frame per line.
///
/// Accepted publishes get no acknowledgement; error frames carry a
/// machine-readable reason and, for `NOT_LEADER`, the leader's client
/// endpoint so the publisher can rebind.
async fn publisher_loop<S: LogStore>(
    stream: TcpStream,
    ctx: &Arc<ServerContext<S>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
            _ = shutdown_rx.recv() => return Ok(()),
        };
        if line.is_empty() {
            continue;
        }

        let msg = match Message::parse_frame(&line) {
            Ok(msg) => msg,
            Err(err) => {
                // Malformed frames are logged and dropped; the
                // connection stays open.
                ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "dropping malformed publish frame");
                continue;
            }
        };

        match ctx.propose_local(ClientWriteRequest::publish(msg)).await {
            Ok(_) => {}
            Err(ProposeError::NotLeader(leader)) => {
                let hint = leader.map(|p| p.client_addr().to_string()).unwrap_or_default();
                write_half.write_all(format!("ERROR:NOT_LEADER|{}\n", hint).as_bytes()).await?;
            }
            Err(ProposeError::Unavailable(reason)) => {
                tracing::warn!(%reason, "publish failed");
                write_half.write_all(b"ERROR:UNAVAILABLE|\n").await?;
            }
        }
    }
}

/// Handle a subscriber connection.
///
/// Subscription changes are relayed to the leader through consensus while
/// the connection stays on this node; committed messages for the
/// subscriber's topics arrive on the outbound queue, drained by a writer
/// task. A subscriber silent for longer than the idle timeout is
/// disconnected.
async fn subscriber_loop<S: LogStore>(
    stream: TcpStream,
    ctx: &Arc<ServerContext<S>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let peer_addr = stream.peer_addr()?;
    let subscriber_id = format!("{}@node{}", peer_addr, ctx.config.node_id);
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let queue = ctx.registry.register_connection(&subscriber_id);
    let writer = spawn_outbound_writer(queue.clone(), write_half);

    let idle = Duration::from_millis(ctx.config.subscriber_idle_timeout);
    let res: anyhow::Result<()> = loop {
        let line = tokio::select! {
            line = timeout(idle, lines.next_line()) => match line {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break Ok(()),
                Ok(Err(err)) => break Err(err.into()),
                Err(_) => {
                    tracing::info!(subscriber = %subscriber_id, "subscriber heartbeat timeout, disconnecting");
                    break Ok(());
                }
            },
            _ = shutdown_rx.recv() => break Ok(()),
        };
        if queue.is_detached() {
            break Ok(());
        }

        match parse_subscriber_line(&line) {
            Ok(SubscriberCommand::Ping) => {
                ctx.registry.record_heartbeat(&subscriber_id);
                queue.push("PONG".to_string());
            }
            Ok(SubscriberCommand::Subscribe(topic)) => {
                let rpc = ClientWriteRequest::subscribe(Subscription {
                    subscriber_id: subscriber_id.clone(),
                    node_id: ctx.config.node_id,
                    topic,
                });
                if let Err(err) = ctx.propose_forwarded(rpc).await {
                    tracing::warn!(subscriber = %subscriber_id, ?err, "subscribe failed");
                    queue.push("ERROR:UNAVAILABLE|".to_string());
                }
            }
            Ok(SubscriberCommand::Unsubscribe(topic)) => {
                let rpc = ClientWriteRequest::unsubscribe(Unsubscription {
                    subscriber_id: subscriber_id.clone(),
                    topic,
                });
                if let Err(err) = ctx.propose_forwarded(rpc).await {
                    tracing::warn!(subscriber = %subscriber_id, ?err, "unsubscribe failed");
                    queue.push("ERROR:UNAVAILABLE|".to_string());
                }
            }
            Err(err) => {
                ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subscriber = %subscriber_id, %err, "dropping malformed subscriber line");
            }
        }
    };

    // Tear down: stop delivery, then propagate the removal of this
    // subscriber's registrations through consensus.
    let topics = ctx.registry.drop_connection(&subscriber_id);
    ctx.propose_unsubscribe_all(&subscriber_id, topics).await;
    writer.abort();
    let _ = writer.await;
    res
}

/// Drain the outbound queue onto the socket. Exits when the queue is
/// detached or the socket fails; a failed write detaches the queue so the
/// reader side can clean up.
fn spawn_outbound_writer(queue: Arc<OutboundQueue>, mut write_half: OwnedWriteHalf) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(frame) = queue.pop().await {
                let mut payload = frame;
                payload.push('\n');
                if let Err(err) = write_half.write_all(payload.as_bytes()).await {
                    tracing::debug!(error=%err, "subscriber socket write failed, detaching");
                    queue.detach();
                    return;
                }
            }
        }
        .instrument(tracing::debug_span!("subscriber-writer")),
    )
}

#[derive(Debug, PartialEq)]
enum SubscriberCommand {
    Subscribe(String),
    Unsubscribe(String),
    Ping,
}

fn parse_subscriber_line(line: &str) -> Result<SubscriberCommand, ProtocolError> {
    if line == "PING" {
        return Ok(SubscriberCommand::Ping);
    }
    if let Some(topic) = line.strip_prefix("SUBSCRIBE:") {
        if topic.is_empty() {
            return Err(ProtocolError::MissingTopic);
        }
        return Ok(SubscriberCommand::Subscribe(topic.to_string()));
    }
    if let Some(topic) = line.strip_prefix("UNSUBSCRIBE:") {
        if topic.is_empty() {
            return Err(ProtocolError::MissingTopic);
        }
        return Ok(SubscriberCommand::Unsubscribe(topic.to_string()));
    }
    Err(ProtocolError::UnknownCommand(line.chars().take(32).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscriber_commands() {
        assert!(matches!(parse_subscriber_line("PING"), Ok(SubscriberCommand::Ping)));
        assert!(matches!(
            parse_subscriber_line("SUBSCRIBE:news"),
            Ok(SubscriberCommand::Subscribe(t)) if t == "news"
        ));
        assert!(matches!(
            parse_subscriber_line("UNSUBSCRIBE:news"),
            Ok(SubscriberCommand::Unsubscribe(t)) if t == "news"
        ));
    }

    #[test]
    fn rejects_empty_topic_and_unknown_commands() {
        assert_eq!(parse_subscriber_line("SUBSCRIBE:"), Err(ProtocolError::MissingTopic));
        assert!(matches!(
            parse_subscriber_line("HELLO"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }
}
