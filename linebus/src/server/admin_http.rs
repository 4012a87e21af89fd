//! The admin HTTP endpoint: status, inspection, and JSON publishing.
//!
//! Handlers translate requests into core calls and format JSON; no
//! broker logic lives here. Followers answer `POST /publish` with a 307
//! redirect at the leader's admin URL.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hyper::header;
use hyper::service::make_service_fn;
use hyper::service::service_fn;
use hyper::Body;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::Server;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::BrokerError;
use crate::message::Message;
use crate::message::PayloadFormat;
use crate::raft::ClientWriteRequest;
use crate::server::ProposeError;
use crate::server::ServerContext;
use crate::storage::AppliedEvent;
use crate::storage::LogStore;

/// Start the admin HTTP server on the pre-bound listener.
pub(super) fn spawn_server<S: LogStore>(
    listener: std::net::TcpListener,
    ctx: Arc<ServerContext<S>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>, BrokerError> {
    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { handle(req, ctx).await }
            }))
        }
    });

    let server = Server::from_tcp(listener)
        .map_err(|err| BrokerError::Other(err.into()))?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });

    Ok(tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(error = %err, "admin HTTP server error");
        }
    }))
}

async fn handle<S: LogStore>(req: Request<Body>, ctx: Arc<ServerContext<S>>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (&method, path.as_str()) {
        (&Method::GET, "/status") => status(&ctx).await,
        (&Method::GET, "/raft") => raft_state(&ctx),
        (&Method::GET, "/messages") => messages(&ctx, req.uri().query()).await,
        (&Method::GET, "/subscribers") => subscribers(&ctx),
        (&Method::GET, "/stats") => stats(&ctx),
        (&Method::POST, "/publish") => publish(req, &ctx).await?,
        _ => json_response(StatusCode::NOT_FOUND, &json!({"error": "no such endpoint"})),
    };
    Ok(response)
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// GET /status — liveness, uptime, message counts.
async fn status<S: LogStore>(ctx: &Arc<ServerContext<S>>) -> Response<Body> {
    let metrics = ctx.raft.metrics().borrow().clone();
    match ctx.storage.snapshot_state().await {
        Ok(snapshot) => json_response(
            StatusCode::OK,
            &json!({
                "node_id": ctx.config.node_id,
                "state": metrics.state.to_string(),
                "uptime_seconds": ctx.started_at.elapsed().as_secs(),
                "message_count": snapshot.message_count,
                "topic_count": snapshot.topics.len(),
                "last_applied": snapshot.last_applied,
            }),
        ),
        Err(err) => json_response(StatusCode::INTERNAL_SERVER_ERROR, &json!({"error": err.to_string()})),
    }
}

/// GET /raft — consensus state of this node.
fn raft_state<S: LogStore>(ctx: &Arc<ServerContext<S>>) -> Response<Body> {
    let metrics = ctx.raft.metrics().borrow().clone();
    json_response(
        StatusCode::OK,
        &json!({
            "node_id": metrics.id,
            "state": metrics.state.to_string(),
            "current_term": metrics.current_term,
            "log_length": metrics.last_log_index,
            "commit_index": metrics.commit_index,
            "last_applied": metrics.last_applied,
            "cluster_size": metrics.cluster_size(),
            "leader_id": metrics.current_leader,
        }),
    )
}

/// GET /messages — recent committed messages, bounded.
async fn messages<S: LogStore>(ctx: &Arc<ServerContext<S>>, query: Option<&str>) -> Response<Body> {
    let limit = query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("limit="))
                .and_then(|v| v.parse::<usize>().ok())
        })
        .unwrap_or(100);
    match ctx.storage.read_messages(limit).await {
        Ok(messages) => json_response(
            StatusCode::OK,
            &json!({
                "count": messages.len(),
                "messages": messages,
            }),
        ),
        Err(err) => json_response(StatusCode::INTERNAL_SERVER_ERROR, &json!({"error": err.to_string()})),
    }
}

/// GET /subscribers — the replicated registration table.
fn subscribers<S: LogStore>(ctx: &Arc<ServerContext<S>>) -> Response<Body> {
    let all = ctx.registry.snapshot();
    json_response(
        StatusCode::OK,
        &json!({
            "count": all.len(),
            "subscribers": all,
        }),
    )
}

/// GET /stats — aggregate counters.
fn stats<S: LogStore>(ctx: &Arc<ServerContext<S>>) -> Response<Body> {
    let stats = ctx.stats.as_ref();
    json_response(
        StatusCode::OK,
        &json!({
            "messages_published": stats.messages_published.load(Ordering::Relaxed),
            "frames_delivered": stats.frames_delivered.load(Ordering::Relaxed),
            "frames_dropped": stats.frames_dropped.load(Ordering::Relaxed),
            "protocol_errors": stats.protocol_errors.load(Ordering::Relaxed),
            "publisher_connections": stats.publisher_connections.load(Ordering::Relaxed),
            "subscriber_connections": ctx.registry.active_connection_count(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    format: Option<String>,
    body: String,
}

/// POST /publish — behaves like a TCP publish.
async fn publish<S: LogStore>(
    req: Request<Body>,
    ctx: &Arc<ServerContext<S>>,
) -> Result<Response<Body>, hyper::Error> {
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    let parsed: PublishBody = match serde_json::from_slice(&bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": format!("invalid publish body: {}", err)}),
            ))
        }
    };

    let format = match parsed.format.as_deref() {
        None => PayloadFormat::Json,
        Some(name) => match PayloadFormat::from_wire_name(&name.to_ascii_uppercase()) {
            Some(format) => format,
            None => {
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({"error": format!("unknown format {:?}", name)}),
                ))
            }
        },
    };

    let msg = match Message::from_parts(&parsed.topic, format, &parsed.body) {
        Ok(msg) => msg,
        Err(err) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": err.to_string()}),
            ))
        }
    };

    match ctx.propose_local(ClientWriteRequest::publish(msg)).await {
        Ok(resp) => {
            let seq_no = match &resp.event {
                AppliedEvent::Published(stored) => Some(stored.seq_no),
                _ => None,
            };
            Ok(json_response(
                StatusCode::OK,
                &json!({"index": resp.index, "seq_no": seq_no}),
            ))
        }
        Err(ProposeError::NotLeader(Some(leader))) => {
            let location = format!("{}/publish", leader.admin_url());
            Ok(Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(header::LOCATION, location.clone())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"leader": location}).to_string()))
                .unwrap_or_else(|_| Response::new(Body::empty())))
        }
        Err(ProposeError::NotLeader(None)) => Ok(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": "not leader, and no leader is known"}),
        )),
        Err(ProposeError::Unavailable(reason)) => Ok(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": reason}),
        )),
    }
}
