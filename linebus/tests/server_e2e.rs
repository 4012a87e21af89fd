use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use linebus::discovery::StaticDiscovery;
use linebus::server::BrokerNode;
use linebus::Config;
use linebus::State;
use linestore::DiskStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;

mod fixtures;

async fn start_node(client_port: u16, admin_port: u16, idle_timeout_ms: u64) -> Result<BrokerNode<DiskStore>> {
    let config = Config::build("e2e".into())
        .node_id(0)
        .client_port(client_port)
        .admin_http_port(admin_port)
        .subscriber_idle_timeout(idle_timeout_ms)
        .validate()
        .map_err(|err| anyhow!("config: {}", err))?;
    let store = Arc::new(DiskStore::open_temporary().context("open temporary store")?);
    let discovery = Arc::new(StaticDiscovery::new(Vec::new()));
    BrokerNode::start(config, store, discovery).await.map_err(|err| anyhow!("start: {}", err))
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, what: &str) -> Result<String> {
    let mut line = String::new();
    let n = timeout(Duration::from_secs(3), reader.read_line(&mut line))
        .await
        .with_context(|| format!("timed out waiting for {}", what))??;
    if n == 0 {
        return Err(anyhow!("connection closed while waiting for {}", what));
    }
    Ok(line.trim_end().to_string())
}

async fn http_get(url: &str) -> Result<(u16, String)> {
    let client = hyper::Client::new();
    let resp = client.get(url.parse()?).await?;
    let status = resp.status().as_u16();
    let body = hyper::body::to_bytes(resp.into_body()).await?;
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

async fn http_post(url: &str, body: String) -> Result<(u16, String)> {
    let client = hyper::Client::new();
    let req = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(url)
        .header("content-type", "application/json")
        .body(hyper::Body::from(body))?;
    let resp = client.request(req).await?;
    let status = resp.status().as_u16();
    let body = hyper::body::to_bytes(resp.into_body()).await?;
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Single-node happy path over real sockets.
///
/// What does this test do?
///
/// - starts one broker node on loopback.
/// - connects a subscriber over TCP, subscribes to `news`, and checks
///   PING/PONG.
/// - publishes over TCP and over `POST /publish`, and asserts both
///   messages arrive as frames on the subscriber connection.
/// - checks `/raft` and `/messages` reflect the committed state.
///
/// RUST_LOG=linebus,server_e2e=trace cargo test -p linebus --test server_e2e
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn broker_round_trip_over_tcp_and_http() -> Result<()> {
    fixtures::init_tracing();

    let (client_port, admin_port) = (25870, 25890);
    let node = start_node(client_port, admin_port, 90_000).await?;
    let admin = format!("http://127.0.0.1:{}", admin_port);

    node.context()
        .raft
        .wait(Some(Duration::from_secs(3)))
        .state(State::Leader, "single node becomes leader")
        .await?;

    // Subscriber connects, registers, and stays attached.
    let sub = TcpStream::connect(("127.0.0.1", client_port)).await?;
    let (sub_read, mut sub_write) = sub.into_split();
    let mut sub_reader = BufReader::new(sub_read);
    sub_write.write_all(b"SUBSCRI").await?;
    sub_write.write_all(b"SUBSCRIBE:news\n").await?;

    // Heartbeat round trip.
    sub_write.write_all(b"PING\n").await?;
    assert_eq!(read_line(&mut sub_reader, "PONG").await?, "PONG");

    // Wait for the registration to be applied before publishing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let (status, body) = http_get(&format!("{}/subscribers", admin)).await?;
        assert_eq!(status, 200);
        if body.contains("news") {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("subscription never appeared in /subscribers: {}", body));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Publish over TCP.
    let mut publisher = TcpStream::connect(("127.0.0.1", client_port)).await?;
    publisher.write_all(b"PUBLISH").await?;
    publisher
        .write_all(b"FORMAT:JSON|{\"Id\":1,\"EventName\":\"x\",\"Value\":\"hello\",\"Topic\":\"news\"}\n")
        .await?;

    let frame = read_line(&mut sub_reader, "first delivery").await?;
    assert!(frame.starts_with("FORMAT:JSON|"), "got {}", frame);
    assert!(frame.contains(r#""Value":"hello""#), "got {}", frame);

    // Publish over the admin HTTP endpoint.
    let body = r#"{"topic":"news","format":"JSON","body":"{\"Id\":2,\"EventName\":\"x\",\"Value\":\"M2\",\"Topic\":\"news\"}"}"#;
    let (status, resp) = http_post(&format!("{}/publish", admin), body.to_string()).await?;
    assert_eq!(status, 200, "publish response: {}", resp);

    let frame = read_line(&mut sub_reader, "second delivery").await?;
    assert!(frame.contains(r#""Value":"M2""#), "got {}", frame);

    // The admin surface reflects the committed state.
    let (status, raft) = http_get(&format!("{}/raft", admin)).await?;
    assert_eq!(status, 200);
    assert!(raft.contains(r#""state":"LEADER""#), "got {}", raft);
    assert!(raft.contains(r#""current_term":1"#), "got {}", raft);

    let (status, messages) = http_get(&format!("{}/messages", admin)).await?;
    assert_eq!(status, 200);
    assert!(messages.contains("hello") && messages.contains("M2"), "got {}", messages);
    assert!(messages.contains(r#""count":2"#), "got {}", messages);

    node.shutdown().await?;
    Ok(())
}

/// Subscriber heartbeat timeout.
///
/// What does this test do?
///
/// - starts a broker with a short subscriber idle timeout.
/// - connects a subscriber which then goes silent.
/// - asserts the broker closes the connection and removes the
///   registration.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_subscriber_is_disconnected() -> Result<()> {
    fixtures::init_tracing();

    let (client_port, admin_port) = (25970, 25990);
    let node = start_node(client_port, admin_port, 400).await?;
    let admin = format!("http://127.0.0.1:{}", admin_port);

    node.context()
        .raft
        .wait(Some(Duration::from_secs(3)))
        .state(State::Leader, "single node becomes leader")
        .await?;

    let sub = TcpStream::connect(("127.0.0.1", client_port)).await?;
    let (sub_read, mut sub_write) = sub.into_split();
    let mut sub_reader = BufReader::new(sub_read);
    sub_write.write_all(b"SUBSCRI").await?;
    sub_write.write_all(b"SUBSCRIBE:quiet\n").await?;

    // No PING: the broker hangs up after the idle window and the read
    // side observes EOF.
    let mut line = String::new();
    let n = timeout(Duration::from_secs(3), sub_reader.read_line(&mut line))
        .await
        .context("broker never closed the idle connection")??;
    assert_eq!(n, 0, "expected EOF, got {:?}", line);

    // The registration is withdrawn cluster-wide.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let (status, body) = http_get(&format!("{}/subscribers", admin)).await?;
        assert_eq!(status, 200);
        if body.contains(r#""count":0"#) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("subscriber was not removed: {}", body));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    node.shutdown().await?;
    Ok(())
}
