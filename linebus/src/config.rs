//! Broker runtime configuration.

use std::net::IpAddr;
use std::net::Ipv4Addr;

use rand::thread_rng;
use rand::Rng;

use crate::error::BrokerError;
use crate::NodeId;

/// Offset from the client TCP port at which the peer RPC endpoint listens.
pub const PEER_RPC_PORT_OFFSET: u16 = 1000;

/// The runtime configuration for a broker node.
///
/// Timing values follow the Raft guidance: the heartbeat interval is kept
/// strictly below the minimum election timeout, and election timeouts are
/// randomized per node within `[election_timeout_min,
/// election_timeout_max]` to break split votes.
///
/// The directly constructable fields are all public; use
/// [`Config::build`] for defaults plus [`ConfigBuilder::validate`]
/// enforcement, or [`Config::from_env`] in the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// The name of the cluster to which this node belongs.
    pub cluster_name: String,
    /// This node's stable ID.
    pub node_id: NodeId,
    /// The host on which all three listeners bind.
    pub host: IpAddr,
    /// The client TCP port (publishers and subscribers).
    pub client_port: u16,
    /// The admin HTTP port.
    pub admin_http_port: u16,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders send
    /// heartbeats, and the per-RPC timeout for AppendEntries.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// Distance behind the leader's last log index after which a
    /// replication stream is considered lagging.
    pub replication_lag_threshold: u64,
    /// The maximum number of queued durable writes drained per batch by
    /// the write serializer.
    pub write_batch_max: usize,
    /// Capacity of the write serializer queue.
    pub write_queue_depth: usize,
    /// Upper bound on the number of nodes probed by the port scanner.
    pub max_cluster_size: u16,
    /// Interval between membership rescans, in milliseconds.
    pub discovery_interval: u64,
    /// Capacity of each subscriber connection's outbound frame queue.
    pub subscriber_queue_depth: usize,
    /// Consecutive outbound-queue overflows after which a subscriber is
    /// forcibly detached.
    pub subscriber_overflow_limit: u32,
    /// Milliseconds of subscriber silence (no PING, no command) before
    /// the broker closes the connection.
    pub subscriber_idle_timeout: u64,
    /// Deadline for draining client connections on graceful shutdown,
    /// in milliseconds.
    pub shutdown_drain_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            node_id: None,
            host: None,
            client_port: None,
            admin_http_port: None,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            write_batch_max: None,
            write_queue_depth: None,
            max_cluster_size: None,
            discovery_interval: None,
            subscriber_queue_depth: None,
            subscriber_overflow_limit: None,
            subscriber_idle_timeout: None,
            shutdown_drain_timeout: None,
        }
    }

    /// Build a config from the process environment.
    ///
    /// `BROKER_NODE_ID` (integer ≥ 0) and `BROKER_PORT` (client TCP) are
    /// required; `HTTP_PORT` defaults to `8080 + node_id` and
    /// `MAX_CLUSTER_SIZE` to 20. The peer RPC port is always
    /// `BROKER_PORT + 1000`.
    pub fn from_env() -> Result<Config, BrokerError> {
        fn var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, BrokerError> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| BrokerError::Config(format!("could not parse {}={:?}", name, raw))),
                Err(_) => Ok(None),
            }
        }

        let node_id: NodeId =
            var("BROKER_NODE_ID")?.ok_or_else(|| BrokerError::Config("BROKER_NODE_ID is not set".into()))?;
        let client_port: u16 =
            var("BROKER_PORT")?.ok_or_else(|| BrokerError::Config("BROKER_PORT is not set".into()))?;
        let admin_http_port: u16 = match var("HTTP_PORT")? {
            Some(port) => port,
            None => 8080 + node_id as u16,
        };

        let mut builder = Config::build("linebus".into())
            .node_id(node_id)
            .client_port(client_port)
            .admin_http_port(admin_http_port);
        if let Some(max) = var::<u16>("MAX_CLUSTER_SIZE")? {
            builder = builder.max_cluster_size(max);
        }
        builder.validate()
    }

    /// The peer RPC port derived from the client port.
    pub fn peer_rpc_port(&self) -> u16 {
        self.client_port + PEER_RPC_PORT_OFFSET
    }

    /// Generate a new random election timeout within the configured range.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The grace window after which an unreachable peer is dropped from
    /// the membership view.
    pub fn peer_lost_grace(&self) -> u64 {
        self.election_timeout_max * 3
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    node_id: Option<NodeId>,
    host: Option<IpAddr>,
    client_port: Option<u16>,
    admin_http_port: Option<u16>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    write_batch_max: Option<usize>,
    write_queue_depth: Option<usize>,
    max_cluster_size: Option<u16>,
    discovery_interval: Option<u64>,
    subscriber_queue_depth: Option<usize>,
    subscriber_overflow_limit: Option<u32>,
    subscriber_idle_timeout: Option<u64>,
    shutdown_drain_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set this node's ID.
    pub fn node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Set the bind host.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the client TCP port.
    pub fn client_port(mut self, port: u16) -> Self {
        self.client_port = Some(port);
        self
    }

    /// Set the admin HTTP port.
    pub fn admin_http_port(mut self, port: u16) -> Self {
        self.admin_http_port = Some(port);
        self
    }

    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the replication lag threshold.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the write serializer batch bound.
    pub fn write_batch_max(mut self, val: usize) -> Self {
        self.write_batch_max = Some(val);
        self
    }

    /// Set the write queue capacity.
    pub fn write_queue_depth(mut self, val: usize) -> Self {
        self.write_queue_depth = Some(val);
        self
    }

    /// Set the scan upper bound for peer discovery.
    pub fn max_cluster_size(mut self, val: u16) -> Self {
        self.max_cluster_size = Some(val);
        self
    }

    /// Set the membership rescan interval in milliseconds.
    pub fn discovery_interval(mut self, val: u64) -> Self {
        self.discovery_interval = Some(val);
        self
    }

    /// Set the subscriber outbound queue capacity.
    pub fn subscriber_queue_depth(mut self, val: usize) -> Self {
        self.subscriber_queue_depth = Some(val);
        self
    }

    /// Set the subscriber idle timeout in milliseconds.
    pub fn subscriber_idle_timeout(mut self, val: u64) -> Self {
        self.subscriber_idle_timeout = Some(val);
        self
    }

    /// Validate the state of this builder & produce a new `Config` instance.
    pub fn validate(self) -> Result<Config, BrokerError> {
        let config = Config {
            cluster_name: self.cluster_name,
            node_id: self.node_id.unwrap_or(0),
            host: self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            client_port: self.client_port.unwrap_or(5000),
            admin_http_port: self.admin_http_port.unwrap_or(8080),
            election_timeout_min: self.election_timeout_min.unwrap_or(150),
            election_timeout_max: self.election_timeout_max.unwrap_or(300),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(50),
            max_payload_entries: self.max_payload_entries.unwrap_or(300),
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            write_batch_max: self.write_batch_max.unwrap_or(64),
            write_queue_depth: self.write_queue_depth.unwrap_or(1024),
            max_cluster_size: self.max_cluster_size.unwrap_or(20),
            discovery_interval: self.discovery_interval.unwrap_or(5000),
            subscriber_queue_depth: self.subscriber_queue_depth.unwrap_or(256),
            subscriber_overflow_limit: self.subscriber_overflow_limit.unwrap_or(8),
            subscriber_idle_timeout: self.subscriber_idle_timeout.unwrap_or(90_000),
            shutdown_drain_timeout: self.shutdown_drain_timeout.unwrap_or(5_000),
        };
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(BrokerError::Config(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if config.heartbeat_interval >= config.election_timeout_min {
            return Err(BrokerError::Config(
                "heartbeat_interval must be less than election_timeout_min".into(),
            ));
        }
        if config.write_batch_max == 0 || config.write_queue_depth == 0 {
            return Err(BrokerError::Config("write queue bounds must be non-zero".into()));
        }
        if config.client_port.checked_add(PEER_RPC_PORT_OFFSET).is_none() {
            return Err(BrokerError::Config(format!(
                "client port {} leaves no room for the peer RPC port",
                config.client_port
            )));
        }
        Ok(config)
    }
}
