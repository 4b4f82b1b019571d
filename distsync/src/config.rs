use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;

use raft::NodeId;

/// Static cluster membership, parsed once at startup and never mutated: this crate does not
/// support adding or removing peers at runtime.
#[derive(Clone, Debug)]
pub struct ClusterMember {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Every runtime-tunable knob the platform recognizes, read from the process environment.
///
/// Field names track the `UPPER_SNAKE_CASE` environment variables listed in the option table:
/// `NODE_ID`/`NODE_HOST`/`NODE_PORT` for self-identity, `CLUSTER_NODES` for static membership,
/// and the rest governing Raft timing and the three state machines.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    pub node_host: String,
    pub node_port: u16,
    pub cluster_nodes: Vec<ClusterMember>,

    pub heartbeat_interval: u64,
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,

    pub queue_partitions: u32,
    pub queue_virtual_nodes: u32,
    pub visibility_timeout: u64,
    pub message_persistence: bool,
    pub message_ttl: u64,

    pub cache_size_mb: u64,

    pub request_timeout: u64,
}

impl Config {
    /// Build a [`Config`] from the process environment, per the recognized option table.
    /// Required: `NODE_ID`, `NODE_HOST`, `NODE_PORT`, `CLUSTER_NODES` (at least 3 members).
    pub fn from_env() -> anyhow::Result<Self> {
        let node_id = env_required("NODE_ID")?.parse().map_err(|_| anyhow::anyhow!("NODE_ID must be an integer"))?;
        let node_host = env_required("NODE_HOST")?;
        let node_port = env_required("NODE_PORT")?.parse().map_err(|_| anyhow::anyhow!("NODE_PORT must be a u16"))?;
        let cluster_nodes = parse_cluster_nodes(&env_required("CLUSTER_NODES")?)?;

        if cluster_nodes.len() < 3 {
            anyhow::bail!("CLUSTER_NODES must list at least 3 nodes, got {}", cluster_nodes.len());
        }
        if !cluster_nodes.iter().any(|m| m.id == node_id) {
            anyhow::bail!("NODE_ID {} is not present in CLUSTER_NODES", node_id);
        }

        Ok(Self {
            node_id,
            node_host,
            node_port,
            cluster_nodes,
            heartbeat_interval: env_or("HEARTBEAT_INTERVAL", 1_000),
            election_timeout_min: env_or("ELECTION_TIMEOUT_MIN", 5_000),
            election_timeout_max: env_or("ELECTION_TIMEOUT_MAX", 10_000),
            queue_partitions: env_or("QUEUE_PARTITIONS", 16),
            queue_virtual_nodes: env_or("QUEUE_VIRTUAL_NODES", 150),
            visibility_timeout: env_or("VISIBILITY_TIMEOUT", 30_000),
            message_persistence: env_or("MESSAGE_PERSISTENCE", true),
            message_ttl: env_or("MESSAGE_TTL", 86_400),
            cache_size_mb: env_or("CACHE_SIZE_MB", 256),
            request_timeout: env_or("REQUEST_TIMEOUT", 5_000),
        })
    }

    /// Translate this config into the consensus engine's own, smaller config type.
    pub fn raft_config(&self) -> anyhow::Result<raft::Config> {
        raft::Config::build("distsync")
            .heartbeat_interval(self.heartbeat_interval)
            .election_timeout_min(self.election_timeout_min)
            .election_timeout_max(self.election_timeout_max)
            .validate()
    }

    pub fn peer_addrs(&self) -> BTreeMap<NodeId, SocketAddr> {
        self.cluster_nodes.iter().map(|m| (m.id, m.addr)).collect()
    }

    pub fn members(&self) -> std::collections::BTreeSet<NodeId> {
        self.cluster_nodes.iter().map(|m| m.id).collect()
    }
}

fn env_required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("missing required environment variable {}", key))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parse `CLUSTER_NODES` in the form `id:host:port,id:host:port,...`.
fn parse_cluster_nodes(raw: &str) -> anyhow::Result<Vec<ClusterMember>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("malformed CLUSTER_NODES entry: {}", entry))?;
            let host = parts.next().ok_or_else(|| anyhow::anyhow!("malformed CLUSTER_NODES entry: {}", entry))?;
            let port = parts.next().ok_or_else(|| anyhow::anyhow!("malformed CLUSTER_NODES entry: {}", entry))?;
            let id: NodeId = id.parse().map_err(|_| anyhow::anyhow!("invalid node id in CLUSTER_NODES: {}", id))?;
            let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|_| anyhow::anyhow!("invalid host:port in CLUSTER_NODES: {}:{}", host, port))?;
            Ok(ClusterMember { id, addr })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_nodes() {
        let members = parse_cluster_nodes("1:127.0.0.1:9001,2:127.0.0.1:9002,3:127.0.0.1:9003").unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].id, 1);
        assert_eq!(members[1].addr.port(), 9002);
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_cluster_nodes("1:127.0.0.1").is_err());
    }

    #[test]
    fn members_is_the_full_static_voter_set() {
        let cfg = Config {
            node_id: 1,
            node_host: "127.0.0.1".into(),
            node_port: 9001,
            cluster_nodes: parse_cluster_nodes("1:127.0.0.1:9001,2:127.0.0.1:9002,3:127.0.0.1:9003").unwrap(),
            heartbeat_interval: 1_000,
            election_timeout_min: 5_000,
            election_timeout_max: 10_000,
            queue_partitions: 16,
            queue_virtual_nodes: 150,
            visibility_timeout: 30_000,
            message_persistence: true,
            message_ttl: 86_400,
            cache_size_mb: 256,
            request_timeout: 5_000,
        };
        assert_eq!(cfg.members(), maplit::btreeset! {1, 2, 3});
    }
}
