use std::cmp::Ordering;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Runtime-tunable parameters governing election timing, heartbeats, and log replication
/// batching.
///
/// Mirrors the handful of knobs a production Raft deployment actually needs to adjust; the
/// defaults are conservative enough for a cluster of nodes on the same network segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// A name uniquely identifying this cluster, to guard against cross-talk between
    /// clusters sharing a transport.
    pub cluster_name: String,
    /// Lower bound, in milliseconds, of the randomized election timeout.
    pub election_timeout_min: u64,
    /// Upper bound, in milliseconds, of the randomized election timeout.
    pub election_timeout_max: u64,
    /// Interval, in milliseconds, at which the leader sends heartbeats (empty AppendEntries).
    pub heartbeat_interval: u64,
    /// Maximum number of log entries to send in a single AppendEntries RPC.
    pub max_payload_entries: u64,
}

impl Config {
    /// Draw a new randomized election timeout, in milliseconds, within this config's bounds.
    ///
    /// Randomizing the timeout per term is what keeps split votes rare: every follower samples
    /// independently, so the first one to fire becomes a candidate well before the rest.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max)
    }

    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "distsync".into(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_payload_entries: 300,
        }
    }
}

/// Builder for [`Config`], validating that the election timeout bounds are sane before
/// producing a value other code can trust without re-checking.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    pub fn validate(self) -> anyhow::Result<Config> {
        let defaults = Config::default();
        let cfg = Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min.unwrap_or(defaults.election_timeout_min),
            election_timeout_max: self.election_timeout_max.unwrap_or(defaults.election_timeout_max),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(defaults.heartbeat_interval),
            max_payload_entries: self.max_payload_entries.unwrap_or(defaults.max_payload_entries),
        };

        match cfg.election_timeout_min.cmp(&cfg.election_timeout_max) {
            Ordering::Greater | Ordering::Equal => {
                anyhow::bail!(
                    "election_timeout_min ({}) must be less than election_timeout_max ({})",
                    cfg.election_timeout_min,
                    cfg.election_timeout_max
                );
            }
            Ordering::Less => {}
        }
        if cfg.heartbeat_interval >= cfg.election_timeout_min {
            anyhow::bail!(
                "heartbeat_interval ({}) must be less than election_timeout_min ({})",
                cfg.heartbeat_interval,
                cfg.election_timeout_min
            );
        }
        if cfg.max_payload_entries == 0 {
            anyhow::bail!("max_payload_entries must be greater than 0");
        }
        Ok(cfg)
    }
}
