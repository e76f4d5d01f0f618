use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;

use crate::raft::Node;
use crate::raft::NodeId;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
/// The configuration for this Raft instance.
pub struct RaftConfig {
    /// The id used for this instance. Must be unique in the cluster.
    pub id: NodeId,
    /// The ip address to listen for requests on in TCP implmentations.
    pub ip: IpAddr,
    /// The port to listen for request on in TCP implementations.
    pub port: u16,
    /// The other members of the cluster.
    pub nodes: Vec<Node>,
    /// Where persistent state is kept.
    pub data_directory: PathBuf,
    /// Interval between leader heartbeats. Must be below the minimum election timeout.
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Upper bound on a single outbound RPC.
    pub rpc_timeout_ms: u64,
    /// Maximum number of entries that can be sent in an append message.
    pub max_append_entries: u64,
}

impl RaftConfig {
    /// Validates the configuration, ensuring all values make sense.
    pub fn validate(&self) -> Result<()> {
        let id_pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$")?;
        if !id_pattern.is_match(&self.id) {
            return Err(anyhow::anyhow!("invalid node id {:?}", self.id));
        }
        if self.port < 1024 {
            return Err(anyhow::anyhow!("port value too low"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("heartbeat interval is too low"));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(anyhow::anyhow!(
                "heartbeat interval must be below the minimum election timeout"
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(anyhow::anyhow!(
                "minimum election timeout exceeds the maximum"
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(anyhow::anyhow!("rpc timeout is too low"));
        }
        if self.max_append_entries == 0 {
            return Err(anyhow::anyhow!("max append entries must be positive"));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !id_pattern.is_match(&node.id) {
                return Err(anyhow::anyhow!("invalid peer id {:?}", node.id));
            }
            if node.id == self.id {
                return Err(anyhow::anyhow!("node {} lists itself as a peer", self.id));
            }
            if !seen.insert(&node.id) {
                return Err(anyhow::anyhow!("duplicate peer {}", node.id));
            }
        }

        Ok(())
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            id: "node-1".to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 6669,
            nodes: vec![],
            data_directory: PathBuf::from("raft_data"),
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            rpc_timeout_ms: 100,
            max_append_entries: 64,
        }
    }
}
