//! Runtime configuration.
//!
//! Nodes are identified two ways: a numeric raft id (from the static node
//! list) and a display name derived from the client listen address, which is
//! what redirect-host substitution and join requests use.

use log::warn;
use serde_derive::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    /// Client-facing HTTP address of the peer.
    pub listen: String,
    /// Inter-node RPC address of the peer.
    pub raft_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: u64,
    pub listen: String,
    pub raft_addr: String,
    pub data_path: String,
    /// Leader address of an existing cluster to join at startup.
    #[serde(default)]
    pub join: Option<String>,
    /// Bounds the per-request wait for a leader; absent means wait forever.
    #[serde(default)]
    pub leader_wait_timeout_ms: Option<u64>,
    #[serde(default)]
    pub node_list: Vec<NodeConfig>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            listen: "127.0.0.1:4001".to_string(),
            raft_addr: "127.0.0.1:5001".to_string(),
            data_path: "./data".to_string(),
            join: None,
            leader_wait_timeout_ms: None,
            node_list: Vec::new(),
        }
    }

    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return RuntimeConfig::new();
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        }
    }

    pub fn node(&self, id: u64) -> Option<&NodeConfig> {
        self.node_list.iter().find(|node| node.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeConfig> {
        self.node_list
            .iter()
            .find(|node| node_name(&node.listen) == name)
    }

    /// This node's display name, derived from its listen address.
    pub fn name(&self) -> String {
        node_name(&self.listen)
    }

    /// The address peers dial to reach this node's raft endpoint.
    pub fn connection_string(&self) -> String {
        format!("http://{}", self.raft_addr)
    }
}

/// Derives a node name from a listen address. Path separators are flattened
/// so socket-path style addresses stay usable as names.
pub fn node_name(listen: &str) -> String {
    listen.replace('/', "-")
}

/// The substring of a node name substituted inside a request Host header
/// when redirecting to the leader.
pub fn name_fragment(name: &str) -> &str {
    name.trim_start_matches(".-").trim_end_matches(".sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
id = 2
listen = "127.0.0.1:4002"
raft_addr = "127.0.0.1:5002"
data_path = "/tmp/node2"
join = "127.0.0.1:4001"
leader_wait_timeout_ms = 5000

[[node_list]]
id = 1
listen = "127.0.0.1:4001"
raft_addr = "127.0.0.1:5001"

[[node_list]]
id = 2
listen = "127.0.0.1:4002"
raft_addr = "127.0.0.1:5002"
"#
        )
        .unwrap();

        let config = RuntimeConfig::from_toml(file.path().to_str().unwrap());
        assert_eq!(config.id, 2);
        assert_eq!(config.join.as_deref(), Some("127.0.0.1:4001"));
        assert_eq!(config.leader_wait_timeout_ms, Some(5000));
        assert_eq!(config.node(1).unwrap().raft_addr, "127.0.0.1:5001");
        assert_eq!(config.node_by_name("127.0.0.1:4002").unwrap().id, 2);
        assert_eq!(config.connection_string(), "http://127.0.0.1:5002");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = RuntimeConfig::from_toml("/definitely/not/here.toml");
        assert_eq!(config.id, 1);
        assert!(config.node_list.is_empty());
    }

    #[test]
    fn names_flatten_path_separators() {
        assert_eq!(node_name("./node0.sock"), ".-node0.sock");
        assert_eq!(node_name("127.0.0.1:4001"), "127.0.0.1:4001");
    }

    #[test]
    fn fragments_strip_socket_decoration() {
        assert_eq!(name_fragment(".-node0.sock"), "node0");
        assert_eq!(name_fragment("127.0.0.1:4001"), "127.0.0.1:4001");
    }
}
