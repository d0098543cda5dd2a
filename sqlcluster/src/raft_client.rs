//! Outbound raft message transport.
//!
//! Drains the drive loop's outbound mailbox and posts each message to its
//! destination peer over gRPC. Connections are dialed lazily, kept per peer,
//! and dropped on failure so the next message redials; raft's own retries
//! cover anything lost in between.

use pb::raft_service_client::RaftServiceClient;
use pb::PostDataRequest;
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tonic::transport::Channel;

use crate::config::NodeConfig;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

/// Address book mapping raft node ids to dialable connection strings.
///
/// Seeded from the static node list and extended by committed membership
/// changes, whose context carries the joiner's address.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<u64, String>>>,
}

impl PeerRegistry {
    pub fn record(&self, id: u64, connection_string: String) {
        self.inner.lock().unwrap().insert(id, connection_string);
    }

    pub fn resolve(&self, id: u64) -> Option<String> {
        self.inner.lock().unwrap().get(&id).cloned()
    }
}

pub struct RaftClient {
    peers: HashMap<u64, RaftServiceClient<Channel>>,
    registry: PeerRegistry,
    node_list: Vec<NodeConfig>,
}

impl RaftClient {
    pub fn new(registry: PeerRegistry, node_list: Vec<NodeConfig>) -> RaftClient {
        RaftClient {
            peers: HashMap::new(),
            registry,
            node_list,
        }
    }

    /// Posts one raft message to its destination, dialing on first use.
    pub async fn post_data(&mut self, message: RaftMessage) {
        let to = message.to;
        if !self.peers.contains_key(&to) {
            let Some(addr) = self.resolve(to) else {
                log::error!("no connection string known for peer {}", to);
                return;
            };
            match RaftServiceClient::connect(addr).await {
                Ok(client) => {
                    self.peers.insert(to, client);
                }
                Err(e) => {
                    log::warn!("failed to dial peer {}: {}", to, e);
                    return;
                }
            }
        }

        let request = PostDataRequest {
            data: message.write_to_bytes().unwrap(),
        };
        let client = self.peers.get_mut(&to).unwrap();
        if let Err(e) = client.post_data(request).await {
            log::warn!("post to peer {} failed: {}, dropping connection", to, e);
            self.peers.remove(&to);
        }
    }

    fn resolve(&self, id: u64) -> Option<String> {
        self.registry.resolve(id).or_else(|| {
            self.node_list
                .iter()
                .find(|node| node.id == id)
                .map(|node| format!("http://{}", node.raft_addr))
        })
    }
}
