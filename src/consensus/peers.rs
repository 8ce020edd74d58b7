use std::collections::BTreeMap;

use super::message::NodeId;
use crate::common::error::ConfigError;

pub const FAULTS_ALLOWED: usize = 1;
pub const CLUSTER_SIZE: usize = 2 * FAULTS_ALLOWED + 1;

pub fn default_ports() -> BTreeMap<NodeId, u16> {
    BTreeMap::from([(1, 8001), (2, 8002), (3, 8003)])
}

/// Fixed membership of the cluster as seen from one node.
#[derive(Debug, Clone)]
pub struct Topology {
    pub id: NodeId,
    host: String,
    members: BTreeMap<NodeId, u16>,
}

impl Topology {
    pub fn new(id: NodeId, host: impl Into<String>, members: BTreeMap<NodeId, u16>) -> Result<Self, ConfigError> {
        if members.len() != CLUSTER_SIZE {
            return Err(ConfigError::ClusterSize {
                expected: CLUSTER_SIZE,
                found: members.len(),
            });
        }
        if !members.contains_key(&id) {
            return Err(ConfigError::UnknownNode(id));
        }
        Ok(Topology {
            id,
            host: host.into(),
            members,
        })
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.members.keys().copied().filter(|member| *member != self.id).collect()
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn addr(&self, id: NodeId) -> Option<String> {
        self.members.get(&id).map(|port| format!("{}:{}", self.host, port))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.members[&self.id])
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    /// Majority of the cluster, self included.
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Peer responses needed on top of the local vote.
    pub fn peer_quorum(&self) -> usize {
        self.quorum_size() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peers_exclude_self() {
        let topology = Topology::new(2, "127.0.0.1", default_ports()).unwrap();
        assert_eq!(topology.peers(), vec![1, 3]);
        assert!(topology.is_member(3));
        assert!(!topology.is_member(4));
        assert_eq!(topology.addr(3).as_deref(), Some("127.0.0.1:8003"));
        assert_eq!(topology.listen_addr(), "127.0.0.1:8002");
    }

    #[test]
    fn test_quorum_of_three() {
        let topology = Topology::new(1, "127.0.0.1", default_ports()).unwrap();
        assert_eq!(topology.quorum_size(), 2);
        assert_eq!(topology.peer_quorum(), 1);
    }

    #[test]
    fn test_rejects_unknown_node_and_bad_size() {
        assert!(matches!(
            Topology::new(4, "127.0.0.1", default_ports()),
            Err(ConfigError::UnknownNode(4))
        ));

        let mut ports = default_ports();
        ports.insert(4, 8004);
        assert!(matches!(
            Topology::new(1, "127.0.0.1", ports),
            Err(ConfigError::ClusterSize { expected: 3, found: 4 })
        ));
    }
}
