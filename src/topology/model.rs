//! Topology schema: nodes, links, sites.

use serde::{Deserialize, Serialize};

/// Node role within the mesh.
///
/// A DN (distribution node) relays traffic and may initiate ignition; a CN
/// (client node) terminates a single wireless link and never initiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Dn,
    Cn,
}

/// Liveness as tracked by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Offline,
    Online,
    /// Online and configured to initiate beamforming.
    OnlineInitiator,
}

impl NodeStatus {
    pub fn is_online(self) -> bool {
        !matches!(self, NodeStatus::Offline)
    }
}

/// Antenna polarity. Both ends of a wireless link must be opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    Odd,
    Even,
    HybridOdd,
    HybridEven,
}

/// Golay code indices for a radio (tx/rx).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GolayIdx {
    pub tx_golay_idx: i64,
    pub rx_golay_idx: i64,
}

/// Geographic location, optional per node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Position accuracy in meters.
    pub accuracy: f64,
}

/// A mesh node: one or more baseband radios sharing a CPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub node_type: NodeType,
    /// MAC addresses of this node's radios (normalized, lower-case).
    pub wlan_mac_addrs: Vec<String>,
    /// Primary identity MAC (node id on the message plane).
    pub mac_addr: String,
    pub pop_node: bool,
    #[serde(default)]
    pub status: NodeStatus,
    pub site_name: String,
    #[serde(default)]
    pub polarity: Option<Polarity>,
    #[serde(default)]
    pub golay_idx: Option<GolayIdx>,
    #[serde(default)]
    pub channel: Option<i64>,
    /// Software version last reported by the node.
    #[serde(default)]
    pub software_version: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl Node {
    /// Whether the given radio MAC belongs to this node.
    pub fn has_radio(&self, mac: &str) -> bool {
        self.mac_addr == mac || self.wlan_mac_addrs.iter().any(|m| m == mac)
    }
}

/// Physical medium of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Wireless,
    Ethernet,
}

/// A link between two nodes. Endpoints are stored in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub a_node_name: String,
    pub z_node_name: String,
    /// Radio MAC on the A side (wireless links).
    #[serde(default)]
    pub a_node_mac: String,
    /// Radio MAC on the Z side (wireless links).
    #[serde(default)]
    pub z_node_mac: String,
    pub link_type: LinkType,
    #[serde(default)]
    pub is_alive: bool,
    #[serde(default)]
    pub linkup_attempts: u64,
    /// Backup DN-to-CN link, only tried after the primary has had its chance.
    #[serde(default)]
    pub is_backup_cn_link: bool,
}

impl Link {
    pub fn is_wireless(&self) -> bool {
        self.link_type == LinkType::Wireless
    }

    /// The other endpoint of this link, if `node` is one of them.
    pub fn other_end(&self, node: &str) -> Option<&str> {
        if self.a_node_name == node {
            Some(&self.z_node_name)
        } else if self.z_node_name == node {
            Some(&self.a_node_name)
        } else {
            None
        }
    }
}

/// Canonical link name: endpoint names sorted so that `(a,z)` and `(z,a)`
/// map to the same link.
pub fn link_name(a: &str, z: &str) -> String {
    if a <= z {
        format!("link-{}-{}", a, z)
    } else {
        format!("link-{}-{}", z, a)
    }
}

/// A named group of co-located nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Network-wide tunables carried inside the topology file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub channel: Option<i64>,
    #[serde(default)]
    pub deterministic_prefix_alloc_params: Option<serde_json::Value>,
}

/// The whole graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub config: TopologyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_name_canonical_order() {
        assert_eq!(link_name("node-a", "node-b"), "link-node-a-node-b");
        assert_eq!(link_name("node-b", "node-a"), "link-node-a-node-b");
        assert_eq!(link_name("1", "1"), "link-1-1");
    }

    #[test]
    fn test_other_end() {
        let link = Link {
            name: link_name("a", "b"),
            a_node_name: "a".into(),
            z_node_name: "b".into(),
            a_node_mac: String::new(),
            z_node_mac: String::new(),
            link_type: LinkType::Wireless,
            is_alive: false,
            linkup_attempts: 0,
            is_backup_cn_link: false,
        };
        assert_eq!(link.other_end("a"), Some("b"));
        assert_eq!(link.other_end("b"), Some("a"));
        assert_eq!(link.other_end("c"), None);
    }

    #[test]
    fn test_topology_serde_round_trip() {
        let topo = Topology {
            name: "test".into(),
            nodes: vec![Node {
                name: "n0".into(),
                node_type: NodeType::Dn,
                wlan_mac_addrs: vec!["aa:bb:cc:dd:ee:00".into()],
                mac_addr: "aa:bb:cc:dd:ee:00".into(),
                pop_node: true,
                status: NodeStatus::Offline,
                site_name: "s0".into(),
                polarity: Some(Polarity::Odd),
                golay_idx: Some(GolayIdx::default()),
                channel: Some(2),
                software_version: None,
                location: None,
            }],
            links: vec![],
            sites: vec![Site {
                name: "s0".into(),
                location: None,
            }],
            config: TopologyConfig::default(),
        };
        let json = serde_json::to_string(&topo).unwrap();
        let back: Topology = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes[0].name, "n0");
        assert_eq!(back.nodes[0].polarity, Some(Polarity::Odd));
        assert_eq!(back.sites[0].name, "s0");
    }
}
