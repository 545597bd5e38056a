//! Minion-wide shared objects: static node info, the applied node config,
//! and the set of wireless peers currently associated.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::messages::BgpInfo;
use crate::nodecfg::NodeConfigWrapper;
use crate::topology::NodeType;

/// Static node identity, read once at boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id on the message plane (the identity MAC).
    pub node_id: String,
    /// Radio MAC -> PCI bus id.
    #[serde(default)]
    pub radio_mac_to_bus_id: BTreeMap<String, String>,
    #[serde(default)]
    pub hw_model: Option<String>,
    #[serde(default)]
    pub hw_board_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<NodeType>,
}

impl NodeInfo {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading node info {}", path.display()))?;
        let info: NodeInfo = serde_json::from_str(&raw)
            .with_context(|| format!("parsing node info {}", path.display()))?;
        if info.node_id.trim().is_empty() {
            anyhow::bail!("empty node ID");
        }
        Ok(info)
    }

    pub fn radios(&self) -> Vec<String> {
        self.radio_mac_to_bus_id.keys().cloned().collect()
    }
}

/// One associated wireless peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub node_type: Option<NodeType>,
    /// Local radio the association lives on.
    pub radio_mac: String,
}

/// Handles shared across minion apps.
#[derive(Clone)]
pub struct MinionState {
    pub node_info: Arc<NodeInfo>,
    node_config: Arc<RwLock<NodeConfigWrapper>>,
    /// Peer MAC -> association info (the peer node type map).
    peers: Arc<RwLock<BTreeMap<String, PeerEntry>>>,
    /// Latest BGP neighbor view (POP nodes only).
    bgp_status: Arc<RwLock<Option<BTreeMap<String, BgpInfo>>>>,
}

impl MinionState {
    pub fn new(node_info: NodeInfo, node_config: NodeConfigWrapper) -> Self {
        Self {
            node_info: Arc::new(node_info),
            node_config: Arc::new(RwLock::new(node_config)),
            peers: Arc::new(RwLock::new(BTreeMap::new())),
            bgp_status: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_bgp_status(&self, status: Option<BTreeMap<String, BgpInfo>>) {
        *self.bgp_status.write().await = status;
    }

    pub async fn bgp_status(&self) -> Option<BTreeMap<String, BgpInfo>> {
        self.bgp_status.read().await.clone()
    }

    pub async fn read_config(&self) -> RwLockReadGuard<'_, NodeConfigWrapper> {
        self.node_config.read().await
    }

    pub async fn write_config(&self) -> RwLockWriteGuard<'_, NodeConfigWrapper> {
        self.node_config.write().await
    }

    pub async fn add_peer(&self, peer_mac: String, entry: PeerEntry) {
        self.peers.write().await.insert(peer_mac, entry);
    }

    pub async fn remove_peer(&self, peer_mac: &str) {
        self.peers.write().await.remove(peer_mac);
    }

    pub async fn peer_macs(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_conn_status(&self) -> BTreeMap<String, bool> {
        self.peers
            .read()
            .await
            .keys()
            .map(|k| (k.clone(), true))
            .collect()
    }

    /// Drop every peer associated through the given radio (device down).
    pub async fn remove_peers_on_radio(&self, radio_mac: &str) -> Vec<String> {
        let mut peers = self.peers.write().await;
        let dropped: Vec<String> = peers
            .iter()
            .filter(|(_, e)| e.radio_mac == radio_mac)
            .map(|(k, _)| k.clone())
            .collect();
        for peer in &dropped {
            peers.remove(peer);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_node_info_parse() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node_info");
        std::fs::write(
            &path,
            serde_json::json!({
                "node_id": "aa:bb:cc:00:00:01",
                "radio_mac_to_bus_id": {"aa:bb:cc:00:00:01": "0000:01:00.0"},
                "hw_board_id": "NXP_LS1048A_PUMA"
            })
            .to_string(),
        )
        .unwrap();
        let info = NodeInfo::from_file(&path).unwrap();
        assert_eq!(info.node_id, "aa:bb:cc:00:00:01");
        assert_eq!(info.radios(), vec!["aa:bb:cc:00:00:01".to_string()]);
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node_info");
        std::fs::write(&path, r#"{"node_id": "  "}"#).unwrap();
        assert!(NodeInfo::from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_peer_tracking() {
        let state = MinionState::new(
            NodeInfo::default(),
            NodeConfigWrapper::load(""),
        );
        state
            .add_peer(
                "aa:bb:cc:00:00:02".into(),
                PeerEntry {
                    node_type: Some(NodeType::Cn),
                    radio_mac: "aa:bb:cc:00:00:01".into(),
                },
            )
            .await;
        assert_eq!(state.peer_macs().await, vec!["aa:bb:cc:00:00:02".to_string()]);
        let dropped = state.remove_peers_on_radio("aa:bb:cc:00:00:01").await;
        assert_eq!(dropped, vec!["aa:bb:cc:00:00:02".to_string()]);
        assert!(state.peer_macs().await.is_empty());
    }
}
