//! `TopologyWrapper`: single source of truth for the topology graph.
//!
//! All mutation goes through validating methods; derived lookup maps are
//! kept in sync so apps can resolve nodes by name or radio MAC without
//! scanning. Apps read under a shared lock and mutate under an exclusive
//! lock (see `shared.rs` for the composite lock order).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{info, warn};

use super::model::{link_name, Link, LinkType, Node, NodeStatus, NodeType, Site, Topology};

/// Validation and lookup errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node name is empty")]
    EmptyNodeName,
    #[error("node {0} already exists")]
    DuplicateNode(String),
    #[error("node {0} does not exist")]
    NoSuchNode(String),
    #[error("site {0} does not exist")]
    NoSuchSite(String),
    #[error("site {0} already exists")]
    DuplicateSite(String),
    #[error("site {0} still has nodes assigned")]
    SiteInUse(String),
    #[error("link {0} already exists")]
    DuplicateLink(String),
    #[error("link {0} does not exist")]
    NoSuchLink(String),
    #[error("link endpoints must be two distinct existing nodes")]
    BadEndpoints,
    #[error("wireless link between two CNs is not allowed")]
    CnToCn,
    #[error("CN {0} may appear on at most one wireless link")]
    CnLinkLimit(String),
    #[error("radio MAC {0} is already assigned")]
    DuplicateMac(String),
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("node {0} is still alive (use force)")]
    NodeAlive(String),
    #[error("link {0} is still alive (use force)")]
    LinkAlive(String),
    #[error("topology file error: {0}")]
    File(String),
}

/// Normalize a MAC address to lower-case, colon-separated form.
pub fn standardize_mac(mac: &str) -> Result<String, TopologyError> {
    let cleaned: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    if cleaned.len() != 12 {
        return Err(TopologyError::InvalidMac(mac.to_string()));
    }
    Ok(cleaned
        .as_bytes()
        .chunks(2)
        .map(|b| std::str::from_utf8(b).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":"))
}

/// The wrapper. Internally keyed by name so insertion order never leaks
/// into serialized output.
#[derive(Debug, Default)]
pub struct TopologyWrapper {
    name: String,
    nodes: BTreeMap<String, Node>,
    links: BTreeMap<String, Link>,
    sites: BTreeMap<String, Site>,
    config: super::model::TopologyConfig,
    /// Radio MAC (normalized) -> node name.
    mac_to_node: BTreeMap<String, String>,
}

impl TopologyWrapper {
    /// Build from a parsed topology, validating every invariant.
    pub fn from_topology(topo: Topology) -> Result<Self, TopologyError> {
        let mut w = Self {
            name: topo.name,
            config: topo.config,
            ..Default::default()
        };
        for site in topo.sites {
            w.add_site(site)?;
        }
        for node in topo.nodes {
            w.add_node(node)?;
        }
        for link in topo.links {
            w.add_link(link)?;
        }
        Ok(w)
    }

    /// Load and validate a topology file.
    pub fn from_file(path: &Path) -> Result<Self, TopologyError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TopologyError::File(format!("{}: {}", path.display(), e)))?;
        let topo: Topology = serde_json::from_str(&raw)
            .map_err(|e| TopologyError::File(format!("{}: {}", path.display(), e)))?;
        Self::from_topology(topo)
    }

    /// Reset runtime state after a controller (re)start: nothing is known to
    /// be alive until a heartbeat proves it.
    pub fn sanitize(&mut self) {
        for node in self.nodes.values_mut() {
            node.status = NodeStatus::Offline;
        }
        for link in self.links.values_mut() {
            if link.is_wireless() {
                link.is_alive = false;
            } else {
                // Wired links have no ignition handshake; assume up.
                link.is_alive = true;
            }
        }
    }

    // ---- Accessors ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_node_by_mac(&self, mac: &str) -> Option<&Node> {
        self.mac_to_node.get(mac).and_then(|n| self.nodes.get(n))
    }

    pub fn get_link(&self, name: &str) -> Option<&Link> {
        self.links.get(name)
    }

    /// The link between two nodes in either order, if any.
    pub fn get_link_between(&self, a: &str, z: &str) -> Option<&Link> {
        self.links.get(&link_name(a, z))
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn all_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn all_sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links incident to a node.
    pub fn links_for_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Link> {
        self.links
            .values()
            .filter(move |l| l.a_node_name == node || l.z_node_name == node)
    }

    /// Wireless links incident to a node.
    pub fn wireless_links_for_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Link> {
        self.links_for_node(node).filter(|l| l.is_wireless())
    }

    pub fn pop_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.pop_node)
    }

    /// Export the graph as a plain topology (nodes/links/sites sorted by
    /// name, so serialize -> parse is identity modulo insertion order).
    pub fn topology(&self) -> Topology {
        Topology {
            name: self.name.clone(),
            nodes: self.nodes.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
            sites: self.sites.values().cloned().collect(),
            config: self.config.clone(),
        }
    }

    // ---- Mutators ----

    pub fn add_site(&mut self, site: Site) -> Result<(), TopologyError> {
        if site.name.is_empty() {
            return Err(TopologyError::EmptyNodeName);
        }
        if self.sites.contains_key(&site.name) {
            return Err(TopologyError::DuplicateSite(site.name));
        }
        self.sites.insert(site.name.clone(), site);
        Ok(())
    }

    pub fn del_site(&mut self, name: &str) -> Result<(), TopologyError> {
        if !self.sites.contains_key(name) {
            return Err(TopologyError::NoSuchSite(name.to_string()));
        }
        if self.nodes.values().any(|n| n.site_name == name) {
            return Err(TopologyError::SiteInUse(name.to_string()));
        }
        self.sites.remove(name);
        Ok(())
    }

    pub fn edit_site(&mut self, name: &str, new_site: Site) -> Result<(), TopologyError> {
        if !self.sites.contains_key(name) {
            return Err(TopologyError::NoSuchSite(name.to_string()));
        }
        if new_site.name != name {
            if self.sites.contains_key(&new_site.name) {
                return Err(TopologyError::DuplicateSite(new_site.name));
            }
            for node in self.nodes.values_mut() {
                if node.site_name == name {
                    node.site_name = new_site.name.clone();
                }
            }
            self.sites.remove(name);
        }
        self.sites.insert(new_site.name.clone(), new_site);
        Ok(())
    }

    pub fn add_node(&mut self, mut node: Node) -> Result<(), TopologyError> {
        if node.name.trim().is_empty() {
            return Err(TopologyError::EmptyNodeName);
        }
        if self.nodes.contains_key(&node.name) {
            return Err(TopologyError::DuplicateNode(node.name));
        }
        if !self.sites.contains_key(&node.site_name) {
            return Err(TopologyError::NoSuchSite(node.site_name));
        }
        // Normalize and claim every radio MAC.
        node.mac_addr = standardize_mac(&node.mac_addr)?;
        let mut macs = Vec::with_capacity(node.wlan_mac_addrs.len());
        for mac in &node.wlan_mac_addrs {
            macs.push(standardize_mac(mac)?);
        }
        node.wlan_mac_addrs = macs;
        for mac in node.all_macs() {
            if self.mac_to_node.contains_key(&mac) {
                return Err(TopologyError::DuplicateMac(mac));
            }
        }
        for mac in node.all_macs() {
            self.mac_to_node.insert(mac, node.name.clone());
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn del_node(&mut self, name: &str, force: bool) -> Result<(), TopologyError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| TopologyError::NoSuchNode(name.to_string()))?;
        if !force && node.status.is_online() {
            return Err(TopologyError::NodeAlive(name.to_string()));
        }
        let incident: Vec<String> = self
            .links_for_node(name)
            .map(|l| l.name.clone())
            .collect();
        if !force && incident.iter().any(|l| self.links[l].is_alive) {
            return Err(TopologyError::LinkAlive(name.to_string()));
        }
        for l in incident {
            self.links.remove(&l);
        }
        if let Some(node) = self.nodes.remove(name) {
            for mac in node.all_macs() {
                self.mac_to_node.remove(&mac);
            }
        }
        Ok(())
    }

    pub fn edit_node(&mut self, name: &str, new_node: Node) -> Result<(), TopologyError> {
        if !self.nodes.contains_key(name) {
            return Err(TopologyError::NoSuchNode(name.to_string()));
        }
        // Only renames and parameter edits are supported; links keep
        // referring to the node by name, so rewrite them on rename.
        if new_node.name != name && self.nodes.contains_key(&new_node.name) {
            return Err(TopologyError::DuplicateNode(new_node.name));
        }
        let Some(old) = self.nodes.remove(name) else {
            return Err(TopologyError::NoSuchNode(name.to_string()));
        };
        for mac in old.all_macs() {
            self.mac_to_node.remove(&mac);
        }
        let result = self.add_node(new_node.clone());
        if result.is_err() {
            // Roll back.
            for mac in old.all_macs() {
                self.mac_to_node.insert(mac, old.name.clone());
            }
            self.nodes.insert(old.name.clone(), old);
            return result;
        }
        if new_node.name != name {
            let renames: Vec<(String, Link)> = self
                .links
                .values()
                .filter(|l| l.a_node_name == name || l.z_node_name == name)
                .cloned()
                .map(|mut l| {
                    let old_name = l.name.clone();
                    if l.a_node_name == name {
                        l.a_node_name = new_node.name.clone();
                    }
                    if l.z_node_name == name {
                        l.z_node_name = new_node.name.clone();
                    }
                    // Re-canonicalize endpoints and name.
                    if l.a_node_name > l.z_node_name {
                        std::mem::swap(&mut l.a_node_name, &mut l.z_node_name);
                        std::mem::swap(&mut l.a_node_mac, &mut l.z_node_mac);
                    }
                    l.name = link_name(&l.a_node_name, &l.z_node_name);
                    (old_name, l)
                })
                .collect();
            for (old_name, l) in renames {
                self.links.remove(&old_name);
                self.links.insert(l.name.clone(), l);
            }
        }
        Ok(())
    }

    pub fn add_link(&mut self, mut link: Link) -> Result<(), TopologyError> {
        if link.a_node_name == link.z_node_name {
            return Err(TopologyError::BadEndpoints);
        }
        let a = self
            .nodes
            .get(&link.a_node_name)
            .ok_or(TopologyError::BadEndpoints)?;
        let z = self
            .nodes
            .get(&link.z_node_name)
            .ok_or(TopologyError::BadEndpoints)?;
        if link.is_wireless() {
            if a.node_type == NodeType::Cn && z.node_type == NodeType::Cn {
                return Err(TopologyError::CnToCn);
            }
            for (node, end_mac) in [(a, &link.a_node_mac), (z, &link.z_node_mac)] {
                if node.node_type == NodeType::Cn {
                    let existing = self
                        .wireless_links_for_node(&node.name)
                        .filter(|l| !l.is_backup_cn_link && !link.is_backup_cn_link)
                        .count();
                    if existing >= 1 {
                        return Err(TopologyError::CnLinkLimit(node.name.clone()));
                    }
                }
                if !end_mac.is_empty() {
                    let mac = standardize_mac(end_mac)?;
                    if !node.has_radio(&mac) {
                        return Err(TopologyError::InvalidMac(mac));
                    }
                }
            }
        }
        // Canonical endpoint order and name.
        if link.a_node_name > link.z_node_name {
            std::mem::swap(&mut link.a_node_name, &mut link.z_node_name);
            std::mem::swap(&mut link.a_node_mac, &mut link.z_node_mac);
        }
        link.name = link_name(&link.a_node_name, &link.z_node_name);
        if !link.a_node_mac.is_empty() {
            link.a_node_mac = standardize_mac(&link.a_node_mac)?;
        }
        if !link.z_node_mac.is_empty() {
            link.z_node_mac = standardize_mac(&link.z_node_mac)?;
        }
        if self.links.contains_key(&link.name) {
            return Err(TopologyError::DuplicateLink(link.name));
        }
        if link.link_type == LinkType::Ethernet {
            link.is_alive = true;
        }
        self.links.insert(link.name.clone(), link);
        Ok(())
    }

    pub fn del_link(&mut self, a: &str, z: &str, force: bool) -> Result<(), TopologyError> {
        let name = link_name(a, z);
        let link = self
            .links
            .get(&name)
            .ok_or_else(|| TopologyError::NoSuchLink(name.clone()))?;
        if !force && link.is_alive && link.is_wireless() {
            return Err(TopologyError::LinkAlive(name));
        }
        self.links.remove(&name);
        Ok(())
    }

    /// Flip link liveness; returns the previous state, or an error for an
    /// unknown link.
    pub fn set_link_status(&mut self, name: &str, alive: bool) -> Result<bool, TopologyError> {
        let link = self
            .links
            .get_mut(name)
            .ok_or_else(|| TopologyError::NoSuchLink(name.to_string()))?;
        let prev = link.is_alive;
        link.is_alive = alive;
        Ok(prev)
    }

    pub fn set_node_status(&mut self, name: &str, status: NodeStatus) -> Result<NodeStatus, TopologyError> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::NoSuchNode(name.to_string()))?;
        let prev = node.status;
        node.status = status;
        Ok(prev)
    }

    pub fn set_node_software_version(
        &mut self,
        name: &str,
        version: String,
    ) -> Result<(), TopologyError> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::NoSuchNode(name.to_string()))?;
        node.software_version = Some(version);
        Ok(())
    }

    pub fn bump_linkup_attempts(&mut self, name: &str) -> Result<u64, TopologyError> {
        let link = self
            .links
            .get_mut(name)
            .ok_or_else(|| TopologyError::NoSuchLink(name.to_string()))?;
        link.linkup_attempts += 1;
        Ok(link.linkup_attempts)
    }

    /// Nodes co-located at a site (for intra-site wired adjacency inference).
    pub fn nodes_at_site<'a>(&'a self, site: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.values().filter(move |n| n.site_name == site)
    }

    /// Mark a node offline and take down its incident wireless links.
    /// Returns the names of links that transitioned to down.
    pub fn mark_node_offline(&mut self, name: &str) -> Result<Vec<String>, TopologyError> {
        self.set_node_status(name, NodeStatus::Offline)?;
        let incident: Vec<String> = self
            .wireless_links_for_node(name)
            .filter(|l| l.is_alive)
            .map(|l| l.name.clone())
            .collect();
        for link in &incident {
            if let Some(l) = self.links.get_mut(link) {
                l.is_alive = false;
            }
        }
        Ok(incident)
    }

    /// Write a timestamped snapshot of the graph.
    pub fn save_snapshot(&self, dir: &Path) -> Result<std::path::PathBuf, TopologyError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| TopologyError::File(format!("{}: {}", dir.display(), e)))?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("e2e_topology.conf-{}", stamp));
        let json = serde_json::to_string_pretty(&self.topology())
            .map_err(|e| TopologyError::File(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| TopologyError::File(format!("{}: {}", path.display(), e)))?;
        info!("Saved topology snapshot: {}", path.display());
        Ok(path)
    }

    /// Consistency audit used on load; logs anything suspicious.
    pub fn audit(&self) {
        let mut seen = HashSet::new();
        for link in self.links.values() {
            if !seen.insert(&link.name) {
                warn!(link = %link.name, "duplicate link name in topology");
            }
            if self.nodes.get(&link.a_node_name).is_none()
                || self.nodes.get(&link.z_node_name).is_none()
            {
                warn!(link = %link.name, "link references missing node");
            }
        }
    }
}

impl Node {
    /// All MACs claimed by this node (identity + radios), normalized form
    /// assumed.
    pub fn all_macs(&self) -> Vec<String> {
        let mut macs = vec![self.mac_addr.clone()];
        for m in &self.wlan_mac_addrs {
            if !macs.contains(m) {
                macs.push(m.clone());
            }
        }
        macs
    }
}
