//! Controller TopologyApp: authoritative owner of the topology graph.
//!
//! Drives four timers (status reconciliation, topology info sync, routing
//! adjacency dumps, periodic snapshots), serves CRUD with strict
//! validation, and translates minion link reports into graph updates plus
//! `LinkStatusEvent`s for IgnitionApp.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{
    appid, E2eAck, LinkStatusEvent, LinkStatusType, Message, NodeParams, RoutingAdjacencies,
};
use crate::shared::SharedState;
use crate::topology::{LinkType, NodeStatus, NodeType, TopologyError};

pub struct TopologyAppConfig {
    pub status_reports_interval: Duration,
    pub node_alive_timeout: Duration,
    pub topology_info_sync_interval: Duration,
    pub topology_report_interval: Duration,
    pub routing_adjacencies_dump_interval: Duration,
    pub topology_dir: PathBuf,
    pub enable_airtime_auto_alloc: bool,
    pub enable_centralized_prefix_alloc: bool,
    pub enable_deterministic_prefix_alloc: bool,
    pub enable_create_intrasite_links: bool,
}

pub struct TopologyApp {
    shared: SharedState,
    cfg: TopologyAppConfig,
    /// Topology revision; bumped on every graph mutation so allocation
    /// passes only run when something changed.
    graph_revision: u64,
    last_alloc_revision: u64,
    /// Latest adjacency dump per node.
    routing_adjacencies: BTreeMap<String, Vec<String>>,
}

impl TopologyApp {
    pub fn new(shared: SharedState, cfg: TopologyAppConfig) -> Self {
        Self {
            shared,
            cfg,
            graph_revision: 1,
            last_alloc_revision: 0,
            routing_adjacencies: BTreeMap::new(),
        }
    }

    /// Create wired links between co-located DNs so ignition can treat them
    /// as adjacencies.
    async fn create_intrasite_links(&mut self) {
        let shared = self.shared.clone();
        let mut topo = shared.write_topology().await;
        let sites: Vec<String> = topo.all_sites().map(|s| s.name.clone()).collect();
        for site in sites {
            let dns: Vec<String> = topo
                .nodes_at_site(&site)
                .filter(|n| n.node_type == NodeType::Dn)
                .map(|n| n.name.clone())
                .collect();
            for i in 0..dns.len() {
                for j in (i + 1)..dns.len() {
                    if topo.get_link_between(&dns[i], &dns[j]).is_some() {
                        continue;
                    }
                    let link = crate::topology::Link {
                        name: String::new(),
                        a_node_name: dns[i].clone(),
                        z_node_name: dns[j].clone(),
                        a_node_mac: String::new(),
                        z_node_mac: String::new(),
                        link_type: LinkType::Ethernet,
                        is_alive: true,
                        linkup_attempts: 0,
                        is_backup_cn_link: false,
                    };
                    match topo.add_link(link) {
                        Ok(()) => {
                            self.graph_revision += 1;
                            info!("created intra-site link between {} and {}", dns[i], dns[j]);
                        }
                        Err(e) => debug!("intra-site link skipped: {}", e),
                    }
                }
            }
        }
    }

    /// Status reconciliation: liveness from the shared status store.
    async fn sync_with_status_reports(&mut self, ctx: &AppContext) {
        let now = Instant::now();
        let mut events = Vec::new();

        // Snapshot the status store first; the status lock is a leaf and is
        // never held across a topology/config acquisition.
        let status: BTreeMap<String, crate::shared::StatusEntry> = {
            let store = self.shared.read_status().await;
            store.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        {
            let mut topo = self.shared.write_topology().await;

            let node_names: Vec<String> = topo.all_nodes().map(|n| n.name.clone()).collect();
            for name in node_names {
                let Some(node) = topo.get_node(&name) else {
                    continue;
                };
                let entry = node
                    .all_macs()
                    .into_iter()
                    .find_map(|mac| status.get(&mac).cloned());

                match entry {
                    Some(entry)
                        if now.duration_since(entry.received_at) < self.cfg.node_alive_timeout =>
                    {
                        let reported = entry.report.status;
                        let new_status = if reported.is_online() {
                            reported
                        } else {
                            NodeStatus::Online
                        };
                        let prev = topo.set_node_status(&name, new_status).unwrap_or(new_status);
                        if prev == NodeStatus::Offline {
                            info!(node = %name, "node is back online");
                            events.push((
                                EventId::NodeStatusChange,
                                EventLevel::Info,
                                format!("{} is online", name),
                            ));
                        }
                        if let Some(version) = entry.report.version.clone() {
                            let _ = topo.set_node_software_version(&name, version);
                        }
                    }
                    _ => {
                        let was_online = topo
                            .get_node(&name)
                            .map(|n| n.status.is_online())
                            .unwrap_or(false);
                        if was_online {
                            warn!(node = %name, "no heartbeat within timeout, marking offline");
                            let downed = topo.mark_node_offline(&name).unwrap_or_default();
                            events.push((
                                EventId::NodeStatusChange,
                                EventLevel::Warning,
                                format!("{} is offline", name),
                            ));
                            for link in downed {
                                events.push((
                                    EventId::LinkStatusChange,
                                    EventLevel::Warning,
                                    link.clone(),
                                ));
                                // Tell IgnitionApp the link went down
                                // (inferred, not node-reported).
                                ctx.bus
                                    .send(
                                        "",
                                        appid::CTRL_IGNITION,
                                        appid::CTRL_TOPOLOGY,
                                        Message::LinkStatusEvent(LinkStatusEvent {
                                            link_name: link,
                                            link_status_type: LinkStatusType::LinkDown,
                                            node_reported: false,
                                        }),
                                    )
                                    .await;
                            }
                        }
                    }
                }
            }
        }

        for (id, level, reason) in events {
            ctx.events
                .log_event(EventCategory::Topology, id, level, reason);
        }

        self.maybe_recompute_allocations().await;
    }

    /// Recompute prefix/airtime allocations when enabled and the graph
    /// changed since the last pass.
    async fn maybe_recompute_allocations(&mut self) {
        if self.last_alloc_revision == self.graph_revision {
            return;
        }
        self.last_alloc_revision = self.graph_revision;

        if !self.cfg.enable_centralized_prefix_alloc
            && !self.cfg.enable_deterministic_prefix_alloc
            && !self.cfg.enable_airtime_auto_alloc
        {
            return;
        }

        let (topo, mut config) = self.shared.write_both().await;

        if self.cfg.enable_centralized_prefix_alloc || self.cfg.enable_deterministic_prefix_alloc {
            // Deterministic: node order is the sorted node list, so the same
            // graph always yields the same allocation.
            for (idx, node) in topo.all_nodes().enumerate() {
                let prefix = format!("face:b00c:0:{:x}::/64", idx);
                if let Err(e) = config.set_auto_node_overrides(
                    &node.name,
                    json!({"prefixAlloc": {"allocatedPrefix": prefix}}),
                ) {
                    warn!("prefix allocation write failed for {}: {}", node.name, e);
                }
            }
        }

        if self.cfg.enable_airtime_auto_alloc {
            // Fair share: split each node's airtime across its wireless
            // peers.
            for node in topo.all_nodes() {
                let peers: Vec<String> = topo
                    .wireless_links_for_node(&node.name)
                    .filter_map(|l| l.other_end(&node.name).map(|s| s.to_string()))
                    .collect();
                if peers.is_empty() {
                    continue;
                }
                let share = 10_000 / peers.len() as i64;
                let alloc: BTreeMap<String, i64> =
                    peers.into_iter().map(|p| (p, share)).collect();
                if let Err(e) = config
                    .set_auto_node_overrides(&node.name, json!({"airtimeAllocMap": alloc}))
                {
                    warn!("airtime allocation write failed for {}: {}", node.name, e);
                }
            }
        }
    }

    /// Push each online node its view of its neighbors so local config is
    /// consistent with the graph.
    async fn sync_topology_info(&self) {
        let (topo, mut config) = self.shared.write_both().await;
        for node in topo.all_nodes() {
            if !node.status.is_online() {
                continue;
            }
            let mut neighbors = BTreeMap::new();
            for link in topo.wireless_links_for_node(&node.name) {
                let Some(peer_name) = link.other_end(&node.name) else {
                    continue;
                };
                let Some(peer) = topo.get_node(peer_name) else {
                    continue;
                };
                let peer_mac = if link.a_node_name == node.name {
                    &link.z_node_mac
                } else {
                    &link.a_node_mac
                };
                neighbors.insert(
                    peer_mac.clone(),
                    json!({
                        "nodeName": peer.name,
                        "nodeType": peer.node_type,
                        "polarity": peer.polarity,
                        "golayIdx": peer.golay_idx,
                        "channel": peer.channel,
                        "linkName": link.name,
                    }),
                );
            }
            let info = json!({
                "topologyInfo": {
                    "nodeName": node.name,
                    "neighborInfo": neighbors,
                }
            });
            if let Err(e) = config.set_auto_node_overrides(&node.name, info) {
                warn!("topology info sync failed for {}: {}", node.name, e);
            }
        }
    }

    /// Poll each online minion's routing KV store.
    async fn request_routing_adjacencies(&self, ctx: &AppContext) {
        let targets: Vec<String> = {
            let topo = self.shared.read_topology().await;
            topo.all_nodes()
                .filter(|n| n.status.is_online())
                .map(|n| n.mac_addr.clone())
                .collect()
        };
        for minion in targets {
            ctx.bus
                .send(
                    minion,
                    appid::MINION_OPENR_CLIENT,
                    appid::CTRL_TOPOLOGY,
                    Message::GetRoutingAdjacencies,
                )
                .await;
        }
    }

    /// Detect mesh partitions from collected adjacency dumps.
    fn check_partitions(&self) -> Option<usize> {
        if self.routing_adjacencies.is_empty() {
            return None;
        }
        // Reachability sweep from the first node in the dump.
        let mut visited = HashSet::new();
        let mut stack: Vec<&String> = self.routing_adjacencies.keys().take(1).collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(adjs) = self.routing_adjacencies.get(node) {
                for adj in adjs {
                    if !visited.contains(adj) {
                        if let Some((key, _)) = self.routing_adjacencies.get_key_value(adj) {
                            stack.push(key);
                        }
                    }
                }
            }
        }
        let unreachable = self.routing_adjacencies.len() - visited.len();
        (unreachable > 0).then_some(unreachable)
    }

    async fn record_topology_stats(&self, ctx: &AppContext) {
        let topo = self.shared.read_topology().await;
        let online = topo.all_nodes().filter(|n| n.status.is_online()).count();
        let alive_links = topo
            .all_links()
            .filter(|l| l.is_wireless() && l.is_alive)
            .count();
        let wireless_links = topo.all_links().filter(|l| l.is_wireless()).count();
        info!(
            "topology: {}/{} nodes online, {}/{} wireless links alive",
            online,
            topo.node_count(),
            alive_links,
            wireless_links
        );
        if let Err(e) = topo.save_snapshot(&self.cfg.topology_dir) {
            warn!("topology snapshot failed: {}", e);
        }
        if let Some(partitioned) = self.check_partitions() {
            ctx.events.log_event(
                EventCategory::Topology,
                EventId::NodeStatusChange,
                EventLevel::Warning,
                format!("routing mesh partitioned: {} node(s) unreachable", partitioned),
            );
        }
    }

    /// Apply a driver-confirmed link report from a minion.
    async fn process_link_status(&mut self, ctx: &AppContext, inbound: &Inbound) {
        let Message::LinkStatus(ref ls) = inbound.message else {
            return;
        };
        let alive = ls.link_status_type == LinkStatusType::LinkUp;

        let link_name = {
            let mut topo = self.shared.write_topology().await;
            let link_name = match (
                topo.get_node_by_mac(&ls.radio_mac),
                topo.get_node_by_mac(&ls.responder_mac),
            ) {
                (Some(a), Some(z)) => crate::topology::link_name(&a.name, &z.name),
                _ => {
                    warn!(
                        radio = %ls.radio_mac,
                        responder = %ls.responder_mac,
                        "link status for unknown endpoint"
                    );
                    return;
                }
            };
            match topo.set_link_status(&link_name, alive) {
                Ok(prev) => {
                    if prev != alive {
                        info!(link = %link_name, alive, "link status changed");
                    }
                }
                Err(e) => {
                    warn!("link status update failed: {}", e);
                    return;
                }
            }
            link_name
        };

        ctx.events.log_event(
            EventCategory::Topology,
            EventId::LinkStatusChange,
            if alive {
                EventLevel::Info
            } else {
                EventLevel::Warning
            },
            format!(
                "{} is {}",
                link_name,
                if alive { "up" } else { "down" }
            ),
        );

        // Notify IgnitionApp (node-reported change).
        ctx.bus
            .send(
                "",
                appid::CTRL_IGNITION,
                appid::CTRL_TOPOLOGY,
                Message::LinkStatusEvent(LinkStatusEvent {
                    link_name,
                    link_status_type: ls.link_status_type,
                    node_reported: true,
                }),
            )
            .await;

        // Push PHY node params to a responder CN when its link comes up.
        if alive {
            let params = {
                let topo = self.shared.read_topology().await;
                topo.get_node_by_mac(&ls.responder_mac).map(|n| {
                    (
                        n.mac_addr.clone(),
                        NodeParams {
                            polarity: n.polarity,
                            golay_idx: n.golay_idx,
                            channel: n.channel,
                            airtime_alloc_map: None,
                        },
                    )
                })
            };
            if let Some((minion, params)) = params {
                ctx.bus
                    .send(
                        minion,
                        appid::MINION_STATUS,
                        appid::CTRL_TOPOLOGY,
                        Message::SetNodeParams(params),
                    )
                    .await;
            }
        }
    }

    /// CRUD over nodes/links/sites. Replies E2E_ACK and bumps the graph
    /// revision on success.
    async fn process_crud(&mut self, ctx: &AppContext, inbound: &Inbound) {
        let (result, event): (Result<(), TopologyError>, Option<(EventId, String)>) = {
            let mut topo = self.shared.write_topology().await;
            match &inbound.message {
                Message::AddNode(req) => {
                    let name = req.node.name.clone();
                    (
                        topo.add_node(req.node.clone()),
                        Some((EventId::TopologyNodeAdded, name)),
                    )
                }
                Message::DelNode(req) => (
                    topo.del_node(&req.node_name, req.force),
                    Some((EventId::TopologyNodeRemoved, req.node_name.clone())),
                ),
                Message::EditNode(req) => {
                    let r = topo.edit_node(&req.node_name, req.new_node.clone());
                    (r, None)
                }
                Message::AddLink(req) => {
                    let name = crate::topology::link_name(
                        &req.link.a_node_name,
                        &req.link.z_node_name,
                    );
                    (
                        topo.add_link(req.link.clone()),
                        Some((EventId::TopologyLinkAdded, name)),
                    )
                }
                Message::DelLink(req) => (
                    topo.del_link(&req.a_node_name, &req.z_node_name, req.force),
                    Some((
                        EventId::TopologyLinkRemoved,
                        crate::topology::link_name(&req.a_node_name, &req.z_node_name),
                    )),
                ),
                Message::AddSite(req) => (
                    topo.add_site(req.site.clone()),
                    Some((EventId::TopologySiteAdded, req.site.name.clone())),
                ),
                Message::DelSite(req) => (
                    topo.del_site(&req.site_name),
                    Some((EventId::TopologySiteRemoved, req.site_name.clone())),
                ),
                Message::EditSite(req) => {
                    (topo.edit_site(&req.site_name, req.new_site.clone()), None)
                }
                _ => return,
            }
        };

        let ack = match &result {
            Ok(()) => {
                self.graph_revision += 1;
                if let Some((id, subject)) = event {
                    ctx.events.log_event(
                        EventCategory::Topology,
                        id,
                        EventLevel::Info,
                        subject,
                    );
                }
                E2eAck::ok("success")
            }
            Err(e) => E2eAck::fail(e.to_string()),
        };
        ctx.reply(
            appid::CTRL_TOPOLOGY,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(ack),
        )
        .await;
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match &inbound.message {
            Message::GetTopology => {
                let topo = self.shared.read_topology().await.topology();
                ctx.reply(
                    appid::CTRL_TOPOLOGY,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::TopologyResp(topo),
                )
                .await;
            }
            Message::LinkStatus(_) => self.process_link_status(ctx, &inbound).await,
            Message::BumpLinkupAttempts { link_name } => {
                let mut topo = self.shared.write_topology().await;
                if let Err(e) = topo.bump_linkup_attempts(link_name) {
                    debug!("bump linkup attempts: {}", e);
                }
            }
            Message::RoutingAdjacencies(RoutingAdjacencies { adjacency_map }) => {
                for (node, adjs) in adjacency_map {
                    self.routing_adjacencies.insert(node.clone(), adjs.clone());
                }
            }
            Message::AddNode(_)
            | Message::DelNode(_)
            | Message::EditNode(_)
            | Message::AddLink(_)
            | Message::DelLink(_)
            | Message::AddSite(_)
            | Message::DelSite(_)
            | Message::EditSite(_) => self.process_crud(ctx, &inbound).await,
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

#[async_trait]
impl App for TopologyApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_TOPOLOGY
    }

    async fn init(&mut self) -> Result<()> {
        if self.cfg.enable_create_intrasite_links {
            self.create_intrasite_links().await;
        }
        Ok(())
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut status_timer = tokio::time::interval(self.cfg.status_reports_interval);
        let mut info_sync_timer = tokio::time::interval(self.cfg.topology_info_sync_interval);
        let mut adjacency_timer =
            tokio::time::interval(self.cfg.routing_adjacencies_dump_interval);
        let mut report_timer = tokio::time::interval(self.cfg.topology_report_interval);
        for t in [
            &mut status_timer,
            &mut info_sync_timer,
            &mut adjacency_timer,
            &mut report_timer,
        ] {
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = status_timer.tick() => self.sync_with_status_reports(&ctx).await,
                _ = info_sync_timer.tick() => self.sync_topology_info().await,
                _ = adjacency_timer.tick() => self.request_routing_adjacencies(&ctx).await,
                _ = report_timer.tick() => self.record_topology_stats(&ctx).await,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.process_message(&ctx, inbound).await;
                }
            }
        }
        Ok(())
    }
}
