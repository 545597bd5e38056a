//! Controller IgnitionApp: wireless link bring-up scheduling.
//!
//! Every pass the app enumerates dead wireless links whose initiator side
//! is reachable, filters them through the dampening state, and dispatches
//! at most one LINK_UP per link network-wide. Per-radio pacing guarantees a
//! radio is never asked to start a second beamforming sweep while the
//! firmware's own timeout has not elapsed.
//!
//! Invariants enforced here:
//! - at most one in-flight LINK_UP per link at any time,
//! - successive LINK_UP commands from one radio are >= bfTimeout apart,
//! - a link that just failed is deferred by the dampen interval (or the
//!   extended interval once it has been failing long enough),
//! - a CN reachable through both a primary and a backup link only sees a
//!   backup attempt after the primary has had `backupCnLinkInterval` to
//!   come up.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{
    appid, E2eAck, ForceDissocReq, IgnitionCandidate, IgnitionParams, IgnitionState,
    LinkStatusEvent, LinkStatusType, Message, SetLinkStatus, SetLinkStatusReq,
};
use crate::shared::SharedState;
use crate::topology::{Link, Node, NodeType, TopologyWrapper};

#[derive(Debug, Clone)]
pub struct IgnitionAppConfig {
    pub linkup_interval: Duration,
    pub bf_timeout: Duration,
    pub dampen_interval: Duration,
    pub extended_dampen_interval: Duration,
    pub extended_dampen_failure_interval: Duration,
    pub backup_cn_link_interval: Duration,
    pub p2mp_assoc_delay: Duration,
    pub ignore_dampen_interval_after_resp: bool,
}

pub struct IgnitionApp {
    shared: SharedState,
    cfg: IgnitionAppConfig,
    auto_ignition_enabled: bool,
    /// Per-link auto-ignition opt-out.
    link_auto_ignite_off: HashSet<String>,
    /// Most recent attempt per link (cleared on link status events).
    link_to_attempt_ts: HashMap<String, Instant>,
    /// Oldest still-unacknowledged attempt per link.
    link_to_initial_attempt_ts: HashMap<String, Instant>,
    /// Most recent attempt per initiator radio (bfTimeout pacing).
    initiator_to_attempt_ts: HashMap<String, Instant>,
    /// Earliest time a CN could have been ignited (backup link policy).
    cn_to_possible_ignition_ts: HashMap<String, Instant>,
    /// Most recent successful LINK_UP per radio (P2MP pacing).
    radio_to_linkup_ts: HashMap<String, (Instant, String)>,
    /// Per-node round-robin starting index over its links.
    linkup_iteration_index: HashMap<String, usize>,
    last_ig_candidates: Vec<IgnitionCandidate>,
    /// Set when SetIgnitionParams changes the pass interval.
    interval_changed: bool,
}

impl IgnitionApp {
    pub fn new(shared: SharedState, cfg: IgnitionAppConfig) -> Self {
        Self {
            shared,
            cfg,
            auto_ignition_enabled: true,
            link_auto_ignite_off: HashSet::new(),
            link_to_attempt_ts: HashMap::new(),
            link_to_initial_attempt_ts: HashMap::new(),
            initiator_to_attempt_ts: HashMap::new(),
            cn_to_possible_ignition_ts: HashMap::new(),
            radio_to_linkup_ts: HashMap::new(),
            linkup_iteration_index: HashMap::new(),
            last_ig_candidates: Vec::new(),
            interval_changed: false,
        }
    }

    /// The dampen interval currently in force for a link: chronically
    /// failing links back off to the extended interval.
    fn effective_dampen(&self, link_name: &str, now: Instant) -> Duration {
        match self.link_to_initial_attempt_ts.get(link_name) {
            Some(initial)
                if now.duration_since(*initial) > self.cfg.extended_dampen_failure_interval =>
            {
                self.cfg.extended_dampen_interval
            }
            _ => self.cfg.dampen_interval,
        }
    }

    fn link_dampened(&self, link_name: &str, now: Instant) -> bool {
        match self.link_to_attempt_ts.get(link_name) {
            Some(last) => now.duration_since(*last) < self.effective_dampen(link_name, now),
            None => false,
        }
    }

    /// Radio-level pacing: the firmware sweep timeout, plus the configured
    /// P2MP association delay after a successful link-up.
    fn radio_paced_out(&self, radio_mac: &str, now: Instant) -> bool {
        if let Some(last) = self.initiator_to_attempt_ts.get(radio_mac) {
            if now.duration_since(*last) < self.cfg.bf_timeout {
                return true;
            }
        }
        if !self.cfg.p2mp_assoc_delay.is_zero() {
            if let Some((last_up, _)) = self.radio_to_linkup_ts.get(radio_mac) {
                if now.duration_since(*last_up) < self.cfg.p2mp_assoc_delay {
                    return true;
                }
            }
        }
        false
    }

    /// Initiator radio MAC for a node on a link.
    fn initiator_radio<'a>(link: &'a Link, node: &'a Node) -> Option<&'a str> {
        let mac = if link.a_node_name == node.name {
            &link.a_node_mac
        } else {
            &link.z_node_mac
        };
        if !mac.is_empty() {
            return Some(mac);
        }
        node.wlan_mac_addrs.first().map(|s| s.as_str())
    }

    /// Whether the CN behind this link must still wait for its primary.
    fn backup_link_held_back(&self, topo: &TopologyWrapper, link: &Link, now: Instant) -> bool {
        if !link.is_backup_cn_link {
            return false;
        }
        let cn_name = [&link.a_node_name, &link.z_node_name]
            .into_iter()
            .find(|n| {
                topo.get_node(n)
                    .map(|node| node.node_type == NodeType::Cn)
                    .unwrap_or(false)
            });
        let Some(cn_name) = cn_name else {
            return false;
        };
        match self.cn_to_possible_ignition_ts.get(cn_name.as_str()) {
            Some(first) => now.duration_since(*first) < self.cfg.backup_cn_link_interval,
            // The CN has never been igniteable; hold the backup until the
            // window starts counting.
            None => true,
        }
    }

    /// One ignition pass: compute candidates and dispatch LINK_UP commands.
    async fn linkup_pass(&mut self, ctx: &AppContext) {
        if !self.auto_ignition_enabled {
            return;
        }
        let now = Instant::now();
        let mut candidates: Vec<(IgnitionCandidate, SetLinkStatus)> = Vec::new();

        let shared = self.shared.clone();
        {
            let topo = shared.read_topology().await;
            self.cleanup_state(&topo);
            self.track_cn_ignition_windows(&topo, now);

            // Links already ticketed this pass (one in-flight LINK_UP per
            // link network-wide).
            let mut claimed_links: HashSet<String> = HashSet::new();
            // Radios ticketed this pass.
            let mut claimed_radios: HashSet<String> = HashSet::new();

            let initiators: Vec<String> = topo
                .all_nodes()
                .filter(|n| n.node_type == NodeType::Dn && n.status.is_online())
                .map(|n| n.name.clone())
                .collect();

            for initiator_name in initiators {
                let Some(initiator) = topo.get_node(&initiator_name) else {
                    continue;
                };
                let links: Vec<&Link> = topo
                    .wireless_links_for_node(&initiator_name)
                    .filter(|l| !l.is_alive)
                    .collect();
                if links.is_empty() {
                    continue;
                }

                // Round-robin: advance this node's starting index each pass
                // so a persistently failing link cannot head-of-line block
                // its siblings.
                let start = {
                    let idx = self
                        .linkup_iteration_index
                        .entry(initiator_name.clone())
                        .or_insert(0);
                    let start = *idx % links.len();
                    *idx = idx.wrapping_add(1);
                    start
                };

                for offset in 0..links.len() {
                    let link = links[(start + offset) % links.len()];
                    if claimed_links.contains(&link.name) {
                        continue;
                    }
                    if self.link_auto_ignite_off.contains(&link.name) {
                        continue;
                    }
                    let Some(responder_name) = link.other_end(&initiator_name) else {
                        continue;
                    };
                    let Some(responder) = topo.get_node(responder_name) else {
                        continue;
                    };
                    if self.link_dampened(&link.name, now) {
                        continue;
                    }
                    if self.backup_link_held_back(&topo, link, now) {
                        continue;
                    }
                    let Some(radio) = Self::initiator_radio(link, initiator) else {
                        debug!(node = %initiator_name, "no radio mapping, cannot initiate");
                        continue;
                    };
                    if claimed_radios.contains(radio) || self.radio_paced_out(radio, now) {
                        continue;
                    }
                    let responder_mac = if link.a_node_name == initiator_name {
                        link.z_node_mac.clone()
                    } else {
                        link.a_node_mac.clone()
                    };
                    if responder_mac.is_empty() {
                        continue;
                    }

                    claimed_links.insert(link.name.clone());
                    claimed_radios.insert(radio.to_string());
                    candidates.push((
                        IgnitionCandidate {
                            initiator_node_name: initiator_name.clone(),
                            initiator_radio_mac: radio.to_string(),
                            responder_node_name: responder.name.clone(),
                            responder_radio_mac: responder_mac.clone(),
                            link_name: link.name.clone(),
                        },
                        SetLinkStatus {
                            link_status_type: LinkStatusType::LinkUp,
                            initiator_mac: radio.to_string(),
                            responder_mac,
                            responder_node_type: Some(responder.node_type),
                            responder_polarity: responder.polarity,
                            golay_idx: responder.golay_idx,
                            control_superframe: None,
                            channel: responder.channel,
                        },
                    ));

                    // One new association per initiator node per pass.
                    break;
                }
            }
        }

        self.last_ig_candidates = candidates.iter().map(|(c, _)| c.clone()).collect();

        for (candidate, command) in candidates {
            self.dispatch_link_up(ctx, candidate, command, now).await;
        }
    }

    async fn dispatch_link_up(
        &mut self,
        ctx: &AppContext,
        candidate: IgnitionCandidate,
        command: SetLinkStatus,
        now: Instant,
    ) {
        info!(
            link = %candidate.link_name,
            initiator = %candidate.initiator_node_name,
            radio = %candidate.initiator_radio_mac,
            "igniting link"
        );
        self.link_to_attempt_ts
            .insert(candidate.link_name.clone(), now);
        self.link_to_initial_attempt_ts
            .entry(candidate.link_name.clone())
            .or_insert(now);
        self.initiator_to_attempt_ts
            .insert(candidate.initiator_radio_mac.clone(), now);

        // The minion id is the node's identity MAC.
        let minion = {
            let topo = self.shared.read_topology().await;
            topo.get_node(&candidate.initiator_node_name)
                .map(|n| n.mac_addr.clone())
        };
        let Some(minion) = minion else {
            return;
        };

        ctx.bus
            .send(
                "",
                appid::CTRL_TOPOLOGY,
                appid::CTRL_IGNITION,
                Message::BumpLinkupAttempts {
                    link_name: candidate.link_name.clone(),
                },
            )
            .await;
        ctx.events.log_event(
            EventCategory::Ignition,
            EventId::SetLinkStatus,
            EventLevel::Info,
            format!(
                "igniting {} from {}",
                candidate.link_name, candidate.initiator_node_name
            ),
        );
        ctx.bus
            .send(
                minion,
                appid::MINION_IGNITION,
                appid::CTRL_IGNITION,
                Message::SetLinkStatus(command),
            )
            .await;
    }

    /// Record when each CN first became igniteable (for backup link
    /// timing).
    fn track_cn_ignition_windows(&mut self, topo: &TopologyWrapper, now: Instant) {
        for node in topo.all_nodes() {
            if node.node_type != NodeType::Cn {
                continue;
            }
            let igniteable = topo.wireless_links_for_node(&node.name).any(|l| {
                if l.is_alive {
                    return false;
                }
                l.other_end(&node.name)
                    .and_then(|peer| topo.get_node(peer))
                    .map(|peer| peer.node_type == NodeType::Dn && peer.status.is_online())
                    .unwrap_or(false)
            });
            if igniteable {
                self.cn_to_possible_ignition_ts
                    .entry(node.name.clone())
                    .or_insert(now);
            }
        }
    }

    /// Drop dampening state that can no longer matter, so the maps cannot
    /// grow unbounded.
    fn cleanup_state(&mut self, topo: &TopologyWrapper) {
        let both_ends_offline = |link_name: &str| -> bool {
            match topo.get_link(link_name) {
                Some(link) => {
                    let a_off = topo
                        .get_node(&link.a_node_name)
                        .map(|n| !n.status.is_online())
                        .unwrap_or(true);
                    let z_off = topo
                        .get_node(&link.z_node_name)
                        .map(|n| !n.status.is_online())
                        .unwrap_or(true);
                    a_off && z_off
                }
                None => true,
            }
        };

        self.link_to_initial_attempt_ts
            .retain(|link, _| !both_ends_offline(link));
        self.link_to_attempt_ts
            .retain(|link, _| topo.get_link(link).is_some());

        self.cn_to_possible_ignition_ts.retain(|cn, _| {
            topo.get_node(cn).is_some_and(|_| {
                topo.wireless_links_for_node(cn).any(|l| {
                    l.other_end(cn)
                        .and_then(|peer| topo.get_node(peer))
                        .map(|peer| peer.status.is_online())
                        .unwrap_or(false)
                })
            })
        });

        self.radio_to_linkup_ts.retain(|radio, _| {
            topo.get_node_by_mac(radio)
                .map(|n| topo.wireless_links_for_node(&n.name).any(|l| l.is_alive))
                .unwrap_or(false)
        });
    }

    /// A link status event from TopologyApp clears the relevant dampening
    /// state.
    fn process_link_status_event(&mut self, event: &LinkStatusEvent) {
        match event.link_status_type {
            LinkStatusType::LinkUp => {
                self.link_to_attempt_ts.remove(&event.link_name);
                self.link_to_initial_attempt_ts.remove(&event.link_name);
            }
            LinkStatusType::LinkDown => {
                if event.node_reported && self.cfg.ignore_dampen_interval_after_resp {
                    // Quick retry path: the node told us explicitly, skip
                    // the regular dampen (the extended interval still
                    // applies through linkToInitialAttemptTs).
                    self.link_to_attempt_ts.remove(&event.link_name);
                }
            }
        }
    }

    /// Post-topology bookkeeping for a link event (needs the graph).
    async fn update_radio_records(&mut self, event: &LinkStatusEvent) {
        let now = Instant::now();
        let shared = self.shared.clone();
        let topo = shared.read_topology().await;
        let Some(link) = topo.get_link(&event.link_name) else {
            return;
        };
        let radios = [link.a_node_mac.clone(), link.z_node_mac.clone()];
        match event.link_status_type {
            LinkStatusType::LinkUp => {
                for radio in radios.into_iter().filter(|r| !r.is_empty()) {
                    // The node reported, so the radio's sweep is over.
                    self.initiator_to_attempt_ts.remove(&radio);
                    self.radio_to_linkup_ts
                        .insert(radio, (now, event.link_name.clone()));
                }
                for end in [&link.a_node_name, &link.z_node_name] {
                    if topo
                        .get_node(end)
                        .map(|n| n.node_type == NodeType::Cn)
                        .unwrap_or(false)
                    {
                        self.cn_to_possible_ignition_ts.remove(end.as_str());
                    }
                }
            }
            LinkStatusType::LinkDown => {
                for radio in radios.into_iter().filter(|r| !r.is_empty()) {
                    if let Some((_, l)) = self.radio_to_linkup_ts.get(&radio) {
                        if *l == event.link_name {
                            self.radio_to_linkup_ts.remove(&radio);
                        }
                    }
                    // The radio reported; its sweep is over.
                    self.initiator_to_attempt_ts.remove(&radio);
                }
            }
        }
    }

    /// Manual link action from the NMS. Validates and bypasses dampening.
    async fn process_set_link_status_req(&mut self, ctx: &AppContext, inbound: &Inbound) {
        let Message::SetLinkStatusReq(ref req) = inbound.message else {
            return;
        };
        let result = self.manual_link_action(req).await;
        let ack = match result {
            Ok((minion, command)) => {
                ctx.bus
                    .send(
                        minion,
                        appid::MINION_IGNITION,
                        appid::CTRL_IGNITION,
                        Message::SetLinkStatus(command),
                    )
                    .await;
                ctx.events.log_event(
                    EventCategory::Ignition,
                    EventId::SetLinkStatus,
                    EventLevel::Info,
                    format!("manual {:?} for {}", req.action, req.link_name),
                );
                E2eAck::ok(format!("dispatched {:?}", req.action))
            }
            Err(reason) => E2eAck::fail(reason),
        };
        ctx.reply(
            appid::CTRL_IGNITION,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(ack),
        )
        .await;
    }

    async fn manual_link_action(
        &mut self,
        req: &SetLinkStatusReq,
    ) -> std::result::Result<(String, SetLinkStatus), String> {
        let now = Instant::now();
        let shared = self.shared.clone();
        let topo = shared.read_topology().await;
        let link = topo
            .get_link(&req.link_name)
            .ok_or_else(|| format!("no such link: {}", req.link_name))?;
        if !link.is_wireless() {
            return Err(format!("{} is not a wireless link", req.link_name));
        }

        // Pick the initiator: the requested node, or the A end.
        let initiator_name = req
            .initiator_node
            .clone()
            .unwrap_or_else(|| link.a_node_name.clone());
        if link.other_end(&initiator_name).is_none() {
            return Err(format!(
                "{} is not an endpoint of {}",
                initiator_name, req.link_name
            ));
        }
        let initiator = topo
            .get_node(&initiator_name)
            .ok_or_else(|| format!("no such node: {}", initiator_name))?;
        if initiator.node_type == NodeType::Cn {
            return Err("a CN cannot initiate ignition".to_string());
        }
        if !initiator.status.is_online() {
            return Err(format!("initiator {} is offline", initiator_name));
        }
        let responder_name = link
            .other_end(&initiator_name)
            .map(|s| s.to_string())
            .unwrap_or_default();
        let responder = topo
            .get_node(&responder_name)
            .ok_or_else(|| format!("no such node: {}", responder_name))?;

        let radio = Self::initiator_radio(link, initiator)
            .ok_or_else(|| format!("{} has no radio mapping", initiator_name))?
            .to_string();
        let responder_mac = if link.a_node_name == initiator_name {
            link.z_node_mac.clone()
        } else {
            link.a_node_mac.clone()
        };

        if req.action == LinkStatusType::LinkUp {
            // Manual attempts bypass dampening but still record state so
            // the auto path honors pacing afterwards.
            self.link_to_attempt_ts.insert(req.link_name.clone(), now);
            self.link_to_initial_attempt_ts
                .entry(req.link_name.clone())
                .or_insert(now);
            self.initiator_to_attempt_ts.insert(radio.clone(), now);
        }

        Ok((
            initiator.mac_addr.clone(),
            SetLinkStatus {
                link_status_type: req.action,
                initiator_mac: radio,
                responder_mac,
                responder_node_type: Some(responder.node_type),
                responder_polarity: responder.polarity,
                golay_idx: responder.golay_idx,
                control_superframe: None,
                channel: responder.channel,
            },
        ))
    }

    async fn process_force_dissoc(&self, ctx: &AppContext, inbound: &Inbound, req: &ForceDissocReq) {
        // No topology validation: resolve the owning minion if we can and
        // fire a dissoc at it.
        let minion = {
            let topo = self.shared.read_topology().await;
            topo.get_node_by_mac(&req.initiator_mac)
                .map(|n| n.mac_addr.clone())
        };
        let ack = match minion {
            Some(minion) => {
                ctx.bus
                    .send(
                        minion,
                        appid::MINION_IGNITION,
                        appid::CTRL_IGNITION,
                        Message::SetLinkStatus(SetLinkStatus {
                            link_status_type: LinkStatusType::LinkDown,
                            initiator_mac: req.initiator_mac.clone(),
                            responder_mac: req.responder_mac.clone(),
                            responder_node_type: None,
                            responder_polarity: None,
                            golay_idx: None,
                            control_superframe: None,
                            channel: None,
                        }),
                    )
                    .await;
                E2eAck::ok("dissoc dispatched")
            }
            None => E2eAck::fail(format!("unknown radio {}", req.initiator_mac)),
        };
        ctx.reply(
            appid::CTRL_IGNITION,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(ack),
        )
        .await;
    }

    fn ignition_state(&self, now: Instant) -> IgnitionState {
        IgnitionState {
            auto_ignition_enabled: self.auto_ignition_enabled,
            last_ig_candidates: self.last_ig_candidates.clone(),
            dampened_links: self
                .link_to_attempt_ts
                .keys()
                .filter(|l| self.link_dampened(l, now))
                .cloned()
                .collect(),
        }
    }

    fn process_set_ignition_params(&mut self, params: &IgnitionParams) {
        if let Some(enable) = params.enable {
            if enable != self.auto_ignition_enabled {
                info!("auto-ignition {}", if enable { "enabled" } else { "disabled" });
            }
            self.auto_ignition_enabled = enable;
        }
        if let Some(interval_s) = params.link_up_interval_s {
            let new = Duration::from_secs(interval_s.max(1));
            if new != self.cfg.linkup_interval {
                self.cfg.linkup_interval = new;
                self.interval_changed = true;
            }
        }
        for (link, auto) in &params.link_auto_ignite {
            if *auto {
                self.link_auto_ignite_off.remove(link);
            } else {
                self.link_auto_ignite_off.insert(link.clone());
            }
        }
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match &inbound.message {
            Message::SetLinkStatusReq(_) => {
                self.process_set_link_status_req(ctx, &inbound).await;
            }
            Message::LinkStatusEvent(event) => {
                self.process_link_status_event(event);
                self.update_radio_records(event).await;
            }
            Message::SetIgnitionParams(params) => {
                self.process_set_ignition_params(params);
                ctx.reply(
                    appid::CTRL_IGNITION,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(E2eAck::ok("ignition params updated")),
                )
                .await;
            }
            Message::GetIgnitionState => {
                let state = self.ignition_state(Instant::now());
                ctx.reply(
                    appid::CTRL_IGNITION,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::IgnitionState(state),
                )
                .await;
            }
            Message::ForceDissocReq(req) => {
                let req = req.clone();
                self.process_force_dissoc(ctx, &inbound, &req).await;
            }
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

#[async_trait]
impl App for IgnitionApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_IGNITION
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut linkup_timer = tokio::time::interval(self.cfg.linkup_interval);
        linkup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.interval_changed {
                self.interval_changed = false;
                linkup_timer = tokio::time::interval(self.cfg.linkup_interval);
                linkup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            }
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = linkup_timer.tick() => self.linkup_pass(&ctx).await,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.process_message(&ctx, inbound).await;
                }
            }
        }
        Ok(())
    }
}
