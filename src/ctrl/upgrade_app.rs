//! Controller UpgradeApp: coordinated software upgrades.
//!
//! Requests queue FIFO; each request decomposes into batches of nodes
//! upgraded in parallel. A batch is initiated (dispatching PREPARE or
//! COMMIT to every node at once, with a common timeout and a snapshot of
//! wireless-link liveness and POP BGP peer counts), then drained as minion
//! status reports come in. `skipFailure` decides whether a failing node is
//! dropped or kills the whole request.
//!
//! Images are staged into a local store, verified against their embedded
//! meta trailer, and served to minions over HTTP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{
    appid, E2eAck, GoldenImage, Message, UpgradeGroupReq, UpgradeImage, UpgradeListImagesResp,
    UpgradeReq, UpgradeReqType, UpgradeStateDump, UpgradeStatusType,
};
use crate::shared::SharedState;
use crate::upgrade::verify_image_file;

/// A set of nodes upgraded in parallel.
#[derive(Debug, Default, Clone)]
struct Batch {
    /// Pending node names.
    nodes: BTreeSet<String>,
    init_time: Option<Instant>,
    /// Wireless links that were alive at initiation (minus skipLinks).
    tracked_links: HashSet<String>,
    /// BGP peer count per POP node at initiation.
    bgp_peers: HashMap<String, usize>,
}

impl Batch {
    fn pending(&self) -> bool {
        !self.nodes.is_empty()
    }

    fn timed_out(&self, timeout: Duration) -> bool {
        self.init_time
            .map(|t| t.elapsed() >= timeout)
            .unwrap_or(false)
    }
}

struct StagedImage {
    image: UpgradeImage,
    path: PathBuf,
}

pub struct UpgradeAppConfig {
    pub sync_interval: Duration,
    pub golden_check_interval: Duration,
    pub image_dir: PathBuf,
    /// Base URI minions use to fetch staged images, e.g.
    /// `http://ctrl:17080/images`.
    pub image_http_base: String,
    pub controller_config_file: PathBuf,
}

pub struct UpgradeApp {
    shared: SharedState,
    cfg: UpgradeAppConfig,
    images: BTreeMap<String, StagedImage>,
    pending_reqs: VecDeque<UpgradeGroupReq>,
    cur_req: Option<UpgradeGroupReq>,
    cur_batch: Batch,
    pending_batches: VecDeque<Batch>,
    /// Prepare/commit retries so far per node.
    retries: HashMap<String, u32>,
    golden: GoldenImage,
    /// Request id of the in-flight golden reconciliation, if any.
    golden_upgrade_id: Option<String>,
}

impl UpgradeApp {
    pub fn new(shared: SharedState, cfg: UpgradeAppConfig) -> Self {
        Self {
            shared,
            cfg,
            images: BTreeMap::new(),
            pending_reqs: VecDeque::new(),
            cur_req: None,
            cur_batch: Batch::default(),
            pending_batches: VecDeque::new(),
            retries: HashMap::new(),
            golden: GoldenImage::default(),
            golden_upgrade_id: None,
        }
    }

    /// Scan the image directory for previously staged images and load the
    /// golden image record from the controller config.
    fn load_persisted_state(&mut self) {
        if let Ok(entries) = std::fs::read_dir(&self.cfg.image_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match verify_image_file(&path) {
                    Ok(meta) => {
                        info!(image = name, version = %meta.version, "restored staged image");
                        self.images.insert(
                            name.to_string(),
                            StagedImage {
                                image: UpgradeImage {
                                    name: name.to_string(),
                                    md5: meta.md5,
                                    http_uri: format!("{}/{}", self.cfg.image_http_base, name),
                                    hardware_board_ids: meta.hardware_board_ids,
                                },
                                path,
                            },
                        );
                    }
                    Err(e) => warn!(image = name, "ignoring invalid staged image: {}", e),
                }
            }
        }
        if let Ok(raw) = std::fs::read_to_string(&self.cfg.controller_config_file) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                if let Some(golden) = value.get("goldenImage") {
                    match serde_json::from_value::<GoldenImage>(golden.clone()) {
                        Ok(g) => self.golden = g,
                        Err(e) => warn!("golden image config failed to parse: {}", e),
                    }
                }
            }
        }
    }

    fn persist_golden(&self) {
        let path = &self.cfg.controller_config_file;
        if path.as_os_str().is_empty() {
            return;
        }
        let mut value = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if let Ok(golden) = serde_json::to_value(&self.golden) {
            value["goldenImage"] = golden;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, serde_json::to_string_pretty(&value).unwrap_or_default())
        {
            warn!("persisting golden image failed: {}", e);
        }
    }

    /// Resolve a request's node list (empty = whole network) into node
    /// names, applying exclusions.
    async fn resolve_nodes(&self, req: &UpgradeGroupReq) -> Vec<String> {
        let topo = self.shared.read_topology().await;
        let mut names: Vec<String> = if req.nodes.is_empty() {
            topo.all_nodes().map(|n| n.name.clone()).collect()
        } else {
            req.nodes
                .iter()
                .filter(|n| topo.get_node(n).is_some())
                .cloned()
                .collect()
        };
        names.retain(|n| !req.exclude_nodes.contains(n));
        names
    }

    /// Node name -> (minion id, reported version, upgrade status).
    async fn node_report(
        &self,
        node_name: &str,
    ) -> Option<(String, Option<String>, crate::messages::UpgradeStatus)> {
        let mac = {
            let topo = self.shared.read_topology().await;
            topo.get_node(node_name).map(|n| n.mac_addr.clone())?
        };
        let status = self.shared.status_for(&mac).await;
        match status {
            Some(entry) => Some((
                mac,
                entry.report.version.clone(),
                entry.report.upgrade_status.clone(),
            )),
            None => Some((mac, None, Default::default())),
        }
    }

    // ---- Request intake ----

    async fn process_upgrade_group_req(&mut self, ctx: &AppContext, inbound: &Inbound) {
        let Message::UpgradeGroupReq(ref req) = inbound.message else {
            return;
        };
        let ack = self.enqueue_request(ctx, req.clone()).await;
        ctx.reply(
            appid::CTRL_UPGRADE,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(ack),
        )
        .await;
    }

    async fn enqueue_request(&mut self, ctx: &AppContext, req: UpgradeGroupReq) -> E2eAck {
        match req.ur_type {
            UpgradeReqType::ResetStatus => {
                // Immediate dispatch, no batching.
                let nodes = self.resolve_nodes(&req).await;
                for node in &nodes {
                    if let Some((minion, _, _)) = self.node_report(node).await {
                        ctx.bus
                            .send(
                                minion,
                                appid::MINION_UPGRADE,
                                appid::CTRL_UPGRADE,
                                Message::UpgradeReq(UpgradeReq {
                                    ur_type: UpgradeReqType::ResetStatus,
                                    upgrade_req_id: req.upgrade_req_id.clone(),
                                    md5: String::new(),
                                    image_url: String::new(),
                                    schedule_to_commit: 0,
                                    download_timeout_s: 0,
                                }),
                            )
                            .await;
                    }
                }
                E2eAck::ok(format!("reset dispatched to {} node(s)", nodes.len()))
            }
            UpgradeReqType::FullUpgrade => {
                // Split into a PREPARE and a scheduled COMMIT request.
                let mut prepare = req.clone();
                prepare.ur_type = UpgradeReqType::PrepareUpgrade;
                prepare.upgrade_req_id = format!("{}-prepare", req.upgrade_req_id);
                let mut commit = req.clone();
                commit.ur_type = UpgradeReqType::CommitUpgrade;
                commit.upgrade_req_id = format!("{}-commit", req.upgrade_req_id);
                match self.validate_request(&prepare) {
                    Ok(()) => {
                        self.pending_reqs.push_back(prepare);
                        self.pending_reqs.push_back(commit);
                        E2eAck::ok("full upgrade queued")
                    }
                    Err(e) => E2eAck::fail(e),
                }
            }
            UpgradeReqType::PrepareUpgrade | UpgradeReqType::CommitUpgrade => {
                match self.validate_request(&req) {
                    Ok(()) => {
                        info!(req_id = %req.upgrade_req_id, ur_type = ?req.ur_type, "upgrade request queued");
                        self.pending_reqs.push_back(req);
                        E2eAck::ok("upgrade request queued")
                    }
                    Err(e) => E2eAck::fail(e),
                }
            }
        }
    }

    fn validate_request(&self, req: &UpgradeGroupReq) -> std::result::Result<(), String> {
        if req.upgrade_req_id.is_empty() {
            return Err("upgrade request id must be set".to_string());
        }
        if req.ur_type == UpgradeReqType::PrepareUpgrade {
            let image = self
                .images
                .values()
                .find(|i| i.image.name == req.image_name || i.image.md5 == req.md5);
            if image.is_none() {
                return Err(format!("image {} is not staged", req.image_name));
            }
        }
        if req.timeout_s == 0 {
            return Err("timeout must be positive".to_string());
        }
        Ok(())
    }

    // ---- The periodic FSM ----

    async fn sync_with_status_reports(&mut self, ctx: &AppContext) {
        if self.cur_batch.pending() {
            self.check_current_batch(ctx).await;
        }
        while !self.cur_batch.pending() && (self.cur_req.is_some() || !self.pending_reqs.is_empty())
        {
            self.populate_next_batch(ctx).await;
            if self.cur_batch.pending() || (self.cur_req.is_none() && self.pending_reqs.is_empty())
            {
                break;
            }
        }
    }

    /// Drain the current batch against the latest status reports.
    async fn check_current_batch(&mut self, ctx: &AppContext) {
        let Some(req) = self.cur_req.clone() else {
            self.cur_batch = Batch::default();
            return;
        };

        // Commit precondition: captured links still alive, POP peers kept.
        if req.ur_type == UpgradeReqType::CommitUpgrade && self.commit_preconditions_violated().await
        {
            if req.skip_failure {
                warn!(req_id = %req.upgrade_req_id, "commit precondition violated, skipping batch");
                self.cur_batch = Batch::default();
            } else {
                self.abort_cur_req(ctx, "commit precondition violated").await;
            }
            return;
        }

        let nodes: Vec<String> = self.cur_batch.nodes.iter().cloned().collect();
        for node in nodes {
            let Some((_, version, status)) = self.node_report(&node).await else {
                continue;
            };
            match req.ur_type {
                UpgradeReqType::PrepareUpgrade => {
                    if status.us_type == UpgradeStatusType::Flashed
                        && status.next_image.md5 == req.md5
                    {
                        info!(node = %node, "prepare complete");
                        self.cur_batch.nodes.remove(&node);
                        self.retries.remove(&node);
                    } else if matches!(
                        status.us_type,
                        UpgradeStatusType::DownloadFailed | UpgradeStatusType::FlashFailed
                    ) && status.upgrade_req_id == req.upgrade_req_id
                    {
                        self.handle_node_failure(ctx, &node, &req, &status.reason).await;
                        if !self.cur_batch.pending() && self.cur_req.is_none() {
                            return; // request aborted
                        }
                    }
                }
                UpgradeReqType::CommitUpgrade => {
                    if version.as_deref() == Some(req.version.as_str()) && !req.version.is_empty() {
                        info!(node = %node, version = %req.version, "commit complete");
                        self.cur_batch.nodes.remove(&node);
                        self.retries.remove(&node);
                    }
                }
                _ => {}
            }
        }

        if !self.cur_batch.pending() {
            return;
        }
        if self.cur_batch.timed_out(Duration::from_secs(req.timeout_s)) {
            let remaining: Vec<String> = self.cur_batch.nodes.iter().cloned().collect();
            if req.skip_failure {
                warn!(
                    req_id = %req.upgrade_req_id,
                    "batch timed out, skipping {} node(s)",
                    remaining.len()
                );
                ctx.events.log_event(
                    EventCategory::Upgrade,
                    EventId::UpgradeInfo,
                    EventLevel::Warning,
                    format!("batch timeout, skipped nodes: {:?}", remaining),
                );
                self.cur_batch = Batch::default();
            } else {
                self.abort_cur_req(ctx, "batch timed out").await;
            }
        }
    }

    async fn handle_node_failure(
        &mut self,
        ctx: &AppContext,
        node: &str,
        req: &UpgradeGroupReq,
        reason: &str,
    ) {
        let attempts = self.retries.entry(node.to_string()).or_insert(0);
        if *attempts < req.retry_limit {
            *attempts += 1;
            info!(node, attempt = *attempts, "retrying upgrade step");
            self.dispatch_to_node(ctx, node, req).await;
            return;
        }
        if req.skip_failure {
            warn!(node, reason, "node failed, skipping");
            self.cur_batch.nodes.remove(node);
            ctx.events.log_event(
                EventCategory::Upgrade,
                EventId::UpgradeInfo,
                EventLevel::Warning,
                format!("{} failed ({}), skipped", node, reason),
            );
        } else {
            self.abort_cur_req(ctx, &format!("{} failed: {}", node, reason))
                .await;
        }
    }

    /// With `skipFailure` unset, a single failure clears the batch, every
    /// pending batch, and every queued request with the same id.
    async fn abort_cur_req(&mut self, ctx: &AppContext, reason: &str) {
        let req_id = self
            .cur_req
            .as_ref()
            .map(|r| r.upgrade_req_id.clone())
            .unwrap_or_default();
        warn!(req_id = %req_id, reason, "aborting upgrade request");
        ctx.events.log_event(
            EventCategory::Upgrade,
            EventId::UpgradeAbort,
            EventLevel::Error,
            format!("{}: {}", req_id, reason),
        );
        self.cur_batch = Batch::default();
        self.pending_batches.clear();
        self.cur_req = None;
        // A full upgrade's commit half shares the "<id>-" prefix.
        if let Some(base) = req_id.strip_suffix("-prepare") {
            let commit_id = format!("{}-commit", base);
            self.pending_reqs
                .retain(|r| r.upgrade_req_id != commit_id && r.upgrade_req_id != req_id);
        } else {
            self.pending_reqs.retain(|r| r.upgrade_req_id != req_id);
        }
        if self.golden_upgrade_id.as_deref() == Some(req_id.as_str()) {
            self.golden_upgrade_id = None;
        }
    }

    async fn commit_preconditions_violated(&self) -> bool {
        let topo = self.shared.read_topology().await;
        for link in &self.cur_batch.tracked_links {
            match topo.get_link(link) {
                Some(l) if l.is_alive => {}
                _ => {
                    warn!(link = %link, "tracked wireless link went down during commit");
                    return true;
                }
            }
        }
        drop(topo);
        for (pop, captured) in &self.cur_batch.bgp_peers {
            let mac = {
                let topo = self.shared.read_topology().await;
                topo.get_node(pop).map(|n| n.mac_addr.clone())
            };
            let Some(mac) = mac else { continue };
            let current = self
                .shared
                .status_for(&mac)
                .await
                .and_then(|e| e.report.bgp_status)
                .map(|m| m.values().filter(|b| b.online).count())
                .unwrap_or(0);
            if current < *captured {
                warn!(pop, captured, current, "POP node lost BGP peers during commit");
                return true;
            }
        }
        false
    }

    /// Pop the next batch (or convert the next request into batches).
    async fn populate_next_batch(&mut self, ctx: &AppContext) {
        if self.pending_batches.is_empty() {
            self.cur_req = None;
            self.populate_next_req(ctx).await;
            if self.pending_batches.is_empty() {
                return;
            }
        }
        let Some(mut batch) = self.pending_batches.pop_front() else {
            return;
        };
        let Some(req) = self.cur_req.clone() else {
            return;
        };

        // Idempotence: drop nodes already in the target state.
        let nodes: Vec<String> = batch.nodes.iter().cloned().collect();
        for node in nodes {
            let Some((_, version, status)) = self.node_report(&node).await else {
                continue;
            };
            let already_done = match req.ur_type {
                UpgradeReqType::PrepareUpgrade => {
                    (status.us_type == UpgradeStatusType::Flashed && status.next_image.md5 == req.md5)
                        || (!req.version.is_empty()
                            && version.as_deref() == Some(req.version.as_str()))
                }
                UpgradeReqType::CommitUpgrade => {
                    !req.version.is_empty() && version.as_deref() == Some(req.version.as_str())
                }
                _ => false,
            };
            if already_done {
                debug!(node = %node, "already in target state, dropping from batch");
                batch.nodes.remove(&node);
            }
        }
        if !batch.pending() {
            self.cur_batch = Batch::default();
            return;
        }

        // Snapshot liveness for the commit precondition.
        if req.ur_type == UpgradeReqType::CommitUpgrade {
            let topo = self.shared.read_topology().await;
            batch.tracked_links = topo
                .all_links()
                .filter(|l| l.is_wireless() && l.is_alive)
                .map(|l| l.name.clone())
                .filter(|name| !req.skip_links.contains(name))
                .collect();
            let pops: Vec<(String, String)> = topo
                .pop_nodes()
                .map(|n| (n.name.clone(), n.mac_addr.clone()))
                .collect();
            drop(topo);
            for (name, mac) in pops {
                let peers = self
                    .shared
                    .status_for(&mac)
                    .await
                    .and_then(|e| e.report.bgp_status)
                    .map(|m| m.values().filter(|b| b.online).count())
                    .unwrap_or(0);
                batch.bgp_peers.insert(name, peers);
            }
        }

        batch.init_time = Some(Instant::now());
        info!(
            req_id = %req.upgrade_req_id,
            ur_type = ?req.ur_type,
            nodes = batch.nodes.len(),
            "initiating upgrade batch"
        );
        ctx.events.log_event(
            EventCategory::Upgrade,
            if req.ur_type == UpgradeReqType::CommitUpgrade {
                EventId::UpgradeCommit
            } else {
                EventId::UpgradePrepare
            },
            EventLevel::Info,
            format!(
                "initiating {:?} for {} node(s)",
                req.ur_type,
                batch.nodes.len()
            ),
        );

        let nodes: Vec<String> = batch.nodes.iter().cloned().collect();
        self.cur_batch = batch;
        for node in nodes {
            self.dispatch_to_node(ctx, &node, &req).await;
        }
    }

    async fn dispatch_to_node(&self, ctx: &AppContext, node: &str, req: &UpgradeGroupReq) {
        let Some((minion, _, _)) = self.node_report(node).await else {
            return;
        };
        let image_url = self
            .images
            .values()
            .find(|i| i.image.name == req.image_name || i.image.md5 == req.md5)
            .map(|i| i.image.http_uri.clone())
            .unwrap_or_default();
        ctx.bus
            .send(
                minion,
                appid::MINION_UPGRADE,
                appid::CTRL_UPGRADE,
                Message::UpgradeReq(UpgradeReq {
                    ur_type: req.ur_type,
                    upgrade_req_id: req.upgrade_req_id.clone(),
                    md5: req.md5.clone(),
                    image_url,
                    schedule_to_commit: req.schedule_to_commit.unwrap_or(0),
                    download_timeout_s: req.timeout_s,
                }),
            )
            .await;
    }

    /// Convert the next queued request into batches.
    async fn populate_next_req(&mut self, _ctx: &AppContext) {
        let Some(req) = self.pending_reqs.pop_front() else {
            return;
        };
        let nodes = self.resolve_nodes(&req).await;
        if nodes.is_empty() {
            info!(req_id = %req.upgrade_req_id, "request resolves to no nodes, dropping");
            return;
        }
        let limit = if req.limit == 0 { nodes.len() } else { req.limit };
        for chunk in nodes.chunks(limit.max(1)) {
            self.pending_batches.push_back(Batch {
                nodes: chunk.iter().cloned().collect(),
                init_time: None,
                tracked_links: HashSet::new(),
                bgp_peers: HashMap::new(),
            });
        }
        self.retries.clear();
        self.cur_req = Some(req);
    }

    // ---- Golden image ----

    async fn golden_image_sweep(&mut self, ctx: &AppContext) {
        if !self.golden.enabled || self.golden.version.is_empty() {
            return;
        }
        if self.golden_upgrade_id.is_some() || self.cur_req.is_some() {
            return; // one reconciliation at a time
        }
        let drifted: Vec<String> = {
            let topo = self.shared.read_topology().await;
            topo.all_nodes()
                .filter(|n| n.status.is_online())
                .filter(|n| !self.golden.node_blacklist.contains(&n.name))
                .filter(|n| {
                    n.software_version
                        .as_deref()
                        .map(|v| v != self.golden.version)
                        .unwrap_or(false)
                })
                .map(|n| n.name.clone())
                .collect()
        };
        if drifted.is_empty() {
            return;
        }
        let Some((image_name, image_md5)) = self
            .images
            .values()
            .find(|i| i.image.name == self.golden.image_name)
            .map(|i| (i.image.name.clone(), i.image.md5.clone()))
        else {
            warn!(image = %self.golden.image_name, "golden image is not staged");
            return;
        };
        let req_id = format!("golden-{}", rand::random::<u32>());
        info!(
            req_id = %req_id,
            nodes = drifted.len(),
            "golden image sweep: reconciling drifted nodes"
        );
        let req = UpgradeGroupReq {
            ur_type: UpgradeReqType::FullUpgrade,
            upgrade_req_id: req_id.clone(),
            nodes: drifted,
            exclude_nodes: vec![],
            image_name,
            md5: image_md5,
            version: self.golden.version.clone(),
            timeout_s: 600,
            skip_failure: true,
            skip_links: vec![],
            limit: 0,
            retry_limit: 1,
            schedule_to_commit: Some(0),
        };
        self.golden_upgrade_id = Some(format!("{}-commit", req_id));
        let _ = self.enqueue_request(ctx, req).await;
    }

    // ---- Image store ----

    async fn process_add_image(&mut self, ctx: &AppContext, inbound: &Inbound, image_url: &str) {
        // Stage in a worker; completion posts back to this app's inbox.
        let image_dir = self.cfg.image_dir.clone();
        let http_base = self.cfg.image_http_base.clone();
        let url = image_url.to_string();
        let bus = ctx.bus.clone();
        tokio::spawn(async move {
            let result = stage_image(&url, &image_dir, &http_base).await;
            let message = match result {
                Ok(image) => Message::UpgradeImageStagedNotif {
                    success: true,
                    image,
                    reason: String::new(),
                },
                Err(e) => Message::UpgradeImageStagedNotif {
                    success: false,
                    image: UpgradeImage::default(),
                    reason: e.to_string(),
                },
            };
            bus.send("", appid::CTRL_UPGRADE, appid::CTRL_UPGRADE, message)
                .await;
        });
        ctx.reply(
            appid::CTRL_UPGRADE,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(E2eAck::ok("image staging started")),
        )
        .await;
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match &inbound.message {
            Message::UpgradeGroupReq(_) => self.process_upgrade_group_req(ctx, &inbound).await,
            Message::UpgradeStateReq => {
                let dump = UpgradeStateDump {
                    cur_batch: self.cur_batch.nodes.iter().cloned().collect(),
                    pending_batches: self
                        .pending_batches
                        .iter()
                        .map(|b| b.nodes.iter().cloned().collect())
                        .collect(),
                    cur_req: self.cur_req.clone(),
                    pending_reqs: self.pending_reqs.iter().cloned().collect(),
                };
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::UpgradeStateDump(dump),
                )
                .await;
            }
            Message::UpgradeAbortReq(req) => {
                let req = req.clone();
                let ack = if req.abort_all {
                    self.abort_cur_req(ctx, &format!("abort requested: {}", req.reason))
                        .await;
                    self.pending_reqs.clear();
                    E2eAck::ok("all upgrade requests aborted")
                } else {
                    let cur_id = self
                        .cur_req
                        .as_ref()
                        .map(|r| r.upgrade_req_id.clone())
                        .unwrap_or_default();
                    if req.req_ids.contains(&cur_id) {
                        self.abort_cur_req(ctx, &format!("abort requested: {}", req.reason))
                            .await;
                    }
                    self.pending_reqs
                        .retain(|r| !req.req_ids.contains(&r.upgrade_req_id));
                    E2eAck::ok("matching upgrade requests aborted")
                };
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(ack),
                )
                .await;
            }
            Message::UpgradeAddImageReq(req) => {
                let url = req.image_url.clone();
                self.process_add_image(ctx, &inbound, &url).await;
            }
            Message::UpgradeImageStagedNotif {
                success,
                image,
                reason,
            } => {
                if *success {
                    info!(image = %image.name, md5 = %image.md5, "image staged");
                    ctx.events.log_event(
                        EventCategory::Upgrade,
                        EventId::UpgradeImageAdded,
                        EventLevel::Info,
                        image.name.clone(),
                    );
                    self.images.insert(
                        image.name.clone(),
                        StagedImage {
                            path: self.cfg.image_dir.join(&image.name),
                            image: image.clone(),
                        },
                    );
                } else {
                    warn!("image staging failed: {}", reason);
                    ctx.events.log_event(
                        EventCategory::Upgrade,
                        EventId::UpgradeImageAdded,
                        EventLevel::Error,
                        format!("image staging failed: {}", reason),
                    );
                }
            }
            Message::UpgradeDelImageReq(req) => {
                let ack = match self.images.remove(&req.name) {
                    Some(staged) => {
                        let _ = std::fs::remove_file(&staged.path);
                        ctx.events.log_event(
                            EventCategory::Upgrade,
                            EventId::UpgradeImageRemoved,
                            EventLevel::Info,
                            req.name.clone(),
                        );
                        E2eAck::ok("image removed")
                    }
                    None => E2eAck::fail(format!("no such image: {}", req.name)),
                };
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(ack),
                )
                .await;
            }
            Message::UpgradeListImagesReq => {
                let images = self.images.values().map(|i| i.image.clone()).collect();
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::UpgradeListImagesResp(UpgradeListImagesResp { images }),
                )
                .await;
            }
            Message::SetGoldenImage(golden) => {
                self.golden = golden.clone();
                self.persist_golden();
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(E2eAck::ok("golden image set")),
                )
                .await;
            }
            Message::GetGoldenImage => {
                ctx.reply(
                    appid::CTRL_UPGRADE,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::GoldenImageResp(self.golden.clone()),
                )
                .await;
            }
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

/// Fetch (or copy) an image into the store and verify its trailer.
async fn stage_image(url: &str, image_dir: &PathBuf, http_base: &str) -> Result<UpgradeImage> {
    std::fs::create_dir_all(image_dir)
        .with_context(|| format!("creating {}", image_dir.display()))?;

    let (bytes, name) = if let Some(path) = url.strip_prefix("file://") {
        let path = PathBuf::from(path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.bin")
            .to_string();
        (
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
            name,
        )
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let parsed = url::Url::parse(url).context("parsing image url")?;
        let name = parsed
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or("image.bin")
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building http client")?;
        let resp = client.get(url).send().await.context("fetching image")?;
        if !resp.status().is_success() {
            anyhow::bail!("image fetch failed: {}", resp.status());
        }
        (resp.bytes().await.context("reading image body")?.to_vec(), name)
    } else {
        anyhow::bail!("unsupported image url scheme: {}", url);
    };

    let meta = crate::upgrade::verify_image(&bytes)?;
    let dest = image_dir.join(&name);
    let tmp = image_dir.join(format!("{}.tmp", name));
    std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &dest).context("renaming staged image")?;

    Ok(UpgradeImage {
        name,
        md5: meta.md5,
        http_uri: format!("{}/{}", http_base, dest.file_name().and_then(|n| n.to_str()).unwrap_or("image.bin")),
        hardware_board_ids: meta.hardware_board_ids,
    })
}

#[async_trait]
impl App for UpgradeApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_UPGRADE
    }

    async fn init(&mut self) -> Result<()> {
        self.load_persisted_state();
        Ok(())
    }

    // run() below; the FSM internals are unit tested at the bottom of this
    // file and exercised end-to-end in tests/upgrade_integration.rs.

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut sync_timer = tokio::time::interval(self.cfg.sync_interval);
        let mut golden_timer = tokio::time::interval(self.cfg.golden_check_interval);
        sync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        golden_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = sync_timer.tick() => self.sync_with_status_reports(&ctx).await,
                _ = golden_timer.tick() => self.golden_image_sweep(&ctx).await,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.process_message(&ctx, inbound).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BgpInfo, StatusReport};
    use crate::shared::StatusEntry;
    use crate::topology::{LinkType, NodeStatus, NodeType, Polarity};

    fn topology(n_nodes: u8) -> crate::topology::TopologyWrapper {
        let mut topo = crate::topology::TopologyWrapper::default();
        topo.add_site(crate::topology::Site {
            name: "s0".into(),
            location: None,
        })
        .unwrap();
        for i in 0..n_nodes {
            topo.add_node(crate::topology::Node {
                name: format!("node-{}", i),
                node_type: NodeType::Dn,
                wlan_mac_addrs: vec![format!("aa:bb:cc:00:00:{:02x}", i)],
                mac_addr: format!("aa:bb:cc:00:00:{:02x}", i),
                pop_node: i == 0,
                status: NodeStatus::Online,
                site_name: "s0".into(),
                polarity: Some(Polarity::Odd),
                golay_idx: None,
                channel: None,
                software_version: Some("RELEASE_M80".into()),
                location: None,
            })
            .unwrap();
        }
        for i in 1..n_nodes {
            topo.add_link(crate::topology::Link {
                name: String::new(),
                a_node_name: "node-0".into(),
                z_node_name: format!("node-{}", i),
                a_node_mac: "aa:bb:cc:00:00:00".into(),
                z_node_mac: format!("aa:bb:cc:00:00:{:02x}", i),
                link_type: LinkType::Wireless,
                is_alive: true,
                linkup_attempts: 0,
                is_backup_cn_link: false,
            })
            .unwrap();
        }
        topo
    }

    fn app_with_nodes(n_nodes: u8, tmp: &tempfile::TempDir) -> UpgradeApp {
        let shared = crate::shared::SharedState::new(
            topology(n_nodes),
            crate::nodecfg::ConfigHelper::load(crate::nodecfg::ConfigPaths::default()).unwrap(),
        );
        UpgradeApp::new(
            shared,
            UpgradeAppConfig {
                sync_interval: Duration::from_secs(1),
                golden_check_interval: Duration::from_secs(60),
                image_dir: tmp.path().join("images"),
                image_http_base: "http://127.0.0.1:17080/images".into(),
                controller_config_file: tmp.path().join("controller_config.json"),
            },
        )
    }

    fn ctx_pair() -> (
        crate::apps::AppContext,
        tokio::sync::mpsc::Receiver<crate::bus::Outbound>,
    ) {
        let (bus, rx) = crate::bus::outbound_channel();
        let (_tx, inbox) = tokio::sync::mpsc::channel(64);
        (
            crate::apps::AppContext {
                bus,
                inbox,
                events: crate::events::EventClient::new(
                    appid::CTRL_UPGRADE,
                    crate::events::create_event_bus(),
                ),
                shutdown: tokio_util::sync::CancellationToken::new(),
            },
            rx,
        )
    }

    async fn set_status(
        app: &UpgradeApp,
        mac: &str,
        version: &str,
        us: crate::messages::UpgradeStatus,
        bgp_peers: usize,
    ) {
        let bgp = (bgp_peers > 0).then(|| {
            (0..bgp_peers)
                .map(|i| {
                    (
                        format!("peer-{}", i),
                        BgpInfo {
                            online: true,
                            asn: 65000,
                            advertised_routes: 1,
                            received_routes: 1,
                        },
                    )
                })
                .collect()
        });
        app.shared.write_status().await.insert(
            mac.to_string(),
            StatusEntry {
                report: StatusReport {
                    version: Some(version.to_string()),
                    upgrade_status: us,
                    bgp_status: bgp,
                    ..Default::default()
                },
                received_at: Instant::now(),
                received_wall_ms: 0,
            },
        );
    }

    fn prepare_req(nodes: Vec<String>, limit: usize, skip_failure: bool) -> UpgradeGroupReq {
        UpgradeGroupReq {
            ur_type: UpgradeReqType::PrepareUpgrade,
            upgrade_req_id: "req-1".into(),
            nodes,
            exclude_nodes: vec![],
            image_name: "img".into(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
            version: "RELEASE_M81".into(),
            timeout_s: 60,
            skip_failure,
            skip_links: vec![],
            limit,
            retry_limit: 0,
            schedule_to_commit: None,
        }
    }

    fn stage_fake_image(app: &mut UpgradeApp) {
        app.images.insert(
            "img".into(),
            StagedImage {
                image: UpgradeImage {
                    name: "img".into(),
                    md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
                    http_uri: "http://127.0.0.1:17080/images/img".into(),
                    hardware_board_ids: vec![],
                },
                path: std::path::PathBuf::from("/nonexistent/img"),
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_splits_into_batches() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(5, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let ack = app.enqueue_request(&ctx, prepare_req(vec![], 2, true)).await;
        assert!(ack.success);
        app.populate_next_req(&ctx).await;
        // Five nodes with a limit of two: three batches.
        assert_eq!(app.pending_batches.len(), 3);
        assert_eq!(app.pending_batches[0].nodes.len(), 2);
        assert_eq!(app.pending_batches[2].nodes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstaged_image_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(1, &tmp);
        let (ctx, _rx) = ctx_pair();
        let ack = app.enqueue_request(&ctx, prepare_req(vec![], 0, false)).await;
        assert!(!ack.success);
        assert!(ack.message.contains("not staged"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_initiation_dispatches_to_each_node() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(3, &tmp);
        stage_fake_image(&mut app);
        let (ctx, mut rx) = ctx_pair();

        let _ = app.enqueue_request(&ctx, prepare_req(vec![], 0, false)).await;
        app.sync_with_status_reports(&ctx).await;
        assert_eq!(app.cur_batch.nodes.len(), 3);

        let mut dispatched = 0;
        while let Ok(out) = rx.try_recv() {
            if matches!(out.message, Message::UpgradeReq(_)) {
                assert_eq!(out.dest_app, appid::MINION_UPGRADE);
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_failure_without_skip_aborts_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(4, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let _ = app
            .enqueue_request(&ctx, prepare_req(vec![], 2, false))
            .await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_batch.pending());
        assert_eq!(app.pending_batches.len(), 1);

        // One node reports a download failure for this request.
        let failed = app.cur_batch.nodes.iter().next().unwrap().clone();
        let mac = format!(
            "aa:bb:cc:00:00:{:02x}",
            failed.trim_start_matches("node-").parse::<u8>().unwrap()
        );
        set_status(
            &app,
            &mac,
            "RELEASE_M80",
            crate::messages::UpgradeStatus {
                us_type: UpgradeStatusType::DownloadFailed,
                next_image: Default::default(),
                reason: "no route".into(),
                upgrade_req_id: "req-1".into(),
                when_to_commit: 0,
            },
            0,
        )
        .await;

        app.sync_with_status_reports(&ctx).await;
        // Everything cleared: batch, pending batches, current request.
        assert!(app.cur_req.is_none());
        assert!(!app.cur_batch.pending());
        assert!(app.pending_batches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_failure_with_skip_drops_node_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(3, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let _ = app.enqueue_request(&ctx, prepare_req(vec![], 0, true)).await;
        app.sync_with_status_reports(&ctx).await;
        assert_eq!(app.cur_batch.nodes.len(), 3);

        set_status(
            &app,
            "aa:bb:cc:00:00:01",
            "RELEASE_M80",
            crate::messages::UpgradeStatus {
                us_type: UpgradeStatusType::DownloadFailed,
                next_image: Default::default(),
                reason: "no route".into(),
                upgrade_req_id: "req-1".into(),
                when_to_commit: 0,
            },
            0,
        )
        .await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_some());
        assert_eq!(app.cur_batch.nodes.len(), 2);
        assert!(!app.cur_batch.nodes.contains("node-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_without_skip_aborts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(2, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let _ = app.enqueue_request(&ctx, prepare_req(vec![], 0, false)).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_batch.pending());

        tokio::time::advance(Duration::from_secs(61)).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_none());
        assert!(!app.cur_batch.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_success_drains_batch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(1, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let _ = app.enqueue_request(&ctx, prepare_req(vec![], 0, false)).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_batch.pending());

        set_status(
            &app,
            "aa:bb:cc:00:00:00",
            "RELEASE_M80",
            crate::messages::UpgradeStatus {
                us_type: UpgradeStatusType::Flashed,
                next_image: crate::messages::ImageMeta {
                    md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
                    version: "RELEASE_M81".into(),
                    model: String::new(),
                    hardware_board_ids: vec![],
                },
                reason: String::new(),
                upgrade_req_id: "req-1".into(),
                when_to_commit: 0,
            },
            0,
        )
        .await;
        app.sync_with_status_reports(&ctx).await;
        assert!(!app.cur_batch.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_precondition_link_down_aborts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(3, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let mut req = prepare_req(vec![], 0, false);
        req.ur_type = UpgradeReqType::CommitUpgrade;
        let _ = app.enqueue_request(&ctx, req).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_batch.pending());
        assert!(!app.cur_batch.tracked_links.is_empty());

        // A tracked wireless link drops after batch initiation.
        app.shared
            .write_topology()
            .await
            .set_link_status("link-node-0-node-1", false)
            .unwrap();
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_none(), "commit must abort on link loss");
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_precondition_bgp_loss_aborts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(2, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        // POP node starts with two BGP peers.
        set_status(
            &app,
            "aa:bb:cc:00:00:00",
            "RELEASE_M80",
            Default::default(),
            2,
        )
        .await;

        let mut req = prepare_req(vec![], 0, false);
        req.ur_type = UpgradeReqType::CommitUpgrade;
        let _ = app.enqueue_request(&ctx, req).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_batch.pending());
        assert_eq!(app.cur_batch.bgp_peers.get("node-0"), Some(&2));

        // The POP loses a peer.
        set_status(
            &app,
            "aa:bb:cc:00:00:00",
            "RELEASE_M80",
            Default::default(),
            1,
        )
        .await;
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_none(), "commit must abort on BGP peer loss");
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_links_excluded_from_tracking() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(3, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let mut req = prepare_req(vec![], 0, false);
        req.ur_type = UpgradeReqType::CommitUpgrade;
        req.skip_links = vec!["link-node-0-node-1".into()];
        let _ = app.enqueue_request(&ctx, req).await;
        app.sync_with_status_reports(&ctx).await;
        assert!(!app.cur_batch.tracked_links.contains("link-node-0-node-1"));
        assert!(app.cur_batch.tracked_links.contains("link-node-0-node-2"));

        // The skipped link going down does not abort the request.
        app.shared
            .write_topology()
            .await
            .set_link_status("link-node-0-node-1", false)
            .unwrap();
        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_clears_full_upgrade_pair() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(2, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        let mut req = prepare_req(vec![], 0, false);
        req.ur_type = UpgradeReqType::FullUpgrade;
        req.schedule_to_commit = Some(0);
        let ack = app.enqueue_request(&ctx, req).await;
        assert!(ack.success);
        assert_eq!(app.pending_reqs.len(), 2);

        app.sync_with_status_reports(&ctx).await;
        assert!(app.cur_req.is_some());
        app.abort_cur_req(&ctx, "test abort").await;
        // The paired commit request is dropped with the prepare.
        assert!(app.pending_reqs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_golden_sweep_enqueues_full_upgrade_for_drifted_nodes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut app = app_with_nodes(2, &tmp);
        stage_fake_image(&mut app);
        let (ctx, _rx) = ctx_pair();

        {
            let mut topo = app.shared.write_topology().await;
            topo.set_node_software_version("node-1", "RELEASE_M79".into())
                .unwrap();
        }
        app.golden = GoldenImage {
            enabled: true,
            version: "RELEASE_M80".into(),
            image_name: "img".into(),
            node_blacklist: vec![],
        };
        app.golden_image_sweep(&ctx).await;
        assert_eq!(app.pending_reqs.len(), 2); // prepare + commit
        assert_eq!(app.pending_reqs[0].nodes, vec!["node-1".to_string()]);
        assert!(app.golden_upgrade_id.is_some());

        // A second sweep while one is pending is a no-op.
        app.golden_image_sweep(&ctx).await;
        assert_eq!(app.pending_reqs.len(), 2);
    }
}
