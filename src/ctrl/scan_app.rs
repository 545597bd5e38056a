//! ScanApp: multi-node scan orchestration (bus contract only).
//!
//! Assigns monotonically increasing scan ids, obtains a future BWGD index
//! from SchedulerApp, fans a `ScanReq` out to every participating radio,
//! and collects responses keyed by `(radioMac, token)` until each radio
//! sends its completion marker or the per-scan timer fires. Partial
//! topology-scan frames are merged into one responder record per MAC.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{
    appid, E2eAck, GetSlotReq, Message, ScanData, ScanReq, ScanResp, ScanStatus, ScanType,
    StartScanReq,
};
use crate::shared::SharedState;

/// Per-scan response collection deadline.
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// BWGD slot length requested per scan.
const SCAN_SLOT_BWGD: u64 = 64;

struct PendingSlot {
    scan_id: u64,
    scan_type: ScanType,
    /// Radio MAC -> owning minion id.
    radios: BTreeMap<String, String>,
    tx_radio: Option<String>,
}

struct ActiveScan {
    data: ScanData,
    /// Radios that have not yet sent their completion marker.
    outstanding: BTreeMap<String, u32>,
    deadline: Instant,
}

pub struct ScanApp {
    shared: SharedState,
    next_scan_id: u64,
    next_token: u32,
    next_slot_req_id: u64,
    /// Scans waiting on a BWGD grant, keyed by slot request id.
    awaiting_slot: BTreeMap<u64, PendingSlot>,
    active: BTreeMap<u64, ActiveScan>,
    /// Completed scan results, kept for status queries.
    finished: BTreeMap<u64, ScanData>,
}

impl ScanApp {
    pub fn new(shared: SharedState) -> Self {
        Self {
            shared,
            next_scan_id: 0,
            next_token: 0,
            next_slot_req_id: 0,
            awaiting_slot: BTreeMap::new(),
            active: BTreeMap::new(),
            finished: BTreeMap::new(),
        }
    }

    /// Radios participating in a scan, mapped to their minion ids.
    async fn participants(
        &self,
        scan_type: ScanType,
        tx_node: Option<&str>,
    ) -> (BTreeMap<String, String>, Option<String>) {
        let topo = self.shared.read_topology().await;
        let mut radios = BTreeMap::new();
        let mut tx_radio = None;
        match scan_type {
            ScanType::Topo | ScanType::Im => {
                for node in topo.all_nodes().filter(|n| n.status.is_online()) {
                    for mac in &node.wlan_mac_addrs {
                        radios.insert(mac.clone(), node.mac_addr.clone());
                    }
                }
            }
            ScanType::Pbf | ScanType::Rtcal | ScanType::Cbf => {
                let Some(tx_node) = tx_node else {
                    return (radios, None);
                };
                let Some(node) = topo.get_node(tx_node) else {
                    return (radios, None);
                };
                if let Some(mac) = node.wlan_mac_addrs.first() {
                    tx_radio = Some(mac.clone());
                    radios.insert(mac.clone(), node.mac_addr.clone());
                }
                // Peers across alive wireless links participate as rx.
                for link in topo.wireless_links_for_node(tx_node) {
                    let peer_mac = if link.a_node_name == tx_node {
                        &link.z_node_mac
                    } else {
                        &link.a_node_mac
                    };
                    if let Some(peer) = link
                        .other_end(tx_node)
                        .and_then(|name| topo.get_node(name))
                    {
                        if !peer_mac.is_empty() {
                            radios.insert(peer_mac.clone(), peer.mac_addr.clone());
                        }
                    }
                }
            }
        }
        (radios, tx_radio)
    }

    async fn process_start_scan(&mut self, ctx: &AppContext, inbound: &Inbound, req: &StartScanReq) {
        let (radios, tx_radio) = self.participants(req.scan_type, req.tx_node.as_deref()).await;
        if radios.is_empty() {
            ctx.reply(
                appid::CTRL_SCAN,
                &inbound.sender_node,
                &inbound.sender_app,
                Message::E2eAck(E2eAck::fail("no participating radios")),
            )
            .await;
            return;
        }

        self.next_scan_id += 1;
        self.next_slot_req_id += 1;
        let scan_id = self.next_scan_id;
        self.awaiting_slot.insert(
            self.next_slot_req_id,
            PendingSlot {
                scan_id,
                scan_type: req.scan_type,
                radios,
                tx_radio,
            },
        );
        ctx.bus
            .send(
                "",
                appid::CTRL_SCHEDULER,
                appid::CTRL_SCAN,
                Message::GetSlotReq(GetSlotReq {
                    scan_type: req.scan_type,
                    duration_bwgd: SCAN_SLOT_BWGD,
                    id: self.next_slot_req_id,
                }),
            )
            .await;
        ctx.reply(
            appid::CTRL_SCAN,
            &inbound.sender_node,
            &inbound.sender_app,
            Message::E2eAck(E2eAck::ok(format!("scan {} scheduled", scan_id))),
        )
        .await;
    }

    async fn process_slot_resp(&mut self, ctx: &AppContext, id: u64, bwgd_idx: u64) {
        let Some(pending) = self.awaiting_slot.remove(&id) else {
            debug!(slot_req = id, "slot grant without a pending scan, dropping");
            return;
        };
        let mut outstanding = BTreeMap::new();
        for (radio, minion) in &pending.radios {
            self.next_token += 1;
            let token = self.next_token;
            outstanding.insert(radio.clone(), token);
            ctx.bus
                .send(
                    minion.clone(),
                    appid::MINION_STATUS,
                    appid::CTRL_SCAN,
                    Message::ScanReq(ScanReq {
                        scan_id: pending.scan_id,
                        token,
                        scan_type: pending.scan_type,
                        start_bwgd_idx: bwgd_idx,
                        radio_mac: radio.clone(),
                        is_tx: pending.tx_radio.as_deref() == Some(radio.as_str()),
                        peer_mac: None,
                    }),
                )
                .await;
        }
        info!(
            scan_id = pending.scan_id,
            bwgd_idx,
            radios = outstanding.len(),
            "scan dispatched"
        );
        self.active.insert(
            pending.scan_id,
            ActiveScan {
                data: ScanData {
                    scan_type: Some(pending.scan_type),
                    start_bwgd_idx: bwgd_idx,
                    complete: false,
                    responses: BTreeMap::new(),
                    topo_responders: BTreeMap::new(),
                },
                outstanding,
                deadline: Instant::now() + SCAN_TIMEOUT,
            },
        );
    }

    fn process_scan_resp(&mut self, ctx: &AppContext, resp: &ScanResp) {
        let Some(scan) = self.active.get_mut(&resp.scan_id) else {
            debug!(scan_id = resp.scan_id, "late scan response dropped");
            return;
        };
        match scan.outstanding.get(&resp.radio_mac) {
            Some(token) if *token == resp.token => {}
            _ => {
                debug!(
                    scan_id = resp.scan_id,
                    radio = %resp.radio_mac,
                    "scan response with stale token dropped"
                );
                return;
            }
        }

        // Merge partial topology frames per responder.
        if let Some(topo_info) = &resp.topo_info {
            let entry = scan
                .data
                .topo_responders
                .entry(topo_info.responder_mac.clone())
                .or_default();
            entry.responder_mac = topo_info.responder_mac.clone();
            if topo_info.pos.is_some() {
                entry.pos = topo_info.pos;
            }
            for (adj, rssi) in &topo_info.adjs {
                entry.adjs.insert(adj.clone(), *rssi);
            }
        }
        scan.data
            .responses
            .insert(resp.radio_mac.clone(), resp.clone());

        if resp.complete {
            scan.outstanding.remove(&resp.radio_mac);
            if scan.outstanding.is_empty() {
                scan.data.complete = true;
                info!(scan_id = resp.scan_id, "scan complete");
                ctx.events.log_event(
                    EventCategory::Scan,
                    EventId::ScanComplete,
                    EventLevel::Info,
                    format!("scan {} complete", resp.scan_id),
                );
            }
        }

        if scan.data.complete {
            if let Some(scan) = self.active.remove(&resp.scan_id) {
                self.finished.insert(resp.scan_id, scan.data);
            }
        }
    }

    /// Expire scans whose collection window closed.
    fn expire_scans(&mut self, ctx: &AppContext) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .active
            .iter()
            .filter(|(_, s)| now >= s.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut scan) = self.active.remove(&id) {
                warn!(
                    scan_id = id,
                    missing = scan.outstanding.len(),
                    "scan timed out with outstanding radios"
                );
                scan.data.complete = true;
                self.finished.insert(id, scan.data);
                ctx.events.log_event(
                    EventCategory::Scan,
                    EventId::ScanComplete,
                    EventLevel::Warning,
                    format!("scan {} timed out", id),
                );
            }
        }
    }

    fn scan_status(&self, scan_id: Option<u64>) -> ScanStatus {
        let mut scans = BTreeMap::new();
        for (id, scan) in &self.active {
            if scan_id.is_none() || scan_id == Some(*id) {
                scans.insert(*id, scan.data.clone());
            }
        }
        for (id, data) in &self.finished {
            if scan_id.is_none() || scan_id == Some(*id) {
                scans.insert(*id, data.clone());
            }
        }
        ScanStatus { scans }
    }
}

#[async_trait]
impl App for ScanApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_SCAN
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut expiry_timer = tokio::time::interval(Duration::from_secs(1));
        expiry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = expiry_timer.tick() => self.expire_scans(&ctx),
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::StartScanReq(req) => {
                            let req = req.clone();
                            self.process_start_scan(&ctx, &inbound, &req).await;
                        }
                        Message::GetSlotResp(resp) => {
                            self.process_slot_resp(&ctx, resp.id, resp.bwgd_idx).await;
                        }
                        Message::ScanResp(resp) => self.process_scan_resp(&ctx, resp),
                        Message::GetScanStatusReq(req) => {
                            let status = self.scan_status(req.scan_id);
                            ctx.reply(
                                appid::CTRL_SCAN,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::ScanStatus(status),
                            )
                            .await;
                        }
                        other => {
                            debug!(kind = other.kind(), "unexpected message");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TopoResponderInfo;

    fn scan_app() -> ScanApp {
        ScanApp::new(crate::shared::SharedState::new(
            crate::topology::TopologyWrapper::default(),
            crate::nodecfg::ConfigHelper::load(crate::nodecfg::ConfigPaths::default()).unwrap(),
        ))
    }

    fn ctx_pair() -> (crate::apps::AppContext, tokio::sync::mpsc::Receiver<crate::bus::Outbound>) {
        let (bus, rx) = crate::bus::outbound_channel();
        let (_tx, inbox) = tokio::sync::mpsc::channel(8);
        (
            crate::apps::AppContext {
                bus,
                inbox,
                events: crate::events::EventClient::new(
                    appid::CTRL_SCAN,
                    crate::events::create_event_bus(),
                ),
                shutdown: tokio_util::sync::CancellationToken::new(),
            },
            rx,
        )
    }

    fn resp(scan_id: u64, radio: &str, token: u32, complete: bool) -> ScanResp {
        ScanResp {
            scan_id,
            token,
            radio_mac: radio.into(),
            success: true,
            complete,
            topo_info: Some(TopoResponderInfo {
                responder_mac: "aa:bb:cc:00:00:99".into(),
                pos: None,
                adjs: BTreeMap::from([(radio.to_string(), -42)]),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_frames_merge_per_responder() {
        let mut app = scan_app();
        let (ctx, _rx) = ctx_pair();
        app.active.insert(
            7,
            ActiveScan {
                data: ScanData::default(),
                outstanding: BTreeMap::from([
                    ("r1".to_string(), 1),
                    ("r2".to_string(), 2),
                ]),
                deadline: Instant::now() + SCAN_TIMEOUT,
            },
        );

        app.process_scan_resp(&ctx, &resp(7, "r1", 1, true));
        assert!(app.active.contains_key(&7));
        app.process_scan_resp(&ctx, &resp(7, "r2", 2, true));
        // All markers in: the scan finishes and merges both adjacencies.
        let data = app.finished.get(&7).unwrap();
        assert!(data.complete);
        let merged = data.topo_responders.get("aa:bb:cc:00:00:99").unwrap();
        assert_eq!(merged.adjs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_dropped() {
        let mut app = scan_app();
        let (ctx, _rx) = ctx_pair();
        app.active.insert(
            3,
            ActiveScan {
                data: ScanData::default(),
                outstanding: BTreeMap::from([("r1".to_string(), 5)]),
                deadline: Instant::now() + SCAN_TIMEOUT,
            },
        );
        app.process_scan_resp(&ctx, &resp(3, "r1", 99, true));
        assert!(app.active.get(&3).unwrap().data.responses.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_expiry_marks_partial_complete() {
        let mut app = scan_app();
        let (ctx, _rx) = ctx_pair();
        app.active.insert(
            9,
            ActiveScan {
                data: ScanData::default(),
                outstanding: BTreeMap::from([("r1".to_string(), 1)]),
                deadline: Instant::now(),
            },
        );
        tokio::time::advance(Duration::from_millis(1)).await;
        app.expire_scans(&ctx);
        assert!(app.active.is_empty());
        assert!(app.finished.get(&9).unwrap().complete);
    }
}
