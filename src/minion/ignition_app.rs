//! Minion IgnitionApp: drives the driver's link association interface.
//!
//! Translates controller `SetLinkStatus` commands into driver requests and
//! reports driver-confirmed link transitions back upstream. The firmware
//! enforces its own beamforming timeout; this app only tracks outstanding
//! attempts so late driver responses can be correlated (and stale ones
//! dropped).

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::messages::{
    appid, DriverSetLinkStatus, FwReqType, LinkStatus, LinkStatusType, Message, SetLinkStatus,
};
use crate::minion::broker::CTRL_NODE_ID;
use crate::minion::state::{MinionState, PeerEntry};

pub struct IgnitionApp {
    state: MinionState,
    /// How long to wait for an association response before forgetting it.
    linkup_resp_wait_timeout: Duration,
    /// Responder MAC -> (initiating radio, deadline).
    outstanding: HashMap<String, (String, Instant)>,
}

impl IgnitionApp {
    pub fn new(state: MinionState, linkup_resp_wait_timeout: Duration) -> Self {
        Self {
            state,
            linkup_resp_wait_timeout,
            outstanding: HashMap::new(),
        }
    }

    async fn process_set_link_status(&mut self, ctx: &AppContext, req: &SetLinkStatus) {
        let is_assoc = req.link_status_type == LinkStatusType::LinkUp;
        info!(
            initiator = %req.initiator_mac,
            responder = %req.responder_mac,
            is_assoc,
            "driver link request"
        );
        if is_assoc {
            self.outstanding.insert(
                req.responder_mac.clone(),
                (
                    req.initiator_mac.clone(),
                    Instant::now() + self.linkup_resp_wait_timeout,
                ),
            );
        }
        ctx.bus
            .send(
                "",
                appid::MINION_DRIVER,
                appid::MINION_IGNITION,
                Message::DriverSetLinkStatus(DriverSetLinkStatus {
                    radio_mac: req.initiator_mac.clone(),
                    is_assoc,
                    responder_mac: req.responder_mac.clone(),
                    responder_node_type: req.responder_node_type,
                    golay_idx: req.golay_idx,
                    control_superframe: req.control_superframe,
                }),
            )
            .await;
    }

    async fn process_driver_link_status(
        &mut self,
        ctx: &AppContext,
        status: &crate::messages::DriverLinkStatus,
    ) {
        match status.link_status_type {
            LinkStatusType::LinkUp => {
                info!(
                    radio = %status.radio_mac,
                    responder = %status.responder_mac,
                    "link is up"
                );
                self.outstanding.remove(&status.responder_mac);
                self.state
                    .add_peer(
                        status.responder_mac.clone(),
                        PeerEntry {
                            node_type: None,
                            radio_mac: status.radio_mac.clone(),
                        },
                    )
                    .await;
            }
            LinkStatusType::LinkDown => {
                warn!(
                    radio = %status.radio_mac,
                    responder = %status.responder_mac,
                    "link is down"
                );
                self.state.remove_peer(&status.responder_mac).await;
            }
        }
        // Report upstream; the controller's TopologyApp owns the graph.
        ctx.bus
            .send(
                CTRL_NODE_ID,
                appid::CTRL_TOPOLOGY,
                appid::MINION_IGNITION,
                Message::LinkStatus(LinkStatus {
                    radio_mac: status.radio_mac.clone(),
                    responder_mac: status.responder_mac.clone(),
                    link_status_type: status.link_status_type,
                }),
            )
            .await;
    }

    /// Forget attempts whose firmware sweep has certainly ended.
    fn expire_outstanding(&mut self) {
        let now = Instant::now();
        let before = self.outstanding.len();
        self.outstanding.retain(|_, (_, deadline)| now < *deadline);
        let expired = before - self.outstanding.len();
        if expired > 0 {
            debug!(expired, "association attempts timed out without response");
        }
    }
}

#[async_trait]
impl App for IgnitionApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_IGNITION
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut expiry_timer = tokio::time::interval(Duration::from_secs(1));
        expiry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = expiry_timer.tick() => self.expire_outstanding(),
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::SetLinkStatus(req) => {
                            let req = req.clone();
                            self.process_set_link_status(&ctx, &req).await;
                        }
                        Message::DriverLinkStatus(status) => {
                            let status = status.clone();
                            self.process_driver_link_status(&ctx, &status).await;
                        }
                        Message::FwAck(ack) if ack.req_type == FwReqType::SetLinkStatus => {
                            if !ack.success {
                                warn!(radio = %ack.radio_mac, "driver rejected link request");
                            }
                        }
                        other => {
                            debug!(kind = other.kind(), from = %inbound.sender_app,
                                "unexpected message");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
