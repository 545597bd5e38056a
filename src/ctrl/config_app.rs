//! Controller ConfigApp: config authority and distribution.
//!
//! Serves override reads/writes from the NMS, and runs the reconciliation
//! loop: any online node whose reported `configMd5` differs from the
//! controller-computed effective config gets a fresh `SetMinionConfigReq`.
//! Automated overrides (polarity/golay/prefix/topology info) are written by
//! TopologyApp through the shared `ConfigHelper`; this app only distributes
//! the result.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{
    appid, E2eAck, GetNetworkOverridesResp, GetNodeConfigResp, GetNodeOverridesResp, Message,
    SetMinionConfigReq,
};
use crate::shared::SharedState;

pub struct ConfigApp {
    shared: SharedState,
    reconcile_interval: Duration,
    /// Per-node resend throttle so a restarting node is not flooded.
    resend_gap: Duration,
    last_push: HashMap<String, Instant>,
}

impl ConfigApp {
    pub fn new(shared: SharedState, reconcile_interval: Duration) -> Self {
        Self {
            shared,
            reconcile_interval,
            resend_gap: reconcile_interval * 2,
            last_push: HashMap::new(),
        }
    }

    /// Compare each online node's reported hash with the composed config
    /// and resend on mismatch.
    async fn reconcile(&mut self, ctx: &AppContext) {
        let now = Instant::now();

        // Snapshot status first (leaf lock, never held across the others).
        let reports: Vec<(String, Option<String>, Option<String>, String)> = {
            let status = self.shared.read_status().await;
            status
                .iter()
                .map(|(node_id, entry)| {
                    (
                        node_id.clone(),
                        entry.report.version.clone(),
                        entry.report.hardware_board_id.clone(),
                        entry.report.config_md5.clone(),
                    )
                })
                .collect()
        };

        let mut pushes: Vec<(String, String)> = Vec::new();
        {
            let (topo, config) = self.shared.read_both().await;
            for (node_id, version, hw_board_id, reported_md5) in reports {
                let Some(node) = topo.get_node_by_mac(&node_id) else {
                    continue;
                };
                if !node.status.is_online() {
                    continue;
                }
                if let Some(last) = self.last_push.get(&node_id) {
                    if now.duration_since(*last) < self.resend_gap {
                        continue;
                    }
                }
                let (cfg, md5) = config.effective_config_with_md5(
                    &node.name,
                    version.as_deref(),
                    None,
                    hw_board_id.as_deref(),
                );
                if md5 != reported_md5 {
                    debug!(
                        node = %node.name,
                        expected = %md5,
                        reported = %reported_md5,
                        "config hash mismatch, resending"
                    );
                    pushes.push((node_id, cfg.to_string()));
                }
            }
        }

        for (node_id, config_json) in pushes {
            self.last_push.insert(node_id.clone(), now);
            ctx.bus
                .send_opts(
                    node_id,
                    appid::MINION_CONFIG,
                    appid::CTRL_CONFIG,
                    Message::SetMinionConfigReq(SetMinionConfigReq {
                        config: config_json,
                        bwgd_idx: None,
                    }),
                    true,
                )
                .await;
        }
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match &inbound.message {
            Message::GetNodeConfigReq(req) => {
                let resp = {
                    let (topo, config) = self.shared.read_both().await;
                    match topo.get_node(&req.node) {
                        Some(node) => {
                            let (cfg, md5) = config.effective_config_with_md5(
                                &node.name,
                                node.software_version.as_deref(),
                                None,
                                None,
                            );
                            Ok((cfg.to_string(), md5))
                        }
                        None => Err(format!("no such node: {}", req.node)),
                    }
                };
                let message = match resp {
                    Ok((config, config_md5)) => {
                        Message::GetNodeConfigResp(GetNodeConfigResp { config, config_md5 })
                    }
                    Err(e) => Message::E2eAck(E2eAck::fail(e)),
                };
                ctx.reply(
                    appid::CTRL_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    message,
                )
                .await;
            }
            Message::SetNodeOverridesReq(req) => {
                let result = {
                    let mut config = self.shared.write_config().await;
                    config.merge_node_overrides(&req.overrides)
                };
                let ack = match result {
                    Ok(()) => {
                        info!("node overrides updated");
                        ctx.events.log_event(
                            EventCategory::Config,
                            EventId::ConfigModified,
                            EventLevel::Info,
                            "node overrides modified",
                        );
                        // Push promptly instead of waiting a full cycle.
                        self.last_push.clear();
                        E2eAck::ok("node overrides set")
                    }
                    Err(e) => E2eAck::fail(e.to_string()),
                };
                ctx.reply(
                    appid::CTRL_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(ack),
                )
                .await;
            }
            Message::GetNodeOverridesReq(req) => {
                let overrides = {
                    let config = self.shared.read_config().await;
                    config.node_overrides(&req.nodes).to_string()
                };
                ctx.reply(
                    appid::CTRL_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::GetNodeOverridesResp(GetNodeOverridesResp { overrides }),
                )
                .await;
            }
            Message::SetNetworkOverridesReq(req) => {
                let result = {
                    let mut config = self.shared.write_config().await;
                    config.set_network_overrides(&req.overrides)
                };
                let ack = match result {
                    Ok(()) => {
                        info!("network overrides updated");
                        ctx.events.log_event(
                            EventCategory::Config,
                            EventId::ConfigModified,
                            EventLevel::Info,
                            "network overrides modified",
                        );
                        self.last_push.clear();
                        E2eAck::ok("network overrides set")
                    }
                    Err(e) => E2eAck::fail(e.to_string()),
                };
                ctx.reply(
                    appid::CTRL_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::E2eAck(ack),
                )
                .await;
            }
            Message::GetNetworkOverridesReq => {
                let overrides = {
                    let config = self.shared.read_config().await;
                    config.all_network_overrides_json()
                };
                ctx.reply(
                    appid::CTRL_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::GetNetworkOverridesResp(GetNetworkOverridesResp { overrides }),
                )
                .await;
            }
            Message::GetMinionConfigResp(resp) => {
                debug!(
                    from = %inbound.sender_node,
                    md5 = %resp.config_md5,
                    "minion config response"
                );
            }
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

#[async_trait]
impl App for ConfigApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_CONFIG
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        let mut reconcile_timer = tokio::time::interval(self.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = reconcile_timer.tick() => {
                    // Pick up external edits to the override files.
                    {
                        let mut config = self.shared.write_config().await;
                        if let Err(e) = config.reload_overrides() {
                            warn!("override reload failed: {}", e);
                        }
                    }
                    self.reconcile(&ctx).await;
                }
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.process_message(&ctx, inbound).await;
                }
            }
        }
        Ok(())
    }
}
