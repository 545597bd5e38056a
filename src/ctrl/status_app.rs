//! Controller StatusApp: heartbeat intake.
//!
//! Receives status reports from minions, throttles repeat reports, records
//! them in the shared status store (stamped with the controller's monotonic
//! clock), and acks the sender. Constant fields (version strings, hardware
//! model) only arrive in full reports; the app requests one whenever it has
//! no record of them or the periodic safeguard interval elapses.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::messages::{appid, Message, StatusDump, StatusReportAck};
use crate::shared::{SharedState, StatusEntry};

pub struct StatusApp {
    shared: SharedState,
    throttle_interval: Duration,
    full_report_interval: Duration,
    /// Last time a report from each node was processed (not just received).
    last_processed: HashMap<String, Instant>,
    /// Last time a full report from each node was seen.
    last_full: HashMap<String, Instant>,
    version: String,
}

impl StatusApp {
    pub fn new(
        shared: SharedState,
        throttle_interval: Duration,
        full_report_interval: Duration,
        version: String,
    ) -> Self {
        Self {
            shared,
            throttle_interval,
            full_report_interval,
            last_processed: HashMap::new(),
            last_full: HashMap::new(),
            version,
        }
    }

    async fn process_status_report(&mut self, ctx: &AppContext, inbound: Inbound) {
        let Message::StatusReport(report) = inbound.message else {
            return;
        };
        let minion = inbound.sender_node;
        if minion.is_empty() {
            debug!("status report without a node id, dropping");
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_processed.get(&minion) {
            if now.duration_since(*last) < self.throttle_interval {
                // Still ack so the minion's progress latch advances.
                ctx.bus
                    .send(
                        minion.clone(),
                        inbound.sender_app,
                        appid::CTRL_STATUS,
                        Message::StatusReportAck(StatusReportAck::default()),
                    )
                    .await;
                return;
            }
        }
        self.last_processed.insert(minion.clone(), now);

        let is_full = report.version.is_some();
        if is_full {
            self.last_full.insert(minion.clone(), now);
        }

        {
            let mut store = self.shared.write_status().await;
            let entry = store.entry(minion.clone());
            match entry {
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    let slot = e.get_mut();
                    // Keep previously learned constant fields on delta reports.
                    let mut merged = report.clone();
                    if merged.version.is_none() {
                        merged.version = slot.report.version.clone();
                        merged.uboot_version = slot.report.uboot_version.clone();
                        merged.hardware_model = slot.report.hardware_model.clone();
                        merged.hardware_board_id = slot.report.hardware_board_id.clone();
                    }
                    slot.report = merged;
                    slot.received_at = now;
                    slot.received_wall_ms = chrono::Utc::now().timestamp_millis();
                }
                std::collections::btree_map::Entry::Vacant(v) => {
                    info!(minion, "first status report");
                    v.insert(StatusEntry {
                        report: report.clone(),
                        received_at: now,
                        received_wall_ms: chrono::Utc::now().timestamp_millis(),
                    });
                }
            }
        }

        // Ask for a full report if constant fields are still unknown or the
        // periodic safeguard interval elapsed.
        let request_full = match self.last_full.get(&minion) {
            None => true,
            Some(t) => now.duration_since(*t) >= self.full_report_interval,
        };

        ctx.bus
            .send(
                minion,
                inbound.sender_app,
                appid::CTRL_STATUS,
                Message::StatusReportAck(StatusReportAck { request_full }),
            )
            .await;
    }

    async fn process_get_status_dump(&self, ctx: &AppContext, inbound: &Inbound) {
        let reports = {
            let store = self.shared.read_status().await;
            store
                .iter()
                .map(|(k, v)| (k.clone(), v.report.clone()))
                .collect()
        };
        ctx.bus
            .send(
                inbound.sender_node.clone(),
                inbound.sender_app.clone(),
                appid::CTRL_STATUS,
                Message::StatusDump(StatusDump {
                    reports,
                    version: self.version.clone(),
                }),
            )
            .await;
    }
}

#[async_trait]
impl App for StatusApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_STATUS
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::StatusReport(_) => {
                            self.process_status_report(&ctx, inbound).await;
                        }
                        Message::GetStatusDump => {
                            self.process_get_status_dump(&ctx, &inbound).await;
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
