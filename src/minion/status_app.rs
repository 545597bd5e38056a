//! Minion StatusApp: heartbeats and miscellaneous node actions.
//!
//! Builds the periodic status report (delta normally, full when the
//! controller asks or on first contact), initializes radios through
//! DriverApp, executes reboot/restart commands, and rate-limits routing
//! link metric pushes with a per-link token bucket.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::messages::{
    appid, FwReqType, Message, NodeParams, RadioStatus, StatusReport, UpgradeStatus,
};
use crate::minion::actions::SharedActionRunner;
use crate::minion::broker::CTRL_NODE_ID;
use crate::minion::state::MinionState;
use crate::nodecfg::CfgAction;
use crate::progress::Progress;
use crate::topology::NodeStatus;

/// Progress file touched on every acked heartbeat.
const MINION_PROGRESS_FILE: &str = "minion";

/// Simple token bucket (tokens replenish continuously at `rate`/s up to
/// `burst`).
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        // Guard against zero/negative configs.
        let rate = if rate > 0.0 { rate } else { 0.1 };
        let burst = if burst > 0.0 { burst } else { 3.0 };
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self, n: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Hysteresis + rate limiting state for one link's routing metric.
struct LinkMetricData {
    last_pushed_metric: i64,
    new_metric_candidate: i64,
    /// Successive same-direction changes (reset on direction flips).
    successive_changes: u32,
    bucket: TokenBucket,
}

pub struct MinionStatusAppConfig {
    pub report_interval: Duration,
    pub bgp_status_interval: Duration,
    pub version: String,
    pub uboot_version: Option<String>,
    pub link_metric_gen_rate: f64,
    pub link_metric_burst_size: f64,
    pub link_metric_min_changes: u32,
}

pub struct StatusApp {
    state: MinionState,
    cfg: MinionStatusAppConfig,
    runner: SharedActionRunner,
    progress: Arc<Progress>,
    my_status: NodeStatus,
    radio_status: BTreeMap<String, RadioStatus>,
    upgrade_status: UpgradeStatus,
    send_full_report: bool,
    link_metrics: HashMap<String, LinkMetricData>,
}

impl StatusApp {
    pub fn new(
        state: MinionState,
        cfg: MinionStatusAppConfig,
        runner: SharedActionRunner,
        progress: Arc<Progress>,
        initial_upgrade_status: UpgradeStatus,
    ) -> Self {
        Self {
            state,
            cfg,
            runner,
            progress,
            my_status: NodeStatus::Offline,
            radio_status: BTreeMap::new(),
            upgrade_status: initial_upgrade_status,
            send_full_report: true,
            link_metrics: HashMap::new(),
        }
    }

    /// Initialize every known radio through the driver.
    async fn send_node_inits(&self, ctx: &AppContext) {
        for radio in self.state.node_info.radios() {
            ctx.bus
                .send(
                    "",
                    appid::MINION_DRIVER,
                    appid::MINION_STATUS,
                    Message::NodeInit { radio_mac: radio },
                )
                .await;
        }
    }

    async fn send_node_params(&self, ctx: &AppContext, radio_mac: &str, params: NodeParams) {
        ctx.bus
            .send(
                "",
                appid::MINION_DRIVER,
                appid::MINION_STATUS,
                Message::FwSetNodeParams {
                    radio_mac: radio_mac.to_string(),
                    params,
                },
            )
            .await;
    }

    fn build_status_report(&self, full: bool, conn_status: BTreeMap<String, bool>) -> StatusReport {
        let mut report = StatusReport {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            status: self.my_status,
            upgrade_status: self.upgrade_status.clone(),
            config_md5: String::new(), // filled by caller under the lock
            radio_status: self.radio_status.clone(),
            neighbor_conn_status: conn_status,
            bgp_status: None,
            wired_interface_macs: vec![],
            version: None,
            uboot_version: None,
            hardware_model: None,
            hardware_board_id: None,
        };
        if full {
            report.version = Some(self.cfg.version.clone());
            report.uboot_version = self.cfg.uboot_version.clone();
            report.hardware_model = self.state.node_info.hw_model.clone();
            report.hardware_board_id = self.state.node_info.hw_board_id.clone();
        }
        report
    }

    async fn report_status(&mut self, ctx: &AppContext) {
        let full = self.send_full_report;
        self.send_full_report = false;

        let conn_status = self.state.peer_conn_status().await;
        let mut report = self.build_status_report(full, conn_status);
        report.config_md5 = self.state.read_config().await.reported_md5().to_string();
        report.bgp_status = self.state.bgp_status().await;

        ctx.bus
            .send(
                CTRL_NODE_ID,
                appid::CTRL_STATUS,
                appid::MINION_STATUS,
                Message::StatusReport(report),
            )
            .await;
    }

    /// Refresh the BGP view. Off-POP nodes carry no BGP config and report
    /// nothing; external session state arrives through the state handle.
    async fn update_bgp_status(&self) {
        let has_bgp = {
            let config = self.state.read_config().await;
            config
                .config()
                .get("bgpParams")
                .and_then(|b| b.get("neighbors"))
                .is_some()
        };
        if !has_bgp {
            self.state.set_bgp_status(None).await;
        }
    }

    /// Apply hysteresis and the token bucket to one link metric
    /// observation. Returns the metric to push, if any.
    fn consider_metric_push(&mut self, peer_mac: &str, candidate: i64) -> Option<i64> {
        let (rate, burst) = (self.cfg.link_metric_gen_rate, self.cfg.link_metric_burst_size);
        let min_changes = self.cfg.link_metric_min_changes;
        let data = self
            .link_metrics
            .entry(peer_mac.to_string())
            .or_insert_with(|| LinkMetricData {
                last_pushed_metric: 0,
                new_metric_candidate: 0,
                successive_changes: 0,
                bucket: TokenBucket::new(rate, burst),
            });

        if candidate == data.last_pushed_metric {
            data.successive_changes = 0;
            return None;
        }
        let direction_up = candidate > data.last_pushed_metric;
        let prev_direction_up = data.new_metric_candidate > data.last_pushed_metric;
        if data.successive_changes > 0 && direction_up != prev_direction_up {
            data.successive_changes = 0;
        }
        data.new_metric_candidate = candidate;
        data.successive_changes += 1;

        if data.successive_changes < min_changes {
            return None;
        }
        if !data.bucket.try_consume(1.0) {
            return None;
        }
        data.successive_changes = 0;
        data.last_pushed_metric = candidate;
        Some(candidate)
    }

    /// Recompute metrics from config for every associated peer and push
    /// the ones that clear the rate limiter.
    async fn update_link_metrics(&mut self, ctx: &AppContext) {
        let metric = {
            let config = self.state.read_config().await;
            config
                .config()
                .pointer("/openrParams/linkMetricConfig/fixedMetric")
                .and_then(|v| v.as_i64())
                .unwrap_or(1)
        };
        let peers = self.state.peer_macs().await;
        for peer in peers {
            if let Some(metric) = self.consider_metric_push(&peer, metric) {
                ctx.bus
                    .send(
                        "",
                        appid::MINION_OPENR_CLIENT,
                        appid::MINION_STATUS,
                        Message::RoutingAdjacencies(crate::messages::RoutingAdjacencies {
                            adjacency_map: BTreeMap::from([(
                                peer.clone(),
                                vec![format!("metric:{}", metric)],
                            )]),
                        }),
                    )
                    .await;
            }
        }
    }

    async fn schedule_action(&self, action: CfgAction, delay: Duration) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner.run(action).await;
        });
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match inbound.message {
            Message::StatusReportAck(ack) => {
                // Connectivity progress for the watchdog.
                self.progress.report(MINION_PROGRESS_FILE);
                if self.my_status == NodeStatus::Offline {
                    info!("controller acknowledged first status report");
                    self.my_status = NodeStatus::Online;
                }
                if ack.request_full {
                    self.send_full_report = true;
                }
            }
            Message::NodeInitNotify(notify) => {
                if notify.success {
                    info!(radio = %notify.radio_mac, vendor = %notify.vendor, "radio initialized");
                    self.radio_status.insert(
                        notify.radio_mac.clone(),
                        RadioStatus {
                            initialized: true,
                            gps_sync: false,
                            vendor: Some(notify.vendor.clone()),
                        },
                    );
                    // Bring the radio to operational state: GPS first, then
                    // PHY parameters from config.
                    ctx.bus
                        .send(
                            "",
                            appid::MINION_DRIVER,
                            appid::MINION_STATUS,
                            Message::GpsEnableReq {
                                radio_mac: notify.radio_mac.clone(),
                            },
                        )
                        .await;
                    let params = {
                        let config = self.state.read_config().await;
                        NodeParams {
                            polarity: None,
                            golay_idx: None,
                            channel: config
                                .config()
                                .pointer("/radioParamsBase/fwParams/channel")
                                .and_then(|v| v.as_i64()),
                            airtime_alloc_map: None,
                        }
                    };
                    self.send_node_params(ctx, &notify.radio_mac, params).await;
                } else {
                    warn!(radio = %notify.radio_mac, "radio init failed");
                }
            }
            Message::FwAck(ack) => match ack.req_type {
                FwReqType::GpsEnable => {
                    if let Some(status) = self.radio_status.get_mut(&ack.radio_mac) {
                        status.gps_sync = ack.success;
                    }
                }
                FwReqType::NodeParams | FwReqType::StatsConfigure => {
                    if !ack.success {
                        warn!(radio = %ack.radio_mac, req = ?ack.req_type, "negative firmware ack");
                    }
                }
                _ => {}
            },
            Message::DevUpDownStatus(status) => {
                if status.up {
                    info!(radio = %status.radio_mac, "baseband device up, re-initializing");
                    ctx.bus
                        .send(
                            "",
                            appid::MINION_DRIVER,
                            appid::MINION_STATUS,
                            Message::NodeInit {
                                radio_mac: status.radio_mac.clone(),
                            },
                        )
                        .await;
                    // Force the controller to resend node params.
                    self.my_status = NodeStatus::Offline;
                } else {
                    warn!(radio = %status.radio_mac, "baseband device down");
                    self.radio_status.remove(&status.radio_mac);
                    let dropped = self.state.remove_peers_on_radio(&status.radio_mac).await;
                    for peer in dropped {
                        ctx.bus
                            .send(
                                CTRL_NODE_ID,
                                appid::CTRL_TOPOLOGY,
                                appid::MINION_STATUS,
                                Message::LinkStatus(crate::messages::LinkStatus {
                                    radio_mac: status.radio_mac.clone(),
                                    responder_mac: peer,
                                    link_status_type: crate::messages::LinkStatusType::LinkDown,
                                }),
                            )
                            .await;
                    }
                }
            }
            Message::SetNodeParams(params) => {
                for radio in self.state.node_info.radios() {
                    self.send_node_params(ctx, &radio, params.clone()).await;
                }
            }
            Message::SetUpgradeStatus(status) => {
                debug!(us_type = ?status.us_type, "upgrade status updated");
                self.upgrade_status = status;
            }
            Message::RebootNode { force, delay_s } => {
                info!(force, delay_s, "reboot requested");
                ctx.events.log_event(
                    crate::events::EventCategory::Status,
                    crate::events::EventId::RebootNode,
                    crate::events::EventLevel::Warning,
                    "reboot requested by controller",
                );
                self.schedule_action(CfgAction::Reboot, Duration::from_secs(delay_s)).await;
            }
            Message::RestartMinion { delay_s } => {
                info!(delay_s, "minion restart requested");
                self.schedule_action(CfgAction::RestartMinion, Duration::from_secs(delay_s))
                    .await;
            }
            Message::UpdateLinkMetrics => {
                self.update_link_metrics(ctx).await;
            }
            Message::ScanReq(req) => {
                // Scans ride through StatusApp to the driver.
                ctx.bus
                    .send("", appid::MINION_DRIVER, appid::MINION_STATUS, Message::ScanReq(req))
                    .await;
            }
            Message::FwHealthReport { radio_mac, .. } => {
                debug!(radio = %radio_mac, "firmware healthy");
            }
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

#[async_trait]
impl App for StatusApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_STATUS
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        self.send_node_inits(&ctx).await;

        let mut report_timer = tokio::time::interval(self.cfg.report_interval);
        let mut bgp_timer = tokio::time::interval(self.cfg.bgp_status_interval);
        report_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        bgp_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = report_timer.tick() => self.report_status(&ctx).await,
                _ = bgp_timer.tick() => self.update_bgp_status().await,
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

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_refill() {
        let mut bucket = TokenBucket::new(1.0, 3.0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_caps_at_burst() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_bucket_params_fall_back() {
        // Zero rate/burst must not wedge or divide by zero.
        let mut bucket = TokenBucket::new(0.0, -1.0);
        assert!(bucket.try_consume(1.0));
    }

    fn status_app(min_changes: u32) -> StatusApp {
        StatusApp::new(
            MinionState::new(
                crate::minion::state::NodeInfo::default(),
                crate::nodecfg::NodeConfigWrapper::load(""),
            ),
            MinionStatusAppConfig {
                report_interval: Duration::from_secs(5),
                bgp_status_interval: Duration::from_secs(30),
                version: "RELEASE_M80".into(),
                uboot_version: None,
                link_metric_gen_rate: 100.0,
                link_metric_burst_size: 100.0,
                link_metric_min_changes: min_changes,
            },
            Arc::new(crate::minion::actions::testing::RecordingRunner::default()),
            Arc::new(Progress::disabled()),
            UpgradeStatus::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_push_requires_successive_changes() {
        let mut app = status_app(3);
        assert_eq!(app.consider_metric_push("peer", 5), None);
        assert_eq!(app.consider_metric_push("peer", 5), None);
        assert_eq!(app.consider_metric_push("peer", 5), Some(5));
        // After the push, the same value is a no-op.
        assert_eq!(app.consider_metric_push("peer", 5), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_direction_flip_resets_counter() {
        let mut app = status_app(3);
        assert_eq!(app.consider_metric_push("peer", 5), None);
        assert_eq!(app.consider_metric_push("peer", 5), None);
        // Direction flips (5 > 0 vs -5 < 0): the streak restarts.
        assert_eq!(app.consider_metric_push("peer", -5), None);
        assert_eq!(app.consider_metric_push("peer", -5), None);
        assert_eq!(app.consider_metric_push("peer", -5), Some(-5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_report_carries_constant_fields() {
        let app = status_app(3);
        let full = app.build_status_report(true, BTreeMap::new());
        assert_eq!(full.version.as_deref(), Some("RELEASE_M80"));
        let delta = app.build_status_report(false, BTreeMap::new());
        assert!(delta.version.is_none());
    }
}
