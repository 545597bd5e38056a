//! Minion ConfigApp: applies pushed configs and computes post-change
//! actions.
//!
//! On every SET the old and new configs are diffed; each changed leaf path
//! maps through the static metadata registry to a set of actions. Effects
//! execute most-severe-first; REBOOT subsumes everything, and delayed
//! actions (reboot, minion restart, POP reconfiguration) fire ~2 s later so
//! the ack to the controller egresses first. Runtime-settable firmware
//! parameters are patched through the driver instead of restarting; a
//! scheduled (BWGD-stamped) patch that would overflow the firmware
//! scheduler pool escalates to a firmware reload.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::driver::passthru::StatsConfigure;
use crate::messages::{appid, GetMinionConfigActionsResp, GetMinionConfigResp, Message};
use crate::minion::actions::SharedActionRunner;
use crate::minion::state::MinionState;
use crate::nodecfg::actions::ordered_effects;
use crate::nodecfg::fwparams::{
    affects_links_or_radios, fits_fw_scheduler_pool, fw_params_for_config,
};
use crate::nodecfg::{flatten_keys, full_difference, CfgAction, ConfigMetadata};

/// Delay before reboot/restart actions so the current exchange flushes.
pub const DELAYED_ACTION_TIME: Duration = Duration::from_secs(2);

pub struct ConfigApp {
    state: MinionState,
    metadata: ConfigMetadata,
    runner: SharedActionRunner,
}

impl ConfigApp {
    pub fn new(state: MinionState, metadata: ConfigMetadata, runner: SharedActionRunner) -> Self {
        Self {
            state,
            metadata,
            runner,
        }
    }

    async fn process_config_set(
        &mut self,
        ctx: &AppContext,
        config_json: &str,
        bwgd_idx: Option<u64>,
    ) {
        let (old, new) = {
            let mut wrapper = self.state.write_config().await;
            let old = match wrapper.set_node_config(config_json) {
                Ok(old) => old,
                Err(e) => {
                    warn!("unable to set node config: {}", e);
                    ctx.events.log_event(
                        EventCategory::Config,
                        EventId::MinionSetConfig,
                        EventLevel::Error,
                        format!("unable to set node config: {}", e),
                    );
                    return;
                }
            };
            (old, wrapper.config().clone())
        };

        let diff = full_difference(&old, &new);
        let changed = flatten_keys(&diff);
        if changed.is_empty() {
            return; // new config is identical
        }
        debug!(changed = changed.len(), "config changed, computing actions");

        let actions = self.metadata.get_actions(&changed);
        ctx.events.log_event_details(
            EventCategory::Config,
            EventId::MinionSetConfig,
            EventLevel::Info,
            "Applying new node config",
            Some(serde_json::json!({
                "actions": actions.keys().map(|a| format!("{:?}", a)).collect::<Vec<_>>(),
            })),
        );

        // Hold the pre-change MD5 until a scheduled restart/reboot actually
        // happens, so the new hash is not reported prematurely.
        if actions.contains_key(&CfgAction::Reboot)
            || actions.contains_key(&CfgAction::RestartMinion)
        {
            self.state.write_config().await.use_previous_config_md5(true);
        }

        self.perform_node_actions(ctx, &actions, bwgd_idx).await;
    }

    async fn perform_node_actions(
        &mut self,
        ctx: &AppContext,
        actions: &BTreeMap<CfgAction, Vec<String>>,
        bwgd_idx: Option<u64>,
    ) {
        let mut delayed: BTreeSet<CfgAction> = BTreeSet::new();

        for action in ordered_effects(actions) {
            let keys = actions.get(&action).cloned().unwrap_or_default();
            match action {
                CfgAction::Reboot | CfgAction::RestartMinion => {
                    delayed.insert(action);
                }
                CfgAction::RestartRouting => {
                    // Routing restarts now; POP reconfiguration waits until
                    // it has come back.
                    info!("Restarting routing first...");
                    self.runner.run(CfgAction::RestartRouting).await;
                    delayed.insert(CfgAction::RestartRouting);
                }
                CfgAction::ReloadFirmware => {
                    if self.affects_hw(&keys).await {
                        info!("Firmware will be reloaded...");
                        delayed.insert(CfgAction::RestartMinion);
                    } else {
                        debug!("config change does not require reloading firmware");
                    }
                }
                CfgAction::SetFwParams => {
                    if self.affects_hw(&keys).await {
                        info!("Changing runtime firmware parameters...");
                        self.set_fw_params(ctx, &keys, None).await;
                    } else {
                        debug!("config change does not require a firmware parameter update");
                    }
                }
                CfgAction::SetFwParamsSyncOrReloadFirmware => {
                    if self.affects_hw(&keys).await {
                        info!("Synchronizing runtime firmware parameter change...");
                        if !self.set_fw_params(ctx, &keys, bwgd_idx).await {
                            warn!(
                                "unable to synchronize runtime firmware parameter changes, \
                                 reloading firmware instead"
                            );
                            delayed.insert(CfgAction::RestartMinion);
                        }
                    } else {
                        debug!("config change does not require a firmware parameter update");
                    }
                }
                CfgAction::UpdateLinkMetrics => {
                    ctx.bus
                        .send(
                            "",
                            appid::MINION_STATUS,
                            appid::MINION_CONFIG,
                            Message::UpdateLinkMetrics,
                        )
                        .await;
                }
                CfgAction::SetFwStatsConfig => {
                    self.send_fw_stats_config(ctx).await;
                }
                CfgAction::SetAirtimeParams => {
                    let airtime = {
                        let config = self.state.read_config().await;
                        config
                            .config()
                            .get("airtimeAllocMap")
                            .and_then(|m| {
                                serde_json::from_value::<BTreeMap<String, i64>>(m.clone()).ok()
                            })
                    };
                    if let Some(map) = airtime {
                        ctx.bus
                            .send(
                                "",
                                appid::MINION_STATUS,
                                appid::MINION_CONFIG,
                                Message::SetNodeParams(crate::messages::NodeParams {
                                    polarity: None,
                                    golay_idx: None,
                                    channel: None,
                                    airtime_alloc_map: Some(map),
                                }),
                            )
                            .await;
                    }
                }
                CfgAction::SyncLinkMonitor | CfgAction::InjectKvstoreKeys => {
                    ctx.bus
                        .send(
                            "",
                            appid::MINION_OPENR_CLIENT,
                            appid::MINION_CONFIG,
                            Message::UpdateLinkMetrics,
                        )
                        .await;
                }
                CfgAction::RedoPopConfig
                | CfgAction::RestartStatsAgent
                | CfgAction::RestartLogtail
                | CfgAction::RestartDhcp
                | CfgAction::RestartWebui
                | CfgAction::RestartUdpPingServer
                | CfgAction::RestartFluentdAgent
                | CfgAction::RestartSnmp
                | CfgAction::ReloadRsyslogConfig
                | CfgAction::ReloadDnsServers
                | CfgAction::ReloadNtpConfig
                | CfgAction::ReloadSshdCaKeys
                | CfgAction::ReloadSshd
                | CfgAction::ReloadFirewall
                | CfgAction::SymlinkTimezone
                | CfgAction::UpdateGlogLevel => {
                    self.runner.run(action).await;
                }
                CfgAction::NoAction => {}
            }
        }

        if delayed.is_empty() {
            return;
        }
        self.schedule_delayed_actions(delayed).await;
    }

    /// Delayed phase: reboot supersedes everything; POP reconfiguration
    /// runs before the minion restart so routing settles first.
    async fn schedule_delayed_actions(&self, delayed: BTreeSet<CfgAction>) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DELAYED_ACTION_TIME).await;
            if delayed.contains(&CfgAction::Reboot) {
                info!("Rebooting...");
                runner.run(CfgAction::Reboot).await;
                return;
            }
            if delayed.contains(&CfgAction::RestartRouting) {
                info!("Restarting POP config...");
                runner.run(CfgAction::RedoPopConfig).await;
            }
            if delayed.contains(&CfgAction::RestartMinion) {
                info!("Restarting minion...");
                runner.run(CfgAction::RestartMinion).await;
            }
        });
    }

    async fn affects_hw(&self, keys: &[String]) -> bool {
        let radios = self.state.node_info.radios();
        let peers = self.state.peer_macs().await;
        affects_links_or_radios(keys, &radios, &peers)
    }

    /// Build and dispatch per-radio firmware patches. Returns false when a
    /// scheduled patch would overflow the firmware scheduler pool.
    async fn set_fw_params(
        &self,
        ctx: &AppContext,
        keys: &[String],
        bwgd_idx: Option<u64>,
    ) -> bool {
        let config = { self.state.read_config().await.config().clone() };
        let radios = self.state.node_info.radios();
        let peers = self.state.peer_macs().await;
        let reqs = fw_params_for_config(&config, keys, bwgd_idx, &radios, &peers);

        // A BWGD-stamped request is buffered by the firmware scheduler,
        // whose pool is tiny; overflow means the caller must reload.
        if bwgd_idx.is_some() && !fits_fw_scheduler_pool(&reqs) {
            return false;
        }

        for (radio_mac, params) in reqs {
            ctx.bus
                .send(
                    "",
                    appid::MINION_DRIVER,
                    appid::MINION_CONFIG,
                    Message::FwConfigReq { radio_mac, params },
                )
                .await;
        }
        true
    }

    async fn send_fw_stats_config(&self, ctx: &AppContext) {
        let configs = {
            let config = self.state.read_config().await;
            config
                .config()
                .pointer("/fwStatsConfig")
                .and_then(|m| serde_json::from_value::<BTreeMap<String, bool>>(m.clone()).ok())
                .unwrap_or_default()
        };
        for radio_mac in self.state.node_info.radios() {
            ctx.bus
                .send(
                    "",
                    appid::MINION_DRIVER,
                    appid::MINION_CONFIG,
                    Message::FwConfigReq {
                        radio_mac,
                        params: crate::messages::FwConfigParams {
                            pass_thru_msgs: vec![crate::driver::passthru::PassThruMsg {
                                cookie: 0,
                                dest: crate::driver::passthru::PtMsgDest::Sb,
                                body: crate::driver::passthru::PassThruBody::StatsConfigure(
                                    StatsConfigure {
                                        configs: configs.clone(),
                                        on_duty_cycle_ms: 0,
                                        off_duty_cycle_ms: 0,
                                    },
                                ),
                            }],
                        },
                    },
                )
                .await;
        }
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match &inbound.message {
            Message::SetMinionConfigReq(req) => {
                info!(from = %inbound.sender_app, "received SET_MINION_CONFIG_REQ");
                let config = req.config.clone();
                let bwgd_idx = req.bwgd_idx;
                self.process_config_set(ctx, &config, bwgd_idx).await;
            }
            Message::GetMinionConfigReq => {
                let (config, config_md5) = {
                    let wrapper = self.state.read_config().await;
                    (wrapper.config_json(), wrapper.current_md5().to_string())
                };
                ctx.reply(
                    appid::MINION_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::GetMinionConfigResp(GetMinionConfigResp { config, config_md5 }),
                )
                .await;
            }
            Message::GetMinionConfigActionsReq(req) => {
                // Dry run: diff against the applied config without setting.
                let resp = match serde_json::from_str::<serde_json::Value>(&req.config) {
                    Ok(new_config) => {
                        let old = { self.state.read_config().await.config().clone() };
                        let changed = flatten_keys(&full_difference(&old, &new_config));
                        let actions = self.metadata.get_actions(&changed);
                        GetMinionConfigActionsResp {
                            actions: actions.keys().copied().collect(),
                            id: req.id.clone(),
                        }
                    }
                    Err(e) => {
                        warn!("unable to parse config for dry run: {}", e);
                        GetMinionConfigActionsResp {
                            actions: BTreeSet::new(),
                            id: req.id.clone(),
                        }
                    }
                };
                ctx.reply(
                    appid::MINION_CONFIG,
                    &inbound.sender_node,
                    &inbound.sender_app,
                    Message::GetMinionConfigActionsResp(resp),
                )
                .await;
            }
            Message::FwSetLogConfig { level, .. } => {
                let level = *level;
                for radio_mac in self.state.node_info.radios() {
                    ctx.bus
                        .send(
                            "",
                            appid::MINION_DRIVER,
                            appid::MINION_CONFIG,
                            Message::FwSetLogConfig {
                                radio_mac,
                                level,
                            },
                        )
                        .await;
                }
            }
            Message::FwConfigResp(resp) => {
                if !resp.success {
                    warn!(radio = %resp.radio_mac, "firmware config request failed");
                }
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
        appid::MINION_CONFIG
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
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
    use crate::minion::actions::testing::RecordingRunner;
    use crate::minion::state::{NodeInfo, PeerEntry};
    use crate::nodecfg::NodeConfigWrapper;
    use serde_json::json;
    use std::sync::Arc;

    const RADIO: &str = "aa:bb:cc:00:00:10";
    const PEER: &str = "aa:bb:cc:00:00:20";

    fn app_with_runner() -> (ConfigApp, Arc<RecordingRunner>, MinionState) {
        let runner = Arc::new(RecordingRunner::default());
        let node_info = NodeInfo {
            node_id: RADIO.into(),
            radio_mac_to_bus_id: std::collections::BTreeMap::from([(
                RADIO.to_string(),
                "0000:01:00.0".to_string(),
            )]),
            hw_model: None,
            hw_board_id: None,
            node_type: None,
        };
        let state = MinionState::new(node_info, NodeConfigWrapper::load(""));
        let app = ConfigApp::new(state.clone(), ConfigMetadata::default(), runner.clone());
        (app, runner, state)
    }

    fn ctx_pair() -> (
        crate::apps::AppContext,
        tokio::sync::mpsc::Receiver<crate::bus::Outbound>,
    ) {
        let (bus, rx) = crate::bus::outbound_channel();
        let (_tx, inbox) = tokio::sync::mpsc::channel(32);
        (
            crate::apps::AppContext {
                bus,
                inbox,
                events: crate::events::EventClient::new(
                    appid::MINION_CONFIG,
                    crate::events::create_event_bus(),
                ),
                shutdown: tokio_util::sync::CancellationToken::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_fw_param_change_patches_without_restart() {
        let (mut app, runner, state) = app_with_runner();
        let (ctx, mut rx) = ctx_pair();
        state
            .add_peer(
                PEER.into(),
                PeerEntry {
                    node_type: None,
                    radio_mac: RADIO.into(),
                },
            )
            .await;

        let base = json!({"linkParamsBase": {"fwParams": {"laMaxMcs": 12}}});
        app.process_config_set(&ctx, &base.to_string(), None).await;
        // Initial set from empty: fires a patch for the new value too.
        while rx.try_recv().is_ok() {}

        let updated = json!({"linkParamsBase": {"fwParams": {"laMaxMcs": 10}}});
        app.process_config_set(&ctx, &updated.to_string(), None).await;

        let out = rx.try_recv().expect("expected a driver-bound message");
        assert_eq!(out.dest_app, appid::MINION_DRIVER);
        match out.message {
            Message::FwConfigReq { radio_mac, params } => {
                assert_eq!(radio_mac, RADIO);
                assert_eq!(params.pass_thru_msgs.len(), 1);
                match &params.pass_thru_msgs[0].body {
                    crate::driver::passthru::PassThruBody::SetFwParamsReq(req) => {
                        assert_eq!(req.addr, PEER);
                        assert_eq!(req.optional_params.get("laMaxMcs"), Some(&10));
                    }
                    other => panic!("unexpected body {:?}", other),
                }
            }
            other => panic!("unexpected message {:?}", other.kind()),
        }
        // No restart-ish action ran.
        assert!(runner.actions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_subsumes_daemon_restarts() {
        let (mut app, runner, _state) = app_with_runner();
        let (ctx, _rx) = ctx_pair();

        app.process_config_set(&ctx, &json!({"sysParams": {"managedConfig": true}}).to_string(), None)
            .await;
        runner.actions.lock().unwrap().clear();

        let update = json!({
            "sysParams": {"managedConfig": true},
            "kernelParams": {"isolcpus": "1"},
            "statsAgentParams": {"enabled": true}
        });
        app.process_config_set(&ctx, &update.to_string(), None).await;

        // Only the delayed reboot runs; the stats agent restart is
        // subsumed.
        tokio::time::sleep(DELAYED_ACTION_TIME + Duration::from_millis(100)).await;
        let actions = runner.actions.lock().unwrap().clone();
        assert_eq!(actions, vec![CfgAction::Reboot]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_routing_defers_pop_config() {
        let (mut app, runner, _state) = app_with_runner();
        let (ctx, _rx) = ctx_pair();

        app.process_config_set(&ctx, &json!({"openrParams": {"x": 1}}).to_string(), None)
            .await;
        // Routing restarted immediately.
        assert_eq!(
            runner.actions.lock().unwrap().clone(),
            vec![CfgAction::RestartRouting]
        );
        // POP reconfiguration lands after the delay.
        tokio::time::sleep(DELAYED_ACTION_TIME + Duration::from_millis(100)).await;
        let actions = runner.actions.lock().unwrap().clone();
        assert_eq!(
            actions,
            vec![CfgAction::RestartRouting, CfgAction::RedoPopConfig]
        );
    }

    #[tokio::test]
    async fn test_identical_config_is_a_noop() {
        let (mut app, runner, _state) = app_with_runner();
        let (ctx, mut rx) = ctx_pair();
        let cfg = json!({"sysParams": {"managedConfig": true}});
        app.process_config_set(&ctx, &cfg.to_string(), None).await;
        runner.actions.lock().unwrap().clear();
        while rx.try_recv().is_ok() {}

        app.process_config_set(&ctx, &cfg.to_string(), None).await;
        assert!(rx.try_recv().is_err());
        assert!(runner.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_patch_overflow_escalates() {
        let (mut app, _runner, state) = app_with_runner();
        let (ctx, _rx) = ctx_pair();
        // Three peers: a scheduled linkParams change yields three PassThru
        // messages per radio, exceeding the pool of two.
        for i in 0..3 {
            state
                .add_peer(
                    format!("aa:bb:cc:00:00:2{}", i),
                    PeerEntry {
                        node_type: None,
                        radio_mac: RADIO.into(),
                    },
                )
                .await;
        }
        app.process_config_set(
            &ctx,
            &json!({"linkParamsBase": {"fwParams": {"laMaxMcs": 12}}}).to_string(),
            None,
        )
        .await;

        let keys = vec!["linkParamsBase.fwParams.laMaxMcs".to_string()];
        assert!(!app.set_fw_params(&ctx, &keys, Some(1000)).await);
        assert!(app.set_fw_params(&ctx, &keys, None).await);
    }

    #[tokio::test]
    async fn test_md5_latch_on_restart_actions() {
        let (mut app, _runner, state) = app_with_runner();
        let (ctx, _rx) = ctx_pair();
        app.process_config_set(&ctx, &json!({"a": 1}).to_string(), None).await;
        let old_md5 = state.read_config().await.current_md5().to_string();

        app.process_config_set(
            &ctx,
            &json!({"a": 1, "timingParams": {"pps": true}}).to_string(),
            None,
        )
        .await;
        let wrapper = state.read_config().await;
        assert_eq!(wrapper.reported_md5(), old_md5);
        assert_ne!(wrapper.current_md5(), old_md5);
    }
}
