//! Post-change config actions.
//!
//! Every config leaf path maps (through a static metadata registry) to a set
//! of actions the minion must take after applying a new config. The union of
//! actions over all changed paths is sorted by severity and deduplicated:
//! a REBOOT subsumes everything else, a RESTART_MINION subsumes the actions
//! a restart re-runs anyway.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Actions a config change can trigger on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CfgAction {
    Reboot,
    RestartMinion,
    ReloadFirmware,
    SetFwParamsSyncOrReloadFirmware,
    RestartRouting,
    RedoPopConfig,
    RestartStatsAgent,
    RestartLogtail,
    RestartDhcp,
    RestartWebui,
    RestartUdpPingServer,
    RestartFluentdAgent,
    RestartSnmp,
    ReloadRsyslogConfig,
    ReloadDnsServers,
    ReloadNtpConfig,
    ReloadSshdCaKeys,
    ReloadSshd,
    ReloadFirewall,
    SymlinkTimezone,
    UpdateGlogLevel,
    UpdateLinkMetrics,
    SetFwStatsConfig,
    SetAirtimeParams,
    SyncLinkMonitor,
    InjectKvstoreKeys,
    SetFwParams,
    NoAction,
}

impl CfgAction {
    /// Total severity order: higher subsumes lower when both are implied by
    /// the same change set.
    pub fn severity(self) -> u8 {
        match self {
            CfgAction::Reboot => 100,
            CfgAction::RestartMinion => 90,
            CfgAction::ReloadFirmware => 80,
            CfgAction::SetFwParamsSyncOrReloadFirmware => 75,
            CfgAction::RestartRouting => 70,
            CfgAction::RedoPopConfig => 60,
            CfgAction::RestartStatsAgent
            | CfgAction::RestartLogtail
            | CfgAction::RestartDhcp
            | CfgAction::RestartWebui
            | CfgAction::RestartUdpPingServer
            | CfgAction::RestartFluentdAgent
            | CfgAction::RestartSnmp => 50,
            CfgAction::ReloadRsyslogConfig
            | CfgAction::ReloadDnsServers
            | CfgAction::ReloadNtpConfig
            | CfgAction::ReloadSshdCaKeys
            | CfgAction::ReloadSshd
            | CfgAction::ReloadFirewall
            | CfgAction::SymlinkTimezone => 40,
            CfgAction::UpdateGlogLevel
            | CfgAction::UpdateLinkMetrics
            | CfgAction::SetFwStatsConfig
            | CfgAction::SetAirtimeParams
            | CfgAction::SyncLinkMonitor
            | CfgAction::InjectKvstoreKeys => 30,
            CfgAction::SetFwParams => 20,
            CfgAction::NoAction => 0,
        }
    }

    /// Whether a minion restart makes this action redundant (the restart
    /// path re-runs it anyway).
    pub fn subsumed_by_restart(self) -> bool {
        matches!(
            self,
            CfgAction::ReloadFirmware
                | CfgAction::SetFwParams
                | CfgAction::SetFwParamsSyncOrReloadFirmware
                | CfgAction::SetFwStatsConfig
                | CfgAction::SetAirtimeParams
                | CfgAction::UpdateGlogLevel
        )
    }
}

/// Firmware parameters the firmware accepts at runtime without a reload.
const RUNTIME_SETTABLE_FW_PARAMS: &[&str] = &[
    "laMaxMcs",
    "laMinMcs",
    "laInvPERTarget",
    "txPower",
    "maxTxPower",
    "minTxPower",
    "tpcEnable",
    "maxAgcTrackingEnabled",
    "maxAgcTrackingMargindB",
    "linkImpairmentDetectionEnable",
    "latpcLinkImpairConfig",
    "mcs",
    "measSlotEnable",
    "crsScale",
];

/// Parameters that both link ends must apply in the same BWGD.
const SYNC_SENSITIVE_FW_PARAMS: &[&str] = &["mcs", "measSlotEnable", "crsScale"];

/// Static metadata registry: config path prefix -> actions.
///
/// Override paths (`radioParamsOverride.<mac>.…`, `linkParamsOverride.<mac>.…`)
/// are normalized before lookup by dropping the MAC segment.
pub struct ConfigMetadata {
    /// Longest-prefix-match table.
    table: BTreeMap<String, Vec<CfgAction>>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let mut table: BTreeMap<String, Vec<CfgAction>> = BTreeMap::new();
        let mut add = |prefix: &str, actions: &[CfgAction]| {
            table.insert(prefix.to_string(), actions.to_vec());
        };

        add("envParams.DPDK_ENABLED", &[CfgAction::Reboot]);
        add("envParams.OPENR_ENABLED", &[CfgAction::Reboot]);
        add("envParams.MINION_VERBOSE", &[CfgAction::UpdateGlogLevel]);
        add("envParams.TIMEZONE", &[CfgAction::SymlinkTimezone]);
        add("kernelParams", &[CfgAction::Reboot]);
        add("timingParams", &[CfgAction::RestartMinion]);

        add("sysParams.ntpServers", &[CfgAction::ReloadNtpConfig]);
        add("sysParams.dnsServers", &[CfgAction::ReloadDnsServers]);
        add("sysParams.sshTrustedUserCAKeys", &[CfgAction::ReloadSshdCaKeys]);
        add("sysParams.allowFactoryCA", &[CfgAction::ReloadSshd]);
        add("sysParams.firewallConfig", &[CfgAction::ReloadFirewall]);

        add("syslogParams", &[CfgAction::ReloadRsyslogConfig]);
        add("statsAgentParams", &[CfgAction::RestartStatsAgent]);
        add("logTailParams", &[CfgAction::RestartLogtail]);
        add("fluentdParams", &[CfgAction::RestartFluentdAgent]);
        add("snmpConfig", &[CfgAction::RestartSnmp]);
        add("webuiParams", &[CfgAction::RestartWebui]);
        add("dhcpParams", &[CfgAction::RestartDhcp]);
        add("udpPingServerParams", &[CfgAction::RestartUdpPingServer]);

        add(
            "openrParams.linkMetricConfig",
            &[CfgAction::UpdateLinkMetrics],
        );
        add("openrParams.linkFlapBackoff", &[CfgAction::SyncLinkMonitor]);
        add("openrParams", &[CfgAction::RestartRouting]);
        add("popParams", &[CfgAction::RedoPopConfig]);
        add("bgpParams", &[CfgAction::RedoPopConfig]);
        add("kvstoreParams", &[CfgAction::InjectKvstoreKeys]);

        add("fwStatsConfig", &[CfgAction::SetFwStatsConfig]);
        add("airtimeAllocMap", &[CfgAction::SetAirtimeParams]);
        add("topologyInfo", &[CfgAction::NoAction]);

        // Runtime-patchable firmware parameters; anything else under
        // fwParams requires a firmware reload. Keys that must change on
        // both link ends in the same BWGD use the synchronized variant.
        for key in RUNTIME_SETTABLE_FW_PARAMS {
            let action = if SYNC_SENSITIVE_FW_PARAMS.contains(key) {
                CfgAction::SetFwParamsSyncOrReloadFirmware
            } else {
                CfgAction::SetFwParams
            };
            add(&format!("radioParamsBase.fwParams.{}", key), &[action]);
            add(&format!("radioParamsOverride.fwParams.{}", key), &[action]);
            add(&format!("linkParamsBase.fwParams.{}", key), &[action]);
            add(&format!("linkParamsOverride.fwParams.{}", key), &[action]);
        }
        add("radioParamsBase.fwParams", &[CfgAction::ReloadFirmware]);
        add("radioParamsOverride.fwParams", &[CfgAction::ReloadFirmware]);
        add("linkParamsBase.fwParams", &[CfgAction::ReloadFirmware]);
        add("linkParamsOverride.fwParams", &[CfgAction::ReloadFirmware]);

        Self { table }
    }
}

impl ConfigMetadata {
    /// Load a registry from a JSON metadata file
    /// (`{"<path-prefix>": ["ACTION", ...], ...}`), falling back to the
    /// built-in table for unlisted prefixes.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut meta = Self::default();
        let raw = std::fs::read_to_string(path)?;
        let parsed: BTreeMap<String, Vec<CfgAction>> = serde_json::from_str(&raw)?;
        for (prefix, actions) in parsed {
            meta.table.insert(prefix, actions);
        }
        Ok(meta)
    }

    /// Drop the MAC segment from override paths so the registry matches.
    fn normalize_path(path: &str) -> String {
        let mut tokens: Vec<&str> = path.split('.').collect();
        if tokens.len() >= 2
            && (tokens[0] == "radioParamsOverride" || tokens[0] == "linkParamsOverride")
        {
            tokens.remove(1);
        }
        tokens.join(".")
    }

    /// Actions for one changed path (longest matching prefix wins).
    pub fn actions_for_path(&self, path: &str) -> Vec<CfgAction> {
        let normalized = Self::normalize_path(path);
        let mut best: Option<(&String, &Vec<CfgAction>)> = None;
        for (prefix, actions) in &self.table {
            let matches = normalized == *prefix
                || normalized.starts_with(&format!("{}.", prefix));
            if matches {
                match best {
                    Some((cur, _)) if cur.len() >= prefix.len() => {}
                    _ => best = Some((prefix, actions)),
                }
            }
        }
        best.map(|(_, a)| a.clone()).unwrap_or_default()
    }

    /// Compute the action set for a list of changed paths: action -> the
    /// paths that implied it.
    pub fn get_actions(&self, changed_paths: &[String]) -> BTreeMap<CfgAction, Vec<String>> {
        let mut out: BTreeMap<CfgAction, Vec<String>> = BTreeMap::new();
        for path in changed_paths {
            for action in self.actions_for_path(path) {
                out.entry(action).or_default().push(path.clone());
            }
        }
        out.remove(&CfgAction::NoAction);
        out
    }
}

/// Order actions for execution (most severe first) and drop actions that a
/// scheduled reboot or minion restart makes redundant.
pub fn ordered_effects(actions: &BTreeMap<CfgAction, Vec<String>>) -> Vec<CfgAction> {
    let mut list: Vec<CfgAction> = actions.keys().copied().collect();
    list.sort_by(|a, b| b.severity().cmp(&a.severity()));

    if list.contains(&CfgAction::Reboot) {
        // Reboot supersedes everything.
        return vec![CfgAction::Reboot];
    }
    let restarting = list.contains(&CfgAction::RestartMinion);
    if restarting {
        list.retain(|a| !a.subsumed_by_restart());
    }
    list
}
