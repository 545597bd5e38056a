//! Runtime firmware parameter patching.
//!
//! When a config change only touches runtime-settable firmware parameters,
//! the minion patches the running firmware instead of restarting it. Changed
//! keys are split by scope (`radioParamsBase`, `radioParamsOverride.<mac>`,
//! `linkParamsBase`, `linkParamsOverride.<mac>`) and turned into one
//! `FwConfigParams` per radio, carrying an ordered sequence of SetFwParams
//! PassThru messages.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::driver::passthru::{
    FwOptParams, PassThruBody, PassThruMsg, PtMsgDest, SetFwParamsReq, EMPTY_MAC_ADDRESS,
};
use crate::messages::FwConfigParams;
use crate::topology::standardize_mac;

use super::merge::{get_path, merge};

/// Firmware scheduler pool bound: a scheduled (BWGD-stamped) patch may hold
/// at most this many PassThru messages per radio. Overflow escalates to a
/// firmware reload.
pub const MAX_FW_RUNTIME_CFG_POOL_SIZE: usize = 2;

/// Effective firmware params for a radio: base deep-merged with the
/// per-radio override.
pub fn radio_fw_params(config: &Value, radio_mac: &str) -> FwOptParams {
    scoped_fw_params(config, "radioParamsBase", "radioParamsOverride", radio_mac)
}

/// Effective firmware params for a link peer: base deep-merged with the
/// per-peer override.
pub fn link_fw_params(config: &Value, peer_mac: &str) -> FwOptParams {
    scoped_fw_params(config, "linkParamsBase", "linkParamsOverride", peer_mac)
}

fn scoped_fw_params(config: &Value, base_key: &str, override_key: &str, mac: &str) -> FwOptParams {
    let mut merged = get_path(config, &format!("{}.fwParams", base_key))
        .cloned()
        .unwrap_or(Value::Null);
    if let Some(overlay) = get_path(config, &format!("{}.{}.fwParams", override_key, mac)) {
        if merged.is_null() {
            merged = Value::Object(Default::default());
        }
        merge(&mut merged, overlay);
    }
    let mut params = FwOptParams::new();
    if let Value::Object(map) = merged {
        for (k, v) in map {
            if let Some(n) = v.as_i64() {
                params.insert(k, n);
            }
        }
    }
    params
}

/// Whether any changed key actually touches a known radio or link peer.
/// Changes scoped to unknown MACs (or to link params on a node with no
/// peers) are no-ops.
pub fn affects_links_or_radios(keys: &[String], radios: &[String], peers: &[String]) -> bool {
    for full_key in keys {
        let tokens: Vec<&str> = full_key.split('.').collect();
        match tokens.first().copied() {
            Some("linkParamsBase") => {
                if !peers.is_empty() {
                    return true;
                }
            }
            Some("radioParamsBase") => {
                if !radios.is_empty() {
                    return true;
                }
            }
            Some(cfg @ ("radioParamsOverride" | "linkParamsOverride")) => {
                let Some(raw_mac) = tokens.get(1) else {
                    continue;
                };
                let Ok(mac) = standardize_mac(raw_mac) else {
                    tracing::error!(key = %full_key, "failed to parse MAC in override path");
                    continue;
                };
                let known = if cfg == "linkParamsOverride" {
                    peers.contains(&mac)
                } else {
                    radios.contains(&mac)
                };
                if known {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Build per-radio firmware patch requests for the given changed keys.
///
/// Radio-scoped parameters target the all-zero MAC (the radio itself);
/// link-scoped parameters produce one message per affected peer. The
/// current value is always read back from the supplied effective config, so
/// a key that was removed falls back to its base-layer value.
pub fn fw_params_for_config(
    config: &Value,
    keys: &[String],
    bwgd_idx: Option<u64>,
    radios: &[String],
    peers: &[String],
) -> BTreeMap<String, FwConfigParams> {
    // Per-radio and per-peer parameter accumulation.
    let mut radio_param_map: BTreeMap<String, FwOptParams> = BTreeMap::new();
    let mut link_param_map: BTreeMap<String, FwOptParams> = BTreeMap::new();

    for full_key in keys {
        let tokens: Vec<&str> = full_key.split('.').collect();
        let Some(cfg) = tokens.first().copied() else {
            continue;
        };
        let Some(key) = tokens.last().copied() else {
            continue;
        };

        let mac = if cfg == "radioParamsOverride" || cfg == "linkParamsOverride" {
            // "<scope>.<mac>.fwParams.<key>"
            if tokens.len() < 4 {
                continue;
            }
            match tokens.get(1).map(|m| standardize_mac(m)) {
                Some(Ok(mac)) => mac,
                _ => {
                    tracing::error!(key = %full_key, "failed to parse MAC in override path");
                    continue;
                }
            }
        } else {
            // "<scope>.fwParams.<key>"
            if tokens.len() < 3 {
                continue;
            }
            String::new()
        };

        match cfg {
            "radioParamsBase" => {
                for radio in radios {
                    let params = radio_fw_params(config, radio);
                    if let Some(val) = params.get(key) {
                        radio_param_map
                            .entry(radio.clone())
                            .or_default()
                            .insert(key.to_string(), *val);
                    }
                }
            }
            "radioParamsOverride" => {
                if !radios.contains(&mac) {
                    tracing::error!(%mac, "ignoring radioParamsOverride for unknown MAC");
                    continue;
                }
                let params = radio_fw_params(config, &mac);
                if let Some(val) = params.get(key) {
                    radio_param_map
                        .entry(mac.clone())
                        .or_default()
                        .insert(key.to_string(), *val);
                }
            }
            "linkParamsBase" => {
                for peer in peers {
                    let params = link_fw_params(config, peer);
                    if let Some(val) = params.get(key) {
                        link_param_map
                            .entry(peer.clone())
                            .or_default()
                            .insert(key.to_string(), *val);
                    }
                }
            }
            "linkParamsOverride" => {
                let params = link_fw_params(config, &mac);
                if let Some(val) = params.get(key) {
                    link_param_map
                        .entry(mac.clone())
                        .or_default()
                        .insert(key.to_string(), *val);
                }
            }
            _ => {}
        }
    }

    // One FwConfigParams per radio: its own radio-scoped message (empty MAC)
    // plus one message per link peer. Link params go to every radio; the
    // firmware ignores peers it does not carry.
    let mut cookie: u32 = 0;
    let mut reqs = BTreeMap::new();
    for radio in radios {
        let mut pass_thru_msgs = Vec::new();
        if let Some(params) = radio_param_map.get(radio) {
            if !params.is_empty() {
                cookie += 1;
                pass_thru_msgs.push(PassThruMsg {
                    cookie,
                    dest: PtMsgDest::Sb,
                    body: PassThruBody::SetFwParamsReq(SetFwParamsReq {
                        addr: EMPTY_MAC_ADDRESS.into(),
                        bwgd_idx,
                        optional_params: params.clone(),
                    }),
                });
            }
        }
        for (peer, params) in &link_param_map {
            if params.is_empty() {
                continue;
            }
            cookie += 1;
            pass_thru_msgs.push(PassThruMsg {
                cookie,
                dest: PtMsgDest::Sb,
                body: PassThruBody::SetFwParamsReq(SetFwParamsReq {
                    addr: peer.clone(),
                    bwgd_idx,
                    optional_params: params.clone(),
                }),
            });
        }
        if !pass_thru_msgs.is_empty() {
            reqs.insert(radio.clone(), FwConfigParams { pass_thru_msgs });
        }
    }
    reqs
}

/// Whether a scheduled patch fits the firmware scheduler pool.
pub fn fits_fw_scheduler_pool(reqs: &BTreeMap<String, FwConfigParams>) -> bool {
    reqs.values()
        .all(|r| r.pass_thru_msgs.len() <= MAX_FW_RUNTIME_CFG_POOL_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RADIO: &str = "aa:bb:cc:00:00:10";
    const PEER_A: &str = "aa:bb:cc:00:00:20";
    const PEER_B: &str = "aa:bb:cc:00:00:21";

    fn config() -> Value {
        json!({
            "radioParamsBase": {"fwParams": {"txPower": 28, "maxAgcTrackingEnabled": 1}},
            "radioParamsOverride": {
                RADIO: {"fwParams": {"txPower": 21}}
            },
            "linkParamsBase": {"fwParams": {"laMaxMcs": 10, "laMinMcs": 2}},
            "linkParamsOverride": {
                PEER_B: {"fwParams": {"laMaxMcs": 9}}
            }
        })
    }

    #[test]
    fn test_radio_params_override_wins() {
        let params = radio_fw_params(&config(), RADIO);
        assert_eq!(params.get("txPower"), Some(&21));
        assert_eq!(params.get("maxAgcTrackingEnabled"), Some(&1));
        // A radio without an override sees the base.
        let params = radio_fw_params(&config(), "aa:bb:cc:00:00:11");
        assert_eq!(params.get("txPower"), Some(&28));
    }

    #[test]
    fn test_link_params_base_change_fans_to_all_peers() {
        let keys = vec!["linkParamsBase.fwParams.laMaxMcs".to_string()];
        let radios = vec![RADIO.to_string()];
        let peers = vec![PEER_A.to_string(), PEER_B.to_string()];
        let reqs = fw_params_for_config(&config(), &keys, None, &radios, &peers);

        let params = &reqs[RADIO].pass_thru_msgs;
        assert_eq!(params.len(), 2);
        let by_addr: BTreeMap<&str, &PassThruMsg> = params
            .iter()
            .map(|m| match &m.body {
                PassThruBody::SetFwParamsReq(req) => (req.addr.as_str(), m),
                other => panic!("unexpected body {:?}", other),
            })
            .collect();
        // Peer A keeps the base value, peer B its override.
        match &by_addr[PEER_A].body {
            PassThruBody::SetFwParamsReq(req) => {
                assert_eq!(req.optional_params.get("laMaxMcs"), Some(&10));
                assert_eq!(req.bwgd_idx, None);
            }
            _ => unreachable!(),
        }
        match &by_addr[PEER_B].body {
            PassThruBody::SetFwParamsReq(req) => {
                assert_eq!(req.optional_params.get("laMaxMcs"), Some(&9));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_radio_scoped_change_targets_empty_mac() {
        let keys = vec!["radioParamsBase.fwParams.txPower".to_string()];
        let radios = vec![RADIO.to_string()];
        let reqs = fw_params_for_config(&config(), &keys, Some(1000), &radios, &[]);
        let msgs = &reqs[RADIO].pass_thru_msgs;
        assert_eq!(msgs.len(), 1);
        match &msgs[0].body {
            PassThruBody::SetFwParamsReq(req) => {
                assert_eq!(req.addr, EMPTY_MAC_ADDRESS);
                assert_eq!(req.optional_params.get("txPower"), Some(&21));
                assert_eq!(req.bwgd_idx, Some(1000));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_unknown_override_mac_ignored() {
        let keys = vec!["radioParamsOverride.ff:ff:ff:ff:ff:01.fwParams.txPower".to_string()];
        let radios = vec![RADIO.to_string()];
        let reqs = fw_params_for_config(&config(), &keys, None, &radios, &[]);
        assert!(reqs.is_empty());
    }

    #[test]
    fn test_affects_links_or_radios() {
        let radios = vec![RADIO.to_string()];
        let peers = vec![PEER_A.to_string()];
        assert!(affects_links_or_radios(
            &["linkParamsBase.fwParams.laMaxMcs".into()],
            &radios,
            &peers
        ));
        assert!(!affects_links_or_radios(
            &["linkParamsBase.fwParams.laMaxMcs".into()],
            &radios,
            &[]
        ));
        assert!(affects_links_or_radios(
            &[format!("radioParamsOverride.{}.fwParams.txPower", RADIO)],
            &radios,
            &peers
        ));
        assert!(!affects_links_or_radios(
            &["radioParamsOverride.ff:ff:ff:ff:ff:02.fwParams.txPower".into()],
            &radios,
            &peers
        ));
    }

    #[test]
    fn test_scheduler_pool_bound() {
        let keys = vec!["linkParamsBase.fwParams.laMaxMcs".to_string()];
        let radios = vec![RADIO.to_string()];
        // Three peers -> three messages per radio -> exceeds the pool of 2.
        let peers = vec![
            PEER_A.to_string(),
            PEER_B.to_string(),
            "aa:bb:cc:00:00:22".to_string(),
        ];
        let reqs = fw_params_for_config(&config(), &keys, Some(500), &radios, &peers);
        assert!(!fits_fw_scheduler_pool(&reqs));

        let reqs = fw_params_for_config(&config(), &keys, Some(500), &radios, &peers[..2].to_vec());
        assert!(fits_fw_scheduler_pool(&reqs));
    }
}
