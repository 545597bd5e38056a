//! Firmware PassThru messages.
//!
//! PassThru is the opaque command/response format tunneled through the
//! netlink driver to the vendor firmware. The vendor ABI bounds a single
//! message to [`MAX_PASS_THRU_SIZE`] bytes; the encoder enforces the cap so
//! an oversized message fails at the sender instead of inside the driver.
//!
//! Messages sharing a cookie must be dispatched exactly once and in order;
//! the cookie is assigned by the sending app and echoed back in responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vendor ABI limit for one serialized PassThru message.
pub const MAX_PASS_THRU_SIZE: usize = 1000;

/// The all-zero MAC targets the radio itself rather than a link peer.
pub const EMPTY_MAC_ADDRESS: &str = "00:00:00:00:00:00";

/// Message direction: southbound (towards firmware) or northbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PtMsgDest {
    Sb,
    Nb,
}

/// Optional firmware parameters, keyed by parameter name.
///
/// The firmware treats every tunable as an integer; unknown keys are
/// rejected with a negative ack.
pub type FwOptParams = BTreeMap<String, i64>;

/// Runtime firmware parameter update for one peer (or the radio itself when
/// `addr` is [`EMPTY_MAC_ADDRESS`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFwParamsReq {
    /// Link peer MAC, or the empty MAC for radio-scoped parameters.
    pub addr: String,
    /// BWGD index at which to apply. Absent means immediate; any explicit
    /// value is future-scheduled by the firmware.
    pub bwgd_idx: Option<u64>,
    pub optional_params: FwOptParams,
}

/// Response to [`SetFwParamsReq`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFwParamsResp {
    pub status: bool,
    pub bwgd_idx: u64,
}

/// Firmware stats subsystem on/off switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfigure {
    pub configs: BTreeMap<String, bool>,
    pub on_duty_cycle_ms: i64,
    pub off_duty_cycle_ms: i64,
}

/// Firmware debug command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwDebugReq {
    pub cmd_str: String,
    pub value: i64,
}

/// Firmware logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLogConfig {
    /// Module name -> verbosity level.
    pub configs: BTreeMap<String, i64>,
}

/// The PassThru body variants this plane produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassThruBody {
    SetFwParamsReq(SetFwParamsReq),
    SetFwParamsResp(SetFwParamsResp),
    StatsConfigure(StatsConfigure),
    FwDebugReq(FwDebugReq),
    SetLogConfig(SetLogConfig),
}

/// One framed PassThru message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassThruMsg {
    pub cookie: u32,
    pub dest: PtMsgDest,
    pub body: PassThruBody,
}

/// Errors from the PassThru codec.
#[derive(Debug, thiserror::Error)]
pub enum PassThruError {
    #[error("serialized PassThru message is {size} bytes, exceeds {MAX_PASS_THRU_SIZE}")]
    TooLarge { size: usize },
    #[error("PassThru encode failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("PassThru decode failed: {0}")]
    Decode(#[source] bincode::Error),
}

/// Encode a PassThru message, enforcing the vendor size cap.
pub fn encode(msg: &PassThruMsg) -> Result<Vec<u8>, PassThruError> {
    let buf = bincode::serialize(msg).map_err(PassThruError::Encode)?;
    if buf.len() > MAX_PASS_THRU_SIZE {
        return Err(PassThruError::TooLarge { size: buf.len() });
    }
    Ok(buf)
}

/// Decode a PassThru message.
pub fn decode(buf: &[u8]) -> Result<PassThruMsg, PassThruError> {
    bincode::deserialize(buf).map_err(PassThruError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_fw_params_msg(n_params: usize) -> PassThruMsg {
        let mut params = FwOptParams::new();
        for i in 0..n_params {
            params.insert(format!("param{}", i), i as i64);
        }
        PassThruMsg {
            cookie: 7,
            dest: PtMsgDest::Sb,
            body: PassThruBody::SetFwParamsReq(SetFwParamsReq {
                addr: EMPTY_MAC_ADDRESS.into(),
                bwgd_idx: Some(123_456),
                optional_params: params,
            }),
        }
    }

    #[test]
    fn test_round_trip() {
        let msg = set_fw_params_msg(4);
        let buf = encode(&msg).unwrap();
        let back = decode(&buf).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_round_trip_all_variants() {
        let msgs = vec![
            set_fw_params_msg(1),
            PassThruMsg {
                cookie: 1,
                dest: PtMsgDest::Nb,
                body: PassThruBody::SetFwParamsResp(SetFwParamsResp {
                    status: true,
                    bwgd_idx: 99,
                }),
            },
            PassThruMsg {
                cookie: 2,
                dest: PtMsgDest::Sb,
                body: PassThruBody::StatsConfigure(StatsConfigure {
                    configs: BTreeMap::from([("TGF_STATS_BF".into(), true)]),
                    on_duty_cycle_ms: 100,
                    off_duty_cycle_ms: 900,
                }),
            },
            PassThruMsg {
                cookie: 3,
                dest: PtMsgDest::Sb,
                body: PassThruBody::FwDebugReq(FwDebugReq {
                    cmd_str: "d".into(),
                    value: 1,
                }),
            },
            PassThruMsg {
                cookie: 4,
                dest: PtMsgDest::Sb,
                body: PassThruBody::SetLogConfig(SetLogConfig {
                    configs: BTreeMap::from([("default".into(), 2)]),
                }),
            },
        ];
        for msg in msgs {
            let buf = encode(&msg).unwrap();
            assert_eq!(decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn test_size_cap_enforced() {
        // Enough parameters to blow the 1000-byte vendor bound.
        let msg = set_fw_params_msg(200);
        match encode(&msg) {
            Err(PassThruError::TooLarge { size }) => assert!(size > MAX_PASS_THRU_SIZE),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        // A length prefix pointing far past the buffer must not panic.
        let garbage = vec![0xffu8; 16];
        assert!(decode(&garbage).is_err());
    }
}
