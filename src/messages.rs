//! Message schema for the E2E control plane.
//!
//! Every payload that crosses the bus (controller app <-> controller app,
//! controller <-> minion, minion app <-> driver) is a variant of the closed
//! [`Message`] enum. Envelopes carry a bincode-serialized `Message`; apps
//! never see raw bytes.
//!
//! Naming follows the subsystem that owns the request: `*Req` flows toward
//! the owner, the unsuffixed or `*Resp` form flows back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::driver::passthru::PassThruMsg;
use crate::nodecfg::actions::CfgAction;
use crate::topology::model::{GolayIdx, Location, NodeType, Polarity, Topology};

// =============================================================================
// Well-known app ids
// =============================================================================

/// Stable string identities for apps on the message plane.
pub mod appid {
    pub const CTRL_BROKER: &str = "ctrl-app-BROKER";
    pub const CTRL_STATUS: &str = "ctrl-app-STATUS_APP";
    pub const CTRL_TOPOLOGY: &str = "ctrl-app-TOPOLOGY_APP";
    pub const CTRL_IGNITION: &str = "ctrl-app-IGNITION_APP";
    pub const CTRL_CONFIG: &str = "ctrl-app-CONFIG_APP";
    pub const CTRL_UPGRADE: &str = "ctrl-app-UPGRADE_APP";
    pub const CTRL_SCAN: &str = "ctrl-app-SCAN_APP";
    pub const CTRL_SCHEDULER: &str = "ctrl-app-SCHEDULER_APP";
    pub const CTRL_BINARY_STAR: &str = "ctrl-app-BINARYSTAR_APP";

    pub const MINION_BROKER: &str = "minion-app-BROKER";
    pub const MINION_STATUS: &str = "minion-app-STATUS_APP";
    pub const MINION_CONFIG: &str = "minion-app-CONFIG_APP";
    pub const MINION_IGNITION: &str = "minion-app-IGNITION_APP";
    pub const MINION_UPGRADE: &str = "minion-app-UPGRADE_APP";
    pub const MINION_DRIVER: &str = "minion-app-DRIVER_APP";
    pub const MINION_OPENR_CLIENT: &str = "minion-app-OPENR_CLIENT_APP";
    pub const MINION_TRAFFIC: &str = "minion-app-TRAFFIC_APP";

    /// Prefix for NMS/API client identities on the apps port.
    pub const API_CLIENT_PREFIX: &str = "api-client-";
}

// =============================================================================
// Common
// =============================================================================

/// Generic success/failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2eAck {
    pub success: bool,
    pub message: String,
}

impl E2eAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// What kind of peer is registering on a broker socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    Minion,
    ApiClient,
}

// =============================================================================
// Status
// =============================================================================

/// Per-radio state as reported by the minion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioStatus {
    pub initialized: bool,
    pub gps_sync: bool,
    pub vendor: Option<String>,
}

/// One BGP neighbor as seen from a POP node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpInfo {
    pub online: bool,
    pub asn: i64,
    pub advertised_routes: u32,
    pub received_routes: u32,
}

/// Software upgrade state of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStatusType {
    #[default]
    None,
    DownloadingImage,
    DownloadFailed,
    FlashingImage,
    FlashFailed,
    Flashed,
    CommitPending,
}

/// Metadata trailer embedded in an upgrade image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub md5: String,
    pub version: String,
    pub model: String,
    #[serde(default)]
    pub hardware_board_ids: Vec<String>,
}

/// A node's upgrade state, carried in every status report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub us_type: UpgradeStatusType,
    pub next_image: ImageMeta,
    pub reason: String,
    pub upgrade_req_id: String,
    /// Unix time (seconds) at which a scheduled commit fires; 0 if none.
    pub when_to_commit: i64,
}

/// Heartbeat from minion StatusApp to controller StatusApp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Minion-local timestamp (ms since its epoch); monotone per minion.
    pub timestamp_ms: i64,
    pub status: crate::topology::model::NodeStatus,
    pub upgrade_status: UpgradeStatus,
    pub config_md5: String,
    pub radio_status: BTreeMap<String, RadioStatus>,
    pub neighbor_conn_status: BTreeMap<String, bool>,
    pub bgp_status: Option<BTreeMap<String, BgpInfo>>,
    #[serde(default)]
    pub wired_interface_macs: Vec<String>,
    // Constant fields, only populated in a full report.
    pub version: Option<String>,
    pub uboot_version: Option<String>,
    pub hardware_model: Option<String>,
    pub hardware_board_id: Option<String>,
}

/// Controller's acknowledgement of a status report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReportAck {
    /// Ask the minion to include constant fields in its next report.
    pub request_full: bool,
}

/// Dump of the latest status report per node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDump {
    pub reports: BTreeMap<String, StatusReport>,
    /// Controller software version.
    pub version: String,
}

/// PHY parameters pushed to a node when it comes online.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeParams {
    pub polarity: Option<Polarity>,
    pub golay_idx: Option<GolayIdx>,
    pub channel: Option<i64>,
    pub airtime_alloc_map: Option<BTreeMap<String, i64>>,
}

// =============================================================================
// Ignition
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatusType {
    LinkUp,
    LinkDown,
}

/// Manual or API-driven link action (validated by controller IgnitionApp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLinkStatusReq {
    pub action: LinkStatusType,
    pub link_name: String,
    /// Preferred initiator node; defaults to the A endpoint if unset.
    pub initiator_node: Option<String>,
}

/// Ignition command from controller to a minion IgnitionApp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetLinkStatus {
    pub link_status_type: LinkStatusType,
    pub initiator_mac: String,
    pub responder_mac: String,
    pub responder_node_type: Option<NodeType>,
    pub responder_polarity: Option<Polarity>,
    pub golay_idx: Option<GolayIdx>,
    pub control_superframe: Option<i64>,
    pub channel: Option<i64>,
}

/// Link state report from a minion (driver-confirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub radio_mac: String,
    pub responder_mac: String,
    pub link_status_type: LinkStatusType,
}

/// Internal notification that the topology recorded a link state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatusEvent {
    pub link_name: String,
    pub link_status_type: LinkStatusType,
    /// Whether a node explicitly reported this change (as opposed to the
    /// controller inferring it from unreachability).
    pub node_reported: bool,
}

/// A candidate produced by one ignition pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnitionCandidate {
    pub initiator_node_name: String,
    pub initiator_radio_mac: String,
    pub responder_node_name: String,
    pub responder_radio_mac: String,
    pub link_name: String,
}

/// Network-wide ignition tunables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnitionParams {
    pub enable: Option<bool>,
    pub link_up_interval_s: Option<u64>,
    /// Per-link auto-ignition override (false disables auto attempts).
    #[serde(default)]
    pub link_auto_ignite: BTreeMap<String, bool>,
}

/// Snapshot of IgnitionApp state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnitionState {
    pub auto_ignition_enabled: bool,
    pub last_ig_candidates: Vec<IgnitionCandidate>,
    pub dampened_links: Vec<String>,
}

/// Fire-and-forget dissociation, bypassing topology validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceDissocReq {
    pub initiator_mac: String,
    pub responder_mac: String,
}

// =============================================================================
// Topology ops
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNodeReq {
    pub node: crate::topology::model::Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelNodeReq {
    pub node_name: String,
    /// Delete even if the node is alive or has live links.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditNodeReq {
    pub node_name: String,
    pub new_node: crate::topology::model::Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddLinkReq {
    pub link: crate::topology::model::Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelLinkReq {
    pub a_node_name: String,
    pub z_node_name: String,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddSiteReq {
    pub site: crate::topology::model::Site,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelSiteReq {
    pub site_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSiteReq {
    pub site_name: String,
    pub new_site: crate::topology::model::Site,
}

/// Routing adjacency dump from a minion's KV store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingAdjacencies {
    /// Node id -> adjacent node ids.
    pub adjacency_map: BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Config
// =============================================================================

/// Full node config push from controller to minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMinionConfigReq {
    /// Effective config as canonical JSON.
    pub config: String,
    /// BWGD index for synchronized firmware parameter application.
    pub bwgd_idx: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMinionConfigResp {
    pub config: String,
    pub config_md5: String,
}

/// Dry-run: which actions would a hypothetical config trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMinionConfigActionsReq {
    pub config: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMinionConfigActionsResp {
    pub actions: BTreeSet<CfgAction>,
    pub id: String,
}

/// NMS: fetch the effective config computed for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeConfigReq {
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeConfigResp {
    pub config: String,
    pub config_md5: String,
}

/// NMS: replace manual per-node overrides (JSON object keyed by node name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNodeOverridesReq {
    pub overrides: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeOverridesReq {
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeOverridesResp {
    pub overrides: String,
}

/// NMS: replace network-wide overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNetworkOverridesReq {
    pub overrides: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNetworkOverridesResp {
    pub overrides: String,
}

/// Runtime firmware parameter patch for one radio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwConfigParams {
    pub pass_thru_msgs: Vec<PassThruMsg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwConfigResp {
    pub radio_mac: String,
    pub success: bool,
}

// =============================================================================
// Upgrade
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeReqType {
    PrepareUpgrade,
    CommitUpgrade,
    ResetStatus,
    FullUpgrade,
}

/// Group upgrade request (NMS -> controller UpgradeApp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeGroupReq {
    pub ur_type: UpgradeReqType,
    pub upgrade_req_id: String,
    /// Target nodes; empty means the whole network.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub exclude_nodes: Vec<String>,
    /// Image name in the controller image store (PREPARE/FULL).
    pub image_name: String,
    /// Expected image MD5; also the commit target identity.
    pub md5: String,
    /// Target software version string.
    pub version: String,
    /// Per-batch timeout in seconds.
    pub timeout_s: u64,
    pub skip_failure: bool,
    /// Wireless links excluded from the commit liveness precondition.
    #[serde(default)]
    pub skip_links: Vec<String>,
    /// Max nodes per batch; 0 means unbounded.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub retry_limit: u32,
    /// For FULL upgrades: delay between flash and commit, in seconds.
    pub schedule_to_commit: Option<u64>,
}

/// Upgrade command (controller -> minion UpgradeApp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeReq {
    pub ur_type: UpgradeReqType,
    pub upgrade_req_id: String,
    pub md5: String,
    /// `http(s)://` or `magnet:` URI of the image.
    pub image_url: String,
    /// Seconds until a scheduled commit fires (0 = immediate).
    pub schedule_to_commit: u64,
    /// Download deadline in seconds.
    pub download_timeout_s: u64,
}

/// An image staged in the controller's store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeImage {
    pub name: String,
    pub md5: String,
    pub http_uri: String,
    #[serde(default)]
    pub hardware_board_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAddImageReq {
    /// Where the controller fetches the image from (http(s) or file path).
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDelImageReq {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeListImagesResp {
    pub images: Vec<UpgradeImage>,
}

/// Abort in-flight and/or queued upgrade requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAbortReq {
    pub abort_all: bool,
    #[serde(default)]
    pub req_ids: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// Controller upgrade FSM snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStateDump {
    pub cur_batch: Vec<String>,
    pub pending_batches: Vec<Vec<String>>,
    pub cur_req: Option<UpgradeGroupReq>,
    pub pending_reqs: Vec<UpgradeGroupReq>,
}

/// Fleet-wide target image; drifted nodes are reconciled in the background.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenImage {
    pub enabled: bool,
    pub version: String,
    pub image_name: String,
    #[serde(default)]
    pub node_blacklist: Vec<String>,
}

// =============================================================================
// Scan / Scheduler
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Pbf,
    Rtcal,
    Im,
    Cbf,
    Topo,
}

/// Scan command fanned out to each participating radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReq {
    pub scan_id: u64,
    pub token: u32,
    pub scan_type: ScanType,
    pub start_bwgd_idx: u64,
    pub radio_mac: String,
    pub is_tx: bool,
    pub peer_mac: Option<String>,
}

/// Partial topology-scan frame from one responder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopoResponderInfo {
    pub responder_mac: String,
    pub pos: Option<Location>,
    /// Adjacent MACs heard during the sweep.
    #[serde(default)]
    pub adjs: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResp {
    pub scan_id: u64,
    pub token: u32,
    pub radio_mac: String,
    pub success: bool,
    /// Set on the final frame from this radio.
    pub complete: bool,
    pub topo_info: Option<TopoResponderInfo>,
}

/// NMS: kick off a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartScanReq {
    pub scan_type: ScanType,
    /// Tx node for directional scans; None for network-wide TOPO scans.
    pub tx_node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanData {
    pub scan_type: Option<ScanType>,
    pub start_bwgd_idx: u64,
    pub complete: bool,
    pub responses: BTreeMap<String, ScanResp>,
    pub topo_responders: BTreeMap<String, TopoResponderInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetScanStatusReq {
    pub scan_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub scans: BTreeMap<u64, ScanData>,
}

/// BWGD slot arbitration (ScanApp -> SchedulerApp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSlotReq {
    pub scan_type: ScanType,
    /// Requested slot length in BWGDs.
    pub duration_bwgd: u64,
    /// Correlation id echoed back in the response.
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSlotResp {
    pub id: u64,
    pub bwgd_idx: u64,
}

// =============================================================================
// Traffic
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMinionPingReq {
    pub dest_ip: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMinionIperfReq {
    pub dest_ip: String,
    pub time_s: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficResult {
    pub success: bool,
    pub output: String,
}

// =============================================================================
// Driver plane (minion-local)
// =============================================================================

/// Which request an [`FwAck`] acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FwReqType {
    SetLinkStatus,
    FwConfig,
    GpsEnable,
    NodeParams,
    StatsConfigure,
    Scan,
}

/// Generic firmware acknowledgement surfaced by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwAck {
    pub radio_mac: String,
    pub req_type: FwReqType,
    pub success: bool,
}

/// Driver-level ignition command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSetLinkStatus {
    pub radio_mac: String,
    pub is_assoc: bool,
    pub responder_mac: String,
    pub responder_node_type: Option<NodeType>,
    pub golay_idx: Option<GolayIdx>,
    pub control_superframe: Option<i64>,
}

/// Driver-confirmed link state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverLinkStatus {
    pub radio_mac: String,
    pub responder_mac: String,
    pub link_status_type: LinkStatusType,
}

/// Radio init acknowledgement from firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInitNotify {
    pub radio_mac: String,
    pub success: bool,
    pub vendor: String,
}

/// Baseband device up/down notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUpDownStatus {
    pub radio_mac: String,
    pub up: bool,
}

// =============================================================================
// HA
// =============================================================================

/// Binary Star FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryStarFsmState {
    Primary,
    Backup,
    Active,
    Passive,
}

/// Replicated persistent data (ACTIVE -> PASSIVE peer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryStarAppData {
    pub seq_num: u64,
    pub topology: Option<Topology>,
    pub node_overrides: Option<String>,
    pub network_overrides: Option<String>,
}

// =============================================================================
// The union
// =============================================================================

/// Every message type on the plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Common
    E2eAck(E2eAck),
    DealerEcho,
    Hello { node_id: String, kind: PeerKind },

    // Status
    StatusReport(StatusReport),
    StatusReportAck(StatusReportAck),
    GetStatusDump,
    StatusDump(StatusDump),
    SetNodeParams(NodeParams),
    RebootNode { force: bool, delay_s: u64 },
    RestartMinion { delay_s: u64 },
    UpdateLinkMetrics,

    // Topology
    GetTopology,
    TopologyResp(Topology),
    AddNode(AddNodeReq),
    DelNode(DelNodeReq),
    EditNode(EditNodeReq),
    AddLink(AddLinkReq),
    DelLink(DelLinkReq),
    AddSite(AddSiteReq),
    DelSite(DelSiteReq),
    EditSite(EditSiteReq),
    BumpLinkupAttempts { link_name: String },
    GetRoutingAdjacencies,
    RoutingAdjacencies(RoutingAdjacencies),

    // Ignition
    SetLinkStatusReq(SetLinkStatusReq),
    SetLinkStatus(SetLinkStatus),
    LinkStatus(LinkStatus),
    LinkStatusEvent(LinkStatusEvent),
    GetIgnitionState,
    IgnitionState(IgnitionState),
    SetIgnitionParams(IgnitionParams),
    ForceDissocReq(ForceDissocReq),

    // Config
    GetMinionConfigReq,
    GetMinionConfigResp(GetMinionConfigResp),
    SetMinionConfigReq(SetMinionConfigReq),
    GetMinionConfigActionsReq(GetMinionConfigActionsReq),
    GetMinionConfigActionsResp(GetMinionConfigActionsResp),
    GetNodeConfigReq(GetNodeConfigReq),
    GetNodeConfigResp(GetNodeConfigResp),
    SetNodeOverridesReq(SetNodeOverridesReq),
    GetNodeOverridesReq(GetNodeOverridesReq),
    GetNodeOverridesResp(GetNodeOverridesResp),
    SetNetworkOverridesReq(SetNetworkOverridesReq),
    GetNetworkOverridesReq,
    GetNetworkOverridesResp(GetNetworkOverridesResp),
    FwConfigReq { radio_mac: String, params: FwConfigParams },
    FwConfigResp(FwConfigResp),
    FwSetLogConfig { radio_mac: String, level: i64 },

    // Upgrade
    UpgradeGroupReq(UpgradeGroupReq),
    UpgradeReq(UpgradeReq),
    SetUpgradeStatus(UpgradeStatus),
    /// Download worker completion (minion UpgradeApp internal).
    UpgradeDownloadDone {
        success: bool,
        local_path: String,
        reason: String,
    },
    UpgradeStateReq,
    UpgradeStateDump(UpgradeStateDump),
    UpgradeAbortReq(UpgradeAbortReq),
    UpgradeAddImageReq(UpgradeAddImageReq),
    UpgradeDelImageReq(UpgradeDelImageReq),
    UpgradeListImagesReq,
    UpgradeListImagesResp(UpgradeListImagesResp),
    /// Staging worker completion (UpgradeApp internal).
    UpgradeImageStagedNotif {
        success: bool,
        image: UpgradeImage,
        reason: String,
    },
    SetGoldenImage(GoldenImage),
    GetGoldenImage,
    GoldenImageResp(GoldenImage),

    // Scan / Scheduler
    StartScanReq(StartScanReq),
    ScanReq(ScanReq),
    ScanResp(ScanResp),
    GetScanStatusReq(GetScanStatusReq),
    ScanStatus(ScanStatus),
    GetSlotReq(GetSlotReq),
    GetSlotResp(GetSlotResp),

    // Traffic
    StartMinionPing(StartMinionPingReq),
    StartMinionIperf(StartMinionIperfReq),
    TrafficResult(TrafficResult),

    // Driver plane
    NodeInit { radio_mac: String },
    NodeInitNotify(NodeInitNotify),
    GpsEnableReq { radio_mac: String },
    FwSetNodeParams { radio_mac: String, params: NodeParams },
    FwAck(FwAck),
    DriverSetLinkStatus(DriverSetLinkStatus),
    DriverLinkStatus(DriverLinkStatus),
    DevUpDownStatus(DevUpDownStatus),
    FwHealthReport { radio_mac: String, self_pet_count: u64 },

    // HA
    BinaryStarGetState,
    BinaryStarFsm { state: BinaryStarFsmState },
    BinaryStarAppData(BinaryStarAppData),
    BinaryStarGetAppData,
}

impl Message {
    /// Short name for logging, without payload contents.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::E2eAck(_) => "E2E_ACK",
            Message::DealerEcho => "DEALER_ECHO",
            Message::Hello { .. } => "HELLO",
            Message::StatusReport(_) => "STATUS_REPORT",
            Message::StatusReportAck(_) => "STATUS_REPORT_ACK",
            Message::GetStatusDump => "GET_STATUS_DUMP",
            Message::StatusDump(_) => "STATUS_DUMP",
            Message::SetNodeParams(_) => "SET_NODE_PARAMS",
            Message::RebootNode { .. } => "REBOOT_NODE",
            Message::RestartMinion { .. } => "RESTART_MINION",
            Message::UpdateLinkMetrics => "UPDATE_LINK_METRICS",
            Message::GetTopology => "GET_TOPOLOGY",
            Message::TopologyResp(_) => "TOPOLOGY_RESP",
            Message::AddNode(_) => "ADD_NODE",
            Message::DelNode(_) => "DEL_NODE",
            Message::EditNode(_) => "EDIT_NODE",
            Message::AddLink(_) => "ADD_LINK",
            Message::DelLink(_) => "DEL_LINK",
            Message::AddSite(_) => "ADD_SITE",
            Message::DelSite(_) => "DEL_SITE",
            Message::EditSite(_) => "EDIT_SITE",
            Message::BumpLinkupAttempts { .. } => "BUMP_LINKUP_ATTEMPTS",
            Message::GetRoutingAdjacencies => "GET_ROUTING_ADJACENCIES",
            Message::RoutingAdjacencies(_) => "ROUTING_ADJACENCIES",
            Message::SetLinkStatusReq(_) => "SET_LINK_STATUS_REQ",
            Message::SetLinkStatus(_) => "SET_LINK_STATUS",
            Message::LinkStatus(_) => "LINK_STATUS",
            Message::LinkStatusEvent(_) => "LINK_STATUS_EVENT",
            Message::GetIgnitionState => "GET_IGNITION_STATE",
            Message::IgnitionState(_) => "IGNITION_STATE",
            Message::SetIgnitionParams(_) => "SET_IGNITION_PARAMS",
            Message::ForceDissocReq(_) => "FORCE_DISSOC_REQ",
            Message::GetMinionConfigReq => "GET_MINION_CONFIG_REQ",
            Message::GetMinionConfigResp(_) => "GET_MINION_CONFIG_RESP",
            Message::SetMinionConfigReq(_) => "SET_MINION_CONFIG_REQ",
            Message::GetMinionConfigActionsReq(_) => "GET_MINION_CONFIG_ACTIONS_REQ",
            Message::GetMinionConfigActionsResp(_) => "GET_MINION_CONFIG_ACTIONS_RESP",
            Message::GetNodeConfigReq(_) => "GET_NODE_CONFIG_REQ",
            Message::GetNodeConfigResp(_) => "GET_NODE_CONFIG_RESP",
            Message::SetNodeOverridesReq(_) => "SET_NODE_OVERRIDES_REQ",
            Message::GetNodeOverridesReq(_) => "GET_NODE_OVERRIDES_REQ",
            Message::GetNodeOverridesResp(_) => "GET_NODE_OVERRIDES_RESP",
            Message::SetNetworkOverridesReq(_) => "SET_NETWORK_OVERRIDES_REQ",
            Message::GetNetworkOverridesReq => "GET_NETWORK_OVERRIDES_REQ",
            Message::GetNetworkOverridesResp(_) => "GET_NETWORK_OVERRIDES_RESP",
            Message::FwConfigReq { .. } => "FW_CONFIG_REQ",
            Message::FwConfigResp(_) => "FW_CONFIG_RESP",
            Message::FwSetLogConfig { .. } => "FW_SET_LOG_CONFIG",
            Message::UpgradeGroupReq(_) => "UPGRADE_GROUP_REQ",
            Message::UpgradeReq(_) => "UPGRADE_REQ",
            Message::SetUpgradeStatus(_) => "SET_UPGRADE_STATUS",
            Message::UpgradeDownloadDone { .. } => "UPGRADE_DOWNLOAD_DONE",
            Message::UpgradeStateReq => "UPGRADE_STATE_REQ",
            Message::UpgradeStateDump(_) => "UPGRADE_STATE_DUMP",
            Message::UpgradeAbortReq(_) => "UPGRADE_ABORT_REQ",
            Message::UpgradeAddImageReq(_) => "UPGRADE_ADD_IMAGE_REQ",
            Message::UpgradeDelImageReq(_) => "UPGRADE_DEL_IMAGE_REQ",
            Message::UpgradeListImagesReq => "UPGRADE_LIST_IMAGES_REQ",
            Message::UpgradeListImagesResp(_) => "UPGRADE_LIST_IMAGES_RESP",
            Message::UpgradeImageStagedNotif { .. } => "UPGRADE_IMAGE_STAGED_NOTIF",
            Message::SetGoldenImage(_) => "SET_GOLDEN_IMAGE",
            Message::GetGoldenImage => "GET_GOLDEN_IMAGE",
            Message::GoldenImageResp(_) => "GOLDEN_IMAGE_RESP",
            Message::StartScanReq(_) => "START_SCAN_REQ",
            Message::ScanReq(_) => "SCAN_REQ",
            Message::ScanResp(_) => "SCAN_RESP",
            Message::GetScanStatusReq(_) => "GET_SCAN_STATUS_REQ",
            Message::ScanStatus(_) => "SCAN_STATUS",
            Message::GetSlotReq(_) => "GET_SLOT_REQ",
            Message::GetSlotResp(_) => "GET_SLOT_RESP",
            Message::StartMinionPing(_) => "START_MINION_PING",
            Message::StartMinionIperf(_) => "START_MINION_IPERF",
            Message::TrafficResult(_) => "TRAFFIC_RESULT",
            Message::NodeInit { .. } => "NODE_INIT",
            Message::NodeInitNotify(_) => "NODE_INIT_NOTIFY",
            Message::GpsEnableReq { .. } => "GPS_ENABLE_REQ",
            Message::FwSetNodeParams { .. } => "FW_SET_NODE_PARAMS",
            Message::FwAck(_) => "FW_ACK",
            Message::DriverSetLinkStatus(_) => "DR_SET_LINK_STATUS",
            Message::DriverLinkStatus(_) => "DR_LINK_STATUS",
            Message::DevUpDownStatus(_) => "DR_DEV_UPDOWN_STATUS",
            Message::FwHealthReport { .. } => "FW_HEALTHY",
            Message::BinaryStarGetState => "BSTAR_GET_STATE",
            Message::BinaryStarFsm { .. } => "BSTAR_FSM",
            Message::BinaryStarAppData(_) => "BSTAR_APP_DATA",
            Message::BinaryStarGetAppData => "BSTAR_GET_APP_DATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_bincode_round_trip() {
        let msg = Message::StatusReport(StatusReport {
            timestamp_ms: 42,
            config_md5: "abc".into(),
            version: Some("RELEASE_M80".into()),
            ..Default::default()
        });
        let buf = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&buf).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_ack_helpers() {
        assert!(E2eAck::ok("done").success);
        assert!(!E2eAck::fail("nope").success);
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Message::DealerEcho.kind(), "DEALER_ECHO");
        assert_eq!(
            Message::UpgradeGroupReq(UpgradeGroupReq {
                ur_type: UpgradeReqType::ResetStatus,
                upgrade_req_id: "r1".into(),
                nodes: vec![],
                exclude_nodes: vec![],
                image_name: String::new(),
                md5: String::new(),
                version: String::new(),
                timeout_s: 180,
                skip_failure: false,
                skip_links: vec![],
                limit: 0,
                retry_limit: 0,
                schedule_to_commit: None,
            })
            .kind(),
            "UPGRADE_GROUP_REQ"
        );
    }
}
