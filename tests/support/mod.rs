#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(dead_code)]
//! In-process harness for controller/minion integration tests.
//!
//! Spins up a real controller (ephemeral ports), real minions, and a
//! scripted RF environment standing in for the radio firmware: driver
//! requests are recorded and association commands produce link-up events on
//! both ends, exactly as a pair of real basebands would report them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::sync::mpsc;

use terragraph_e2e::config::{ControllerSettings, MinionSettings};
use terragraph_e2e::ctrl::{self, ControllerHandle};
use terragraph_e2e::driver::{channel_pair, DriverPair};
use terragraph_e2e::messages::{
    appid, DriverLinkStatus, DriverSetLinkStatus, FwAck, FwConfigParams, FwReqType,
    LinkStatusType, Message, NodeInitNotify, PeerKind, ScanResp,
};
use terragraph_e2e::minion::actions::testing::RecordingRunner;
use terragraph_e2e::minion::state::NodeInfo;
use terragraph_e2e::minion::upgrade_app::FileFlasher;
use terragraph_e2e::minion::{self, MinionHandle};
use terragraph_e2e::nodecfg::{ConfigHelper, ConfigPaths};
use terragraph_e2e::topology::{
    Link, LinkType, Node, NodeStatus, NodeType, Polarity, Site, TopologyWrapper,
};
use terragraph_e2e::wire::{framed, Envelope, WireFramed};

pub const TEST_VERSION: &str = "RELEASE_M80";

/// Reserve an ephemeral port (bind-then-drop).
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn mac(idx: u8) -> String {
    format!("aa:bb:cc:00:00:{:02x}", idx)
}

pub fn dn(name: &str, idx: u8, site: &str, pop: bool) -> Node {
    node(name, idx, site, NodeType::Dn, pop)
}

pub fn cn(name: &str, idx: u8, site: &str) -> Node {
    node(name, idx, site, NodeType::Cn, false)
}

fn node(name: &str, idx: u8, site: &str, node_type: NodeType, pop: bool) -> Node {
    Node {
        name: name.into(),
        node_type,
        wlan_mac_addrs: vec![mac(idx)],
        mac_addr: mac(idx),
        pop_node: pop,
        status: NodeStatus::Offline,
        site_name: site.into(),
        polarity: Some(Polarity::Odd),
        golay_idx: None,
        channel: Some(2),
        software_version: None,
        location: None,
    }
}

pub fn wireless(a: &str, a_idx: u8, z: &str, z_idx: u8) -> Link {
    Link {
        name: String::new(),
        a_node_name: a.into(),
        z_node_name: z.into(),
        a_node_mac: mac(a_idx),
        z_node_mac: mac(z_idx),
        link_type: LinkType::Wireless,
        is_alive: false,
        linkup_attempts: 0,
        is_backup_cn_link: false,
    }
}

pub fn site(name: &str) -> Site {
    Site {
        name: name.into(),
        location: None,
    }
}

// =============================================================================
// Scripted RF environment
// =============================================================================

#[derive(Default)]
struct RfInner {
    /// Radio MAC -> sender into that radio's minion (driver side).
    radios: HashMap<String, mpsc::Sender<Message>>,
    /// Every association command seen, in order.
    pub assoc_cmds: Vec<DriverSetLinkStatus>,
    /// Every firmware config request seen, per radio.
    pub fw_config_reqs: Vec<(String, FwConfigParams)>,
    /// Whether association commands succeed automatically.
    auto_link_up: bool,
}

/// Shared fake-firmware world connecting every minion's driver endpoint.
#[derive(Clone)]
pub struct RfEnvironment {
    inner: Arc<Mutex<RfInner>>,
}

impl RfEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RfInner {
                auto_link_up: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_auto_link_up(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_link_up = enabled;
    }

    pub fn assoc_cmds(&self) -> Vec<DriverSetLinkStatus> {
        self.inner.lock().unwrap().assoc_cmds.clone()
    }

    pub fn fw_config_reqs(&self) -> Vec<(String, FwConfigParams)> {
        self.inner.lock().unwrap().fw_config_reqs.clone()
    }

    /// Build a driver pair for a minion and run its scripted firmware.
    pub fn attach(&self, radios: Vec<String>) -> DriverPair {
        let (app_side, mut endpoint) = channel_pair();
        {
            let mut inner = self.inner.lock().unwrap();
            for radio in &radios {
                inner.radios.insert(radio.clone(), endpoint.tx.clone());
            }
        }
        let env = self.clone();
        tokio::spawn(async move {
            while let Some(message) = endpoint.rx.recv().await {
                env.handle_driver_message(message, &endpoint.tx).await;
            }
        });
        app_side
    }

    async fn handle_driver_message(&self, message: Message, reply: &mpsc::Sender<Message>) {
        match message {
            Message::NodeInit { radio_mac } => {
                let _ = reply
                    .send(Message::NodeInitNotify(NodeInitNotify {
                        radio_mac,
                        success: true,
                        vendor: "sim".into(),
                    }))
                    .await;
            }
            Message::GpsEnableReq { radio_mac } => {
                let _ = reply
                    .send(Message::FwAck(FwAck {
                        radio_mac,
                        req_type: FwReqType::GpsEnable,
                        success: true,
                    }))
                    .await;
            }
            Message::FwSetNodeParams { radio_mac, .. } => {
                let _ = reply
                    .send(Message::FwAck(FwAck {
                        radio_mac,
                        req_type: FwReqType::NodeParams,
                        success: true,
                    }))
                    .await;
            }
            Message::FwConfigReq { radio_mac, params } => {
                self.inner
                    .lock()
                    .unwrap()
                    .fw_config_reqs
                    .push((radio_mac.clone(), params));
                let _ = reply
                    .send(Message::FwConfigResp(terragraph_e2e::messages::FwConfigResp {
                        radio_mac,
                        success: true,
                    }))
                    .await;
            }
            Message::ScanReq(req) => {
                let _ = reply
                    .send(Message::ScanResp(ScanResp {
                        scan_id: req.scan_id,
                        token: req.token,
                        radio_mac: req.radio_mac,
                        success: true,
                        complete: true,
                        topo_info: None,
                    }))
                    .await;
            }
            Message::DriverSetLinkStatus(cmd) => {
                let (auto, peer_tx) = {
                    let mut inner = self.inner.lock().unwrap();
                    if cmd.is_assoc {
                        inner.assoc_cmds.push(cmd.clone());
                    }
                    (inner.auto_link_up, inner.radios.get(&cmd.responder_mac).cloned())
                };
                let _ = reply
                    .send(Message::FwAck(FwAck {
                        radio_mac: cmd.radio_mac.clone(),
                        req_type: FwReqType::SetLinkStatus,
                        success: true,
                    }))
                    .await;
                let status = if cmd.is_assoc {
                    LinkStatusType::LinkUp
                } else {
                    LinkStatusType::LinkDown
                };
                if cmd.is_assoc && !auto {
                    return;
                }
                // Both basebands report the transition.
                let _ = reply
                    .send(Message::DriverLinkStatus(DriverLinkStatus {
                        radio_mac: cmd.radio_mac.clone(),
                        responder_mac: cmd.responder_mac.clone(),
                        link_status_type: status,
                    }))
                    .await;
                if let Some(peer_tx) = peer_tx {
                    let _ = peer_tx
                        .send(Message::DriverLinkStatus(DriverLinkStatus {
                            radio_mac: cmd.responder_mac.clone(),
                            responder_mac: cmd.radio_mac.clone(),
                            link_status_type: status,
                        }))
                        .await;
                }
            }
            _ => {}
        }
    }
}

// =============================================================================
// Controller + minions
// =============================================================================

pub struct TestController {
    pub handle: ControllerHandle,
    pub settings: ControllerSettings,
    pub tmp: TempDir,
}

/// Controller settings tuned for tests: ephemeral ports, 1 s cadences.
pub fn test_controller_settings(tmp: &TempDir) -> ControllerSettings {
    let mut settings = ControllerSettings::default();
    settings.listen_addr = "127.0.0.1".into();
    settings.minion_router_port = 0;
    settings.app_router_port = 0;
    settings.event_pub_port = 0;
    settings.image_http_port = 0;
    settings.public_address = "127.0.0.1".into();
    settings.topology_dir = tmp.path().join("topology").to_string_lossy().into_owned();
    settings.status_reports_interval_s = 1;
    settings.status_report_throttle_interval_s = 0;
    settings.node_alive_timeout_s = 3;
    settings.topology_report_interval_s = 3600;
    settings.topology_info_sync_interval_s = 3600;
    settings.routing_adjacencies_dump_interval_s = 3600;
    settings.ignition.linkup_interval_s = 1;
    settings.ignition.dampen_interval_s = 2;
    settings.enable_centralized_prefix_alloc = false;
    settings.node_config_overrides_file = tmp
        .path()
        .join("node_config_overrides.json")
        .to_string_lossy()
        .into_owned();
    settings.auto_node_config_overrides_file = tmp
        .path()
        .join("auto_node_config_overrides.json")
        .to_string_lossy()
        .into_owned();
    settings.network_config_overrides_file = tmp
        .path()
        .join("network_config_overrides.json")
        .to_string_lossy()
        .into_owned();
    settings.base_config_dir = tmp.path().join("base_versions").to_string_lossy().into_owned();
    settings.fw_base_config_dir = tmp.path().join("fw_versions").to_string_lossy().into_owned();
    settings.hw_base_config_dir = tmp.path().join("hw_versions").to_string_lossy().into_owned();
    settings.hw_config_types_file = tmp
        .path()
        .join("hw_versions/hw_types.json")
        .to_string_lossy()
        .into_owned();
    settings.controller_config_file = tmp
        .path()
        .join("controller_config.json")
        .to_string_lossy()
        .into_owned();
    settings.upgrade_image_dir = tmp.path().join("images").to_string_lossy().into_owned();
    settings
}

/// Start a controller over the given graph.
pub async fn start_controller(nodes: Vec<Node>, links: Vec<Link>, sites: Vec<Site>) -> TestController {
    let tmp = TempDir::new().unwrap();
    let settings = test_controller_settings(&tmp);

    let mut topology = TopologyWrapper::default();
    for s in sites {
        topology.add_site(s).unwrap();
    }
    for n in nodes {
        topology.add_node(n).unwrap();
    }
    for l in links {
        topology.add_link(l).unwrap();
    }
    topology.sanitize();

    let config = ConfigHelper::load(ConfigPaths {
        base_config_dir: settings.base_config_dir.clone().into(),
        fw_base_config_dir: settings.fw_base_config_dir.clone().into(),
        hw_base_config_dir: settings.hw_base_config_dir.clone().into(),
        hw_config_types_file: settings.hw_config_types_file.clone().into(),
        node_overrides_file: settings.node_config_overrides_file.clone().into(),
        auto_node_overrides_file: settings.auto_node_config_overrides_file.clone().into(),
        network_overrides_file: settings.network_config_overrides_file.clone().into(),
    })
    .unwrap();

    let shared = terragraph_e2e::shared::SharedState::new(topology, config);
    let handle = ctrl::spawn_controller(&settings, shared, TEST_VERSION.to_string())
        .await
        .unwrap();
    TestController {
        handle,
        settings,
        tmp,
    }
}

pub struct TestMinion {
    pub handle: MinionHandle,
    pub runner: Arc<RecordingRunner>,
    pub tmp: TempDir,
}

/// Start a minion for one topology node, attached to the RF environment.
pub async fn start_minion(
    ctrl: &TestController,
    node_id: &str,
    radios: Vec<String>,
    rf: &RfEnvironment,
) -> TestMinion {
    start_minion_with_version(ctrl, node_id, radios, rf, TEST_VERSION).await
}

pub async fn start_minion_with_version(
    ctrl: &TestController,
    node_id: &str,
    radios: Vec<String>,
    rf: &RfEnvironment,
    version: &str,
) -> TestMinion {
    let tmp = TempDir::new().unwrap();
    let mut settings = MinionSettings::default();
    settings.controller_host = "127.0.0.1".into();
    settings.controller_router_port = ctrl.handle.ports.minion_port;
    settings.status_report_interval_s = 1;
    settings.ctrl_socket_timeout_s = 8;
    settings.node_config_file = tmp.path().join("node_config.json").to_string_lossy().into_owned();
    settings.upgrade_cache_file = tmp
        .path()
        .join("upgradeCache.json")
        .to_string_lossy()
        .into_owned();
    settings.image_download_dir = tmp.path().join("dl").to_string_lossy().into_owned();
    settings.progress_file_directory = String::new();

    let node_info = NodeInfo {
        node_id: node_id.to_string(),
        radio_mac_to_bus_id: radios
            .iter()
            .enumerate()
            .map(|(i, r)| (r.clone(), format!("0000:0{}:00.0", i)))
            .collect(),
        hw_model: Some("SIM".into()),
        hw_board_id: Some("SIM_BOARD".into()),
        node_type: None,
    };

    let runner = Arc::new(RecordingRunner::default());
    let flasher = Arc::new(FileFlasher::new(tmp.path().join("flashed.bin")));
    let handle = minion::spawn_minion(
        &settings,
        node_info,
        rf.attach(radios),
        runner.clone(),
        flasher,
        version.to_string(),
    )
    .await
    .unwrap();

    TestMinion {
        handle,
        runner,
        tmp,
    }
}

// =============================================================================
// NMS/API client
// =============================================================================

/// Minimal NMS client speaking the apps-port wire protocol.
pub struct ApiClient {
    transport: WireFramed,
    client_id: String,
}

impl ApiClient {
    pub async fn connect(ctrl: &TestController) -> Self {
        Self::connect_to(ctrl.handle.ports.app_port).await
    }

    pub async fn connect_to(app_port: u16) -> Self {
        let client_id = format!("{}{}", appid::API_CLIENT_PREFIX, rand_suffix());
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", app_port))
            .await
            .unwrap();
        let mut transport = framed(stream);
        let hello = Message::Hello {
            node_id: client_id.clone(),
            kind: PeerKind::ApiClient,
        };
        let env = Envelope::new("", appid::CTRL_BROKER, &client_id, &hello, false).unwrap();
        transport.send(env.to_frame().unwrap().into()).await.unwrap();
        Self {
            transport,
            client_id,
        }
    }

    /// Send a request to a controller app and await the next reply.
    pub async fn request(&mut self, dest_app: &str, message: Message) -> Message {
        self.send(dest_app, message).await;
        self.recv().await
    }

    pub async fn send(&mut self, dest_app: &str, message: Message) {
        let env = Envelope::new("", dest_app, &self.client_id, &message, false).unwrap();
        self.transport
            .send(env.to_frame().unwrap().into())
            .await
            .unwrap();
    }

    /// Send a request addressed to a minion app (the broker forwards it).
    pub async fn send_to_node(&mut self, node_id: &str, dest_app: &str, message: Message) {
        let env = Envelope::new(node_id, dest_app, &self.client_id, &message, false).unwrap();
        self.transport
            .send(env.to_frame().unwrap().into())
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.transport.next())
                .await
                .expect("timed out waiting for a reply")
                .expect("connection closed")
                .expect("read error");
            let env = Envelope::from_frame(&frame).unwrap();
            let message = env.message().unwrap();
            if matches!(message, Message::DealerEcho) {
                continue;
            }
            return message;
        }
    }
}

fn rand_suffix() -> u32 {
    rand::random::<u32>() % 1_000_000
}

// =============================================================================
// Polling helpers
// =============================================================================

/// Poll until `check` returns Some, or panic after `timeout`.
pub async fn wait_for<T, F, Fut>(timeout: Duration, what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Link liveness snapshot from the controller's shared state.
pub async fn link_alive_map(ctrl: &TestController) -> BTreeMap<String, bool> {
    let topo = ctrl.handle.shared.read_topology().await;
    topo.all_links()
        .map(|l| (l.name.clone(), l.is_alive))
        .collect()
}
