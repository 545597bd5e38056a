//! Process configuration for the controller and minion daemons.
//!
//! Settings load from an optional JSON/TOML file plus environment overrides
//! (`TG_CONTROLLER_*` / `TG_MINION_*`, `__` as the nesting separator).
//! Policy intervals are plain seconds; apps convert to `Duration` at the
//! point of use.

use anyhow::Result;
use serde::Deserialize;

/// Controller daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSettings {
    /// The IP address to bind to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// The port the controller listens on for minions.
    #[serde(default = "default_minion_router_port")]
    pub minion_router_port: u16,
    /// The port the controller listens on for apps (NMS/API clients).
    #[serde(default = "default_app_router_port")]
    pub app_router_port: u16,
    /// The port the controller publishes events on.
    #[serde(default = "default_event_pub_port")]
    pub event_pub_port: u16,
    /// The port the controller serves staged upgrade images on.
    #[serde(default = "default_image_http_port")]
    pub image_http_port: u16,
    /// Address nodes use to reach this controller's image endpoints.
    #[serde(default = "default_public_address")]
    pub public_address: String,

    /// The config file containing the topology.
    #[serde(default)]
    pub topology_file: String,
    /// The directory to save timestamped topology files.
    #[serde(default = "default_topology_dir")]
    pub topology_dir: String,

    #[serde(default)]
    pub ignition: IgnitionSettings,

    /// Interval at which apps sync with the latest status reports.
    #[serde(default = "default_status_reports_interval_s")]
    pub status_reports_interval_s: u64,
    /// Ignore successive status reports from a node within this interval.
    #[serde(default = "default_status_report_throttle_interval_s")]
    pub status_report_throttle_interval_s: u64,
    /// Request full status reports from minions at this interval.
    #[serde(default = "default_full_status_report_interval_s")]
    pub full_status_report_interval_s: u64,
    /// Mark a node offline if no heartbeat arrives within this interval.
    #[serde(default = "default_node_alive_timeout_s")]
    pub node_alive_timeout_s: u64,
    /// Interval at which each node's topology info config is synced.
    #[serde(default = "default_topology_info_sync_interval_s")]
    pub topology_info_sync_interval_s: u64,
    /// Interval at which node/link status statistics are recorded.
    #[serde(default = "default_topology_report_interval_s")]
    pub topology_report_interval_s: u64,
    /// Interval at which routing adjacencies are dumped from minions.
    #[serde(default = "default_routing_adjacencies_dump_interval_s")]
    pub routing_adjacencies_dump_interval_s: u64,

    /// Whether to enable automatic fair airtime allocation.
    #[serde(default)]
    pub enable_airtime_auto_alloc: bool,
    /// Whether to enable centralized prefix allocation.
    #[serde(default = "default_true")]
    pub enable_centralized_prefix_alloc: bool,
    /// Whether to enable deterministic prefix allocation.
    #[serde(default)]
    pub enable_deterministic_prefix_alloc: bool,
    /// Whether to create wired links between co-located DNs automatically.
    #[serde(default = "default_true")]
    pub enable_create_intrasite_links: bool,

    /// Config override files and base config directories.
    #[serde(default = "default_node_config_overrides_file")]
    pub node_config_overrides_file: String,
    #[serde(default = "default_auto_node_config_overrides_file")]
    pub auto_node_config_overrides_file: String,
    #[serde(default = "default_network_config_overrides_file")]
    pub network_config_overrides_file: String,
    #[serde(default = "default_base_config_dir")]
    pub base_config_dir: String,
    #[serde(default = "default_fw_base_config_dir")]
    pub fw_base_config_dir: String,
    #[serde(default = "default_hw_base_config_dir")]
    pub hw_base_config_dir: String,
    #[serde(default = "default_hw_config_types_file")]
    pub hw_config_types_file: String,
    /// The controller's own config file (golden image, scheduled tasks).
    #[serde(default = "default_controller_config_file")]
    pub controller_config_file: String,
    /// Directory where staged upgrade images live.
    #[serde(default = "default_upgrade_image_dir")]
    pub upgrade_image_dir: String,
    /// Version file for this controller build.
    #[serde(default = "default_version_file")]
    pub version_file: String,

    /// Log peer addresses for connections on the apps socket.
    #[serde(default)]
    pub enable_auth_log_apps_sock: bool,
    /// Log peer addresses for connections on the minions socket.
    #[serde(default)]
    pub enable_auth_log_minions_sock: bool,

    #[serde(default)]
    pub bstar: BinaryStarSettings,
}

/// Ignition tunables (controller).
#[derive(Debug, Clone, Deserialize)]
pub struct IgnitionSettings {
    #[serde(default = "default_linkup_interval_s")]
    pub linkup_interval_s: u64,
    #[serde(default = "default_bf_timeout_s")]
    pub bf_timeout_s: u64,
    #[serde(default = "default_dampen_interval_s")]
    pub dampen_interval_s: u64,
    #[serde(default = "default_extended_dampen_interval_s")]
    pub extended_dampen_interval_s: u64,
    #[serde(default = "default_extended_dampen_failure_interval_s")]
    pub extended_dampen_failure_interval_s: u64,
    #[serde(default = "default_backup_cn_link_interval_s")]
    pub backup_cn_link_interval_s: u64,
    /// Minimum spacing between LINK_UP commands from the same radio (P2MP).
    #[serde(default)]
    pub p2mp_assoc_delay_s: u64,
    /// Ignore the regular dampen interval after an explicit link-down event.
    #[serde(default)]
    pub ignore_dampen_interval_after_resp: bool,
}

impl Default for IgnitionSettings {
    fn default() -> Self {
        Self {
            linkup_interval_s: default_linkup_interval_s(),
            bf_timeout_s: default_bf_timeout_s(),
            dampen_interval_s: default_dampen_interval_s(),
            extended_dampen_interval_s: default_extended_dampen_interval_s(),
            extended_dampen_failure_interval_s: default_extended_dampen_failure_interval_s(),
            backup_cn_link_interval_s: default_backup_cn_link_interval_s(),
            p2mp_assoc_delay_s: 0,
            ignore_dampen_interval_after_resp: false,
        }
    }
}

/// High availability (primary/backup replication) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryStarSettings {
    /// Primary (true) or backup (false) role.
    #[serde(default = "default_true")]
    pub primary: bool,
    /// Port this controller publishes HA state on.
    #[serde(default = "default_bstar_pub_port")]
    pub pub_port: u16,
    /// Peer controller host; empty disables the feature.
    #[serde(default)]
    pub peer_host: String,
    /// Publisher port on the peer controller.
    #[serde(default = "default_bstar_pub_port")]
    pub peer_pub_port: u16,
    /// Disable HA even if a peer host is configured.
    #[serde(default)]
    pub disabled: bool,
}

impl Default for BinaryStarSettings {
    fn default() -> Self {
        Self {
            primary: true,
            pub_port: default_bstar_pub_port(),
            peer_host: String::new(),
            peer_pub_port: default_bstar_pub_port(),
            disabled: false,
        }
    }
}

impl BinaryStarSettings {
    pub fn enabled(&self) -> bool {
        !self.peer_host.is_empty() && !self.disabled
    }
}

/// Minion daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MinionSettings {
    /// The hostname or IP of the controller.
    #[serde(default = "default_controller_host")]
    pub controller_host: String,
    #[serde(default = "default_minion_router_port")]
    pub controller_router_port: u16,

    /// File containing static node info (node id, radios, hardware ids).
    #[serde(default = "default_node_info_file")]
    pub node_info_file: String,
    /// Node configuration file.
    #[serde(default = "default_node_config_file")]
    pub node_config_file: String,
    #[serde(default = "default_version_file")]
    pub version_file: String,
    /// Persisted upgrade state.
    #[serde(default = "default_upgrade_cache_file")]
    pub upgrade_cache_file: String,
    /// Where downloaded images are staged.
    #[serde(default = "default_image_download_dir")]
    pub image_download_dir: String,

    #[serde(default = "default_status_report_interval_s")]
    pub status_report_interval_s: u64,
    #[serde(default = "default_bgp_status_interval_s")]
    pub bgp_status_interval_s: u64,
    /// Reconnect to the controller if nothing arrives for this long.
    /// Should be a multiple of `status_report_interval_s`.
    #[serde(default = "default_ctrl_socket_timeout_s")]
    pub ctrl_socket_timeout_s: u64,
    /// Give up on an unresponsive link-up after this long (vendor BF timeout
    /// plus margin).
    #[serde(default = "default_bf_timeout_s")]
    pub linkup_resp_wait_timeout_s: u64,

    /// Only allow HTTPS sessions for image downloads.
    #[serde(default)]
    pub use_https: bool,

    /// Unix socket path of the netlink driver process.
    #[serde(default = "default_driver_socket_path")]
    pub driver_socket_path: String,

    /// Directory for watchdog progress files (empty disables).
    #[serde(default = "default_progress_file_directory")]
    pub progress_file_directory: String,

    /// Link metric rate limiting: token generation rate (tokens/sec).
    #[serde(default = "default_link_metric_gen_rate")]
    pub link_metric_gen_rate: f64,
    /// Link metric rate limiting: bucket burst size.
    #[serde(default = "default_link_metric_burst_size")]
    pub link_metric_burst_size: f64,
    /// Successive same-direction changes required before a metric push.
    #[serde(default = "default_link_metric_min_changes")]
    pub link_metric_min_changes: u32,
}

fn default_listen_addr() -> String {
    "::".into()
}
fn default_minion_router_port() -> u16 {
    7007
}
fn default_app_router_port() -> u16 {
    17077
}
fn default_event_pub_port() -> u16 {
    17078
}
fn default_image_http_port() -> u16 {
    17080
}
fn default_public_address() -> String {
    "localhost".into()
}
fn default_topology_dir() -> String {
    "/tmp/topology".into()
}
fn default_status_reports_interval_s() -> u64 {
    5
}
fn default_status_report_throttle_interval_s() -> u64 {
    5
}
fn default_full_status_report_interval_s() -> u64 {
    3600
}
fn default_node_alive_timeout_s() -> u64 {
    30
}
fn default_topology_info_sync_interval_s() -> u64 {
    300
}
fn default_topology_report_interval_s() -> u64 {
    30
}
fn default_routing_adjacencies_dump_interval_s() -> u64 {
    30
}
fn default_linkup_interval_s() -> u64 {
    5
}
fn default_bf_timeout_s() -> u64 {
    // Vendor beamforming sweep (~15 s) plus margin for network delays.
    16
}
fn default_dampen_interval_s() -> u64 {
    10
}
fn default_extended_dampen_interval_s() -> u64 {
    300
}
fn default_extended_dampen_failure_interval_s() -> u64 {
    1800
}
fn default_backup_cn_link_interval_s() -> u64 {
    300
}
fn default_bstar_pub_port() -> u16 {
    55555
}
fn default_node_config_overrides_file() -> String {
    "/data/cfg/node_config_overrides.json".into()
}
fn default_auto_node_config_overrides_file() -> String {
    "/data/cfg/auto_node_config_overrides.json".into()
}
fn default_network_config_overrides_file() -> String {
    "/data/cfg/network_config_overrides.json".into()
}
fn default_base_config_dir() -> String {
    "/etc/e2e_config/base_versions/".into()
}
fn default_fw_base_config_dir() -> String {
    "/etc/e2e_config/base_versions/fw_versions/".into()
}
fn default_hw_base_config_dir() -> String {
    "/etc/e2e_config/base_versions/hw_versions/".into()
}
fn default_hw_config_types_file() -> String {
    "/etc/e2e_config/base_versions/hw_versions/hw_types.json".into()
}
fn default_controller_config_file() -> String {
    "/data/cfg/controller_config.json".into()
}
fn default_upgrade_image_dir() -> String {
    "/data/images".into()
}
fn default_version_file() -> String {
    "/etc/tgversion".into()
}
fn default_controller_host() -> String {
    "localhost".into()
}
fn default_node_info_file() -> String {
    "/var/run/node_info".into()
}
fn default_node_config_file() -> String {
    "/data/cfg/node_config.json".into()
}
fn default_upgrade_cache_file() -> String {
    "/data/upgradeCache.json".into()
}
fn default_image_download_dir() -> String {
    "/tmp/upgrade".into()
}
fn default_status_report_interval_s() -> u64 {
    5
}
fn default_bgp_status_interval_s() -> u64 {
    30
}
fn default_ctrl_socket_timeout_s() -> u64 {
    20
}
fn default_driver_socket_path() -> String {
    "/var/run/driver_if.sock".into()
}
fn default_progress_file_directory() -> String {
    "/var/volatile/progress".into()
}
fn default_link_metric_gen_rate() -> f64 {
    0.1
}
fn default_link_metric_burst_size() -> f64 {
    3.0
}
fn default_link_metric_min_changes() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for ControllerSettings {
    #[allow(clippy::expect_used)] // every field carries a serde default
    fn default() -> Self {
        // Serde defaults double as programmatic defaults.
        serde_json::from_value(serde_json::json!({}))
            .expect("controller defaults must deserialize")
    }
}

impl Default for MinionSettings {
    #[allow(clippy::expect_used)] // every field carries a serde default
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("minion defaults must deserialize")
    }
}

/// Load controller settings from an optional file plus `TG_CONTROLLER_*` env.
pub fn load_controller_settings(config_file: Option<&str>) -> Result<ControllerSettings> {
    load(config_file, "TG_CONTROLLER")
}

/// Load minion settings from an optional file plus `TG_MINION_*` env.
pub fn load_minion_settings(config_file: Option<&str>) -> Result<MinionSettings> {
    load(config_file, "TG_MINION")
}

fn load<T: for<'de> Deserialize<'de>>(config_file: Option<&str>, env_prefix: &str) -> Result<T> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = config_file {
        builder = builder.add_source(::config::File::with_name(path).required(false));
    }
    let cfg = builder
        .add_source(
            ::config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(cfg.try_deserialize()?)
}
