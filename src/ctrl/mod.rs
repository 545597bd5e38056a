//! Controller-side apps and daemon wiring.

pub mod binary_star;
pub mod broker;
pub mod config_app;
pub mod ignition_app;
pub mod scan_app;
pub mod scheduler_app;
pub mod status_app;
pub mod topology_app;
pub mod upgrade_app;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::apps::{AppContext, AppCoordinator};
use crate::bus::{outbound_channel, AppRegistry, BusCounters, BusHandle};
use crate::config::ControllerSettings;
use crate::events::{create_event_bus, EventClient, SharedEventBus};
use crate::messages::appid;
use crate::nodecfg::{ConfigHelper, ConfigPaths};
use crate::shared::SharedState;
use crate::topology::TopologyWrapper;

use broker::{BoundPorts, CtrlBroker, RoutingActive};

/// A running controller instance.
pub struct ControllerHandle {
    pub ports: BoundPorts,
    pub image_http_port: u16,
    pub shared: SharedState,
    pub event_bus: SharedEventBus,
    pub routing_active: RoutingActive,
    pub coordinator: AppCoordinator,
    pub bus: BusHandle,
}

impl ControllerHandle {
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
    }
}

/// Build the shared state from the configured files.
pub fn load_shared_state(settings: &ControllerSettings) -> Result<SharedState> {
    let mut topology = if settings.topology_file.is_empty() {
        warn!("no topology file configured, starting with an empty graph");
        TopologyWrapper::default()
    } else {
        TopologyWrapper::from_file(std::path::Path::new(&settings.topology_file))
            .context("loading topology file")?
    };
    topology.sanitize();
    topology.audit();

    let config = ConfigHelper::load(ConfigPaths {
        base_config_dir: PathBuf::from(&settings.base_config_dir),
        fw_base_config_dir: PathBuf::from(&settings.fw_base_config_dir),
        hw_base_config_dir: PathBuf::from(&settings.hw_base_config_dir),
        hw_config_types_file: PathBuf::from(&settings.hw_config_types_file),
        node_overrides_file: PathBuf::from(&settings.node_config_overrides_file),
        auto_node_overrides_file: PathBuf::from(&settings.auto_node_config_overrides_file),
        network_overrides_file: PathBuf::from(&settings.network_config_overrides_file),
    })
    .context("loading config layers")?;

    Ok(SharedState::new(topology, config))
}

/// Spawn a full controller (broker + all apps) from pre-built shared state.
///
/// Used by the daemon and, with port 0 settings, by integration tests.
pub async fn spawn_controller(
    settings: &ControllerSettings,
    shared: SharedState,
    version: String,
) -> Result<ControllerHandle> {
    let event_bus = create_event_bus();
    let counters = Arc::new(BusCounters::default());
    let mut registry = AppRegistry::new(counters);
    let (bus, outbound_rx) = outbound_channel();

    // HA gate: standalone controllers route unconditionally; with a peer
    // configured, BinaryStarApp flips this.
    let routing_active: RoutingActive = Arc::new(AtomicBool::new(!settings.bstar.enabled()));

    let mut coordinator = AppCoordinator::new();
    let ctx_for = |registry: &mut AppRegistry, app_id: &'static str| AppContext {
        bus: bus.clone(),
        inbox: registry.register(app_id),
        events: EventClient::new(app_id, event_bus.clone()),
        shutdown: coordinator.child_token(),
    };

    // Status app
    let status_ctx = ctx_for(&mut registry, appid::CTRL_STATUS);
    let status_app = status_app::StatusApp::new(
        shared.clone(),
        Duration::from_secs(settings.status_report_throttle_interval_s),
        Duration::from_secs(settings.full_status_report_interval_s),
        version.clone(),
    );

    // Topology app
    let topology_ctx = ctx_for(&mut registry, appid::CTRL_TOPOLOGY);
    let topology_app = topology_app::TopologyApp::new(
        shared.clone(),
        topology_app::TopologyAppConfig {
            status_reports_interval: Duration::from_secs(settings.status_reports_interval_s),
            node_alive_timeout: Duration::from_secs(settings.node_alive_timeout_s),
            topology_info_sync_interval: Duration::from_secs(
                settings.topology_info_sync_interval_s,
            ),
            topology_report_interval: Duration::from_secs(settings.topology_report_interval_s),
            routing_adjacencies_dump_interval: Duration::from_secs(
                settings.routing_adjacencies_dump_interval_s,
            ),
            topology_dir: PathBuf::from(&settings.topology_dir),
            enable_airtime_auto_alloc: settings.enable_airtime_auto_alloc,
            enable_centralized_prefix_alloc: settings.enable_centralized_prefix_alloc,
            enable_deterministic_prefix_alloc: settings.enable_deterministic_prefix_alloc,
            enable_create_intrasite_links: settings.enable_create_intrasite_links,
        },
    );

    // Ignition app
    let ignition_ctx = ctx_for(&mut registry, appid::CTRL_IGNITION);
    let ignition_app = ignition_app::IgnitionApp::new(
        shared.clone(),
        ignition_app::IgnitionAppConfig {
            linkup_interval: Duration::from_secs(settings.ignition.linkup_interval_s),
            bf_timeout: Duration::from_secs(settings.ignition.bf_timeout_s),
            dampen_interval: Duration::from_secs(settings.ignition.dampen_interval_s),
            extended_dampen_interval: Duration::from_secs(
                settings.ignition.extended_dampen_interval_s,
            ),
            extended_dampen_failure_interval: Duration::from_secs(
                settings.ignition.extended_dampen_failure_interval_s,
            ),
            backup_cn_link_interval: Duration::from_secs(
                settings.ignition.backup_cn_link_interval_s,
            ),
            p2mp_assoc_delay: Duration::from_secs(settings.ignition.p2mp_assoc_delay_s),
            ignore_dampen_interval_after_resp: settings
                .ignition
                .ignore_dampen_interval_after_resp,
        },
    );

    // Config app
    let config_ctx = ctx_for(&mut registry, appid::CTRL_CONFIG);
    let config_app = config_app::ConfigApp::new(
        shared.clone(),
        Duration::from_secs(settings.status_reports_interval_s),
    );

    // Upgrade app (and its HTTP image endpoint)
    let image_dir = PathBuf::from(&settings.upgrade_image_dir);
    let image_http_port =
        spawn_image_server(&settings.listen_addr, settings.image_http_port, &image_dir).await?;
    let upgrade_ctx = ctx_for(&mut registry, appid::CTRL_UPGRADE);
    let upgrade_app = upgrade_app::UpgradeApp::new(
        shared.clone(),
        upgrade_app::UpgradeAppConfig {
            sync_interval: Duration::from_secs(settings.status_reports_interval_s),
            golden_check_interval: Duration::from_secs(60),
            image_dir,
            image_http_base: format!(
                "http://{}:{}/images",
                settings.public_address, image_http_port
            ),
            controller_config_file: PathBuf::from(&settings.controller_config_file),
        },
    );

    // Scan + scheduler apps
    let scan_ctx = ctx_for(&mut registry, appid::CTRL_SCAN);
    let scan_app = scan_app::ScanApp::new(shared.clone());
    let scheduler_ctx = ctx_for(&mut registry, appid::CTRL_SCHEDULER);
    let scheduler_app = scheduler_app::SchedulerApp::new();

    // Binary Star app
    let bstar_ctx = ctx_for(&mut registry, appid::CTRL_BINARY_STAR);
    let bstar_app = binary_star::BinaryStarApp::new(
        shared.clone(),
        binary_star::BinaryStarAppConfig {
            enabled: settings.bstar.enabled(),
            primary: settings.bstar.primary,
            listen_addr: settings.listen_addr.clone(),
            pub_port: settings.bstar.pub_port,
            peer_host: settings.bstar.peer_host.clone(),
            peer_pub_port: settings.bstar.peer_pub_port,
            version: version.clone(),
        },
        routing_active.clone(),
    );

    // The broker last: it consumes the registry.
    let (ctrl_broker, ports) = CtrlBroker::bind(
        &settings.listen_addr,
        settings.minion_router_port,
        settings.app_router_port,
        settings.event_pub_port,
        registry,
        outbound_rx,
        event_bus.clone(),
        routing_active.clone(),
        Duration::from_secs(settings.status_reports_interval_s),
        Duration::from_secs(20),
        settings.enable_auth_log_minions_sock,
        settings.enable_auth_log_apps_sock,
    )
    .await?;

    let broker_shutdown = coordinator.child_token();
    let broker_handle = tokio::spawn(async move {
        ctrl_broker.run(broker_shutdown).await;
    });
    coordinator.track("ctrl-broker", broker_handle);

    coordinator.spawn(status_app, status_ctx);
    coordinator.spawn(topology_app, topology_ctx);
    coordinator.spawn(ignition_app, ignition_ctx);
    coordinator.spawn(config_app, config_ctx);
    coordinator.spawn(upgrade_app, upgrade_ctx);
    coordinator.spawn(scan_app, scan_ctx);
    coordinator.spawn(scheduler_app, scheduler_ctx);
    coordinator.spawn(bstar_app, bstar_ctx);

    info!("controller is up (version {})", version);
    Ok(ControllerHandle {
        ports,
        image_http_port,
        shared,
        event_bus,
        routing_active,
        coordinator,
        bus,
    })
}

/// Serve staged upgrade images over HTTP. Returns the bound port.
async fn spawn_image_server(
    listen_addr: &str,
    port: u16,
    image_dir: &std::path::Path,
) -> Result<u16> {
    std::fs::create_dir_all(image_dir)
        .with_context(|| format!("creating {}", image_dir.display()))?;
    let app = axum::Router::new().nest_service(
        "/images",
        tower_http::services::ServeDir::new(image_dir.to_path_buf()),
    );
    let listener = tokio::net::TcpListener::bind((listen_addr, port))
        .await
        .with_context(|| format!("binding image server on port {}", port))?;
    let bound = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("image server stopped: {}", e);
        }
    });
    Ok(bound)
}
