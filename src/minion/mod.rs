//! Minion-side apps and daemon wiring.

pub mod actions;
pub mod broker;
pub mod config_app;
pub mod driver_app;
pub mod ignition_app;
pub mod openr_client;
pub mod state;
pub mod status_app;
pub mod traffic_app;
pub mod upgrade_app;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Duration;
use tracing::info;

use crate::apps::{AppContext, AppCoordinator};
use crate::bus::{outbound_channel, AppRegistry, BusCounters, BusHandle};
use crate::config::MinionSettings;
use crate::driver::DriverPair;
use crate::events::{create_event_bus, EventClient, SharedEventBus};
use crate::messages::appid;
use crate::nodecfg::{ConfigMetadata, NodeConfigWrapper};
use crate::progress::Progress;

use actions::SharedActionRunner;
use state::{MinionState, NodeInfo};
use upgrade_app::{Flasher, UpgradeStateCache};

/// A running minion instance.
pub struct MinionHandle {
    pub state: MinionState,
    pub event_bus: SharedEventBus,
    pub coordinator: AppCoordinator,
    pub bus: BusHandle,
}

impl MinionHandle {
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
    }
}

/// Spawn a full minion (broker + all apps).
///
/// The driver pair, action runner, and flasher are injected so tests can
/// script the firmware and observe system actions.
pub async fn spawn_minion(
    settings: &MinionSettings,
    node_info: NodeInfo,
    driver_pair: DriverPair,
    runner: SharedActionRunner,
    flasher: Arc<dyn Flasher>,
    version: String,
) -> Result<MinionHandle> {
    let event_bus = create_event_bus();
    let counters = Arc::new(BusCounters::default());
    let mut registry = AppRegistry::new(counters);
    let (bus, outbound_rx) = outbound_channel();
    let progress = Arc::new(Progress::new(settings.progress_file_directory.clone()));

    let node_config = NodeConfigWrapper::load(settings.node_config_file.clone());
    let minion_state = MinionState::new(node_info, node_config);

    let mut coordinator = AppCoordinator::new();
    let ctx_for = |registry: &mut AppRegistry, app_id: &'static str| AppContext {
        bus: bus.clone(),
        inbox: registry.register(app_id),
        events: EventClient::new(app_id, event_bus.clone()),
        shutdown: coordinator.child_token(),
    };

    // Upgrade app first so its cached status seeds StatusApp.
    let cache = UpgradeStateCache::new(settings.upgrade_cache_file.clone(), version.clone());
    let initial_upgrade_status = cache.load();
    let upgrade_ctx = ctx_for(&mut registry, appid::MINION_UPGRADE);
    let upgrade = upgrade_app::UpgradeApp::new(
        upgrade_app::MinionUpgradeAppConfig {
            download_dir: PathBuf::from(&settings.image_download_dir),
            use_https: settings.use_https,
        },
        cache,
        flasher,
        runner.clone(),
    );

    let status_ctx = ctx_for(&mut registry, appid::MINION_STATUS);
    let status = status_app::StatusApp::new(
        minion_state.clone(),
        status_app::MinionStatusAppConfig {
            report_interval: Duration::from_secs(settings.status_report_interval_s),
            bgp_status_interval: Duration::from_secs(settings.bgp_status_interval_s),
            version: version.clone(),
            uboot_version: None,
            link_metric_gen_rate: settings.link_metric_gen_rate,
            link_metric_burst_size: settings.link_metric_burst_size,
            link_metric_min_changes: settings.link_metric_min_changes,
        },
        runner.clone(),
        progress,
        initial_upgrade_status,
    );

    let config_ctx = ctx_for(&mut registry, appid::MINION_CONFIG);
    let config = config_app::ConfigApp::new(
        minion_state.clone(),
        ConfigMetadata::default(),
        runner.clone(),
    );

    let ignition_ctx = ctx_for(&mut registry, appid::MINION_IGNITION);
    let ignition = ignition_app::IgnitionApp::new(
        minion_state.clone(),
        Duration::from_secs(settings.linkup_resp_wait_timeout_s),
    );

    let driver_ctx = ctx_for(&mut registry, appid::MINION_DRIVER);
    let driver = driver_app::DriverApp::new(driver_pair);

    let openr_ctx = ctx_for(&mut registry, appid::MINION_OPENR_CLIENT);
    let openr = openr_client::OpenrClientApp::new(minion_state.clone());

    let traffic_ctx = ctx_for(&mut registry, appid::MINION_TRAFFIC);
    let traffic = traffic_app::TrafficApp::new();

    let minion_broker = broker::MinionBroker::new(
        minion_state.node_info.node_id.clone(),
        settings.controller_host.clone(),
        settings.controller_router_port,
        registry,
        outbound_rx,
        Duration::from_secs(settings.ctrl_socket_timeout_s),
    );
    let broker_shutdown = coordinator.child_token();
    let broker_handle = tokio::spawn(async move {
        minion_broker.run(broker_shutdown).await;
    });
    coordinator.track("minion-broker", broker_handle);

    coordinator.spawn(upgrade, upgrade_ctx);
    coordinator.spawn(status, status_ctx);
    coordinator.spawn(config, config_ctx);
    coordinator.spawn(ignition, ignition_ctx);
    coordinator.spawn(driver, driver_ctx);
    coordinator.spawn(openr, openr_ctx);
    coordinator.spawn(traffic, traffic_ctx);

    info!(
        node_id = %minion_state.node_info.node_id,
        "minion is up (version {})",
        version
    );
    Ok(MinionHandle {
        state: minion_state,
        event_bus,
        coordinator,
        bus,
    })
}
