#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! High availability: two peered controllers and failover.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use terragraph_e2e::ctrl;
use terragraph_e2e::messages::{appid, BinaryStarFsmState, Message};
use terragraph_e2e::nodecfg::{ConfigHelper, ConfigPaths};
use terragraph_e2e::shared::SharedState;
use terragraph_e2e::topology::TopologyWrapper;

use support::*;

async fn start_ha_controller(
    primary: bool,
    pub_port: u16,
    peer_pub_port: u16,
) -> (ctrl::ControllerHandle, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut settings = test_controller_settings(&tmp);
    settings.bstar.primary = primary;
    settings.bstar.pub_port = pub_port;
    settings.bstar.peer_host = "127.0.0.1".into();
    settings.bstar.peer_pub_port = peer_pub_port;

    let config = ConfigHelper::load(ConfigPaths::default()).unwrap();
    let shared = SharedState::new(TopologyWrapper::default(), config);
    let handle = ctrl::spawn_controller(&settings, shared, TEST_VERSION.to_string())
        .await
        .unwrap();
    (handle, tmp)
}

async fn fsm_state(app_port: u16) -> BinaryStarFsmState {
    let mut client = ApiClient::connect_to(app_port).await;
    client.send(appid::CTRL_BINARY_STAR, Message::BinaryStarGetState).await;
    match client.recv().await {
        Message::BinaryStarFsm { state } => state,
        other => panic!("expected FSM state, got {:?}", other.kind()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_primary_backup_roles_settle() {
    let port_a = free_port().await;
    let port_b = free_port().await;
    let (primary, _ta) = start_ha_controller(true, port_a, port_b).await;
    let (backup, _tb) = start_ha_controller(false, port_b, port_a).await;

    // Peers find each other: primary ACTIVE, backup PASSIVE.
    wait_for(Duration::from_secs(10), "roles to settle", || async {
        let p = primary.routing_active.load(Ordering::SeqCst);
        let b = backup.routing_active.load(Ordering::SeqCst);
        (p && !b).then_some(())
    })
    .await;
    assert_eq!(fsm_state(primary.ports.app_port).await, BinaryStarFsmState::Active);

    // The passive instance refuses NMS requests at the broker.
    let mut client = ApiClient::connect_to(backup.ports.app_port).await;
    let reply = client
        .request(appid::CTRL_BINARY_STAR, Message::BinaryStarGetState)
        .await;
    match reply {
        Message::E2eAck(ack) => {
            assert!(!ack.success);
            assert!(ack.message.contains("passive"), "reason: {}", ack.message);
        }
        other => panic!("expected refusal, got {:?}", other.kind()),
    }

    // Failover: kill the primary; the backup takes over within the peer
    // timeout (plus beacon slack).
    primary.shutdown().await;
    wait_for(Duration::from_secs(10), "backup takeover", || async {
        backup.routing_active.load(Ordering::SeqCst).then_some(())
    })
    .await;
    assert_eq!(fsm_state(backup.ports.app_port).await, BinaryStarFsmState::Active);

    backup.shutdown().await;
}
