#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end ignition scenarios: controller + minions + scripted firmware.

mod support;

use std::time::Duration;

use terragraph_e2e::messages::{appid, E2eAck, LinkStatusType, Message, SetLinkStatusReq};
use terragraph_e2e::topology::link_name;

use support::*;

/// Two nodes, one link: the controller ignites it exactly once and the
/// graph converges to alive.
#[tokio::test(flavor = "multi_thread")]
async fn test_two_node_ignition() {
    let ctrl = start_controller(
        vec![dn("node-0", 0, "pole-a", true), cn("node-1", 1, "pole-a")],
        vec![wireless("node-0", 0, "node-1", 1)],
        vec![site("pole-a")],
    )
    .await;
    let rf = RfEnvironment::new();
    let _m0 = start_minion(&ctrl, &mac(0), vec![mac(0)], &rf).await;
    let _m1 = start_minion(&ctrl, &mac(1), vec![mac(1)], &rf).await;

    let link = link_name("node-0", "node-1");
    wait_for(Duration::from_secs(15), "link to come alive", || async {
        link_alive_map(&ctrl).await.get(&link).copied().unwrap_or(false).then_some(())
    })
    .await;

    // Exactly one association command, initiated by node-0's radio toward
    // node-1 (a CN never initiates).
    let cmds = rf.assoc_cmds();
    assert_eq!(cmds.len(), 1, "expected exactly one LINK_UP, got {:?}", cmds);
    assert_eq!(cmds[0].radio_mac, mac(0));
    assert_eq!(cmds[0].responder_mac, mac(1));

    // Settling time: no duplicate attempts after the link is up.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rf.assoc_cmds().len(), 1);

    ctrl.handle.shutdown().await;
}

/// Four-node diamond: every link ignited exactly once, all four alive.
#[tokio::test(flavor = "multi_thread")]
async fn test_four_node_diamond_ignition() {
    let nodes = vec![
        dn("node-0", 0, "s0", true),
        dn("node-1", 1, "s1", false),
        dn("node-2", 2, "s2", false),
        dn("node-3", 3, "s3", false),
    ];
    let links = vec![
        wireless("node-0", 0, "node-1", 1),
        wireless("node-1", 1, "node-2", 2),
        wireless("node-0", 0, "node-3", 3),
        wireless("node-2", 2, "node-3", 3),
    ];
    let sites = vec![site("s0"), site("s1"), site("s2"), site("s3")];
    let ctrl = start_controller(nodes, links, sites).await;

    let rf = RfEnvironment::new();
    let mut minions = Vec::new();
    for idx in 0..4u8 {
        minions.push(start_minion(&ctrl, &mac(idx), vec![mac(idx)], &rf).await);
    }

    wait_for(Duration::from_secs(30), "all links alive", || async {
        let alive = link_alive_map(&ctrl).await;
        alive.values().all(|v| *v).then_some(())
    })
    .await;

    // Each wireless link was ignited exactly once.
    let mut per_link: std::collections::BTreeMap<String, usize> = Default::default();
    for cmd in rf.assoc_cmds() {
        let a = ctrl
            .handle
            .shared
            .read_topology()
            .await
            .get_node_by_mac(&cmd.radio_mac)
            .unwrap()
            .name
            .clone();
        let z = ctrl
            .handle
            .shared
            .read_topology()
            .await
            .get_node_by_mac(&cmd.responder_mac)
            .unwrap()
            .name
            .clone();
        *per_link.entry(link_name(&a, &z)).or_default() += 1;
    }
    assert_eq!(per_link.len(), 4, "all four links attempted: {:?}", per_link);
    for (link, count) in per_link {
        assert_eq!(count, 1, "{} ignited {} times", link, count);
    }

    ctrl.handle.shutdown().await;
}

/// Node reboot: its links go down within the liveness timeout and re-ignite
/// when the node returns.
#[tokio::test(flavor = "multi_thread")]
async fn test_node_reboot_recovery() {
    let nodes = vec![
        dn("node-0", 0, "s0", true),
        dn("node-1", 1, "s1", false),
        dn("node-2", 2, "s2", false),
    ];
    let links = vec![
        wireless("node-0", 0, "node-1", 1),
        wireless("node-1", 1, "node-2", 2),
    ];
    let ctrl = start_controller(nodes, links, vec![site("s0"), site("s1"), site("s2")]).await;

    let rf = RfEnvironment::new();
    let _m0 = start_minion(&ctrl, &mac(0), vec![mac(0)], &rf).await;
    let m1 = start_minion(&ctrl, &mac(1), vec![mac(1)], &rf).await;
    let _m2 = start_minion(&ctrl, &mac(2), vec![mac(2)], &rf).await;

    wait_for(Duration::from_secs(30), "initial full ignition", || async {
        link_alive_map(&ctrl).await.values().all(|v| *v).then_some(())
    })
    .await;

    // Take node-1 down; both its links must be marked dead within the
    // node-alive timeout (plus reconciliation slack).
    m1.handle.shutdown().await;
    wait_for(Duration::from_secs(10), "links down after node loss", || async {
        let alive = link_alive_map(&ctrl).await;
        (!alive[&link_name("node-0", "node-1")] && !alive[&link_name("node-1", "node-2")])
            .then_some(())
    })
    .await;

    // Node-1 returns: both links re-ignite.
    let _m1b = start_minion(&ctrl, &mac(1), vec![mac(1)], &rf).await;
    wait_for(Duration::from_secs(20), "links re-ignited", || async {
        link_alive_map(&ctrl).await.values().all(|v| *v).then_some(())
    })
    .await;

    ctrl.handle.shutdown().await;
}

/// A CN may never initiate: manual ignition with a CN initiator is refused.
#[tokio::test(flavor = "multi_thread")]
async fn test_manual_ignition_invalid_initiator() {
    let ctrl = start_controller(
        vec![cn("node-0", 0, "s0"), dn("node-1", 1, "s0", false)],
        vec![wireless("node-0", 0, "node-1", 1)],
        vec![site("s0")],
    )
    .await;

    let mut client = ApiClient::connect(&ctrl).await;
    let reply = client
        .request(
            appid::CTRL_IGNITION,
            Message::SetLinkStatusReq(SetLinkStatusReq {
                action: LinkStatusType::LinkUp,
                link_name: link_name("node-0", "node-1"),
                initiator_node: Some("node-0".into()),
            }),
        )
        .await;
    match reply {
        Message::E2eAck(E2eAck { success, message }) => {
            assert!(!success, "CN initiator must be refused");
            assert!(message.contains("CN"), "unexpected reason: {}", message);
        }
        other => panic!("unexpected reply {:?}", other.kind()),
    }

    // An unknown link is also refused.
    let reply = client
        .request(
            appid::CTRL_IGNITION,
            Message::SetLinkStatusReq(SetLinkStatusReq {
                action: LinkStatusType::LinkUp,
                link_name: "link-x-y".into(),
                initiator_node: None,
            }),
        )
        .await;
    assert!(matches!(reply, Message::E2eAck(E2eAck { success: false, .. })));

    ctrl.handle.shutdown().await;
}

/// Dampening: with auto link-up disabled in the firmware, retries on the
/// same link are spaced by the dampen interval.
#[tokio::test(flavor = "multi_thread")]
async fn test_failed_attempts_are_dampened() {
    let ctrl = start_controller(
        vec![dn("node-0", 0, "s0", true), dn("node-1", 1, "s1", false)],
        vec![wireless("node-0", 0, "node-1", 1)],
        vec![site("s0"), site("s1")],
    )
    .await;
    let rf = RfEnvironment::new();
    rf.set_auto_link_up(false); // attempts never succeed
    let _m0 = start_minion(&ctrl, &mac(0), vec![mac(0)], &rf).await;
    let _m1 = start_minion(&ctrl, &mac(1), vec![mac(1)], &rf).await;

    wait_for(Duration::from_secs(15), "first ignition attempt", || async {
        (!rf.assoc_cmds().is_empty()).then_some(())
    })
    .await;

    // Attempts continue, but spaced: with a 2 s dampen (and the much longer
    // bfTimeout pacing the radio), a 5 s window sees at most 2 attempts.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let count = rf.assoc_cmds().len();
    assert!(count <= 2, "expected dampened attempts, saw {}", count);

    ctrl.handle.shutdown().await;
}
