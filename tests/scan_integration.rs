#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Scan orchestration: fan-out, collection, and completion.

mod support;

use std::time::Duration;

use terragraph_e2e::messages::{
    appid, E2eAck, GetScanStatusReq, Message, ScanType, StartScanReq,
};

use support::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_topo_scan_fans_out_and_completes() {
    let ctrl = start_controller(
        vec![dn("node-0", 0, "s0", true), dn("node-1", 1, "s1", false)],
        vec![wireless("node-0", 0, "node-1", 1)],
        vec![site("s0"), site("s1")],
    )
    .await;
    let rf = RfEnvironment::new();
    let _m0 = start_minion(&ctrl, &mac(0), vec![mac(0)], &rf).await;
    let _m1 = start_minion(&ctrl, &mac(1), vec![mac(1)], &rf).await;

    // Both nodes must be online before they can participate.
    wait_for(Duration::from_secs(10), "nodes online", || async {
        let topo = ctrl.handle.shared.read_topology().await;
        let all_online = topo.all_nodes().all(|n| n.status.is_online());
        all_online.then_some(())
    })
    .await;

    let mut client = ApiClient::connect(&ctrl).await;
    let reply = client
        .request(
            appid::CTRL_SCAN,
            Message::StartScanReq(StartScanReq {
                scan_type: ScanType::Topo,
                tx_node: None,
            }),
        )
        .await;
    match reply {
        Message::E2eAck(E2eAck { success, message }) => {
            assert!(success, "scan must schedule: {}", message);
        }
        other => panic!("unexpected reply {:?}", other.kind()),
    }

    // Every radio answers with a completion marker; the scan finishes with
    // one response per participating radio.
    wait_for(Duration::from_secs(20), "scan completion", || async {
        let mut c = ApiClient::connect(&ctrl).await;
        match c
            .request(
                appid::CTRL_SCAN,
                Message::GetScanStatusReq(GetScanStatusReq { scan_id: None }),
            )
            .await
        {
            Message::ScanStatus(status) => {
                let scan = status.scans.get(&1)?;
                (scan.complete && scan.responses.len() == 2).then_some(())
            }
            _ => None,
        }
    })
    .await;

    ctrl.handle.shutdown().await;
}
