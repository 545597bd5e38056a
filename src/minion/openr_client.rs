//! Minion OpenrClientApp: routing plumbing boundary.
//!
//! Serves adjacency dumps to the controller and absorbs link metric pushes
//! from StatusApp. The actual routing daemon interface is out of scope;
//! this app holds the bus contract and the local adjacency view (derived
//! from the associated-peer set).

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

use crate::apps::{App, AppContext};
use crate::messages::{appid, Message, RoutingAdjacencies};
use crate::minion::state::MinionState;

pub struct OpenrClientApp {
    state: MinionState,
    /// Last metric pushed per peer (observability only).
    link_metrics: BTreeMap<String, String>,
}

impl OpenrClientApp {
    pub fn new(state: MinionState) -> Self {
        Self {
            state,
            link_metrics: BTreeMap::new(),
        }
    }

    async fn adjacency_dump(&self) -> RoutingAdjacencies {
        let node_id = self.state.node_info.node_id.clone();
        let peers = self.state.peer_macs().await;
        RoutingAdjacencies {
            adjacency_map: BTreeMap::from([(node_id, peers)]),
        }
    }
}

#[async_trait]
impl App for OpenrClientApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_OPENR_CLIENT
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::GetRoutingAdjacencies => {
                            let dump = self.adjacency_dump().await;
                            ctx.reply(
                                appid::MINION_OPENR_CLIENT,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::RoutingAdjacencies(dump),
                            )
                            .await;
                        }
                        Message::RoutingAdjacencies(push) => {
                            // Metric updates from StatusApp land here on
                            // their way to the routing daemon.
                            for (peer, metrics) in &push.adjacency_map {
                                if let Some(metric) = metrics.first() {
                                    self.link_metrics.insert(peer.clone(), metric.clone());
                                }
                            }
                        }
                        Message::UpdateLinkMetrics => {
                            debug!("link monitor sync requested");
                        }
                        other => {
                            debug!(kind = other.kind(), from = %inbound.sender_app,
                                "unexpected message");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
