//! Minion DriverApp: the only doorway to the netlink driver.
//!
//! All driver-bound traffic funnels through this app onto the single pair
//! socket; messages from the driver fan out to the owning apps by type.
//! PassThru ordering is preserved by construction: one queue in, one
//! socket out.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::apps::{App, AppContext};
use crate::driver::DriverPair;
use crate::messages::{appid, FwReqType, Message};
use crate::minion::broker::CTRL_NODE_ID;

pub struct DriverApp {
    pair: DriverPair,
}

impl DriverApp {
    pub fn new(pair: DriverPair) -> Self {
        Self { pair }
    }

    /// Which local app consumes a driver-originated message.
    fn receiver_app(message: &Message) -> Option<&'static str> {
        match message {
            Message::NodeInitNotify(_)
            | Message::FwHealthReport { .. }
            | Message::DevUpDownStatus(_) => Some(appid::MINION_STATUS),
            Message::DriverLinkStatus(_) => Some(appid::MINION_IGNITION),
            Message::FwConfigResp(_) => Some(appid::MINION_CONFIG),
            Message::FwAck(ack) => match ack.req_type {
                FwReqType::SetLinkStatus => Some(appid::MINION_IGNITION),
                FwReqType::FwConfig => Some(appid::MINION_CONFIG),
                FwReqType::GpsEnable | FwReqType::NodeParams | FwReqType::StatsConfigure => {
                    Some(appid::MINION_STATUS)
                }
                FwReqType::Scan => None, // logged only
            },
            _ => None,
        }
    }

    async fn dispatch_from_driver(&self, ctx: &AppContext, message: Message) {
        // Scan responses go straight upstream to the controller.
        if matches!(message, Message::ScanResp(_)) {
            ctx.bus
                .send(CTRL_NODE_ID, appid::CTRL_SCAN, appid::MINION_DRIVER, message)
                .await;
            return;
        }
        match Self::receiver_app(&message) {
            Some(receiver) => {
                ctx.bus
                    .send("", receiver, appid::MINION_DRIVER, message)
                    .await;
            }
            None => {
                debug!(kind = message.kind(), "driver message with no consumer");
            }
        }
    }
}

#[async_trait]
impl App for DriverApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_DRIVER
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,

                from_driver = self.pair.rx.recv() => {
                    let Some(message) = from_driver else {
                        warn!("driver pair closed");
                        break;
                    };
                    self.dispatch_from_driver(&ctx, message).await;
                }

                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match inbound.message {
                        m @ (Message::NodeInit { .. }
                        | Message::GpsEnableReq { .. }
                        | Message::FwSetNodeParams { .. }
                        | Message::DriverSetLinkStatus(_)
                        | Message::FwConfigReq { .. }
                        | Message::FwSetLogConfig { .. }
                        | Message::ScanReq(_)) => {
                            if self.pair.tx.send(m).await.is_err() {
                                warn!("driver pair send failed");
                                break;
                            }
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
