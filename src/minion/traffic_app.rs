//! Minion TrafficApp: iperf/ping subprocess orchestration.
//!
//! Measurement tools run as child processes in worker tasks; only the
//! completion result crosses back into the app loop, which forwards it to
//! the requester.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::BusHandle;
use crate::messages::{appid, Message, TrafficResult};

pub struct TrafficApp;

impl TrafficApp {
    pub fn new() -> Self {
        Self
    }

    /// Spawn a measurement subprocess; its output is posted back to the
    /// requester when it exits.
    fn spawn_tool(
        bus: BusHandle,
        reply_node: String,
        reply_app: String,
        program: &'static str,
        args: Vec<String>,
    ) {
        tokio::spawn(async move {
            info!(program, ?args, "running traffic tool");
            let output = tokio::process::Command::new(program)
                .args(&args)
                .output()
                .await;
            let result = match output {
                Ok(out) => TrafficResult {
                    success: out.status.success(),
                    output: String::from_utf8_lossy(&out.stdout).into_owned(),
                },
                Err(e) => {
                    warn!(program, "traffic tool failed to spawn: {}", e);
                    TrafficResult {
                        success: false,
                        output: e.to_string(),
                    }
                }
            };
            bus.send(
                reply_node,
                reply_app,
                appid::MINION_TRAFFIC,
                Message::TrafficResult(result),
            )
            .await;
        });
    }
}

impl Default for TrafficApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl App for TrafficApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_TRAFFIC
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::StartMinionPing(req) => {
                            Self::spawn_tool(
                                ctx.bus.clone(),
                                inbound.sender_node.clone(),
                                inbound.sender_app.clone(),
                                "ping6",
                                vec![
                                    "-c".into(),
                                    req.count.to_string(),
                                    req.dest_ip.clone(),
                                ],
                            );
                        }
                        Message::StartMinionIperf(req) => {
                            Self::spawn_tool(
                                ctx.bus.clone(),
                                inbound.sender_node.clone(),
                                inbound.sender_app.clone(),
                                "iperf3",
                                vec![
                                    "-c".into(),
                                    req.dest_ip.clone(),
                                    "-t".into(),
                                    req.time_s.to_string(),
                                    "-p".into(),
                                    req.port.to_string(),
                                    "-J".into(),
                                ],
                            );
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
