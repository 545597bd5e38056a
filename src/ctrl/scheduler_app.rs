//! SchedulerApp: arbitration of the BWGD timeline.
//!
//! Scans (and synchronized config changes) need a future BWGD index agreed
//! on by every participant. This app hands out non-overlapping slots with
//! enough lead time for commands to reach the radios.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::apps::{App, AppContext};
use crate::messages::{appid, GetSlotResp, Message};

/// One BWGD is 25.6 ms.
pub const BWGD_MS_NUMERATOR: u64 = 256;
pub const BWGD_MS_DENOMINATOR: u64 = 10;

/// Minimum lead time before a granted slot, in BWGDs (~2.5 s).
const SLOT_LEAD_BWGD: u64 = 100;

/// Current BWGD index from wall-clock time.
pub fn current_bwgd_idx() -> u64 {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    now_ms * BWGD_MS_DENOMINATOR / BWGD_MS_NUMERATOR
}

pub struct SchedulerApp {
    /// First BWGD index not yet handed out.
    next_free_bwgd: u64,
}

impl SchedulerApp {
    pub fn new() -> Self {
        Self { next_free_bwgd: 0 }
    }

    /// Allocate a slot: after the lead time and after every prior grant.
    fn allocate(&mut self, duration_bwgd: u64) -> u64 {
        let earliest = current_bwgd_idx() + SLOT_LEAD_BWGD;
        let start = earliest.max(self.next_free_bwgd);
        self.next_free_bwgd = start + duration_bwgd.max(1);
        start
    }
}

impl Default for SchedulerApp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl App for SchedulerApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_SCHEDULER
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match &inbound.message {
                        Message::GetSlotReq(req) => {
                            let bwgd_idx = self.allocate(req.duration_bwgd);
                            ctx.reply(
                                appid::CTRL_SCHEDULER,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::GetSlotResp(GetSlotResp { id: req.id, bwgd_idx }),
                            )
                            .await;
                        }
                        other => {
                            debug!(kind = other.kind(), "unexpected message");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
