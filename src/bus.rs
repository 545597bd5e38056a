//! Process-local message plane.
//!
//! Each app owns one mpsc inbox; the process's broker task owns the registry
//! and moves envelopes between inboxes and the external transport. Apps only
//! ever talk to the broker through a cloned [`BusHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::messages::Message;

/// Default inbox depth per app.
pub const INBOX_CAPACITY: usize = 512;

/// A message delivered to an app's inbox.
#[derive(Debug)]
pub struct Inbound {
    /// Node id of the originating process ("" for an app in this process).
    pub sender_node: String,
    pub sender_app: String,
    pub message: Message,
}

/// A message an app hands to its broker for routing.
#[derive(Debug)]
pub struct Outbound {
    /// "" routes to a local app; otherwise a minion or API-client id.
    pub dest_node: String,
    pub dest_app: String,
    pub sender_app: String,
    pub message: Message,
    /// Request gzip for large bodies leaving the process.
    pub compress: bool,
}

/// Dropped-message accounting, bumped by brokers on undeliverable envelopes.
#[derive(Debug, Default)]
pub struct BusCounters {
    pub dropped_no_route: AtomicU64,
    pub dropped_full_inbox: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl BusCounters {
    pub fn dropped_no_route(&self) -> u64 {
        self.dropped_no_route.load(Ordering::Relaxed)
    }

    pub fn dropped_full_inbox(&self) -> u64 {
        self.dropped_full_inbox.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Cloneable sender side of the plane, given to every app.
#[derive(Clone)]
pub struct BusHandle {
    outbound: mpsc::Sender<Outbound>,
}

impl BusHandle {
    /// Route a message. Routing failures are absorbed by the broker (drop +
    /// counter); retry policy belongs to the caller's own timers.
    pub async fn send(
        &self,
        dest_node: impl Into<String>,
        dest_app: impl Into<String>,
        sender_app: impl Into<String>,
        message: Message,
    ) {
        self.send_opts(dest_node, dest_app, sender_app, message, false)
            .await;
    }

    /// Route a message, requesting compression for large bodies.
    pub async fn send_opts(
        &self,
        dest_node: impl Into<String>,
        dest_app: impl Into<String>,
        sender_app: impl Into<String>,
        message: Message,
        compress: bool,
    ) {
        let out = Outbound {
            dest_node: dest_node.into(),
            dest_app: dest_app.into(),
            sender_app: sender_app.into(),
            message,
            compress,
        };
        if self.outbound.send(out).await.is_err() {
            warn!("bus: broker is gone, dropping outbound message");
        }
    }
}

/// Inbox registry, owned by the process's broker.
pub struct AppRegistry {
    inboxes: HashMap<String, mpsc::Sender<Inbound>>,
    counters: Arc<BusCounters>,
}

impl AppRegistry {
    pub fn new(counters: Arc<BusCounters>) -> Self {
        Self {
            inboxes: HashMap::new(),
            counters,
        }
    }

    /// Register an app inbox, returning its receiver half.
    pub fn register(&mut self, app_id: &str) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if self.inboxes.insert(app_id.to_string(), tx).is_some() {
            warn!(app_id, "bus: duplicate app registration, replacing inbox");
        }
        rx
    }

    /// Deliver to a local app. Undeliverable messages are dropped with a
    /// counter bump; there is no buffering beyond the inbox itself.
    pub fn dispatch(&self, dest_app: &str, inbound: Inbound) {
        match self.inboxes.get(dest_app) {
            Some(tx) => {
                if let Err(e) = tx.try_send(inbound) {
                    match e {
                        mpsc::error::TrySendError::Full(m) => {
                            self.counters
                                .dropped_full_inbox
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(dest_app, kind = m.message.kind(), "bus: inbox full, dropping");
                        }
                        mpsc::error::TrySendError::Closed(m) => {
                            self.counters
                                .dropped_no_route
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(dest_app, kind = m.message.kind(), "bus: inbox closed, dropping");
                        }
                    }
                }
            }
            None => {
                self.counters
                    .dropped_no_route
                    .fetch_add(1, Ordering::Relaxed);
                warn!(dest_app, "bus: no such app, dropping message");
            }
        }
    }

    pub fn has_app(&self, app_id: &str) -> bool {
        self.inboxes.contains_key(app_id)
    }

    pub fn counters(&self) -> &Arc<BusCounters> {
        &self.counters
    }
}

/// Create the plane's outbound channel and handle.
pub fn outbound_channel() -> (BusHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY * 4);
    (BusHandle { outbound: tx }, rx)
}
