//! Monitor events published alongside the message plane.
//!
//! Every operator-visible occurrence (ignition attempt, config apply, batch
//! abort, HA transition, ...) is recorded as a typed [`Event`] and published
//! on a broadcast channel. The controller re-publishes the stream on its
//! event port; tests subscribe directly.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event category, mirroring the subsystem that emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Ignition,
    Topology,
    Status,
    Config,
    Upgrade,
    Scan,
    Traffic,
    Driver,
    HighAvailability,
}

/// Specific event identifier within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    SetLinkStatus,
    LinkStatusChange,
    NodeStatusChange,
    TopologyNodeAdded,
    TopologyNodeRemoved,
    TopologyLinkAdded,
    TopologyLinkRemoved,
    TopologySiteAdded,
    TopologySiteRemoved,
    MinionSetConfig,
    ConfigModified,
    UpgradeInfo,
    UpgradePrepare,
    UpgradeCommit,
    UpgradeAbort,
    UpgradeImageAdded,
    UpgradeImageRemoved,
    ScanComplete,
    DriverEvent,
    HighAvailabilityStateChange,
    RebootNode,
    MinionRestart,
}

/// Severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Fatal,
}

/// A single monitor event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub category: EventCategory,
    pub id: EventId,
    pub level: EventLevel,
    /// Human-readable reason.
    pub reason: String,
    /// Optional structured details (JSON).
    pub details: Option<serde_json::Value>,
    /// Originating app id.
    pub source: String,
    /// Wall-clock timestamp (ms since epoch).
    pub timestamp_ms: i64,
}

/// Handle for publishing and subscribing to the event stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event, ignoring the no-subscriber case.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus.
pub type SharedEventBus = Arc<EventBus>;

pub fn create_event_bus() -> SharedEventBus {
    Arc::new(EventBus::default())
}

/// Per-app event emitter carrying the source app id.
#[derive(Clone)]
pub struct EventClient {
    source: String,
    bus: SharedEventBus,
}

impl EventClient {
    pub fn new(source: impl Into<String>, bus: SharedEventBus) -> Self {
        Self {
            source: source.into(),
            bus,
        }
    }

    pub fn log_event(
        &self,
        category: EventCategory,
        id: EventId,
        level: EventLevel,
        reason: impl Into<String>,
    ) {
        self.log_event_details(category, id, level, reason, None);
    }

    pub fn log_event_details(
        &self,
        category: EventCategory,
        id: EventId,
        level: EventLevel,
        reason: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.bus.publish(Event {
            category,
            id,
            level,
            reason: reason.into(),
            details,
            source: self.source.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}
