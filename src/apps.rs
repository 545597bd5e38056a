//! App lifecycle plumbing.
//!
//! Every app (controller or minion side) is a single task owning a typed
//! inbox. [`AppHandle`] wraps the app's main loop with consistent lifecycle
//! handling; [`AppCoordinator`] tracks running apps and coordinates graceful
//! shutdown. No callback inside an app may block; long-running work is moved
//! to a worker task whose completion posts a message back.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusHandle, Inbound};
use crate::events::EventClient;

/// Context handed to an app for the duration of its run.
pub struct AppContext {
    /// Sender side of the message plane.
    pub bus: BusHandle,
    /// This app's inbox.
    pub inbox: mpsc::Receiver<Inbound>,
    /// Monitor event emitter, pre-tagged with the app id.
    pub events: EventClient,
    /// Cancellation for shutdown coordination.
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Reply to the sender of an inbound message.
    pub async fn reply(
        &self,
        app_id: &str,
        inbound_sender_node: &str,
        inbound_sender_app: &str,
        message: crate::messages::Message,
    ) {
        self.bus
            .send(inbound_sender_node, inbound_sender_app, app_id, message)
            .await;
    }
}

/// App-specific logic. Lifecycle (startup, shutdown watch, stop logging) is
/// handled by [`AppHandle`].
#[async_trait]
pub trait App: Send + 'static {
    /// Stable app identity on the message plane.
    fn app_id(&self) -> &'static str;

    /// Run the app's event loop until shutdown or error.
    async fn run(&mut self, ctx: AppContext) -> Result<()>;

    /// Optional one-time setup before the loop starts.
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Wraps an [`App`] with lifecycle management.
pub struct AppHandle<T: App> {
    app: T,
    ctx: AppContext,
}

impl<T: App> AppHandle<T> {
    pub fn new(app: T, ctx: AppContext) -> Self {
        Self { app, ctx }
    }

    /// Run to completion: init, main loop, stop logging.
    pub async fn run(mut self) -> Result<()> {
        let app_id = self.app.app_id();
        info!("Starting app: {}", app_id);

        if let Err(e) = self.app.init().await {
            error!("{}: init failed: {}", app_id, e);
            return Err(e);
        }

        let result = self.app.run(self.ctx).await;
        match &result {
            Ok(()) => info!("{}: stopped", app_id),
            Err(e) => error!("{}: stopped with error: {}", app_id, e),
        }
        result
    }
}

/// Tracks spawned apps and coordinates graceful shutdown.
pub struct AppCoordinator {
    handles: HashMap<&'static str, JoinHandle<()>>,
    /// Parent token; each app gets a child.
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl AppCoordinator {
    pub fn new() -> Self {
        Self::with_shutdown_timeout(Duration::from_secs(5))
    }

    pub fn with_shutdown_timeout(timeout: Duration) -> Self {
        Self {
            handles: HashMap::new(),
            shutdown: CancellationToken::new(),
            shutdown_timeout: timeout,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Child token for one app.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Spawn an app under this coordinator.
    pub fn spawn<T: App>(&mut self, app: T, ctx: AppContext) {
        let app_id = app.app_id();
        let handle = tokio::spawn(async move {
            let _ = AppHandle::new(app, ctx).run().await;
        });
        if self.handles.insert(app_id, handle).is_some() {
            warn!(app_id, "coordinator: replacing previously spawned app");
        }
        debug!(app_id, "coordinator: spawned app");
    }

    /// Track an externally spawned task (e.g. the broker) under shutdown.
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.insert(name, handle);
    }

    pub fn running(&self) -> Vec<&'static str> {
        self.handles
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Cancel all apps and join them with a per-app timeout (reverse of start
    /// order is irrelevant: every app tolerates peers vanishing).
    pub async fn shutdown(mut self) {
        let running = self.running();
        if running.is_empty() {
            info!("No apps running, shutdown complete");
            return;
        }
        info!("Shutting down {} app(s): {:?}", running.len(), running);

        self.shutdown.cancel();

        for (name, handle) in self.handles.drain() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => debug!("{}: task joined", name),
                Ok(Err(e)) => error!("{}: task panicked: {}", name, e),
                Err(_) => warn!("{}: did not stop within timeout, abandoning", name),
            }
        }

        info!("Coordinator shutdown complete");
    }
}

impl Default for AppCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::outbound_channel;
    use crate::events::{create_event_bus, EventClient};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct MockApp {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl App for MockApp {
        fn app_id(&self) -> &'static str {
            "mock-app"
        }

        async fn run(&mut self, ctx: AppContext) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            ctx.shutdown.cancelled().await;
            Ok(())
        }
    }

    fn test_ctx(shutdown: CancellationToken) -> AppContext {
        let (bus, _rx) = outbound_channel();
        let (_tx, inbox) = mpsc::channel(8);
        AppContext {
            bus,
            inbox,
            events: EventClient::new("mock-app", create_event_bus()),
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut coord = AppCoordinator::with_shutdown_timeout(Duration::from_millis(200));
        let ran = Arc::new(AtomicBool::new(false));
        coord.spawn(
            MockApp { ran: ran.clone() },
            test_ctx(coord.child_token()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(coord.running(), vec!["mock-app"]);

        coord.shutdown().await;
    }

    struct FailingApp;

    #[async_trait]
    impl App for FailingApp {
        fn app_id(&self) -> &'static str {
            "failing-app"
        }

        async fn init(&mut self) -> Result<()> {
            anyhow::bail!("no config")
        }

        async fn run(&mut self, _ctx: AppContext) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_init_failure_stops_app() {
        let mut coord = AppCoordinator::with_shutdown_timeout(Duration::from_millis(200));
        coord.spawn(FailingApp, test_ctx(coord.child_token()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coord.running().is_empty());
        coord.shutdown().await;
    }
}
