//! Controller broker: routes envelopes between local apps, minions, and
//! NMS/API clients.
//!
//! The router task exclusively owns the peer socket tables. Accept tasks
//! only decode the registration handshake and pump frames; all routing
//! decisions happen on the router task. Forwarding is stateless per
//! message and undeliverable envelopes are dropped with a counter bump;
//! retry policy lives in the originating app.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{AppRegistry, BusCounters, Inbound, Outbound};
use crate::events::SharedEventBus;
use crate::messages::{appid, E2eAck, Message, PeerKind};
use crate::wire::{auth_meta_blob, framed, Envelope, IP_ADDRESS_META_PROPERTY};

/// Internal events from connection tasks to the router task.
enum NetEvent {
    Register {
        peer_id: String,
        kind: PeerKind,
        conn_seq: u64,
        tx: mpsc::Sender<Envelope>,
    },
    Deregister {
        peer_id: String,
        conn_seq: u64,
    },
    Inbound {
        peer_id: String,
        envelope: Envelope,
    },
}

struct PeerHandle {
    kind: PeerKind,
    conn_seq: u64,
    tx: mpsc::Sender<Envelope>,
    last_seen: Instant,
}

/// Ports actually bound (for port-0 test setups).
#[derive(Debug, Clone, Copy)]
pub struct BoundPorts {
    pub minion_port: u16,
    pub app_port: u16,
    pub event_port: u16,
}

/// Shared flag: only the ACTIVE instance routes minion traffic.
pub type RoutingActive = Arc<AtomicBool>;

/// Routing state and policy, separated from the listeners so `run` can
/// move the listeners into their accept tasks.
struct Router {
    registry: AppRegistry,
    routing_active: RoutingActive,
    peer_timeout: Duration,
    peers: HashMap<String, PeerHandle>,
}

impl Router {
    /// Send dealer echoes and purge peers that went silent.
    fn liveness_pass(&mut self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        for (peer_id, handle) in self.peers.iter() {
            if now.duration_since(handle.last_seen) > self.peer_timeout {
                stale.push(peer_id.clone());
                continue;
            }
            if handle.kind == PeerKind::Minion {
                match Envelope::new(
                    peer_id.clone(),
                    appid::MINION_BROKER,
                    appid::CTRL_BROKER,
                    &Message::DealerEcho,
                    false,
                ) {
                    Ok(echo) => {
                        let _ = handle.tx.try_send(echo);
                    }
                    Err(e) => warn!("dealer echo encode failed: {}", e),
                }
            }
        }
        for peer_id in stale {
            warn!(peer_id, "peer silent past timeout, recreating handle");
            self.peers.remove(&peer_id);
        }
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Register {
                peer_id,
                kind,
                conn_seq,
                tx,
            } => {
                if let Some(existing) = self.peers.get(&peer_id) {
                    warn!(
                        peer_id,
                        "duplicate registration (replacing stale handle from conn {})",
                        existing.conn_seq
                    );
                } else {
                    info!(peer_id, ?kind, "peer registered");
                }
                self.peers.insert(
                    peer_id,
                    PeerHandle {
                        kind,
                        conn_seq,
                        tx,
                        last_seen: Instant::now(),
                    },
                );
            }
            NetEvent::Deregister { peer_id, conn_seq } => {
                // Only drop if the handle still belongs to this connection
                // (a newer registration wins).
                if self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|p| p.conn_seq == conn_seq)
                {
                    info!(peer_id, "peer disconnected");
                    self.peers.remove(&peer_id);
                }
            }
            NetEvent::Inbound { peer_id, envelope } => {
                self.handle_inbound(peer_id, envelope);
            }
        }
    }

    fn handle_inbound(&mut self, peer_id: String, mut envelope: Envelope) {
        let kind = match self.peers.get_mut(&peer_id) {
            Some(handle) => {
                handle.last_seen = Instant::now();
                handle.kind
            }
            None => {
                debug!(peer_id, "inbound from unregistered peer, dropping");
                return;
            }
        };

        let active = self.routing_active.load(Ordering::SeqCst);

        // Relay to another peer (e.g. NMS client addressing a minion, or a
        // minion answering such a request). The source identity rides in
        // sender_node so the reply path works.
        if !envelope.dest_node.is_empty() {
            if !active {
                self.refuse_if_client(&peer_id, kind, &envelope);
                return;
            }
            let Some(target) = self.peers.get(&envelope.dest_node) else {
                self.counters()
                    .dropped_no_route
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    dest_node = %envelope.dest_node,
                    "no transport handle for relay target, dropping"
                );
                return;
            };
            envelope.sender_node = peer_id;
            if target.tx.try_send(envelope).is_err() {
                self.counters()
                    .dropped_full_inbox
                    .fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let message = match envelope.message() {
            Ok(m) => m,
            Err(e) => {
                self.counters()
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_id, "malformed message dropped: {}", e);
                return;
            }
        };

        // Broker-level liveness echo; never dispatched to apps.
        if matches!(message, Message::DealerEcho) {
            return;
        }
        // A repeated hello on a live connection is ignored (and logged).
        if matches!(message, Message::Hello { .. }) {
            debug!(peer_id, "duplicate hello ignored");
            return;
        }

        if !active {
            match kind {
                // PASSIVE: drain minion traffic silently.
                PeerKind::Minion => return,
                PeerKind::ApiClient => {
                    self.refuse_if_client(&peer_id, kind, &envelope);
                    return;
                }
            }
        }

        self.registry.dispatch(
            &envelope.dest_app,
            Inbound {
                sender_node: peer_id,
                sender_app: envelope.sender_app,
                message,
            },
        );
    }

    /// PASSIVE instances refuse NMS requests outright.
    fn refuse_if_client(&self, peer_id: &str, kind: PeerKind, envelope: &Envelope) {
        if kind != PeerKind::ApiClient {
            return;
        }
        if let Some(handle) = self.peers.get(peer_id) {
            if let Ok(reply) = Envelope::new(
                peer_id.to_string(),
                envelope.sender_app.clone(),
                appid::CTRL_BROKER,
                &Message::E2eAck(E2eAck::fail("controller is passive")),
                false,
            ) {
                let _ = handle.tx.try_send(reply);
            }
        }
    }

    fn route_outbound(&mut self, out: Outbound) {
        if out.dest_node.is_empty() {
            // Local app-to-app delivery.
            self.registry.dispatch(
                &out.dest_app,
                Inbound {
                    sender_node: String::new(),
                    sender_app: out.sender_app,
                    message: out.message,
                },
            );
            return;
        }

        let Some(handle) = self.peers.get(&out.dest_node) else {
            self.counters()
                .dropped_no_route
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                dest_node = %out.dest_node,
                kind = out.message.kind(),
                "no transport handle for node, dropping"
            );
            return;
        };

        if handle.kind == PeerKind::Minion && !self.routing_active.load(Ordering::SeqCst) {
            // PASSIVE instances do not drive minions.
            return;
        }

        match Envelope::new(
            out.dest_node.clone(),
            out.dest_app,
            out.sender_app,
            &out.message,
            out.compress,
        ) {
            Ok(env) => {
                if handle.tx.try_send(env).is_err() {
                    self.counters()
                        .dropped_full_inbox
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(dest_node = %out.dest_node, "peer send queue full, dropping");
                }
            }
            Err(e) => warn!("outbound envelope encode failed: {}", e),
        }
    }

    fn counters(&self) -> &Arc<BusCounters> {
        self.registry.counters()
    }
}

pub struct CtrlBroker {
    router: Router,
    outbound_rx: mpsc::Receiver<Outbound>,
    minion_listener: TcpListener,
    app_listener: TcpListener,
    event_listener: TcpListener,
    event_bus: SharedEventBus,
    heartbeat_interval: Duration,
    log_auth_minions: bool,
    log_auth_apps: bool,
}

impl CtrlBroker {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        listen_addr: &str,
        minion_port: u16,
        app_port: u16,
        event_port: u16,
        registry: AppRegistry,
        outbound_rx: mpsc::Receiver<Outbound>,
        event_bus: SharedEventBus,
        routing_active: RoutingActive,
        heartbeat_interval: Duration,
        peer_timeout: Duration,
        log_auth_minions: bool,
        log_auth_apps: bool,
    ) -> Result<(Self, BoundPorts)> {
        let minion_listener = TcpListener::bind((listen_addr, minion_port))
            .await
            .with_context(|| format!("binding minion socket on port {}", minion_port))?;
        let app_listener = TcpListener::bind((listen_addr, app_port))
            .await
            .with_context(|| format!("binding apps socket on port {}", app_port))?;
        let event_listener = TcpListener::bind((listen_addr, event_port))
            .await
            .with_context(|| format!("binding event socket on port {}", event_port))?;
        let ports = BoundPorts {
            minion_port: minion_listener.local_addr()?.port(),
            app_port: app_listener.local_addr()?.port(),
            event_port: event_listener.local_addr()?.port(),
        };
        info!(
            "Broker listening: minions :{}, apps :{}, events :{}",
            ports.minion_port, ports.app_port, ports.event_port
        );
        Ok((
            Self {
                router: Router {
                    registry,
                    routing_active,
                    peer_timeout,
                    peers: HashMap::new(),
                },
                outbound_rx,
                minion_listener,
                app_listener,
                event_listener,
                event_bus,
                heartbeat_interval,
                log_auth_minions,
                log_auth_apps,
            },
            ports,
        ))
    }

    pub fn counters(&self) -> Arc<BusCounters> {
        self.router.registry.counters().clone()
    }

    /// Run the broker until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let CtrlBroker {
            mut router,
            mut outbound_rx,
            minion_listener,
            app_listener,
            event_listener,
            event_bus,
            heartbeat_interval,
            log_auth_minions,
            log_auth_apps,
        } = self;

        let (net_tx, mut net_rx) = mpsc::channel::<NetEvent>(1024);

        // Accept loops for minions and API clients.
        let accept_minions = spawn_accept_loop(
            minion_listener,
            PeerKind::Minion,
            net_tx.clone(),
            shutdown.clone(),
            log_auth_minions,
        );
        let accept_apps = spawn_accept_loop(
            app_listener,
            PeerKind::ApiClient,
            net_tx.clone(),
            shutdown.clone(),
            log_auth_apps,
        );
        // Event stream publisher.
        let event_task = spawn_event_publisher(event_listener, event_bus, shutdown.clone());

        let mut echo_timer = tokio::time::interval(heartbeat_interval);
        echo_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = echo_timer.tick() => router.liveness_pass(),

                event = net_rx.recv() => {
                    let Some(event) = event else { break };
                    router.handle_net_event(event);
                }

                out = outbound_rx.recv() => {
                    let Some(out) = out else { break };
                    router.route_outbound(out);
                }
            }
        }

        accept_minions.abort();
        accept_apps.abort();
        event_task.abort();
        info!("Broker stopped");
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    expected_kind: PeerKind,
    net_tx: mpsc::Sender<NetEvent>,
    shutdown: CancellationToken,
    log_auth: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut conn_seq: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            conn_seq += 1;
                            tokio::spawn(handle_connection(
                                stream,
                                addr,
                                expected_kind,
                                conn_seq,
                                net_tx.clone(),
                                shutdown.clone(),
                                log_auth,
                            ));
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    expected_kind: PeerKind,
    conn_seq: u64,
    net_tx: mpsc::Sender<NetEvent>,
    shutdown: CancellationToken,
    log_auth: bool,
) {
    if log_auth {
        // Observational only; acceptance is unconditional.
        let blob = auth_meta_blob(IP_ADDRESS_META_PROPERTY, &addr.ip().to_string());
        debug!(
            "connection from {} (auth metadata {} bytes)",
            addr,
            blob.len()
        );
    }

    let framed_stream = framed(stream);
    let (mut sink, mut source) = framed_stream.split();

    // The first frame must be a hello carrying the peer's identity.
    let peer_id = loop {
        let Some(frame) = source.next().await else {
            return;
        };
        let Ok(frame) = frame else { return };
        let Ok(env) = Envelope::from_frame(&frame) else {
            warn!("connection from {}: bad first frame", addr);
            return;
        };
        match env.message() {
            Ok(Message::Hello { node_id, kind }) => {
                if kind != expected_kind {
                    warn!(
                        "connection from {}: wrong peer kind {:?} on {:?} socket",
                        addr, kind, expected_kind
                    );
                    return;
                }
                if node_id.is_empty() {
                    warn!("connection from {}: empty node id", addr);
                    return;
                }
                break node_id;
            }
            _ => {
                warn!("connection from {}: expected hello first", addr);
                return;
            }
        }
    };

    let (tx, mut rx) = mpsc::channel::<Envelope>(256);
    if net_tx
        .send(NetEvent::Register {
            peer_id: peer_id.clone(),
            kind: expected_kind,
            conn_seq,
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    // Writer: drain the peer queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            match env.to_frame() {
                Ok(frame) => {
                    if sink.send(frame.into()).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("frame encode failed: {}", e),
            }
        }
    });

    // Reader: pump frames to the router task.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = source.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        match Envelope::from_frame(&frame) {
                            Ok(env) => {
                                if net_tx
                                    .send(NetEvent::Inbound { peer_id: peer_id.clone(), envelope: env })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => warn!(peer_id, "bad frame: {}", e),
                        }
                    }
                    Some(Err(e)) => {
                        debug!(peer_id, "read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    writer.abort();
    let _ = net_tx
        .send(NetEvent::Deregister { peer_id, conn_seq })
        .await;
}

/// Stream monitor events to every subscriber on the event port.
fn spawn_event_publisher(
    listener: TcpListener,
    event_bus: SharedEventBus,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    debug!("event subscriber connected from {}", addr);
                    let mut rx = event_bus.subscribe();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let mut sink = framed(stream);
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                event = rx.recv() => {
                                    let Ok(event) = event else { break };
                                    let Ok(buf) = serde_json::to_vec(&event) else { continue };
                                    if sink.send(buf.into()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
            }
        }
    })
}
