//! BinaryStarApp: primary/backup controller replication.
//!
//! Two controller instances peer over a dedicated pub channel, publishing
//! their FSM state (plus software version) roughly once a second. Only the
//! ACTIVE instance's broker routes minion traffic; the PASSIVE instance
//! drains queues and refuses NMS requests. The ACTIVE side also streams its
//! persistent app data (topology, config overrides) so a failover starts
//! from current state.
//!
//! Split-brain resolution: the backup wins. A primary observing an ACTIVE
//! peer goes PASSIVE; a backup observing silence for the peer timeout takes
//! over.

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::ctrl::broker::RoutingActive;
use crate::events::{EventCategory, EventId, EventLevel};
use crate::messages::{appid, BinaryStarAppData, BinaryStarFsmState, Message};
use crate::shared::SharedState;

/// Peer silence threshold before a takeover.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// Beacon interval on the peer channel.
pub const BEACON_INTERVAL: Duration = Duration::from_millis(1000);

/// App data is replicated every this many beacons while ACTIVE.
const APP_DATA_EVERY_N_BEACONS: u32 = 10;

/// Frames exchanged on the peer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum PeerFrame {
    State {
        state: BinaryStarFsmState,
        version: String,
    },
    AppData(BinaryStarAppData),
}

pub struct BinaryStarAppConfig {
    pub enabled: bool,
    pub primary: bool,
    pub listen_addr: String,
    pub pub_port: u16,
    pub peer_host: String,
    pub peer_pub_port: u16,
    pub version: String,
}

pub struct BinaryStarApp {
    shared: SharedState,
    cfg: BinaryStarAppConfig,
    state: BinaryStarFsmState,
    routing_active: RoutingActive,
    last_peer_seen: Option<Instant>,
    version_mismatch_logged: bool,
    app_data_seq: u64,
    beacon_count: u32,
}

impl BinaryStarApp {
    pub fn new(shared: SharedState, cfg: BinaryStarAppConfig, routing_active: RoutingActive) -> Self {
        let state = if cfg.primary {
            BinaryStarFsmState::Primary
        } else {
            BinaryStarFsmState::Backup
        };
        Self {
            shared,
            cfg,
            state,
            routing_active,
            last_peer_seen: None,
            version_mismatch_logged: false,
            app_data_seq: 0,
            beacon_count: 0,
        }
    }

    fn set_state(&mut self, ctx: &AppContext, new_state: BinaryStarFsmState) {
        if new_state == self.state {
            return;
        }
        info!(from = ?self.state, to = ?new_state, "HA state transition");
        ctx.events.log_event(
            EventCategory::HighAvailability,
            EventId::HighAvailabilityStateChange,
            EventLevel::Info,
            format!("{:?} -> {:?}", self.state, new_state),
        );
        self.state = new_state;
        self.routing_active.store(
            self.state == BinaryStarFsmState::Active,
            Ordering::SeqCst,
        );
    }

    /// Apply a peer state observation to the local FSM.
    fn on_peer_state(
        &mut self,
        ctx: &AppContext,
        peer_state: BinaryStarFsmState,
        peer_version: &str,
    ) {
        self.last_peer_seen = Some(Instant::now());

        // Version equality between peers is required; a mismatched peer
        // forces this instance passive.
        if peer_version != self.cfg.version {
            if !self.version_mismatch_logged {
                self.version_mismatch_logged = true;
                warn!(
                    local = %self.cfg.version,
                    peer = %peer_version,
                    "HA peer version mismatch, forcing PASSIVE"
                );
            }
            self.set_state(ctx, BinaryStarFsmState::Passive);
            return;
        }
        self.version_mismatch_logged = false;

        use BinaryStarFsmState::*;
        let next = match (self.state, peer_state) {
            (Primary, Passive) => Some(Active),
            (Primary, Backup) => Some(Active),
            // Split brain at startup: the backup wins.
            (Primary, Active) => Some(Passive),
            (Backup, Active) => Some(Passive),
            (Backup, Passive) => None,
            // The peer restarted into a cold state while we hold the
            // network: take over actively.
            (Passive, Primary) | (Passive, Backup) => Some(Active),
            // Dual-active: resolve by role, the backup wins.
            (Active, Active) => {
                if self.cfg.primary {
                    Some(Passive)
                } else {
                    None
                }
            }
            (Primary, Primary) => {
                warn!("both HA peers are configured primary");
                None
            }
            _ => None,
        };
        if let Some(next) = next {
            self.set_state(ctx, next);
        }
    }

    /// Peer silence handling.
    fn on_tick(&mut self, ctx: &AppContext) {
        let peer_silent = match self.last_peer_seen {
            Some(seen) => seen.elapsed() >= PEER_TIMEOUT,
            None => true,
        };
        if !peer_silent {
            return;
        }
        use BinaryStarFsmState::*;
        match self.state {
            Primary | Backup | Passive => {
                // No peer: this instance carries the network alone.
                self.set_state(ctx, Active);
            }
            Active => {}
        }
    }

    async fn collect_app_data(&mut self) -> BinaryStarAppData {
        self.app_data_seq += 1;
        let (topo, config) = self.shared.read_both().await;
        BinaryStarAppData {
            seq_num: self.app_data_seq,
            topology: Some(topo.topology()),
            node_overrides: Some(config.all_node_overrides_json()),
            network_overrides: Some(config.all_network_overrides_json()),
        }
    }

    /// Apply replicated data from the ACTIVE peer.
    async fn apply_app_data(&mut self, data: BinaryStarAppData) {
        if data.seq_num <= self.app_data_seq {
            return; // stale replica
        }
        self.app_data_seq = data.seq_num;
        if self.state == BinaryStarFsmState::Active {
            return; // never clobber the active side
        }
        debug!(seq = data.seq_num, "applying replicated app data");
        let (mut topo, mut config) = self.shared.write_both().await;
        if let Some(topology) = data.topology {
            match crate::topology::TopologyWrapper::from_topology(topology) {
                Ok(mut wrapper) => {
                    wrapper.sanitize();
                    *topo = wrapper;
                }
                Err(e) => warn!("replicated topology rejected: {}", e),
            }
        }
        config.apply_replicated(
            data.node_overrides.as_deref(),
            data.network_overrides.as_deref(),
        );
    }
}

#[async_trait]
impl App for BinaryStarApp {
    fn app_id(&self) -> &'static str {
        appid::CTRL_BINARY_STAR
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        if !self.cfg.enabled {
            // Standalone controller: always active.
            self.routing_active.store(true, Ordering::SeqCst);
            self.state = BinaryStarFsmState::Active;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => return Ok(()),
                    inbound = ctx.inbox.recv() => {
                        let Some(inbound) = inbound else { return Ok(()) };
                        if matches!(inbound.message, Message::BinaryStarGetState) {
                            ctx.reply(
                                appid::CTRL_BINARY_STAR,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::BinaryStarFsm { state: self.state },
                            )
                            .await;
                        }
                    }
                }
            }
        }

        // Start PASSIVE-equivalent: don't route until the FSM says so.
        self.routing_active.store(false, Ordering::SeqCst);

        let (sub_tx, mut sub_rx) = mpsc::channel::<mpsc::Sender<PeerFrame>>(16);
        let listener =
            TcpListener::bind((self.cfg.listen_addr.as_str(), self.cfg.pub_port)).await?;
        info!(
            "HA publishing on :{}, peering with {}:{}",
            listener.local_addr()?.port(),
            self.cfg.peer_host,
            self.cfg.peer_pub_port
        );
        spawn_pub_listener(listener, sub_tx, ctx.shutdown.clone());

        let (peer_tx, mut peer_rx) = mpsc::channel::<PeerFrame>(64);
        spawn_peer_subscriber(
            self.cfg.peer_host.clone(),
            self.cfg.peer_pub_port,
            peer_tx,
            ctx.shutdown.clone(),
        );

        // Grace period: the peer gets one full timeout to announce itself
        // before silence triggers a takeover.
        self.last_peer_seen = Some(Instant::now());

        let mut subscribers: Vec<mpsc::Sender<PeerFrame>> = Vec::new();
        let mut beacon = tokio::time::interval(BEACON_INTERVAL);
        let mut tick = tokio::time::interval(PEER_TIMEOUT / 4);
        beacon.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,

                _ = beacon.tick() => {
                    self.beacon_count = self.beacon_count.wrapping_add(1);
                    let state_frame = PeerFrame::State {
                        state: self.state,
                        version: self.cfg.version.clone(),
                    };
                    subscribers.retain(|s| s.try_send(state_frame.clone()).is_ok());
                    if self.state == BinaryStarFsmState::Active
                        && self.beacon_count % APP_DATA_EVERY_N_BEACONS == 0
                        && !subscribers.is_empty()
                    {
                        let data = self.collect_app_data().await;
                        let frame = PeerFrame::AppData(data);
                        subscribers.retain(|s| s.try_send(frame.clone()).is_ok());
                    }
                }

                _ = tick.tick() => self.on_tick(&ctx),

                new_sub = sub_rx.recv() => {
                    if let Some(sub) = new_sub {
                        subscribers.push(sub);
                    }
                }

                frame = peer_rx.recv() => {
                    match frame {
                        Some(PeerFrame::State { state, version }) => {
                            self.on_peer_state(&ctx, state, &version);
                        }
                        Some(PeerFrame::AppData(data)) => {
                            self.last_peer_seen = Some(Instant::now());
                            self.apply_app_data(data).await;
                        }
                        None => {}
                    }
                }

                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    match inbound.message {
                        Message::BinaryStarGetState => {
                            ctx.reply(
                                appid::CTRL_BINARY_STAR,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::BinaryStarFsm { state: self.state },
                            )
                            .await;
                        }
                        Message::BinaryStarGetAppData => {
                            let data = self.collect_app_data().await;
                            ctx.reply(
                                appid::CTRL_BINARY_STAR,
                                &inbound.sender_node,
                                &inbound.sender_app,
                                Message::BinaryStarAppData(data),
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

fn spawn_pub_listener(
    listener: TcpListener,
    sub_tx: mpsc::Sender<mpsc::Sender<PeerFrame>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    debug!("HA subscriber connected from {}", addr);
                    let (frame_tx, mut frame_rx) = mpsc::channel::<PeerFrame>(64);
                    if sub_tx.send(frame_tx).await.is_err() {
                        break;
                    }
                    tokio::spawn(async move {
                        let mut sink = crate::wire::framed(stream);
                        while let Some(frame) = frame_rx.recv().await {
                            let Ok(buf) = bincode::serialize(&frame) else { continue };
                            if sink.send(buf.into()).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        }
    });
}

fn spawn_peer_subscriber(
    peer_host: String,
    peer_port: u16,
    peer_tx: mpsc::Sender<PeerFrame>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut delay = Duration::from_millis(500);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match TcpStream::connect((peer_host.as_str(), peer_port)).await {
                Ok(stream) => {
                    debug!("connected to HA peer {}:{}", peer_host, peer_port);
                    delay = Duration::from_millis(500);
                    let mut source = crate::wire::framed(stream);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            frame = source.next() => {
                                match frame {
                                    Some(Ok(buf)) => {
                                        match bincode::deserialize::<PeerFrame>(&buf) {
                                            Ok(frame) => {
                                                if peer_tx.send(frame).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => debug!("bad HA frame: {}", e),
                                        }
                                    }
                                    _ => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("HA peer unreachable: {}", e);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
    });
}
