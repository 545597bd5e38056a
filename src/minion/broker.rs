//! Minion broker: one upstream stream to the controller plus local app
//! dispatch.
//!
//! Local routing never depends on the upstream: "" routes to a local app,
//! anything else goes to the controller when connected (and is dropped with
//! a counter bump when not). The upstream redials with backoff; if nothing
//! (not even a dealer echo) arrives for `ctrl_socket_timeout`, the socket
//! is torn down and recreated.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{AppRegistry, Inbound, Outbound};
use crate::messages::{appid, Message, PeerKind};
use crate::wire::{framed, Envelope, WireFramed};

/// Node id under which minion apps address the controller.
pub const CTRL_NODE_ID: &str = "ctrl";

pub struct MinionBroker {
    node_id: String,
    controller_host: String,
    controller_port: u16,
    registry: AppRegistry,
    outbound_rx: mpsc::Receiver<Outbound>,
    ctrl_socket_timeout: Duration,
}

impl MinionBroker {
    pub fn new(
        node_id: String,
        controller_host: String,
        controller_port: u16,
        registry: AppRegistry,
        outbound_rx: mpsc::Receiver<Outbound>,
        ctrl_socket_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            controller_host,
            controller_port,
            registry,
            outbound_rx,
            ctrl_socket_timeout,
        }
    }

    pub fn counters(&self) -> Arc<crate::bus::BusCounters> {
        self.registry.counters().clone()
    }

    async fn connect(&self) -> Option<WireFramed> {
        match TcpStream::connect((self.controller_host.as_str(), self.controller_port)).await {
            Ok(stream) => {
                let mut transport = framed(stream);
                let hello = Message::Hello {
                    node_id: self.node_id.clone(),
                    kind: PeerKind::Minion,
                };
                let env =
                    Envelope::new("", appid::CTRL_BROKER, appid::MINION_BROKER, &hello, false)
                        .ok()?;
                let frame = env.to_frame().ok()?;
                if transport.send(frame.into()).await.is_err() {
                    return None;
                }
                info!(
                    "connected to controller {}:{}",
                    self.controller_host, self.controller_port
                );
                Some(transport)
            }
            Err(e) => {
                debug!("controller unreachable: {}", e);
                None
            }
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut transport: Option<WireFramed> = None;
        let mut last_rx = Instant::now();

        let mut housekeeping = tokio::time::interval(self.ctrl_socket_timeout / 8);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_dial = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = housekeeping.tick() => {
                    match transport {
                        Some(_) => {
                            if last_rx.elapsed() >= self.ctrl_socket_timeout {
                                warn!(
                                    "no controller traffic for {:?}, recreating socket",
                                    self.ctrl_socket_timeout
                                );
                                transport = None;
                                next_dial = Instant::now();
                            }
                        }
                        None => {
                            if Instant::now() >= next_dial {
                                transport = self.connect().await;
                                if transport.is_some() {
                                    last_rx = Instant::now();
                                } else {
                                    next_dial = Instant::now() + Duration::from_secs(2);
                                }
                            }
                        }
                    }
                }

                out = self.outbound_rx.recv() => {
                    let Some(out) = out else { break };
                    if out.dest_node.is_empty() {
                        self.registry.dispatch(&out.dest_app, Inbound {
                            sender_node: String::new(),
                            sender_app: out.sender_app,
                            message: out.message,
                        });
                        continue;
                    }
                    // Everything non-local goes upstream. "ctrl" means "the
                    // process on the other end of this stream" and maps to
                    // an empty dest on the wire; anything else (e.g. an NMS
                    // client id) is relayed by the controller broker.
                    let Some(t) = transport.as_mut() else {
                        self.registry
                            .counters()
                            .dropped_no_route
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(kind = out.message.kind(), "controller not connected, dropping");
                        continue;
                    };
                    let wire_dest = if out.dest_node == CTRL_NODE_ID {
                        String::new()
                    } else {
                        out.dest_node
                    };
                    match Envelope::new(
                        wire_dest,
                        out.dest_app,
                        out.sender_app,
                        &out.message,
                        out.compress,
                    )
                    .and_then(|env| env.to_frame())
                    {
                        Ok(frame) => {
                            if t.send(frame.into()).await.is_err() {
                                warn!("controller send failed, recreating socket");
                                transport = None;
                                next_dial = Instant::now();
                            }
                        }
                        Err(e) => warn!("envelope encode failed: {}", e),
                    }
                }

                frame = next_frame(&mut transport) => {
                    match frame {
                        Some(Ok(frame)) => {
                            last_rx = Instant::now();
                            self.handle_frame(&frame, &mut transport).await;
                        }
                        Some(Err(e)) => {
                            debug!("read error: {}", e);
                            transport = None;
                            next_dial = Instant::now();
                        }
                        None => {
                            if transport.is_some() {
                                warn!("controller closed the connection");
                                transport = None;
                                next_dial = Instant::now();
                            }
                        }
                    }
                }
            }
        }
        info!("Minion broker stopped");
    }

    async fn handle_frame(&self, frame: &[u8], transport: &mut Option<WireFramed>) {
        let Ok(env) = Envelope::from_frame(frame) else {
            self.registry
                .counters()
                .decode_failures
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let message = match env.message() {
            Ok(m) => m,
            Err(e) => {
                self.registry
                    .counters()
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!("malformed message dropped: {}", e);
                return;
            }
        };
        if matches!(message, Message::DealerEcho) {
            // Echo straight back: broker-level liveness.
            if let Some(t) = transport.as_mut() {
                let echo = Envelope::new(
                    "",
                    appid::CTRL_BROKER,
                    appid::MINION_BROKER,
                    &Message::DealerEcho,
                    false,
                )
                .and_then(|env| env.to_frame());
                if let Ok(f) = echo {
                    let _ = t.send(f.into()).await;
                }
            }
            return;
        }
        // Relayed envelopes carry the original peer id; direct controller
        // traffic does not.
        let sender_node = if env.sender_node.is_empty() {
            CTRL_NODE_ID.to_string()
        } else {
            env.sender_node
        };
        self.registry.dispatch(
            &env.dest_app,
            Inbound {
                sender_node,
                sender_app: env.sender_app,
                message,
            },
        );
    }
}

/// Poll the upstream for a frame; pends forever while disconnected so the
/// select loop stays balanced.
async fn next_frame(
    transport: &mut Option<WireFramed>,
) -> Option<Result<Vec<u8>, std::io::Error>> {
    match transport {
        Some(t) => t.next().await.map(|r| r.map(|b| b.to_vec())),
        None => std::future::pending().await,
    }
}
