//! Minion <-> netlink driver plumbing.
//!
//! The driver is a separate process reached over a single pair socket; only
//! DriverApp holds the pair, and it serializes all outbound messages on it.
//! For tests (and x86 emulation) the same pair is backed by in-process
//! channels with a scripted firmware on the far side.

pub mod passthru;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

use crate::messages::Message;

/// Queue depth between DriverApp and the driver bridge.
pub const DRIVER_QUEUE_CAPACITY: usize = 256;

/// DriverApp's side of the pair.
pub struct DriverPair {
    /// Messages towards the driver/firmware.
    pub tx: mpsc::Sender<Message>,
    /// Messages from the driver/firmware.
    pub rx: mpsc::Receiver<Message>,
}

/// The far (driver) side of an in-process pair, used by fakes.
pub struct DriverEndpoint {
    pub tx: mpsc::Sender<Message>,
    pub rx: mpsc::Receiver<Message>,
}

/// Build an in-process pair: (app side, driver side).
pub fn channel_pair() -> (DriverPair, DriverEndpoint) {
    let (app_tx, drv_rx) = mpsc::channel(DRIVER_QUEUE_CAPACITY);
    let (drv_tx, app_rx) = mpsc::channel(DRIVER_QUEUE_CAPACITY);
    (
        DriverPair {
            tx: app_tx,
            rx: app_rx,
        },
        DriverEndpoint {
            tx: drv_tx,
            rx: drv_rx,
        },
    )
}

/// Connect to the real driver's unix pair socket and bridge it to channels.
///
/// Frames are length-delimited bincode [`Message`]s. The bridge task runs
/// until either side closes; DriverApp treats a closed pair as fatal and
/// lets the watchdog handle recovery.
pub async fn connect_unix(path: &str) -> std::io::Result<DriverPair> {
    let stream = UnixStream::connect(path).await?;
    info!("Connected to driver pair socket at {}", path);
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let (app_tx, mut drv_rx) = mpsc::channel::<Message>(DRIVER_QUEUE_CAPACITY);
    let (drv_tx, app_rx) = mpsc::channel::<Message>(DRIVER_QUEUE_CAPACITY);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = drv_rx.recv() => {
                    let Some(msg) = outbound else { break };
                    match bincode::serialize(&msg) {
                        Ok(buf) => {
                            if let Err(e) = framed.send(buf.into()).await {
                                error!("driver bridge: send failed: {}", e);
                                break;
                            }
                        }
                        Err(e) => error!("driver bridge: serialize failed: {}", e),
                    }
                }
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => match bincode::deserialize::<Message>(&frame) {
                            Ok(msg) => {
                                if drv_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("driver bridge: bad frame: {}", e),
                        },
                        Some(Err(e)) => {
                            error!("driver bridge: recv failed: {}", e);
                            break;
                        }
                        None => {
                            warn!("driver bridge: pair socket closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(DriverPair {
        tx: app_tx,
        rx: app_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut app, mut driver) = channel_pair();
        app.tx
            .send(Message::NodeInit {
                radio_mac: "aa:bb:cc:00:00:01".into(),
            })
            .await
            .unwrap();
        let got = driver.rx.recv().await.unwrap();
        assert!(matches!(got, Message::NodeInit { .. }));

        driver
            .tx
            .send(Message::NodeInitNotify(crate::messages::NodeInitNotify {
                radio_mac: "aa:bb:cc:00:00:01".into(),
                success: true,
                vendor: "sim".into(),
            }))
            .await
            .unwrap();
        let got = app.rx.recv().await.unwrap();
        assert!(matches!(got, Message::NodeInitNotify(_)));
    }
}
