//! Bridge server
//!
//! warp WebSocket routes, one session or raw relay per client:
//!
//! - `/scratch/ble`  JSON-RPC over BLE GATT
//! - `/scratch/bt`   JSON-RPC over classic Bluetooth
//! - `/relay/nxt`    raw telegrams over framed serial, base64 text frames
//! - `/relay/spike`  raw REPL lines over serial
//! - `/relay/boost`  raw Boost characteristic traffic, base64 text frames

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::config::RelayConfig;
use crate::registry::DeviceRegistry;
use crate::relay::{self, RawCodec};
use crate::session::ble::BleSession;
use crate::session::bt::BtSession;
use crate::session::{self, notification_queue};
use crate::transport::framed::FramedSerialTransport;
use crate::transport::gatt::{GattCentral, GattTransport};
use crate::transport::line::LineSerialTransport;
use crate::transport::serial::SerialOpener;
use crate::transport::{Transport, TransportFamily};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    Address(String),

    #[error("Cannot start server: {0}")]
    Bind(#[from] warp::Error),
}

/// Everything sessions share: configuration, device access and the
/// per-family device registries.
pub struct Bridge {
    config: RelayConfig,
    serial: Arc<dyn SerialOpener>,
    central: Result<Arc<dyn GattCentral>, String>,
    ble_registry: Arc<DeviceRegistry<String>>,
    bt_registry: Arc<DeviceRegistry<String>>,
}

impl Bridge {
    /// `central` carries the reason BLE is unavailable, if it is.
    pub fn new(
        config: RelayConfig,
        serial: Arc<dyn SerialOpener>,
        central: Result<Arc<dyn GattCentral>, String>,
    ) -> Self {
        Self {
            config,
            serial,
            central,
            ble_registry: Arc::new(DeviceRegistry::new(TransportFamily::Ble)),
            bt_registry: Arc::new(DeviceRegistry::new(TransportFamily::ClassicBluetooth)),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn nxt_port(&self) -> Option<String> {
        let serial = &self.config.serial;
        serial
            .nxt_port
            .clone()
            .or_else(|| self.serial.detect(&serial.nxt_patterns))
    }

    fn spike_port(&self) -> Option<String> {
        let serial = &self.config.serial;
        serial
            .spike_port
            .clone()
            .or_else(|| self.serial.detect(&serial.spike_patterns))
    }

    /// The downstream transport for a raw relay, or why there is none.
    fn raw_transport(&self, kind: RawKind) -> Result<Arc<dyn Transport>, String> {
        let transport: Arc<dyn Transport> = match kind {
            RawKind::Nxt => {
                let path = self.nxt_port().ok_or("No NXT serial port found")?;
                Arc::new(FramedSerialTransport::new(
                    Arc::clone(&self.serial),
                    self.config.framed_settings(path),
                ))
            }
            RawKind::Spike => {
                let path = self.spike_port().ok_or("No SPIKE serial port found")?;
                Arc::new(LineSerialTransport::new(
                    Arc::clone(&self.serial),
                    self.config.line_settings(path),
                ))
            }
            RawKind::Boost => {
                let central = self.central.as_ref().map_err(String::clone)?;
                Arc::new(GattTransport::new(Arc::clone(central), self.config.boost_target()))
            }
        };
        Ok(transport)
    }
}

/// The hub behind a `/relay/...` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Nxt,
    Spike,
    Boost,
}

impl RawKind {
    fn codec(&self) -> RawCodec {
        match self {
            RawKind::Spike => RawCodec::Lines,
            RawKind::Nxt | RawKind::Boost => RawCodec::Base64,
        }
    }
}

impl FromStr for RawKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nxt" => Ok(RawKind::Nxt),
            "spike" => Ok(RawKind::Spike),
            "boost" => Ok(RawKind::Boost),
            other => Err(format!("unknown relay {}", other)),
        }
    }
}

fn with_bridge(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (Arc<Bridge>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&bridge))
}

/// All bridge routes. Anything else is a 404.
pub fn routes(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ble = warp::path!("scratch" / "ble")
        .and(warp::ws())
        .and(with_bridge(Arc::clone(&bridge)))
        .map(|ws: Ws, bridge: Arc<Bridge>| ws.on_upgrade(move |socket| serve_ble(socket, bridge)));

    let bt = warp::path!("scratch" / "bt")
        .and(warp::ws())
        .and(with_bridge(Arc::clone(&bridge)))
        .map(|ws: Ws, bridge: Arc<Bridge>| ws.on_upgrade(move |socket| serve_bt(socket, bridge)));

    let raw = warp::path!("relay" / RawKind)
        .and(warp::ws())
        .and(with_bridge(bridge))
        .map(|kind: RawKind, ws: Ws, bridge: Arc<Bridge>| {
            ws.on_upgrade(move |socket| serve_raw(socket, kind, bridge))
        });

    ble.or(bt).or(raw)
}

/// Text frames in, text frames out. The stream ends at the first close
/// frame or socket error; binary frames are ignored.
fn split_socket(
    socket: WebSocket,
) -> (
    impl Stream<Item = String> + Unpin + Send,
    impl Sink<String> + Unpin + Send,
) {
    let (tx, rx) = socket.split();
    let incoming = Box::pin(
        rx.take_while(|message| {
            future::ready(match message {
                Ok(message) => !message.is_close(),
                Err(e) => {
                    log::debug!("WebSocket error: {}", e);
                    false
                }
            })
        })
        .filter_map(|message| {
            future::ready(
                message
                    .ok()
                    .and_then(|m| m.to_str().ok().map(str::to_string)),
            )
        }),
    );
    let outgoing = Box::pin(
        tx.with(|text: String| future::ready(Ok::<_, warp::Error>(Message::text(text)))),
    );
    (incoming, outgoing)
}

async fn serve_ble(socket: WebSocket, bridge: Arc<Bridge>) {
    let (incoming, outgoing) = split_socket(socket);
    let (notifier, queue) = notification_queue();
    let handler = BleSession::new(
        bridge.central.clone(),
        Arc::clone(&bridge.ble_registry),
        bridge.config.ble_settings(),
        notifier,
    );
    session::run(handler, queue, incoming, outgoing).await;
}

async fn serve_bt(socket: WebSocket, bridge: Arc<Bridge>) {
    let (incoming, outgoing) = split_socket(socket);
    let (notifier, queue) = notification_queue();
    let handler = BtSession::new(
        Arc::clone(&bridge.serial),
        Arc::clone(&bridge.bt_registry),
        bridge.config.bt_settings(),
        notifier,
    );
    session::run(handler, queue, incoming, outgoing).await;
}

async fn serve_raw(mut socket: WebSocket, kind: RawKind, bridge: Arc<Bridge>) {
    let transport = match bridge.raw_transport(kind) {
        Ok(transport) => transport,
        Err(e) => {
            log::error!("{:?} relay unavailable: {}", kind, e);
            let _ = socket.send(Message::close_with(1011u16, e)).await;
            return;
        }
    };
    log::info!("{:?} relay client connected", kind);
    let (incoming, outgoing) = split_socket(socket);
    relay::run_raw(
        transport,
        kind.codec(),
        bridge.config.relay_settings(),
        incoming,
        outgoing,
    )
    .await;
}

/// Serve until `shutdown` resolves. Uses TLS when the config names a
/// certificate and key.
pub async fn serve<S>(bridge: Arc<Bridge>, shutdown: S) -> Result<(), ServerError>
where
    S: Future<Output = ()> + Send + 'static,
{
    let server = &bridge.config.server;
    let ip: IpAddr = server
        .bind
        .parse()
        .map_err(|_| ServerError::Address(server.bind.clone()))?;
    let addr = SocketAddr::new(ip, server.port);
    let tls = server.tls_cert.clone().zip(server.tls_key.clone());
    let routes = routes(Arc::clone(&bridge)).with(warp::log("hubrelay::server"));

    match tls {
        Some((cert, key)) => {
            log::info!("Listening on wss://{}", addr);
            let (_, running) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, shutdown);
            running.await;
        }
        None => {
            let (bound, running) =
                warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown)?;
            log::info!("Listening on ws://{}", bound);
            running.await;
        }
    }
    log::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimSerialOpener;

    fn bridge() -> Arc<Bridge> {
        Arc::new(Bridge::new(
            RelayConfig::default(),
            Arc::new(SimSerialOpener::new()),
            Err("BLE disabled".into()),
        ))
    }

    #[test]
    fn test_raw_kind_paths() {
        assert_eq!("nxt".parse::<RawKind>(), Ok(RawKind::Nxt));
        assert_eq!("spike".parse::<RawKind>().map(|k| k.codec()), Ok(RawCodec::Lines));
        assert!("ev3".parse::<RawKind>().is_err());
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let response = warp::test::request().path("/scratch/usb").reply(&routes(bridge())).await;
        assert_eq!(response.status(), 404);
        let response = warp::test::request().path("/relay/ev3").reply(&routes(bridge())).await;
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn test_missing_ports_are_reported() {
        let bridge = bridge();
        assert_eq!(
            bridge.raw_transport(RawKind::Nxt).err().as_deref(),
            Some("No NXT serial port found")
        );
        assert_eq!(bridge.raw_transport(RawKind::Boost).err().as_deref(), Some("BLE disabled"));
    }

    #[test]
    fn test_configured_port_wins_over_detection() {
        let opener = SimSerialOpener::new();
        opener.add("/dev/ttyUSB0", crate::transport::simulated::SimSerialHub::new());
        let mut config = RelayConfig::default();
        let bridge = Bridge::new(config.clone(), Arc::new(opener), Err(String::new()));
        assert_eq!(bridge.nxt_port().as_deref(), Some("/dev/ttyUSB0"));

        config.serial.nxt_port = Some("/dev/rfcomm3".into());
        let bridge = Bridge::new(config, Arc::new(SimSerialOpener::new()), Err(String::new()));
        assert_eq!(bridge.nxt_port().as_deref(), Some("/dev/rfcomm3"));
    }
}
