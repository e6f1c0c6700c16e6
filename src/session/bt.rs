//! Classic Bluetooth session: NXT / EV3 over bound RFCOMM device nodes.
//!
//! Telegrams from the hub reach the client as `didReceiveMessage`
//! notifications; `send` writes a client-framed telegram verbatim.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::registry::DeviceRegistry;
use crate::relay::{pump_downstream, RelaySettings};
use crate::rpc::{self, Method, RpcError};
use crate::telegram::{self, FramerSettings};
use crate::transport::framed::FramedSerialSettings;
use crate::transport::rfcomm::RfcommTransport;
use crate::transport::serial::{device_display_name, SerialOpener, WritePolicy};
use crate::transport::{offload, LinkStats, Transport};

use super::{
    discovered, discovery_filter, peripheral_id, spawn_announcer, Notifier, SessionHandler,
    SessionStatus,
};

/// GET_BATT_LVL, sent periodically so the NXT does not power down.
pub const KEEPALIVE_TELEGRAM: [u8; 4] = [0x02, 0x00, 0x00, 0x0B];

#[derive(Debug, Clone)]
pub struct BtSettings {
    /// Device node prefixes enumerated by `discover`.
    pub patterns: Vec<String>,
    pub keywords: Vec<String>,
    /// Reported signal strength; device nodes carry none.
    pub rssi_hint: i16,
    pub announce_interval: Duration,
    pub baud_rate: u32,
    pub framer: FramerSettings,
    pub write: WritePolicy,
    pub relay: RelaySettings,
    pub keepalive: Duration,
}

impl Default for BtSettings {
    fn default() -> Self {
        Self {
            patterns: vec!["rfcomm".into(), "cu.".into(), "tty.".into()],
            keywords: vec!["nxt".into(), "ev3".into(), "lego".into()],
            rssi_hint: -50,
            announce_interval: Duration::from_secs(1),
            baud_rate: 115200,
            framer: FramerSettings::default(),
            write: WritePolicy::default(),
            relay: RelaySettings::default(),
            keepalive: Duration::from_secs(25),
        }
    }
}

pub struct BtSession {
    opener: Arc<dyn SerialOpener>,
    registry: Arc<DeviceRegistry<String>>,
    settings: BtSettings,
    notifier: Notifier,
    status: SessionStatus,
    announcer: Option<JoinHandle<()>>,
    transport: Option<Arc<RfcommTransport>>,
    pump: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

impl BtSession {
    pub fn new(
        opener: Arc<dyn SerialOpener>,
        registry: Arc<DeviceRegistry<String>>,
        settings: BtSettings,
        notifier: Notifier,
    ) -> Self {
        Self {
            opener,
            registry,
            settings,
            notifier,
            status: SessionStatus::Initial,
            announcer: None,
            transport: None,
            pump: None,
            keepalive: None,
        }
    }

    fn stop_announcing(&mut self) {
        if let Some(task) = self.announcer.take() {
            task.abort();
        }
    }

    async fn disconnect(&mut self) {
        for task in [self.pump.take(), self.keepalive.take()].into_iter().flatten() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn discover(&mut self, params: Value) -> Result<Value, RpcError> {
        let filter = discovery_filter(&params, &self.settings.keywords);
        self.stop_announcing();

        let opener = Arc::clone(&self.opener);
        let patterns = self.settings.patterns.clone();
        let ports = offload(move || Ok(opener.ports(&patterns))).await?;

        {
            let mut scan = self.registry.begin_scan().await;
            let mut seen = HashSet::new();
            for path in ports {
                let name = device_display_name(Path::new(&path));
                // Bound nodes carry no hub name; only a keyword scan keeps them.
                let bound_node = !filter.is_explicit() && name.starts_with("rfcomm");
                if !(bound_node || filter.matches(Some(&name))) || !seen.insert(name.clone()) {
                    continue;
                }
                let peripheral = scan.add(Some(name), Some(self.settings.rssi_hint), path);
                log::info!("Found {} at {}", peripheral.name, peripheral.address);
                self.notifier
                    .notify("didDiscoverPeripheral", discovered(&peripheral));
            }
            log::info!("Discovery complete, {} device(s)", scan.found().len());
        }

        if self.status != SessionStatus::Connected {
            self.status = SessionStatus::Discovery;
            self.announcer = Some(spawn_announcer(
                Arc::clone(&self.registry),
                self.notifier.clone(),
                self.settings.announce_interval,
            ));
        }
        Ok(Value::Null)
    }

    async fn connect(&mut self, params: Value) -> Result<Value, RpcError> {
        let id = peripheral_id(&params)?;
        let peripheral = self
            .registry
            .resolve(id)
            .await
            .ok_or(RpcError::InvalidPeripheral)?;

        self.disconnect().await;
        if self.status == SessionStatus::Connected {
            self.status = SessionStatus::Discovery;
        }
        let transport = Arc::new(RfcommTransport::new(
            Arc::clone(&self.opener),
            FramedSerialSettings {
                path: peripheral.address.clone(),
                baud_rate: self.settings.baud_rate,
                framer: self.settings.framer,
                write: self.settings.write,
            },
        ));
        transport.connect().await?;
        log::info!("Connected to {} ({})", peripheral.name, peripheral.address);
        self.stop_announcing();

        let notifier = self.notifier.clone();
        let downstream: Arc<dyn Transport> = transport.clone();
        self.pump = Some(tokio::spawn(pump_downstream(
            downstream,
            self.settings.relay,
            move |data| notifier.notify("didReceiveMessage", rpc::encoded_message(&data)),
        )));

        if peripheral.name.to_uppercase().contains("NXT") {
            self.keepalive = Some(spawn_keepalive(Arc::clone(&transport), self.settings.keepalive));
        }
        self.transport = Some(transport);
        self.status = SessionStatus::Connected;
        Ok(Value::Null)
    }

    async fn send(&mut self, params: Value) -> Result<Value, RpcError> {
        let transport = self.transport.clone().ok_or(RpcError::NotConnected)?;
        let data = telegram::encode(rpc::decode_message(&params)?);
        transport.write(&data).await?;
        Ok(json!(data.len()))
    }
}

/// Write [`KEEPALIVE_TELEGRAM`] every `interval` until aborted.
pub fn spawn_keepalive(transport: Arc<RfcommTransport>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log::debug!("Sending keep-alive to {}", transport.device_name());
            if let Err(e) = transport.write(&KEEPALIVE_TELEGRAM).await {
                log::warn!("Keep-alive failed: {}", e);
            }
        }
    })
}

#[async_trait]
impl SessionHandler for BtSession {
    fn name(&self) -> &'static str {
        "bt"
    }

    fn supports(&self, method: Method) -> bool {
        matches!(method, Method::Discover | Method::Connect | Method::Send)
    }

    async fn handle(&mut self, method: Method, params: Value) -> Result<Value, RpcError> {
        match method {
            Method::Discover => self.discover(params).await,
            Method::Connect => self.connect(params).await,
            Method::Send => self.send(params).await,
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    fn stats(&self) -> Option<LinkStats> {
        self.transport.as_ref().map(|t| t.stats())
    }

    async fn close(&mut self) {
        self.stop_announcing();
        self.disconnect().await;
        self.status = SessionStatus::Done;
    }
}
