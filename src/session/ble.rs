//! BLE session: GATT discover/connect/read/write/notify for micro:bit,
//! WeDo, Boost and friends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::DeviceRegistry;
use crate::rpc::{self, Method, RpcError};
use crate::telegram::describe;
use crate::transport::gatt::{parse_uuid, GattCentral, GattLink, NOTIFICATION_QUEUE_DEPTH};
use crate::transport::{LinkCounters, LinkStats};

use super::{
    discovered, discovery_filter, peripheral_id, spawn_announcer, Notifier, SessionHandler,
    SessionStatus,
};

#[derive(Debug, Clone)]
pub struct BleSettings {
    pub scan_duration: Duration,
    pub announce_interval: Duration,
    /// Name fragments accepted when the client gives no filter.
    pub keywords: Vec<String>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            announce_interval: Duration::from_secs(1),
            keywords: [
                "bbc", "micro:bit", "microbit", "lego", "lpf2", "hub", "wedo", "boost",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

pub struct BleSession {
    central: Result<Arc<dyn GattCentral>, String>,
    registry: Arc<DeviceRegistry<String>>,
    settings: BleSettings,
    notifier: Notifier,
    status: SessionStatus,
    announcer: Option<JoinHandle<()>>,
    link: Option<Arc<dyn GattLink>>,
    forwarder: Option<JoinHandle<()>>,
    counters: Arc<LinkCounters>,
}

impl BleSession {
    /// `central` is the error text when no BLE stack is available; the
    /// session then fails at startup.
    pub fn new(
        central: Result<Arc<dyn GattCentral>, String>,
        registry: Arc<DeviceRegistry<String>>,
        settings: BleSettings,
        notifier: Notifier,
    ) -> Self {
        Self {
            central,
            registry,
            settings,
            notifier,
            status: SessionStatus::Initial,
            announcer: None,
            link: None,
            forwarder: None,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    fn central(&self) -> Result<Arc<dyn GattCentral>, RpcError> {
        self.central
            .as_ref()
            .map(Arc::clone)
            .map_err(|e| RpcError::Unavailable(e.clone()))
    }

    fn link(&self) -> Result<Arc<dyn GattLink>, RpcError> {
        self.link.clone().ok_or(RpcError::NotConnected)
    }

    fn stop_announcing(&mut self) {
        if let Some(task) = self.announcer.take() {
            task.abort();
        }
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.disconnect().await {
                log::warn!("BLE disconnect failed: {}", e);
            }
        }
    }

    async fn discover(&mut self, params: Value) -> Result<Value, RpcError> {
        let central = self.central()?;
        let filter = discovery_filter(&params, &self.settings.keywords);
        self.stop_announcing();

        {
            let mut scan = self.registry.begin_scan().await;
            log::info!("Scanning for BLE peripherals ({:?})", self.settings.scan_duration);
            let adverts = central.scan(self.settings.scan_duration).await?;
            for advert in adverts {
                if !filter.matches(advert.name.as_deref()) {
                    continue;
                }
                let peripheral = scan.add(advert.name, advert.rssi, advert.address);
                log::info!("Found {} ({})", peripheral.name, peripheral.address);
                self.notifier
                    .notify("didDiscoverPeripheral", discovered(&peripheral));
            }
            log::info!("Scan complete, {} matching peripheral(s)", scan.found().len());
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
        let central = self.central()?;
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
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        let link: Arc<dyn GattLink> = Arc::from(central.connect(&peripheral.address, tx).await?);
        log::info!("Connected to {} ({})", peripheral.name, peripheral.address);

        self.stop_announcing();
        self.forwarder = Some(spawn_forwarder(
            rx,
            self.notifier.clone(),
            Arc::clone(&self.counters),
        ));
        self.link = Some(link);
        self.status = SessionStatus::Connected;
        Ok(Value::Null)
    }

    async fn read(&mut self, params: Value) -> Result<Value, RpcError> {
        let link = self.link()?;
        let characteristic = characteristic_id(&params)?;
        let service = service_id(&params)?;

        let value = link.read(service, characteristic).await?;
        self.counters.record_received(value.len());
        if rpc::flag(&params, "startNotifications") {
            link.subscribe(service, characteristic).await?;
        }
        Ok(rpc::encoded_message(&value))
    }

    async fn write(&mut self, params: Value) -> Result<Value, RpcError> {
        let link = self.link()?;
        let characteristic = characteristic_id(&params)?;
        let service = service_id(&params)?;
        let data = rpc::decode_message(&params)?;
        let with_response = rpc::param(&params, "withResponse")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        log::debug!(
            "Client → {}: {} {}",
            characteristic,
            describe::hex_dump(&data, 100),
            describe::boost_packet(&data)
        );
        if let Err(e) = link.write(service, characteristic, &data, with_response).await {
            self.counters.record_error();
            return Err(e.into());
        }
        self.counters.record_sent(data.len());
        Ok(json!(data.len()))
    }

    async fn start_notifications(&mut self, params: Value) -> Result<Value, RpcError> {
        let link = self.link()?;
        let characteristic = characteristic_id(&params)?;
        link.subscribe(service_id(&params)?, characteristic).await?;
        Ok(Value::Null)
    }

    async fn stop_notifications(&mut self, params: Value) -> Result<Value, RpcError> {
        let link = self.link()?;
        link.unsubscribe(characteristic_id(&params)?).await?;
        Ok(Value::Null)
    }
}

fn characteristic_id(params: &Value) -> Result<Uuid, RpcError> {
    parse_uuid(rpc::required(params, "characteristicId")?)
        .ok_or_else(|| RpcError::InvalidParams("bad characteristicId".into()))
}

fn service_id(params: &Value) -> Result<Option<Uuid>, RpcError> {
    match rpc::param(params, "serviceId") {
        Some(value) => parse_uuid(value)
            .map(Some)
            .ok_or_else(|| RpcError::InvalidParams("bad serviceId".into())),
        None => Ok(None),
    }
}

fn spawn_forwarder(
    mut rx: mpsc::Receiver<crate::transport::gatt::GattNotification>,
    notifier: Notifier,
    counters: Arc<LinkCounters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            counters.record_received(notification.value.len());
            log::debug!(
                "{} → Client: {}",
                notification.characteristic,
                describe::hex_dump(&notification.value, 100)
            );
            let mut params = rpc::encoded_message(&notification.value);
            params["serviceId"] = json!(notification.service.to_string());
            params["characteristicId"] = json!(notification.characteristic.to_string());
            if !notifier.notify("characteristicDidChange", params) {
                break;
            }
        }
        log::debug!("GATT notification stream ended");
    })
}

#[async_trait]
impl SessionHandler for BleSession {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn supports(&self, method: Method) -> bool {
        !matches!(method, Method::Send)
    }

    async fn startup(&mut self) -> Result<(), RpcError> {
        self.central().map(|_| ())
    }

    async fn handle(&mut self, method: Method, params: Value) -> Result<Value, RpcError> {
        match method {
            Method::Discover => self.discover(params).await,
            Method::Connect => self.connect(params).await,
            Method::Read => self.read(params).await,
            Method::Write => self.write(params).await,
            Method::StartNotifications => self.start_notifications(params).await,
            Method::StopNotifications => self.stop_notifications(params).await,
            Method::Send => Err(RpcError::UnknownMethod(method.to_string())),
        }
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    fn stats(&self) -> Option<LinkStats> {
        Some(self.counters.snapshot())
    }

    async fn close(&mut self) {
        self.stop_announcing();
        self.disconnect().await;
        self.status = SessionStatus::Done;
    }
}
