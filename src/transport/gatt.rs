//! BLE GATT access
//!
//! [`GattCentral`] and [`GattLink`] are the seam between the relay and a
//! BLE stack: btleplug when the `ble-central` feature is enabled, the
//! simulator otherwise. Notifications never call back into the relay;
//! they are queued on a bounded channel handed to [`GattCentral::connect`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::serial::lock;
use super::{LinkCounters, LinkStats, Transport, TransportError, TransportFamily};

/// `0000xxxx-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/// Depth of the per-connection notification queue.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 64;

/// One advertising peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattAdvertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattNotification {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// The scanning/connecting side of a BLE stack.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Scan for `duration` and report everything seen.
    async fn scan(&self, duration: Duration) -> Result<Vec<GattAdvertisement>, TransportError>;

    /// Connect to `address`. Notifications from characteristics later
    /// subscribed on the returned link are sent to `notifications`.
    async fn connect(
        &self,
        address: &str,
        notifications: mpsc::Sender<GattNotification>,
    ) -> Result<Box<dyn GattLink>, TransportError>;
}

/// A connected peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn read(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Expand a 16- or 32-bit assigned number onto the Bluetooth base UUID.
pub fn short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (u128::from(short) << 96))
}

/// Parse a service or characteristic identifier as clients send them: a
/// full UUID string, a number, or a short hex string such as `"180f"`.
pub fn parse_uuid(value: &Value) -> Option<Uuid> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).map(short_uuid),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(uuid) = Uuid::parse_str(s) {
                return Some(uuid);
            }
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            if digits.is_empty() || digits.len() > 8 {
                return None;
            }
            u32::from_str_radix(digits, 16).ok().map(short_uuid)
        }
        _ => None,
    }
}

/// Which peripheral a [`GattTransport`] attaches to and what it watches.
#[derive(Debug, Clone)]
pub struct GattTarget {
    /// Fixed address; skips the scan when set.
    pub address: Option<String>,
    /// Case-insensitive name fragments accepted during the scan.
    pub name_keywords: Vec<String>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub scan_duration: Duration,
    /// Bounded wait for one notification in [`Transport::read`].
    pub read_wait: Duration,
}

impl GattTarget {
    fn accepts(&self, advert: &GattAdvertisement) -> bool {
        if let Some(address) = &self.address {
            return advert.address.eq_ignore_ascii_case(address);
        }
        let name = match &advert.name {
            Some(name) => name.to_lowercase(),
            None => return false,
        };
        self.name_keywords
            .iter()
            .any(|keyword| name.contains(&keyword.to_lowercase()))
    }
}

/// A single characteristic on one peripheral, exposed as a [`Transport`].
///
/// `read` yields one notification at a time; `write` is one GATT write with
/// response and no manual retry.
pub struct GattTransport {
    central: Arc<dyn GattCentral>,
    target: GattTarget,
    link: Mutex<Option<Arc<dyn GattLink>>>,
    notifications: tokio::sync::Mutex<Option<mpsc::Receiver<GattNotification>>>,
    counters: LinkCounters,
}

impl GattTransport {
    pub fn new(central: Arc<dyn GattCentral>, target: GattTarget) -> Self {
        Self {
            central,
            target,
            link: Mutex::new(None),
            notifications: tokio::sync::Mutex::new(None),
            counters: LinkCounters::default(),
        }
    }

    pub fn target(&self) -> &GattTarget {
        &self.target
    }

    fn current_link(&self) -> Option<Arc<dyn GattLink>> {
        lock(&self.link).clone()
    }

    async fn find_address(&self) -> Result<String, TransportError> {
        if let Some(address) = &self.target.address {
            return Ok(address.clone());
        }
        log::info!("Scanning for hub ({:?})", self.target.name_keywords);
        let found = self.central.scan(self.target.scan_duration).await?;
        found
            .into_iter()
            .find(|advert| self.target.accepts(advert))
            .map(|advert| {
                log::info!(
                    "Found {} at {}",
                    advert.name.as_deref().unwrap_or("unnamed hub"),
                    advert.address
                );
                advert.address
            })
            .ok_or_else(|| TransportError::NoDevice(self.target.name_keywords.join("/")))
    }
}

#[async_trait]
impl Transport for GattTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::Ble
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let previous = lock(&self.link).take();
        if let Some(old) = previous {
            let _ = old.disconnect().await;
        }

        let address = self.find_address().await?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        let link: Arc<dyn GattLink> = Arc::from(self.central.connect(&address, tx).await?);
        if let Err(e) = link
            .subscribe(Some(self.target.service), self.target.characteristic)
            .await
        {
            let _ = link.disconnect().await;
            return Err(e);
        }

        *self.notifications.lock().await = Some(rx);
        *lock(&self.link) = Some(link);
        log::info!("Connected to {}, notifications on {}", address, self.target.characteristic);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match self.current_link() {
            Some(link) => link.is_connected().await,
            None => false,
        }
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut guard = self.notifications.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(self.target.read_wait, rx.recv()).await {
            Ok(Some(notification)) => {
                self.counters.record_received(notification.value.len());
                Ok(Some(notification.value))
            }
            // Sender dropped: the link went away.
            Ok(None) => {
                *guard = None;
                Err(TransportError::NotConnected)
            }
            Err(_) => Ok(None),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.current_link().ok_or(TransportError::NotConnected)?;
        match link
            .write(Some(self.target.service), self.target.characteristic, data, true)
            .await
        {
            Ok(()) => {
                self.counters.record_sent(data.len());
                Ok(())
            }
            Err(e) => {
                self.counters.record_error();
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                log::warn!("Disconnect failed: {}", e);
            }
        }
        *self.notifications.lock().await = None;
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::{SimGattCentral, SimPeripheral};
    use serde_json::json;

    #[test]
    fn test_parse_uuid_forms() {
        let battery = Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(parse_uuid(&json!(0x180f)), Some(battery));
        assert_eq!(parse_uuid(&json!("180f")), Some(battery));
        assert_eq!(parse_uuid(&json!("0x180F")), Some(battery));
        assert_eq!(parse_uuid(&json!("0000180f-0000-1000-8000-00805f9b34fb")), Some(battery));
        assert_eq!(parse_uuid(&json!("not-a-uuid")), None);
        assert_eq!(parse_uuid(&json!(null)), None);
    }

    fn boost_target() -> GattTarget {
        GattTarget {
            address: None,
            name_keywords: vec!["Move Hub".into(), "BOOST".into()],
            service: short_uuid(0x1623),
            characteristic: short_uuid(0x1624),
            scan_duration: Duration::from_millis(10),
            read_wait: Duration::from_millis(20),
        }
    }

    fn central_with_hub() -> (Arc<SimGattCentral>, SimPeripheral) {
        let central = Arc::new(SimGattCentral::new());
        central.add(SimPeripheral::new("11:22", Some("BBC micro:bit"), Some(-70)));
        let hub = SimPeripheral::new("33:44", Some("LEGO Move Hub"), Some(-48)).with_characteristic(
            short_uuid(0x1623),
            short_uuid(0x1624),
            &[],
        );
        central.add(hub.clone());
        (central, hub)
    }

    #[tokio::test]
    async fn test_connect_picks_matching_hub_and_subscribes() {
        let (central, hub) = central_with_hub();
        let transport = GattTransport::new(central, boost_target());

        transport.connect().await.unwrap();
        assert!(transport.is_alive().await);
        assert!(hub.is_subscribed(short_uuid(0x1624)));

        assert!(hub.notify(short_uuid(0x1624), &[0x05, 0x00, 0x45, 0x01, 0x07]).await);
        let value = transport.read().await.unwrap();
        assert_eq!(value, Some(vec![0x05, 0x00, 0x45, 0x01, 0x07]));
        assert_eq!(transport.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_goes_to_characteristic() {
        let (central, hub) = central_with_hub();
        let transport = GattTransport::new(central, boost_target());
        transport.connect().await.unwrap();

        transport.write(&[0x08, 0x00, 0x81, 0x01]).await.unwrap();
        assert_eq!(hub.writes(), vec![(short_uuid(0x1624), vec![0x08, 0x00, 0x81, 0x01])]);
        assert_eq!(transport.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_no_matching_hub() {
        let central = Arc::new(SimGattCentral::new());
        central.add(SimPeripheral::new("11:22", Some("Heart Rate"), None));
        let transport = GattTransport::new(central, boost_target());
        assert!(matches!(transport.connect().await, Err(TransportError::NoDevice(_))));
        assert!(!transport.is_alive().await);
        assert!(matches!(transport.write(&[1]).await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_dropped_link_is_not_alive() {
        let (central, hub) = central_with_hub();
        let transport = GattTransport::new(central, boost_target());
        transport.connect().await.unwrap();
        hub.drop_link();
        assert!(!transport.is_alive().await);
    }
}
