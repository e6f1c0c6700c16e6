//! btleplug-backed [`GattCentral`] (Mac/Linux/Windows)
//!
//! Built with `--features ble-central`.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::{GattAdvertisement, GattCentral, GattLink, GattNotification};
use super::TransportError;

fn ble_err(e: btleplug::Error) -> TransportError {
    TransportError::Ble(e.to_string())
}

/// The first Bluetooth adapter on the host.
pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Ble("No Bluetooth adapter found".into()))?;
        Ok(Self { adapter })
    }

    async fn find(&self, address: &str) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
            if peripheral.id().to_string() == address {
                return Ok(peripheral);
            }
        }
        Err(TransportError::NoDevice(address.to_string()))
    }
}

#[async_trait]
impl GattCentral for BtleCentral {
    async fn scan(&self, duration: Duration) -> Result<Vec<GattAdvertisement>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        tokio::time::sleep(duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
            let properties = match peripheral.properties().await {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("No properties for {:?}: {}", peripheral.id(), e);
                    continue;
                }
            };
            found.push(GattAdvertisement {
                address: peripheral.id().to_string(),
                name: properties.local_name,
                rssi: properties.rssi,
            });
        }
        Ok(found)
    }

    async fn connect(
        &self,
        address: &str,
        notifications: mpsc::Sender<GattNotification>,
    ) -> Result<Box<dyn GattLink>, TransportError> {
        let peripheral = self.find(address).await?;
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let mut stream = peripheral.notifications().await.map_err(ble_err)?;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let notification = GattNotification {
                    service: event.service_uuid,
                    characteristic: event.uuid,
                    value: event.value,
                };
                if notifications.send(notification).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(BtleLink {
            peripheral,
            forwarder,
        }))
    }
}

struct BtleLink {
    peripheral: Peripheral,
    forwarder: JoinHandle<()>,
}

impl BtleLink {
    fn characteristic(
        &self,
        service: Option<Uuid>,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && service.map_or(true, |s| c.service_uuid == s))
            .ok_or_else(|| TransportError::Ble(format!("No characteristic {}", uuid)))
    }
}

#[async_trait]
impl GattLink for BtleLink {
    async fn read(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let c = self.characteristic(service, characteristic)?;
        self.peripheral.read(&c).await.map_err(ble_err)
    }

    async fn write(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(service, characteristic)?;
        let kind = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&c, data, kind).await.map_err(ble_err)
    }

    async fn subscribe(
        &self,
        service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(service, characteristic)?;
        self.peripheral.subscribe(&c).await.map_err(ble_err)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let c = self.characteristic(None, characteristic)?;
        self.peripheral.unsubscribe(&c).await.map_err(ble_err)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.forwarder.abort();
        self.peripheral.disconnect().await.map_err(ble_err)
    }
}
