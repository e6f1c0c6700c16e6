//! In-process hub simulator
//!
//! Stand-ins for serial devices and a BLE central so sessions and relays
//! can be exercised without hardware. Used by the tests and by the
//! binary's `--simulate` mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::telegram::ByteSource;

use super::gatt::{GattAdvertisement, GattCentral, GattLink, GattNotification};
use super::serial::{lock, SerialLink, SerialOpener};
use super::TransportError;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct SerialState {
    /// Bytes travelling hub -> relay.
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    writes: Vec<Vec<u8>>,
    write_attempts: usize,
    fail_writes: bool,
    unplugged: bool,
    responder: Option<Responder>,
}

/// The hub end of a simulated serial device.
#[derive(Clone, Default)]
pub struct SimSerialHub {
    state: Arc<Mutex<SerialState>>,
}

impl SimSerialHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer writes with canned replies.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
        self
    }

    /// Queue bytes for the relay to read.
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Bytes queued but not yet read by the relay.
    pub fn pending(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Everything the relay wrote, concatenated.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Each successful write separately.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Write calls, successful or not.
    pub fn write_attempts(&self) -> usize {
        lock(&self.state).write_attempts
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Simulate the device disappearing: every I/O call fails.
    pub fn unplug(&self) {
        lock(&self.state).unplugged = true;
    }

    pub fn replug(&self) {
        lock(&self.state).unplugged = false;
    }

    pub fn is_unplugged(&self) -> bool {
        lock(&self.state).unplugged
    }

    /// A relay-side handle onto this device.
    pub fn link(&self) -> Box<dyn SerialLink> {
        Box::new(SimSerialLink {
            state: Arc::clone(&self.state),
        })
    }
}

struct SimSerialLink {
    state: Arc<Mutex<SerialState>>,
}

fn unplugged_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated device unplugged")
}

impl ByteSource for SimSerialLink {
    fn available(&mut self) -> io::Result<usize> {
        let state = lock(&self.state);
        if state.unplugged {
            return Err(unplugged_error());
        }
        Ok(state.inbound.len())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.unplugged {
            return Err(unplugged_error());
        }
        state.inbound.read_into(buf)
    }
}

impl SerialLink for SimSerialLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.write_attempts += 1;
        if state.unplugged {
            return Err(unplugged_error());
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated write failure"));
        }
        state.written.extend_from_slice(data);
        state.writes.push(data.to_vec());
        if let Some(responder) = state.responder.as_mut() {
            if let Some(reply) = responder(data) {
                state.inbound.extend(reply);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(SimSerialLink {
            state: Arc::clone(&self.state),
        }))
    }

    fn probe(&mut self) -> bool {
        !lock(&self.state).unplugged
    }
}

/// A [`SerialOpener`] over a fixed set of simulated devices.
#[derive(Default)]
pub struct SimSerialOpener {
    ports: Mutex<HashMap<String, SimSerialHub>>,
    opens: AtomicUsize,
}

impl SimSerialOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<String>, hub: SimSerialHub) {
        lock(&self.ports).insert(path.into(), hub);
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SerialOpener for SimSerialOpener {
    fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let ports = lock(&self.ports);
        let hub = ports.get(path).ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated device at {}", path),
            ))
        })?;
        if hub.is_unplugged() {
            return Err(TransportError::Io(unplugged_error()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(hub.link())
    }

    fn ports(&self, patterns: &[String]) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.ports).keys().cloned().collect();
        paths.sort();
        let mut found = Vec::new();
        for pattern in patterns {
            for path in &paths {
                let node = path.rsplit('/').next().unwrap_or(path);
                if node.starts_with(pattern.as_str()) && !found.contains(path) {
                    found.push(path.clone());
                }
            }
        }
        found
    }
}

/// Canned NXT behaviour: answer the battery-level request with 8000 mV.
pub fn nxt_battery_responder() -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    |data: &[u8]| {
        if data == [0x02, 0x00, 0x00, 0x0B] {
            Some(vec![0x05, 0x00, 0x02, 0x0B, 0x00, 0x40, 0x1F])
        } else {
            None
        }
    }
}

struct SimCharacteristic {
    service: Uuid,
    uuid: Uuid,
    value: Vec<u8>,
}

struct PeripheralState {
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    characteristics: Vec<SimCharacteristic>,
    connected: bool,
    refuse_connections: bool,
    subscribed: HashSet<Uuid>,
    sink: Option<mpsc::Sender<GattNotification>>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

/// A simulated BLE peripheral.
#[derive(Clone)]
pub struct SimPeripheral {
    state: Arc<Mutex<PeripheralState>>,
}

impl SimPeripheral {
    pub fn new(address: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PeripheralState {
                address: address.into(),
                name: name.map(str::to_string),
                rssi,
                characteristics: Vec::new(),
                connected: false,
                refuse_connections: false,
                subscribed: HashSet::new(),
                sink: None,
                writes: Vec::new(),
            })),
        }
    }

    pub fn with_characteristic(self, service: Uuid, uuid: Uuid, value: &[u8]) -> Self {
        lock(&self.state).characteristics.push(SimCharacteristic {
            service,
            uuid,
            value: value.to_vec(),
        });
        self
    }

    pub fn address(&self) -> String {
        lock(&self.state).address.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Emit a notification if the characteristic is subscribed. Returns
    /// whether it was delivered.
    pub async fn notify(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let (sink, service) = {
            let state = lock(&self.state);
            if !state.connected || !state.subscribed.contains(&characteristic) {
                return false;
            }
            let service = state
                .characteristics
                .iter()
                .find(|c| c.uuid == characteristic)
                .map(|c| c.service)
                .unwrap_or_else(Uuid::nil);
            match state.sink.clone() {
                Some(sink) => (sink, service),
                None => return false,
            }
        };
        sink.send(GattNotification {
            service,
            characteristic,
            value: value.to_vec(),
        })
        .await
        .is_ok()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        lock(&self.state).subscribed.contains(&characteristic)
    }

    /// Simulate the radio link dropping.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.sink = None;
    }

    fn advertisement(&self) -> GattAdvertisement {
        let state = lock(&self.state);
        GattAdvertisement {
            address: state.address.clone(),
            name: state.name.clone(),
            rssi: state.rssi,
        }
    }
}

/// A simulated BLE central that "sees" every added peripheral.
pub struct SimGattCentral {
    peripherals: Mutex<Vec<SimPeripheral>>,
    scan_delay: Duration,
    scans: AtomicUsize,
    scanning: AtomicBool,
    overlapping_scans: AtomicUsize,
}

impl SimGattCentral {
    pub fn new() -> Self {
        Self {
            peripherals: Mutex::new(Vec::new()),
            scan_delay: Duration::ZERO,
            scans: AtomicUsize::new(0),
            scanning: AtomicBool::new(false),
            overlapping_scans: AtomicUsize::new(0),
        }
    }

    /// Make each scan take `delay` instead of the requested duration.
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    pub fn add(&self, peripheral: SimPeripheral) {
        lock(&self.peripherals).push(peripheral);
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Scans that started while another was still running.
    pub fn overlapping_scans(&self) -> usize {
        self.overlapping_scans.load(Ordering::SeqCst)
    }

    fn find(&self, address: &str) -> Option<SimPeripheral> {
        lock(&self.peripherals)
            .iter()
            .find(|p| p.address() == address)
            .cloned()
    }
}

impl Default for SimGattCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GattCentral for SimGattCentral {
    async fn scan(&self, _duration: Duration) -> Result<Vec<GattAdvertisement>, TransportError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            self.overlapping_scans.fetch_add(1, Ordering::SeqCst);
        }
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.scan_delay.is_zero() {
            tokio::time::sleep(self.scan_delay).await;
        }
        let found = lock(&self.peripherals)
            .iter()
            .map(SimPeripheral::advertisement)
            .collect();
        self.scanning.store(false, Ordering::SeqCst);
        Ok(found)
    }

    async fn connect(
        &self,
        address: &str,
        notifications: mpsc::Sender<GattNotification>,
    ) -> Result<Box<dyn GattLink>, TransportError> {
        let peripheral = self
            .find(address)
            .ok_or_else(|| TransportError::NoDevice(address.to_string()))?;
        {
            let mut state = lock(&peripheral.state);
            if state.refuse_connections {
                return Err(TransportError::Ble(format!("{} refused the connection", address)));
            }
            state.connected = true;
            state.sink = Some(notifications);
        }
        Ok(Box::new(SimGattLink { peripheral }))
    }
}

struct SimGattLink {
    peripheral: SimPeripheral,
}

impl SimGattLink {
    fn require_connected(&self) -> Result<(), TransportError> {
        if lock(&self.peripheral.state).connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl GattLink for SimGattLink {
    async fn read(
        &self,
        _service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.require_connected()?;
        let state = lock(&self.peripheral.state);
        state
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .map(|c| c.value.clone())
            .ok_or_else(|| TransportError::Ble(format!("No characteristic {}", characteristic)))
    }

    async fn write(
        &self,
        _service: Option<Uuid>,
        characteristic: Uuid,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), TransportError> {
        self.require_connected()?;
        let mut state = lock(&self.peripheral.state);
        if !state.characteristics.iter().any(|c| c.uuid == characteristic) {
            return Err(TransportError::Ble(format!("No characteristic {}", characteristic)));
        }
        state.writes.push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        _service: Option<Uuid>,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.require_connected()?;
        let mut state = lock(&self.peripheral.state);
        if !state.characteristics.iter().any(|c| c.uuid == characteristic) {
            return Err(TransportError::Ble(format!("No characteristic {}", characteristic)));
        }
        state.subscribed.insert(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.require_connected()?;
        lock(&self.peripheral.state).subscribed.remove(&characteristic);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.peripheral.state);
        state.connected = false;
        state.sink = None;
        state.subscribed.clear();
        Ok(())
    }
}
