//! Downstream transport adapters
//!
//! One uniform interface over every medium a hub can hang off: framed
//! serial, RFCOMM (classic Bluetooth), BLE GATT and line-oriented serial.
//! Each adapter owns the blocking primitive of its medium and routes every
//! blocking call through the runtime's bounded blocking pool.

pub mod framed;
pub mod gatt;
pub mod line;
pub mod rfcomm;
pub mod serial;
pub mod simulated;

#[cfg(feature = "ble-central")]
pub mod btle;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("No device found: {0}")]
    NoDevice(String),

    #[error("Write failed after {attempts} attempts: {last}")]
    WriteFailed { attempts: u32, last: String },

    #[error("BLE error: {0}")]
    Ble(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Blocking worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for TransportError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransportError::Worker(err.to_string())
    }
}

/// The medium a transport runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportFamily {
    FramedSerial,
    Ble,
    ClassicBluetooth,
    LineSerial,
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportFamily::FramedSerial => "framed-serial",
            TransportFamily::Ble => "ble",
            TransportFamily::ClassicBluetooth => "classic-bluetooth",
            TransportFamily::LineSerial => "line-serial",
        };
        f.write_str(name)
    }
}

/// A live link to one hub.
///
/// Methods take `&self` so the downstream read side and the client write
/// side of one session can drive the same adapter concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    fn family(&self) -> TransportFamily;

    /// Open (or reopen) the underlying link.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Re-validate liveness. Physical disconnects are silent until the
    /// next I/O attempt, so adapters probe instead of trusting a flag.
    async fn is_alive(&self) -> bool;

    /// Bounded-wait read of the next unit (telegram, line, notification).
    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&self);

    fn stats(&self) -> LinkStats;
}

/// Traffic counters for one connection.
#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    errors: AtomicU64,
}

impl LinkCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LinkCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors: u64,
}

impl LinkStats {
    /// Packets per second in both directions over `elapsed`.
    pub fn packet_rate(&self, elapsed: chrono::Duration) -> f64 {
        let millis = elapsed.num_milliseconds();
        if millis <= 0 {
            return 0.0;
        }
        (self.packets_sent + self.packets_received) as f64 * 1000.0 / millis as f64
    }
}

/// Run a blocking I/O closure on the blocking worker pool.
pub(crate) async fn offload<F, T>(work: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
