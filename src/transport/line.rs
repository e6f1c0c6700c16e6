//! Line-oriented serial transport (SPIKE / Robot Inventor REPL)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;

use crate::telegram::{describe, ByteSource};

use super::serial::{lock, write_with_retry, SerialOpener, SharedLink, WritePolicy};
use super::{offload, LinkCounters, LinkStats, Transport, TransportError, TransportFamily};

/// Ctrl-C, sent on connect to break out of a running program.
pub const INTERRUPT: u8 = 0x03;

/// A partial line longer than this is dropped.
const MAX_PENDING: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct LineSerialSettings {
    pub path: String,
    pub baud_rate: u32,
    /// Pause after the interrupt byte before reading.
    pub settle: Duration,
}

pub struct LineSerialTransport {
    opener: Arc<dyn SerialOpener>,
    settings: LineSerialSettings,
    link: SharedLink,
    pending: Arc<Mutex<Vec<u8>>>,
    alive: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
}

/// Pop the next non-empty line from `buffer`, trimmed.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

impl LineSerialTransport {
    pub fn new(opener: Arc<dyn SerialOpener>, settings: LineSerialSettings) -> Self {
        Self {
            opener,
            settings,
            link: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(Vec::new())),
            alive: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(LinkCounters::default()),
        }
    }
}

#[async_trait]
impl Transport for LineSerialTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::LineSerial
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let opener = Arc::clone(&self.opener);
        let settings = self.settings.clone();
        let link = offload(move || {
            let mut link = opener.open(&settings.path, settings.baud_rate)?;
            link.write_all(&[INTERRUPT])?;
            link.flush()?;
            thread::sleep(settings.settle);
            Ok(link)
        })
        .await?;

        *lock(&self.link) = Some(link);
        lock(&self.pending).clear();
        self.alive.store(true, Ordering::SeqCst);
        log::info!("Connected to {}", self.settings.path);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let link = Arc::clone(&self.link);
        let probed = offload(move || Ok(lock(&link).as_mut().map_or(false, |l| l.probe())))
            .await
            .unwrap_or(false);
        if !probed {
            self.alive.store(false, Ordering::SeqCst);
        }
        probed
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let link = Arc::clone(&self.link);
        let pending = Arc::clone(&self.pending);
        let alive = Arc::clone(&self.alive);
        let counters = Arc::clone(&self.counters);
        offload(move || {
            let mut buffer = lock(&pending);
            if let Some(line) = take_line(&mut buffer) {
                counters.record_received(line.len());
                return Ok(Some(line.into_bytes()));
            }

            let mut guard = lock(&link);
            let port = guard.as_mut().ok_or(TransportError::NotConnected)?;
            let chunk = port.available().and_then(|n| {
                let mut chunk = vec![0u8; n];
                let read = if n > 0 { port.read_into(&mut chunk)? } else { 0 };
                chunk.truncate(read);
                Ok(chunk)
            });
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    counters.record_error();
                    alive.store(false, Ordering::SeqCst);
                    return Err(TransportError::Io(e));
                }
            };

            buffer.extend_from_slice(&chunk);
            if buffer.len() > MAX_PENDING && !buffer.contains(&b'\n') {
                log::warn!("Dropping {} bytes without a line break", buffer.len());
                buffer.clear();
            }
            let line = take_line(&mut buffer);
            if let Some(line) = &line {
                log::debug!("Hub → Client: {} {}", line, describe::spike_line(line));
                counters.record_received(line.len());
            }
            Ok(line.map(String::into_bytes))
        })
        .await
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let link = Arc::clone(&self.link);
        let alive = Arc::clone(&self.alive);
        let counters = Arc::clone(&self.counters);
        let data = data.to_vec();
        let policy = WritePolicy {
            attempts: 1,
            delay: Duration::ZERO,
        };
        offload(move || write_with_retry(&link, &data, policy, &alive, &counters)).await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.link).take();
        lock(&self.pending).clear();
        log::info!("Closed {}", self.settings.path);
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::{SimSerialHub, SimSerialOpener};

    fn transport(hub: &SimSerialHub) -> LineSerialTransport {
        let opener = SimSerialOpener::new();
        opener.add("/dev/ttyACM0", hub.clone());
        LineSerialTransport::new(
            Arc::new(opener),
            LineSerialSettings {
                path: "/dev/ttyACM0".into(),
                baud_rate: 115200,
                settle: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_take_line_skips_blank_lines() {
        let mut buffer = b"\r\n  \nhello\r\nwor".to_vec();
        assert_eq!(take_line(&mut buffer), Some("hello".to_string()));
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"wor");
    }

    #[tokio::test]
    async fn test_connect_sends_interrupt() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();
        assert_eq!(hub.written(), vec![INTERRUPT]);
    }

    #[tokio::test]
    async fn test_partial_lines_persist_across_reads() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();

        hub.feed(b">>> print(1");
        assert_eq!(transport.read().await.unwrap(), None);
        hub.feed(b"+1)\r\n2\r\n");
        assert_eq!(transport.read().await.unwrap(), Some(b">>> print(1+1)".to_vec()));
        // Second line already buffered, no new bytes needed.
        assert_eq!(transport.read().await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(transport.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_is_single_attempt() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();
        hub.fail_writes(true);
        assert!(transport.write(b"import hub\r\n").await.is_err());
        // One for the interrupt, one for the failed write.
        assert_eq!(hub.write_attempts(), 2);
        assert!(!transport.is_alive().await);
    }
}
