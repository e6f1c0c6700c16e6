//! Framed serial transport (NXT over USB or a paired serial port)
//!
//! Reads go through the telegram framer on a blocking worker. The device is
//! opened twice (cloned handle) so a read waiting out its timeout never
//! holds up a write.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::telegram::{describe, ByteSource, Framer, FramerSettings};

use super::serial::{lock, write_with_retry, SerialLink, SerialOpener, SharedLink, WritePolicy};
use super::{offload, LinkCounters, LinkStats, Transport, TransportError, TransportFamily};

#[derive(Debug, Clone)]
pub struct FramedSerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub framer: FramerSettings,
    pub write: WritePolicy,
}

struct ReadSide {
    link: Box<dyn SerialLink>,
    framer: Framer,
}

/// The read handle as the framer sees it. Once the transport is closed
/// every poll fails, so a decode waiting out its timeout returns early.
struct Watched<'a> {
    link: &'a mut dyn SerialLink,
    alive: &'a AtomicBool,
}

impl ByteSource for Watched<'_> {
    fn available(&mut self) -> io::Result<usize> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }
        self.link.available()
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.link.read_into(buf)
    }
}

pub struct FramedSerialTransport {
    opener: Arc<dyn SerialOpener>,
    settings: FramedSerialSettings,
    reader: Arc<Mutex<Option<ReadSide>>>,
    writer: SharedLink,
    alive: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
}

impl FramedSerialTransport {
    pub fn new(opener: Arc<dyn SerialOpener>, settings: FramedSerialSettings) -> Self {
        Self {
            opener,
            settings,
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(LinkCounters::default()),
        }
    }

    pub fn path(&self) -> &str {
        &self.settings.path
    }
}

#[async_trait]
impl Transport for FramedSerialTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::FramedSerial
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let opener = Arc::clone(&self.opener);
        let path = self.settings.path.clone();
        let baud_rate = self.settings.baud_rate;
        let (read_link, write_link) = offload(move || {
            let link = opener.open(&path, baud_rate)?;
            let clone = link.try_clone_link()?;
            Ok((link, clone))
        })
        .await?;

        *lock(&self.reader) = Some(ReadSide {
            link: read_link,
            framer: Framer::new(self.settings.framer),
        });
        *lock(&self.writer) = Some(write_link);
        self.alive.store(true, Ordering::SeqCst);
        log::info!("Connected to {}", self.settings.path);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let writer = Arc::clone(&self.writer);
        let probed = offload(move || Ok(lock(&writer).as_mut().map_or(false, |link| link.probe())))
            .await
            .unwrap_or(false);
        if !probed {
            log::warn!("{} stopped responding", self.settings.path);
            self.alive.store(false, Ordering::SeqCst);
        }
        probed
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let reader = Arc::clone(&self.reader);
        let alive = Arc::clone(&self.alive);
        let counters = Arc::clone(&self.counters);
        offload(move || {
            let mut guard = lock(&reader);
            let side = guard.as_mut().ok_or(TransportError::NotConnected)?;
            let mut source = Watched {
                link: side.link.as_mut(),
                alive: &alive,
            };
            match side.framer.decode_stream(&mut source) {
                Ok(Some(telegram)) => {
                    counters.record_received(telegram.len());
                    log::debug!(
                        "Hub → Client: {} {}",
                        describe::hex_dump(telegram.as_bytes(), 100),
                        describe::telegram(telegram.as_bytes())
                    );
                    Ok(Some(telegram.into_bytes()))
                }
                Ok(None) => Ok(None),
                Err(_) if !alive.load(Ordering::SeqCst) => Err(TransportError::NotConnected),
                Err(e) => {
                    counters.record_error();
                    alive.store(false, Ordering::SeqCst);
                    Err(TransportError::Io(e))
                }
            }
        })
        .await
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        log::debug!(
            "Client → Hub: {} {}",
            describe::hex_dump(data, 100),
            describe::telegram(data)
        );
        let writer = Arc::clone(&self.writer);
        let alive = Arc::clone(&self.alive);
        let counters = Arc::clone(&self.counters);
        let policy = self.settings.write;
        let data = data.to_vec();
        offload(move || write_with_retry(&writer, &data, policy, &alive, &counters)).await
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.writer).take();
        // A read in flight gives up at its next poll and releases the handle.
        let reader = Arc::clone(&self.reader);
        if let Err(e) = offload(move || {
            lock(&reader).take();
            Ok(())
        })
        .await
        {
            log::warn!("Releasing {} failed: {}", self.settings.path, e);
        }
        log::info!("Closed {}", self.settings.path);
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::{nxt_battery_responder, SimSerialHub, SimSerialOpener};
    use std::time::Duration;

    fn transport(hub: &SimSerialHub) -> FramedSerialTransport {
        with_timeout(hub, Duration::from_millis(30))
    }

    fn with_timeout(hub: &SimSerialHub, timeout: Duration) -> FramedSerialTransport {
        let opener = SimSerialOpener::new();
        opener.add("/dev/cu.NXT", hub.clone());
        FramedSerialTransport::new(
            Arc::new(opener),
            FramedSerialSettings {
                path: "/dev/cu.NXT".into(),
                baud_rate: 115200,
                framer: FramerSettings {
                    max_length: 256,
                    timeout,
                    poll_interval: Duration::from_millis(1),
                },
                write: WritePolicy {
                    attempts: 3,
                    delay: Duration::from_millis(1),
                },
            },
        )
    }

    #[tokio::test]
    async fn test_battery_request_round_trip() {
        let hub = SimSerialHub::new().with_responder(nxt_battery_responder());
        let transport = transport(&hub);
        transport.connect().await.unwrap();

        transport.write(&[0x02, 0x00, 0x00, 0x0B]).await.unwrap();
        assert_eq!(hub.written(), vec![0x02, 0x00, 0x00, 0x0B]);

        let reply = transport.read().await.unwrap().unwrap();
        assert_eq!(reply, vec![0x05, 0x00, 0x02, 0x0B, 0x00, 0x40, 0x1F]);
        assert_eq!(transport.read().await.unwrap(), None);

        let stats = transport.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.packets_received, 1);
    }

    #[tokio::test]
    async fn test_telegrams_read_in_wire_order() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();
        hub.feed(&[0x01, 0x00, 0xA1, 0xFF, 0xFF, 0x01, 0x00, 0xA2]);

        let mut got = Vec::new();
        for _ in 0..4 {
            if let Some(t) = transport.read().await.unwrap() {
                got.push(t);
            }
        }
        assert_eq!(got, vec![vec![0x01, 0x00, 0xA1], vec![0x01, 0x00, 0xA2]]);
    }

    #[tokio::test]
    async fn test_failed_writes_mark_link_dead() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();
        assert!(transport.is_alive().await);

        hub.fail_writes(true);
        let result = transport.write(&[0x02, 0x00, 0x00, 0x0B]).await;
        assert!(matches!(result, Err(TransportError::WriteFailed { attempts: 3, .. })));
        assert_eq!(hub.write_attempts(), 3);
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn test_unplug_is_detected_by_probe() {
        let hub = SimSerialHub::new();
        let transport = transport(&hub);
        transport.connect().await.unwrap();
        hub.unplug();
        assert!(!transport.is_alive().await);
        assert!(transport.connect().await.is_err());
        hub.replug();
        transport.connect().await.unwrap();
        assert!(transport.is_alive().await);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_read() {
        let hub = SimSerialHub::new();
        let transport = Arc::new(with_timeout(&hub, Duration::from_secs(10)));
        transport.connect().await.unwrap();

        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.read().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close waited out the read timeout");
        let read = pending.await.unwrap();
        assert!(matches!(read, Err(TransportError::NotConnected)));
        assert_eq!(transport.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_read_before_connect() {
        let transport = transport(&SimSerialHub::new());
        assert!(matches!(transport.read().await, Err(TransportError::NotConnected)));
        assert!(!transport.is_alive().await);
    }
}
