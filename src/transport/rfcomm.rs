//! Classic Bluetooth (RFCOMM) transport
//!
//! The bound RFCOMM device node is a plain serial device, but its reads have
//! no asynchronous form, so each connection gets a dedicated receive thread.
//! The thread decodes telegrams and hands them over on a bounded channel;
//! [`Transport::read`] only ever polls that channel.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::telegram::{describe, Framer};

use super::framed::FramedSerialSettings;
use super::serial::{
    device_display_name, lock, write_with_retry, SerialLink, SerialOpener, SharedLink,
};
use super::{offload, LinkCounters, LinkStats, Transport, TransportError, TransportFamily};

/// Telegrams buffered between the receive thread and the session.
const RECEIVE_QUEUE_DEPTH: usize = 32;

struct ReceiveWorker {
    running: Arc<AtomicBool>,
    // Never joined: the thread exits on its own once its current read
    // returns or times out.
    _handle: thread::JoinHandle<()>,
}

pub struct RfcommTransport {
    opener: Arc<dyn SerialOpener>,
    settings: FramedSerialSettings,
    writer: SharedLink,
    worker: Mutex<Option<ReceiveWorker>>,
    received: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    alive: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
}

impl RfcommTransport {
    pub fn new(opener: Arc<dyn SerialOpener>, settings: FramedSerialSettings) -> Self {
        Self {
            opener,
            settings,
            writer: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            received: tokio::sync::Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// Name the device was bound under, e.g. `NXT` for `/dev/cu.NXT`.
    pub fn device_name(&self) -> String {
        device_display_name(Path::new(&self.settings.path))
    }

    fn stop_worker(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}

fn receive_loop(
    mut link: Box<dyn SerialLink>,
    mut framer: Framer,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    while running.load(Ordering::SeqCst) {
        match framer.decode_stream(link.as_mut()) {
            Ok(Some(telegram)) => {
                counters.record_received(telegram.len());
                log::debug!(
                    "Hub → Client: {} {}",
                    describe::hex_dump(telegram.as_bytes(), 100),
                    describe::telegram(telegram.as_bytes())
                );
                if tx.blocking_send(telegram.into_bytes()).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::error!("RFCOMM receive failed: {}", e);
                    counters.record_error();
                    alive.store(false, Ordering::SeqCst);
                }
                break;
            }
        }
    }
    log::debug!("RFCOMM receive worker stopped");
}

#[async_trait]
impl Transport for RfcommTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::ClassicBluetooth
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.stop_worker();

        let opener = Arc::clone(&self.opener);
        let path = self.settings.path.clone();
        let baud_rate = self.settings.baud_rate;
        let (read_link, write_link) = offload(move || {
            let link = opener.open(&path, baud_rate)?;
            let clone = link.try_clone_link()?;
            Ok((link, clone))
        })
        .await?;

        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        let framer = Framer::new(self.settings.framer);
        let handle = {
            let running = Arc::clone(&running);
            let alive = Arc::clone(&self.alive);
            let counters = Arc::clone(&self.counters);
            thread::Builder::new()
                .name("rfcomm-rx".into())
                .spawn(move || receive_loop(read_link, framer, running, alive, counters, tx))?
        };

        *lock(&self.writer) = Some(write_link);
        *self.received.lock().await = Some(rx);
        *lock(&self.worker) = Some(ReceiveWorker {
            running,
            _handle: handle,
        });
        self.alive.store(true, Ordering::SeqCst);
        log::info!("RFCOMM link to {} open", self.settings.path);
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
            self.alive.store(false, Ordering::SeqCst);
        }
        probed
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut guard = self.received.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match rx.try_recv() {
            Ok(telegram) => Ok(Some(telegram)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                *guard = None;
                self.alive.store(false, Ordering::SeqCst);
                Err(TransportError::NotConnected)
            }
        }
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
        self.stop_worker();
        lock(&self.writer).take();
        *self.received.lock().await = None;
        log::info!("RFCOMM link to {} closed", self.settings.path);
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }
}
