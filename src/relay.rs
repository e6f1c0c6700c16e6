//! Relay loop
//!
//! Moves hub data up to the client and client data down to the hub. The
//! downstream pump runs as its own task so an idle hub never stalls client
//! writes. A dead link is reopened after a run of failed liveness checks;
//! until then the client just sees silence.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::rpc;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Consecutive dead polls tolerated before reconnecting.
    pub reconnect_threshold: u32,
    /// Pause after a failed reconnect.
    pub reconnect_backoff: Duration,
    /// Pause between liveness checks on a dead link.
    pub dead_poll: Duration,
    /// Pause after a read that returned nothing.
    pub idle_backoff: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            reconnect_threshold: 5,
            reconnect_backoff: Duration::from_secs(1),
            dead_poll: Duration::from_millis(100),
            idle_backoff: Duration::from_millis(50),
        }
    }
}

/// What the pump does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    Read,
    Wait,
    Reconnect,
}

/// Counts consecutive dead polls.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    threshold: u32,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: 0,
        }
    }

    pub fn next(&mut self, alive: bool) -> PumpAction {
        if alive {
            self.failures = 0;
            return PumpAction::Read;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.threshold {
            PumpAction::Reconnect
        } else {
            PumpAction::Wait
        }
    }

    pub fn reconnected(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Read from `transport` until `forward` returns false. Runs until the
/// caller aborts it or the consumer goes away.
pub async fn pump_downstream<F>(
    transport: Arc<dyn Transport>,
    settings: RelaySettings,
    mut forward: F,
)
where
    F: FnMut(Vec<u8>) -> bool + Send,
{
    let mut policy = ReconnectPolicy::new(settings.reconnect_threshold);
    loop {
        match policy.next(transport.is_alive().await) {
            PumpAction::Read => match transport.read().await {
                Ok(Some(data)) => {
                    if !forward(data) {
                        break;
                    }
                }
                Ok(None) => tokio::time::sleep(settings.idle_backoff).await,
                Err(e) => {
                    log::debug!("Downstream read failed: {}", e);
                    tokio::time::sleep(settings.idle_backoff).await;
                }
            },
            PumpAction::Wait => tokio::time::sleep(settings.dead_poll).await,
            PumpAction::Reconnect => {
                log::info!("{} link down, reconnecting", transport.family());
                match transport.connect().await {
                    Ok(()) => {
                        log::info!("{} link reconnected", transport.family());
                        policy.reconnected();
                    }
                    Err(e) => {
                        log::warn!("Reconnect failed: {}", e);
                        tokio::time::sleep(settings.reconnect_backoff).await;
                    }
                }
            }
        }
    }
    log::debug!("Downstream pump stopped");
}

/// How a raw relay maps bytes to client text messages and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCodec {
    /// Each unit base64-encoded, both ways.
    Base64,
    /// Lines of text; client text goes down with `\r\n` appended.
    Lines,
}

impl RawCodec {
    pub fn to_client(&self, data: &[u8]) -> String {
        match self {
            RawCodec::Base64 => rpc::encode_base64(data),
            RawCodec::Lines => String::from_utf8_lossy(data).into_owned(),
        }
    }

    /// `None` when the message should be skipped.
    pub fn from_client(&self, text: &str) -> Option<Vec<u8>> {
        match self {
            RawCodec::Base64 => match rpc::decode_base64(text) {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some(data),
                Err(e) => {
                    log::warn!("Dropping client message: {}", e);
                    None
                }
            },
            RawCodec::Lines => {
                let mut data = text.as_bytes().to_vec();
                data.extend_from_slice(b"\r\n");
                Some(data)
            }
        }
    }
}

/// Bridge one client socket straight onto a transport, without JSON-RPC.
pub async fn run_raw<I, O>(
    transport: Arc<dyn Transport>,
    codec: RawCodec,
    settings: RelaySettings,
    mut incoming: I,
    mut outgoing: O,
) where
    I: Stream<Item = String> + Unpin,
    O: Sink<String> + Unpin,
{
    let started = chrono::Utc::now();
    let family = transport.family();
    if let Err(e) = transport.connect().await {
        // The pump keeps retrying; the client sees silence until then.
        log::warn!("{} initial connect failed: {}", family, e);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let pump = tokio::spawn(pump_downstream(Arc::clone(&transport), settings, move |data| {
        tx.send(codec.to_client(&data)).is_ok()
    }));

    loop {
        tokio::select! {
            Some(text) = rx.recv() => {
                if outgoing.send(text).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => {
                let text = match message {
                    Some(text) => text,
                    None => break,
                };
                if let Some(data) = codec.from_client(&text) {
                    if let Err(e) = transport.write(&data).await {
                        log::warn!("{} write failed: {}", family, e);
                    }
                }
            }
        }
    }

    pump.abort();
    transport.close().await;
    let stats = transport.stats();
    let uptime = chrono::Utc::now() - started;
    log::info!(
        "{} relay closed after {}s: {} bytes up, {} bytes down, {} errors, {:.1} packets/s",
        family,
        uptime.num_seconds(),
        stats.bytes_received,
        stats.bytes_sent,
        stats.errors,
        stats.packet_rate(uptime)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::client;
    use crate::transport::{LinkCounters, LinkStats, TransportError, TransportFamily};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_policy_reconnects_after_threshold() {
        let mut policy = ReconnectPolicy::new(5);
        for _ in 0..5 {
            assert_eq!(policy.next(false), PumpAction::Wait);
        }
        assert_eq!(policy.next(false), PumpAction::Reconnect);
        // Still down after a failed reconnect: try again.
        assert_eq!(policy.next(false), PumpAction::Reconnect);
        policy.reconnected();
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.next(false), PumpAction::Wait);
    }

    #[test]
    fn test_policy_resets_when_alive() {
        let mut policy = ReconnectPolicy::new(5);
        for _ in 0..4 {
            policy.next(false);
        }
        assert_eq!(policy.next(true), PumpAction::Read);
        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn test_codecs() {
        assert_eq!(RawCodec::Base64.to_client(&[0x02, 0x00, 0x00, 0x0B]), "AgAACw==");
        assert_eq!(RawCodec::Base64.from_client("AQID"), Some(vec![1, 2, 3]));
        assert_eq!(RawCodec::Base64.from_client(""), None);
        assert_eq!(RawCodec::Base64.from_client("%%%"), None);
        assert_eq!(RawCodec::Lines.from_client("hub.status()"), Some(b"hub.status()\r\n".to_vec()));
        assert_eq!(RawCodec::Lines.to_client(b"OK"), "OK");
    }

    /// Scripted transport: queued reads, a liveness flag, recorded writes.
    #[derive(Default)]
    struct Scripted {
        reads: Mutex<VecDeque<Vec<u8>>>,
        alive: AtomicBool,
        revive_on_connect: AtomicBool,
        connects: AtomicUsize,
        writes: Mutex<Vec<Vec<u8>>>,
        counters: LinkCounters,
    }

    #[async_trait]
    impl Transport for Scripted {
        fn family(&self) -> TransportFamily {
            TransportFamily::FramedSerial
        }

        async fn connect(&self) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.revive_on_connect.load(Ordering::SeqCst) {
                self.alive.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(TransportError::NoDevice("scripted".into()))
            }
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(self.reads.lock().unwrap().pop_front())
        }

        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn stats(&self) -> LinkStats {
            self.counters.snapshot()
        }
    }

    fn quick() -> RelaySettings {
        RelaySettings {
            reconnect_threshold: 5,
            reconnect_backoff: Duration::from_millis(1000),
            dead_poll: Duration::from_millis(100),
            idle_backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_forwards_in_order() {
        let transport = Arc::new(Scripted::default());
        transport.alive.store(true, Ordering::SeqCst);
        for n in 0..4u8 {
            transport.reads.lock().unwrap().push_back(vec![n]);
        }

        let mut seen = Vec::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        pump_downstream(dyn_transport, quick(), |data| {
            seen.push(data[0]);
            seen.len() < 4
        })
        .await;
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_reconnects_after_dead_polls() {
        let transport = Arc::new(Scripted::default());
        transport.revive_on_connect.store(true, Ordering::SeqCst);
        transport.reads.lock().unwrap().push_back(vec![0xAA]);

        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let started = tokio::time::Instant::now();
        pump_downstream(dyn_transport, quick(), |_| false).await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        // Five dead polls, then the sixth check reconnects.
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_backs_off() {
        let transport = Arc::new(Scripted::default());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let pump = tokio::spawn(pump_downstream(dyn_transport, quick(), |_| true));

        // 500 ms of dead polls, a failed attempt, 1 s back-off, another attempt.
        tokio::time::sleep(Duration::from_millis(1550)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        pump.abort();
    }

    #[tokio::test]
    async fn test_raw_relay_moves_both_directions() {
        let transport = Arc::new(Scripted::default());
        transport.revive_on_connect.store(true, Ordering::SeqCst);
        transport.reads.lock().unwrap().push_back(vec![0x02, 0x00, 0x00, 0x0B]);

        let (mut client, incoming, outgoing) = client();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let relay = tokio::spawn(run_raw(
            dyn_transport,
            RawCodec::Base64,
            RelaySettings {
                idle_backoff: Duration::from_millis(5),
                ..quick()
            },
            incoming,
            outgoing,
        ));

        let up = client.replies.recv().await.unwrap();
        assert_eq!(up, "AgAACw==");

        client.send("AQID");
        client.send("");
        for _ in 0..100 {
            if !transport.writes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*transport.writes.lock().unwrap(), vec![vec![1, 2, 3]]);

        drop(client);
        relay.await.unwrap();
        assert!(!transport.alive.load(Ordering::SeqCst));
    }
}
