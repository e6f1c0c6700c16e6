//! Per-client JSON-RPC sessions
//!
//! A session reads requests off the client socket one at a time, hands
//! each to its family's [`SessionHandler`] and writes back exactly one
//! response per request that carried an `id`. While a request is being
//! handled, queued notifications keep flowing to the client in the order
//! they were raised.

pub mod ble;
pub mod bt;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::{DeviceRegistry, DiscoveryFilter, Peripheral};
use crate::rpc::{self, Method, Notification, Request, RpcError};
use crate::transport::LinkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initial,
    Discovery,
    Connected,
    Done,
}

/// Queues notifications for the client. Cloned into background tasks.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Returns false once the session has ended.
    pub fn notify(&self, method: &str, params: Value) -> bool {
        self.send(Notification::new(method, params))
    }

    pub fn send(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn notification_queue() -> (Notifier, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Notifier { tx }, rx)
}

/// The family-specific half of a session.
#[async_trait]
pub trait SessionHandler: Send {
    /// Short name for the log.
    fn name(&self) -> &'static str;

    fn supports(&self, method: Method) -> bool;

    /// Check that the family can work at all. An error here is fatal: it is
    /// reported once and the session ends.
    async fn startup(&mut self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn handle(&mut self, method: Method, params: Value) -> Result<Value, RpcError>;

    fn status(&self) -> SessionStatus;

    /// Traffic on the bound connection, if any.
    fn stats(&self) -> Option<LinkStats> {
        None
    }

    async fn close(&mut self);
}

struct ClientGone;

async fn deliver<O>(outgoing: &mut O, message: Value) -> Result<(), ClientGone>
where
    O: Sink<String> + Unpin,
{
    outgoing.send(message.to_string()).await.map_err(|_| ClientGone)
}

async fn drain<O>(
    queue: &mut mpsc::UnboundedReceiver<Notification>,
    outgoing: &mut O,
) -> Result<(), ClientGone>
where
    O: Sink<String> + Unpin,
{
    while let Ok(notification) = queue.try_recv() {
        deliver(outgoing, notification.to_json()).await?;
    }
    Ok(())
}

/// Run one request to completion, forwarding notifications meanwhile.
async fn dispatch<H, O>(
    handler: &mut H,
    request: Request,
    queue: &mut mpsc::UnboundedReceiver<Notification>,
    outgoing: &mut O,
) -> Result<(), ClientGone>
where
    H: SessionHandler,
    O: Sink<String> + Unpin,
{
    let method = request.method.parse::<Method>().and_then(|method| {
        if handler.supports(method) {
            Ok(method)
        } else {
            Err(RpcError::UnknownMethod(request.method.clone()))
        }
    });

    let outcome = match method {
        Ok(method) => {
            log::debug!("[{}] {} {}", handler.name(), method, request.params);
            let work = handler.handle(method, request.params);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    biased;
                    Some(notification) = queue.recv() => {
                        deliver(outgoing, notification.to_json()).await?;
                    }
                    outcome = &mut work => break outcome,
                }
            }
        }
        Err(e) => Err(e),
    };

    // Notifications raised by the handler precede its response.
    drain(queue, outgoing).await?;

    match request.id {
        Some(id) => deliver(outgoing, rpc::response(id, outcome)).await,
        None => {
            if let Err(e) = outcome {
                log::debug!("{} (no id, not answered): {}", request.method, e);
            }
            Ok(())
        }
    }
}

/// Drive a session until the client goes away. Returns the final status.
pub async fn run<H, I, O>(
    mut handler: H,
    mut queue: mpsc::UnboundedReceiver<Notification>,
    mut incoming: I,
    mut outgoing: O,
) -> SessionStatus
where
    H: SessionHandler,
    I: Stream<Item = String> + Unpin,
    O: Sink<String> + Unpin,
{
    let started = chrono::Utc::now();
    log::info!("[{}] session started", handler.name());

    if let Err(e) = handler.startup().await {
        log::error!("[{}] cannot start: {}", handler.name(), e);
        let _ = deliver(&mut outgoing, Notification::error(&e).to_json()).await;
        handler.close().await;
        let _ = outgoing.close().await;
        return SessionStatus::Done;
    }

    loop {
        tokio::select! {
            biased;
            Some(notification) = queue.recv() => {
                if deliver(&mut outgoing, notification.to_json()).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => {
                let text = match message {
                    Some(text) => text,
                    None => break,
                };
                let request = match Request::parse(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("[{}] ignoring message: {}", handler.name(), e);
                        continue;
                    }
                };
                if dispatch(&mut handler, request, &mut queue, &mut outgoing).await.is_err() {
                    break;
                }
            }
        }
    }

    let status = handler.status();
    handler.close().await;

    let uptime = chrono::Utc::now() - started;
    match handler.stats() {
        Some(stats) => log::info!(
            "[{}] session closed after {}s ({:?} at close): \
             {} packets sent, {} received, {} errors, {:.1} packets/s",
            handler.name(),
            uptime.num_seconds(),
            status,
            stats.packets_sent,
            stats.packets_received,
            stats.errors,
            stats.packet_rate(uptime)
        ),
        None => log::info!(
            "[{}] session closed after {}s ({:?} at close)",
            handler.name(),
            uptime.num_seconds(),
            status
        ),
    }
    SessionStatus::Done
}

/// A discovery filter from `discover` params: `filters` is a list of
/// `{name}` / `{namePrefix}` objects. Without any, `keywords` apply.
pub fn discovery_filter(params: &Value, keywords: &[String]) -> DiscoveryFilter {
    let mut filter = DiscoveryFilter::with_keywords(keywords);
    let entries = rpc::param(params, "filters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in entries {
        if let Some(name) = entry.get("name").and_then(Value::as_str) {
            filter.names.push(name.to_string());
        }
        if let Some(prefix) = entry.get("namePrefix").and_then(Value::as_str) {
            filter.name_prefixes.push(prefix.to_string());
        }
    }
    filter
}

/// Params of a `didDiscoverPeripheral` notification.
pub fn discovered<A>(peripheral: &Peripheral<A>) -> Value {
    let mut params = json!({
        "peripheralId": peripheral.id,
        "name": peripheral.name,
    });
    if let Some(rssi) = peripheral.rssi {
        params["rssi"] = json!(rssi);
    }
    params
}

/// Re-announce the registry contents every `interval` until aborted.
pub fn spawn_announcer<A>(
    registry: std::sync::Arc<DeviceRegistry<A>>,
    notifier: Notifier,
    interval: Duration,
) -> JoinHandle<()>
where
    A: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for peripheral in registry.snapshot().await {
                if !notifier.notify("didDiscoverPeripheral", discovered(&peripheral)) {
                    return;
                }
            }
        }
    })
}

/// Parse the `peripheralId` param.
pub fn peripheral_id(params: &Value) -> Result<usize, RpcError> {
    rpc::param(params, "peripheralId")
        .and_then(Value::as_u64)
        .and_then(|id| usize::try_from(id).ok())
        .ok_or(RpcError::InvalidPeripheral)
}


#[cfg(test)]
mod tests {
    use super::testing::client;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Echo {
        notifier: Notifier,
        status: SessionStatus,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn supports(&self, method: Method) -> bool {
            matches!(method, Method::Discover | Method::Send)
        }

        async fn handle(&mut self, method: Method, params: Value) -> Result<Value, RpcError> {
            match method {
                Method::Discover => {
                    self.status = SessionStatus::Discovery;
                    for n in 0..3 {
                        self.notifier.notify("didDiscoverPeripheral", json!({ "peripheralId": n }));
                        tokio::task::yield_now().await;
                    }
                    Ok(Value::Null)
                }
                Method::Send => {
                    let delay = params.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(params)
                }
                _ => Err(RpcError::UnknownMethod(method.to_string())),
            }
        }

        fn status(&self) -> SessionStatus {
            self.status
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo() -> (Echo, mpsc::UnboundedReceiver<Notification>, Arc<AtomicUsize>) {
        let (notifier, queue) = notification_queue();
        let closed = Arc::new(AtomicUsize::new(0));
        let handler = Echo {
            notifier,
            status: SessionStatus::Initial,
            closed: Arc::clone(&closed),
        };
        (handler, queue, closed)
    }

    #[tokio::test]
    async fn test_notifications_precede_response_in_order() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        let session = tokio::spawn(run(handler, queue, incoming, outgoing));

        client.send(r#"{"jsonrpc":"2.0","method":"discover","params":{},"id":1}"#);
        for n in 0..3 {
            let note = client.next().await;
            assert_eq!(note["method"], "didDiscoverPeripheral");
            assert_eq!(note["params"]["peripheralId"], n);
            assert!(note.get("id").is_none());
        }
        let response = client.next().await;
        assert_eq!(response, json!({"jsonrpc":"2.0","id":1,"result":null}));

        drop(client);
        assert_eq!(session.await.unwrap(), SessionStatus::Done);
    }

    #[tokio::test]
    async fn test_responses_pair_with_ids_in_request_order() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        tokio::spawn(run(handler, queue, incoming, outgoing));

        // The slow first request must still be answered first.
        client.send(
            r#"{"jsonrpc":"2.0","method":"send","params":{"delayMs":30,"n":"a"},"id":"a"}"#,
        );
        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{"n":"b"},"id":"b"}"#);
        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{"n":"c"},"id":3}"#);

        let first = client.next().await;
        let second = client.next().await;
        let third = client.next().await;
        assert_eq!(first["id"], "a");
        assert_eq!(first["result"]["n"], "a");
        assert_eq!(second["id"], "b");
        assert_eq!(third["id"], 3);
        assert!(client.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_ignored() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        tokio::spawn(run(handler, queue, incoming, outgoing));

        client.send("{garbage");
        client.send(r#"{"jsonrpc":"1.0","method":"send","id":1}"#);
        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{},"id":2}"#);

        let reply = client.next().await;
        assert_eq!(reply["id"], 2);
    }

    #[tokio::test]
    async fn test_unsupported_method_is_an_error() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        tokio::spawn(run(handler, queue, incoming, outgoing));

        client.send(r#"{"jsonrpc":"2.0","method":"write","params":{},"id":1}"#);
        client.send(r#"{"jsonrpc":"2.0","method":"reboot","params":{},"id":2}"#);

        assert_eq!(client.next().await["error"]["message"], "Unknown method: write");
        assert_eq!(client.next().await["error"]["message"], "Unknown method: reboot");
    }

    #[tokio::test]
    async fn test_requests_without_id_get_no_response() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        tokio::spawn(run(handler, queue, incoming, outgoing));

        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{}}"#);
        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{},"id":9}"#);
        assert_eq!(client.next().await["id"], 9);
    }

    #[tokio::test]
    async fn test_null_id_is_answered() {
        let (handler, queue, _) = echo();
        let (mut client, incoming, outgoing) = client();
        tokio::spawn(run(handler, queue, incoming, outgoing));

        client.send(r#"{"jsonrpc":"2.0","method":"send","params":{},"id":null}"#);
        let reply = client.next().await;
        assert_eq!(reply.get("id"), Some(&Value::Null));
        assert!(reply.get("result").is_some());
    }

    #[tokio::test]
    async fn test_close_runs_when_client_leaves() {
        let (handler, queue, closed) = echo();
        let (client, incoming, outgoing) = client();
        let session = tokio::spawn(run(handler, queue, incoming, outgoing));
        drop(client);
        session.await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    struct Broken;

    #[async_trait]
    impl SessionHandler for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn supports(&self, _method: Method) -> bool {
            true
        }

        async fn startup(&mut self) -> Result<(), RpcError> {
            Err(RpcError::Unavailable("No compatible transport".into()))
        }

        async fn handle(&mut self, _method: Method, _params: Value) -> Result<Value, RpcError> {
            Ok(Value::Null)
        }

        fn status(&self) -> SessionStatus {
            SessionStatus::Initial
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_fatal_startup_is_reported_once() {
        let (_notifier, queue) = notification_queue();
        let (mut client, incoming, outgoing) = client();
        let status = run(Broken, queue, incoming, outgoing).await;
        assert_eq!(status, SessionStatus::Done);

        let message = client.next().await;
        assert_eq!(
            message,
            json!({"jsonrpc":"2.0","method":"error","params":{"message":"No compatible transport"}})
        );
        assert!(client.replies.recv().await.is_none());
    }

    #[test]
    fn test_discovery_filter_from_params() {
        let keywords = vec!["lego".to_string()];
        let filter = discovery_filter(
            &json!({"filters":[{"name":"Pybricks Hub"},{"namePrefix":"BBC"}]}),
            &keywords,
        );
        assert_eq!(filter.names, vec!["Pybricks Hub"]);
        assert_eq!(filter.name_prefixes, vec!["BBC"]);

        let fallback = discovery_filter(&json!({"filters":[{"services":[0x1623]}]}), &keywords);
        assert!(!fallback.is_explicit());
        assert!(fallback.matches(Some("LEGO Hub")));
    }

    #[test]
    fn test_peripheral_id_param() {
        assert_eq!(peripheral_id(&json!({"peripheralId":2})), Ok(2));
        assert_eq!(peripheral_id(&json!({"peripheralId":"x"})), Err(RpcError::InvalidPeripheral));
        assert_eq!(peripheral_id(&json!({})), Err(RpcError::InvalidPeripheral));
    }
}
