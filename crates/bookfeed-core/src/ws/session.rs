//! One persistent WebSocket connection shared by many request/response calls.
//!
//! The session runs as a tokio task that:
//! 1. Connects to the endpoint.
//! 2. Forwards outbound request frames from callers.
//! 3. Reads frames and resolves the pending request whose `id` matches.
//! 4. Sends periodic ping frames.
//! 5. On disconnect fails every pending request and reconnects with
//!    exponential backoff.
//!
//! Callers never wait for a reconnect: a request issued while the socket is
//! down fails immediately with [`RequestError::Disconnected`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::ReconnectPolicy;
use crate::error::BookfeedError;

/// Invoked with the running reconnection count each time the socket comes
/// back after a loss.
pub type OnReconnectCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("websocket not connected")]
    Disconnected,
    #[error("response timed out after {0:?}")]
    Timeout(Duration),
    #[error("session closed")]
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct WsSessionConfig {
    pub url: String,
    /// Log prefix, e.g. `deribit/options`.
    pub label: String,
    pub reconnect: ReconnectPolicy,
    /// `None` disables client pings.
    pub ping_interval: Option<Duration>,
}

type PendingTable = AHashMap<u64, oneshot::Sender<Result<Value, RequestError>>>;

struct SessionShared {
    /// id → waiting caller. Locked only around insert/remove.
    pending: Mutex<PendingTable>,
    /// Writer side of the live connection; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
    reconnections: AtomicU64,
    connected: watch::Sender<bool>,
}

impl SessionShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        let mut guard = match self.outbound.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = tx;
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<String>> {
        match self.outbound.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolve the pending request matching this frame's id, if any.
    fn dispatch(&self, label: &str, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[ws-api {label}] non-JSON frame dropped: {e}");
                return;
            }
        };
        let Some(id) = frame_id(&value) else {
            debug!("[ws-api {label}] frame without id ignored");
            return;
        };
        let waiter = self.pending().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(value));
            }
            None => debug!("[ws-api {label}] no pending request for id {id}"),
        }
    }

    fn fail_all(&self, err: RequestError) -> usize {
        let drained: Vec<_> = self.pending().drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }
}

/// Extract a numeric request id from a response frame. Accepts `"id": 42`
/// and `"id": "42"`.
fn frame_id(v: &Value) -> Option<u64> {
    match v.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Shared request/response session over a single WebSocket.
pub struct WsRequestSession {
    config: WsSessionConfig,
    shared: Arc<SessionShared>,
    /// Shutdown signal and connection task while running.
    running: Mutex<Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
}

impl WsRequestSession {
    /// Create a new (not yet started) session. Rejects unparseable URLs.
    pub fn new(config: WsSessionConfig) -> Result<Self, BookfeedError> {
        url::Url::parse(&config.url)
            .map_err(|e| BookfeedError::Config(format!("bad websocket url {}: {e}", config.url)))?;
        let (connected, _) = watch::channel(false);
        Ok(Self {
            config,
            shared: Arc::new(SessionShared {
                pending: Mutex::new(AHashMap::new()),
                outbound: Mutex::new(None),
                next_id: AtomicU64::new(1),
                reconnections: AtomicU64::new(0),
                connected,
            }),
            running: Mutex::new(None),
        })
    }

    /// Start the connection task. Calling `start` on a running session is a no-op.
    pub fn start(&self, on_reconnect: Option<OnReconnectCallback>) {
        let mut running = self.running_guard();
        if running.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            connection_loop(config, shared, on_reconnect, shutdown_rx).await;
        });
        *running = Some((shutdown_tx, task));
    }

    fn running_guard(&self) -> std::sync::MutexGuard<'_, Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>> {
        match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Allocate a fresh request id.
    pub fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Wait until the socket is up, at most `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.connected.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await.is_ok_and(|r| r.is_ok())
    }

    pub fn reconnections(&self) -> u64 {
        self.shared.reconnections.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Send `frame` (which must carry `id`) and await the matching response.
    ///
    /// The pending entry lives exactly as long as this future: a timeout or
    /// a caller dropping the future removes it, and the connection stays up.
    pub async fn request(&self, id: u64, frame: String, timeout: Duration) -> Result<Value, RequestError> {
        let outbound = self.shared.outbound().ok_or(RequestError::Disconnected)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        let _entry = PendingEntry { shared: &self.shared, id };

        if outbound.send(frame).is_err() {
            return Err(RequestError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a result: the table was torn down.
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => Err(RequestError::Timeout(timeout)),
        }
    }

    /// Stop the connection task and fail everything still pending.
    /// Stopping a session that was never started (or is already stopped)
    /// is a no-op.
    pub async fn stop(&self) {
        let running = self.running_guard().take();
        if let Some((shutdown_tx, task)) = running {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }
        self.shared.fail_all(RequestError::Closed);
    }
}

/// Removes a request's pending slot when the request ends, however it ends.
struct PendingEntry<'a> {
    shared: &'a SessionShared,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

impl Drop for WsRequestSession {
    fn drop(&mut self) {
        if let Some((_, task)) = self.running_guard().take() {
            task.abort();
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_ws(url: &str) -> Result<WsStream, BookfeedError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BookfeedError::WebSocket(e.to_string()))?;
    Ok(stream)
}

/// Connect, pump frames, reconnect.
async fn connection_loop(
    config: WsSessionConfig,
    shared: Arc<SessionShared>,
    on_reconnect: Option<OnReconnectCallback>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let label = config.label.as_str();
    let policy = config.reconnect;
    let mut backoff = policy.initial_delay;
    let mut ever_connected = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        info!("[ws-api {label}] connecting to {}", config.url);
        let ws_stream = tokio::select! {
            r = connect_ws(&config.url) => r,
            _ = shutdown_rx.changed() => break,
        };
        let ws_stream = match ws_stream {
            Ok(s) => s,
            Err(e) => {
                error!("[ws-api {label}] connection failed: {e}, retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = shutdown_rx.changed() => break,
                }
                backoff = policy.next_delay(backoff);
                continue;
            }
        };

        backoff = policy.initial_delay;
        if ever_connected {
            let n = shared.reconnections.fetch_add(1, Ordering::Relaxed) + 1;
            info!("[ws-api {label}] reconnected (#{n})");
            if let Some(cb) = &on_reconnect {
                cb(n);
            }
        } else {
            info!("[ws-api {label}] connected");
        }
        ever_connected = true;

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        shared.set_outbound(Some(out_tx));
        shared.connected.send_replace(true);

        let ping_interval = config.ping_interval;
        tokio::pin! {
            let ping_tick = async {
                match ping_interval {
                    Some(d) => {
                        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
                        loop {
                            interval.tick().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
        }

        let shutting_down = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = ws_write.close().await;
                    break true;
                }

                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => shared.dispatch(label, &text),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("[ws-api {label}] received close frame");
                            break false;
                        }
                        Some(Err(e)) => {
                            error!("[ws-api {label}] read error: {e}");
                            break false;
                        }
                        None => {
                            warn!("[ws-api {label}] stream ended");
                            break false;
                        }
                        _ => {}
                    }
                }

                Some(msg) = out_rx.recv() => {
                    if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                        error!("[ws-api {label}] send error: {e}");
                        break false;
                    }
                }

                _ = &mut ping_tick => {
                    if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                        error!("[ws-api {label}] ping send error: {e}");
                        break false;
                    }
                }
            }
        };

        shared.set_outbound(None);
        shared.connected.send_replace(false);
        let failed = shared.fail_all(RequestError::Disconnected);
        if shutting_down {
            break;
        }

        warn!("[ws-api {label}] disconnected ({failed} pending failed), reconnecting in {backoff:?}");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown_rx.changed() => break,
        }
        backoff = policy.next_delay(backoff);
    }

    shared.set_outbound(None);
    shared.connected.send_replace(false);
    shared.fail_all(RequestError::Closed);
    info!("[ws-api {label}] session stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn config(port: u16) -> WsSessionConfig {
        WsSessionConfig {
            url: format!("ws://127.0.0.1:{port}"),
            label: "test".into(),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_delay: Duration::from_millis(200),
            },
            ping_interval: None,
        }
    }

    async fn read_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => return serde_json::from_str(&t).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn frame_id_accepts_numbers_and_strings() {
        assert_eq!(frame_id(&serde_json::json!({"id": 7})), Some(7));
        assert_eq!(frame_id(&serde_json::json!({"id": "8"})), Some(8));
        assert_eq!(frame_id(&serde_json::json!({"id": null})), None);
        assert_eq!(frame_id(&serde_json::json!({"result": 1})), None);
    }

    #[test]
    fn rejects_bad_url() {
        let mut c = config(1);
        c.url = "not a url".into();
        assert!(WsRequestSession::new(c).is_err());
    }

    #[tokio::test]
    async fn request_fails_fast_when_not_connected() {
        let session = WsRequestSession::new(config(1)).unwrap();
        let r = session.request(1, "{}".into(), Duration::from_secs(5)).await;
        assert_eq!(r, Err(RequestError::Disconnected));
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_not_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let req = read_text(&mut ws).await;
            assert_eq!(req["id"], 42);
            ws.send(Message::Text(r#"{"id":43,"result":"other"}"#.into())).await.unwrap();
            ws.send(Message::Text(r#"{"id":42,"result":"mine"}"#.into())).await.unwrap();
            let _ = ws.next().await;
        });

        let session = WsRequestSession::new(config(port)).unwrap();
        session.start(None);
        assert!(session.wait_connected(Duration::from_secs(2)).await);

        let resp = session
            .request(42, r#"{"id":42,"method":"depth"}"#.into(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp["result"], "mine");
        assert_eq!(session.pending_count(), 0);
        session.stop().await;
    }

    #[tokio::test]
    async fn timeout_drops_entry_but_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Swallow the first request, answer the second.
            let _ = read_text(&mut ws).await;
            let req = read_text(&mut ws).await;
            let reply = serde_json::json!({"id": req["id"], "result": "ok"}).to_string();
            ws.send(Message::Text(reply.into())).await.unwrap();
            let _ = ws.next().await;
        });

        let session = WsRequestSession::new(config(port)).unwrap();
        session.start(None);
        assert!(session.wait_connected(Duration::from_secs(2)).await);

        let id = session.next_id();
        let r = session.request(id, format!(r#"{{"id":{id}}}"#), Duration::from_millis(100)).await;
        assert!(matches!(r, Err(RequestError::Timeout(_))));
        assert_eq!(session.pending_count(), 0);
        assert!(session.is_connected());

        let id = session.next_id();
        let r = session.request(id, format!(r#"{{"id":{id}}}"#), Duration::from_secs(2)).await;
        assert_eq!(r.unwrap()["result"], "ok");
        session.stop().await;
    }

    #[tokio::test]
    async fn cancelled_requests_leave_no_pending_entries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Never answer.
            while ws.next().await.is_some() {}
        });

        let session = WsRequestSession::new(config(port)).unwrap();
        session.start(None);
        assert!(session.wait_connected(Duration::from_secs(2)).await);

        for _ in 0..5 {
            let id = session.next_id();
            let fut = session.request(id, format!(r#"{{"id":{id}}}"#), Duration::from_secs(5));
            assert!(tokio::time::timeout(Duration::from_millis(50), fut).await.is_err());
        }
        assert_eq!(session.pending_count(), 0);
        assert!(session.is_connected());
        session.stop().await;
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection: read one request then drop the socket.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = read_text(&mut ws).await;
            drop(ws);
            // Second connection stays open.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
        });

        let reconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reconnects);
        let session = WsRequestSession::new(config(port)).unwrap();
        session.start(Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(session.wait_connected(Duration::from_secs(2)).await);

        let r = session.request(1, r#"{"id":1}"#.into(), Duration::from_secs(5)).await;
        assert_eq!(r, Err(RequestError::Disconnected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.wait_connected(Duration::from_secs(2)).await);
        assert_eq!(session.reconnections(), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
        session.stop().await;
    }
}
