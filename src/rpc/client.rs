/// rippled WebSocket Client
///
/// One WebSocket session to a rippled node, shared by:
/// - request/response commands (`server_info`, `subscribe`, `ledger`), matched by id
/// - the `ledger` stream: every `ledgerClosed` notification is expanded into a
///   full ledger and pushed onto the ledger feed, in close order
///
/// A background session task owns the socket. When the transport fails it
/// reports the error on the error feed, fails in-flight requests, reconnects
/// with linear backoff and restores the subscription.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::types::{validated_ledger_seq, Inbound, LedgerClosed, LedgerResponse};
use crate::audit::AuditSink;
use crate::error::SourceError;
use crate::models::{ConnectionEvent, ConnectionEventKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, SourceError>>>;

/// Feed capacity for the live client
pub const DEFAULT_BUFFER: usize = 100;

/// Feed capacity for the backfill client
pub const BACKFILL_BUFFER: usize = 10_000;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const LIVE_FETCH_ATTEMPTS: u32 = 3;
const LIVE_FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// State shared between the client handle and its background tasks
struct Shared {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    subscribed: AtomicBool,
}

impl Shared {
    async fn request(&self, mut command: Value, timeout: Duration) -> Result<Value, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        command["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(Message::Text(command.to_string().into())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(SourceError::connection("session task is not running"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SourceError::connection("session closed before response")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SourceError::rpc(format!("request {} timed out after {:?}", id, timeout)))
            }
        }
    }

    async fn fetch_ledger(&self, ledger_index: u64, timeout: Duration) -> Result<LedgerResponse, SourceError> {
        let result = self.request(ledger_command(ledger_index), timeout).await?;
        LedgerResponse::from_result(&result)
    }

    async fn fail_pending(&self, reason: &str) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(SourceError::Connection(reason.to_string())));
        }
    }
}

fn ledger_command(ledger_index: u64) -> Value {
    json!({
        "command": "ledger",
        "ledger_index": ledger_index,
        "transactions": true,
        "expand": true,
    })
}

fn subscribe_command() -> Value {
    json!({ "command": "subscribe", "streams": ["ledger"] })
}

/// Client for the rippled WebSocket API
pub struct LedgerClient {
    url: String,
    buffer: usize,
    request_timeout: Duration,
    reconnect_delay: Duration,
    service: &'static str,
    audit: AuditSink,
    shared: Option<Arc<Shared>>,
    ledger_rx: Option<mpsc::Receiver<LedgerResponse>>,
    error_rx: Option<mpsc::Receiver<SourceError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LedgerClient {
    /// Create a client for the live path
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_buffer(url, DEFAULT_BUFFER)
    }

    /// Create a client with larger feed queues, for bulk backfill fetching
    pub fn with_buffer(url: impl Into<String>, buffer: usize) -> Self {
        Self {
            url: url.into(),
            buffer: buffer.max(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            service: "rippled-ws",
            audit: AuditSink::disabled(),
            shared: None,
            ledger_rx: None,
            error_rx: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Base delay of the linear reconnect backoff
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Record connection events under `service` on the given sink
    pub fn with_audit(mut self, audit: AuditSink, service: &'static str) -> Self {
        self.audit = audit;
        self.service = service;
        self
    }

    /// Open the WebSocket session and start the background tasks.
    ///
    /// Does not retry; startup callers treat failure as fatal.
    pub async fn connect(&mut self) -> Result<(), SourceError> {
        self.audit.record(ConnectionEvent::new(self.service, ConnectionEventKind::Attempt, 1));
        let started = Instant::now();

        let ws = match open_socket(&self.url, self.request_timeout).await {
            Ok(ws) => ws,
            Err(e) => {
                self.audit.record(
                    ConnectionEvent::new(self.service, ConnectionEventKind::Failure, 1)
                        .with_error(&e)
                        .with_duration(started.elapsed())
                        .with_metadata(json!({ "url": self.url })),
                );
                return Err(e);
            }
        };

        self.audit.record(
            ConnectionEvent::new(self.service, ConnectionEventKind::Success, 1)
                .with_duration(started.elapsed())
                .with_metadata(json!({ "url": self.url })),
        );

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (ledger_tx, ledger_rx) = mpsc::channel(self.buffer);
        let (error_tx, error_rx) = mpsc::channel(self.buffer);

        let shared = Arc::new(Shared {
            outgoing: outgoing_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subscribed: AtomicBool::new(false),
        });

        let session = Session {
            url: self.url.clone(),
            service: self.service,
            handshake_timeout: self.request_timeout,
            reconnect_delay: self.reconnect_delay,
            audit: self.audit.clone(),
            shared: shared.clone(),
            closed_tx,
            error_tx: error_tx.clone(),
        };

        self.tasks.push(tokio::spawn(session.run(ws, outgoing_rx)));
        self.tasks.push(tokio::spawn(run_ledger_fetcher(
            shared.clone(),
            closed_rx,
            ledger_tx,
            error_tx,
            self.request_timeout,
        )));

        self.shared = Some(shared);
        self.ledger_rx = Some(ledger_rx);
        self.error_rx = Some(error_rx);

        tracing::debug!("Connected to {}", self.url);
        Ok(())
    }

    fn shared(&self) -> Result<&Arc<Shared>, SourceError> {
        self.shared.as_ref().ok_or_else(|| SourceError::connection("client is not connected"))
    }

    /// Current validated ledger index of the node
    pub async fn get_server_info(&self) -> Result<u64, SourceError> {
        let result = self.shared()?.request(json!({ "command": "server_info" }), self.request_timeout).await?;
        validated_ledger_seq(&result)
    }

    /// Subscribe to the ledger stream. Restored automatically after reconnects.
    pub async fn subscribe(&self) -> Result<(), SourceError> {
        let shared = self.shared()?;
        shared.request(subscribe_command(), self.request_timeout).await?;
        shared.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fetch one historical ledger with its expanded transactions
    pub async fn fetch_ledger(&self, ledger_index: u64) -> Result<LedgerResponse, SourceError> {
        let shared = self.shared()?;
        shared
            .fetch_ledger(ledger_index, self.request_timeout)
            .await
            .map_err(|e| SourceError::Fetch { ledger_index, reason: e.to_string() })
    }

    /// Live feed of closed ledgers. Available once per connection.
    pub fn take_ledger_receiver(&mut self) -> Option<mpsc::Receiver<LedgerResponse>> {
        self.ledger_rx.take()
    }

    /// Out-of-band transport errors. Available once per connection.
    pub fn take_error_receiver(&mut self) -> Option<mpsc::Receiver<SourceError>> {
        self.error_rx.take()
    }

    /// Stop the background tasks
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared = None;
    }
}

impl Drop for LedgerClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait::async_trait]
impl super::LedgerFetcher for LedgerClient {
    async fn fetch_ledger(&self, ledger_index: u64) -> Result<LedgerResponse, SourceError> {
        LedgerClient::fetch_ledger(self, ledger_index).await
    }
}

async fn open_socket(url: &str, timeout: Duration) -> Result<WsStream, SourceError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(SourceError::Connection(format!("{}: {}", url, e))),
        Err(_) => Err(SourceError::Connection(format!("{}: handshake timed out after {:?}", url, timeout))),
    }
}

enum SessionEnd {
    ClientGone,
    Transport(String),
}

/// Socket owner: writes queued commands, dispatches inbound frames, reconnects
struct Session {
    url: String,
    service: &'static str,
    handshake_timeout: Duration,
    reconnect_delay: Duration,
    audit: AuditSink,
    shared: Arc<Shared>,
    closed_tx: mpsc::UnboundedSender<LedgerClosed>,
    error_tx: mpsc::Sender<SourceError>,
}

impl Session {
    async fn run(self, mut ws: WsStream, mut outgoing_rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            match self.drive(&mut ws, &mut outgoing_rx).await {
                SessionEnd::ClientGone => {
                    let _ = ws.close(None).await;
                    return;
                }
                SessionEnd::Transport(reason) => {
                    tracing::warn!("WebSocket session to {} lost: {}", self.url, reason);
                    self.shared.fail_pending(&reason).await;
                    self.report(SourceError::Connection(reason));
                    ws = self.reconnect().await;
                }
            }
        }
    }

    async fn drive(&self, ws: &mut WsStream, outgoing_rx: &mut mpsc::UnboundedReceiver<Message>) -> SessionEnd {
        loop {
            tokio::select! {
                outgoing = outgoing_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = ws.send(message).await {
                            return SessionEnd::Transport(format!("send failed: {}", e));
                        }
                    }
                    None => return SessionEnd::ClientGone,
                },
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Transport(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(message)) if message.is_text() => {
                        if let Ok(text) = message.to_text() {
                            self.dispatch(text).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Transport("stream ended".to_string()),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match Inbound::decode(text) {
            Ok(Inbound::Response { id, outcome }) => match self.shared.pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome.map_err(SourceError::Rpc));
                }
                None => tracing::trace!("Ignoring response to unknown request {}", id),
            },
            Ok(Inbound::LedgerClosed(closed)) => {
                tracing::debug!(
                    "Ledger {} closed ({}, {} txns, close time {})",
                    closed.ledger_index,
                    closed.ledger_hash,
                    closed.txn_count,
                    closed.ledger_time
                );
                let _ = self.closed_tx.send(closed);
            }
            Ok(Inbound::Other(kind)) => tracing::trace!("Ignoring {} message", kind),
            Err(e) => {
                tracing::warn!("Undecodable message from rippled: {}", e);
                self.report(e);
            }
        }
    }

    fn report(&self, error: SourceError) {
        if let Err(e) = self.error_tx.try_send(error) {
            tracing::debug!("Error feed unavailable, dropping: {}", e);
        }
    }

    /// Reconnect until it works, restoring the ledger subscription
    async fn reconnect(&self) -> WsStream {
        let mut attempt: u32 = 1;

        loop {
            let delay = (self.reconnect_delay * attempt).min(MAX_RECONNECT_DELAY);
            self.audit.record(
                ConnectionEvent::new(self.service, ConnectionEventKind::Retry, attempt)
                    .with_metadata(json!({ "url": self.url, "retry_delay_ms": delay.as_millis() as u64 })),
            );
            tokio::time::sleep(delay).await;

            let started = Instant::now();
            match open_socket(&self.url, self.handshake_timeout).await {
                Ok(mut ws) => {
                    self.audit.record(
                        ConnectionEvent::new(self.service, ConnectionEventKind::Success, attempt)
                            .with_duration(started.elapsed()),
                    );

                    if self.shared.subscribed.load(Ordering::SeqCst) {
                        if let Err(e) = self.resubscribe(&mut ws).await {
                            tracing::warn!("Failed to restore ledger subscription: {}", e);
                            attempt += 1;
                            continue;
                        }
                    }

                    tracing::info!("✓ Reconnected to {} after {} attempt(s)", self.url, attempt);
                    return ws;
                }
                Err(e) => {
                    self.audit.record(
                        ConnectionEvent::new(self.service, ConnectionEventKind::Failure, attempt)
                            .with_error(&e)
                            .with_duration(started.elapsed()),
                    );
                    tracing::warn!("Reconnect attempt {} to {} failed: {}", attempt, self.url, e);
                    attempt += 1;
                }
            }
        }
    }

    /// Send the subscribe command on a fresh socket. The reply arrives once the
    /// session drives the socket again, so a watcher task checks it.
    async fn resubscribe(&self, ws: &mut WsStream) -> Result<(), SourceError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut command = subscribe_command();
        command["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if let Err(e) = ws.send(Message::Text(command.to_string().into())).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(SourceError::Connection(format!("send failed: {}", e)));
        }

        let error_tx = self.error_tx.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => tracing::debug!("Ledger subscription restored on {}", url),
                Ok(Err(SourceError::Rpc(reason))) => {
                    tracing::warn!("rippled rejected the ledger subscription on {}: {}", url, reason);
                    let _ = error_tx.try_send(SourceError::rpc(format!("subscription not restored: {}", reason)));
                }
                // The socket failed again; the next reconnect resubscribes
                Ok(Err(_)) | Err(_) => {}
            }
        });

        Ok(())
    }
}

/// Expand each closed-ledger notification into a full ledger, in order
async fn run_ledger_fetcher(
    shared: Arc<Shared>,
    mut closed_rx: mpsc::UnboundedReceiver<LedgerClosed>,
    ledger_tx: mpsc::Sender<LedgerResponse>,
    error_tx: mpsc::Sender<SourceError>,
    timeout: Duration,
) {
    while let Some(closed) = closed_rx.recv().await {
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            match shared.fetch_ledger(closed.ledger_index, timeout).await {
                Ok(ledger) => break Ok(ledger),
                Err(e) if attempt < LIVE_FETCH_ATTEMPTS => {
                    tracing::debug!("Retrying ledger {} ({}/{}): {}", closed.ledger_index, attempt, LIVE_FETCH_ATTEMPTS, e);
                    tokio::time::sleep(LIVE_FETCH_RETRY_DELAY * attempt).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(ledger) => {
                tracing::debug!("Fetched ledger {} ({} txns)", ledger.ledger_index, ledger.txn_count);
                if ledger_tx.send(ledger).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let error = SourceError::Fetch { ledger_index: closed.ledger_index, reason: e.to_string() };
                let _ = error_tx.try_send(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn ledger_result(index: u64) -> Value {
        json!({
            "ledger": {
                "ledger_index": index.to_string(),
                "ledger_hash": format!("HASH{}", index),
                "close_time": 750000000 + index,
                "transactions": [{
                    "TransactionType": "OfferCreate",
                    "Account": "rAlice",
                    "Sequence": 1,
                    "TakerGets": "1000000",
                    "TakerPays": "2000000",
                    "hash": format!("TX{}", index),
                    "metaData": {"TransactionResult": "tesSUCCESS"}
                }]
            },
            "validated": true
        })
    }

    /// Minimal rippled: answers server_info, subscribe and ledger, and announces
    /// ledger 106 after the subscription. Ledger 13 does not exist.
    async fn spawn_fake_rippled() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if !message.is_text() {
                    continue;
                }
                let request: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
                let id = request["id"].clone();

                let mut replies = Vec::new();
                match request["command"].as_str().unwrap() {
                    "server_info" => replies.push(json!({
                        "id": id, "status": "success", "type": "response",
                        "result": {"info": {"validated_ledger": {"seq": 105}}}
                    })),
                    "subscribe" => {
                        replies.push(json!({"id": id, "status": "success", "type": "response", "result": {}}));
                        replies.push(json!({
                            "type": "ledgerClosed", "ledger_index": 106, "ledger_hash": "HASH106",
                            "ledger_time": 750000106, "txn_count": 1
                        }));
                    }
                    "ledger" if request["ledger_index"] == 13 => replies.push(json!({
                        "id": id, "status": "error", "type": "response",
                        "error": "lgrNotFound", "error_message": "ledgerNotFound"
                    })),
                    "ledger" => {
                        let index = request["ledger_index"].as_u64().unwrap();
                        replies.push(json!({
                            "id": id, "status": "success", "type": "response", "result": ledger_result(index)
                        }));
                    }
                    _ => {}
                }

                for reply in replies {
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_server_info_subscribe_and_live_ledger() {
        let url = spawn_fake_rippled().await;
        let mut client = LedgerClient::new(url).with_request_timeout(Duration::from_secs(5));
        client.connect().await.unwrap();

        assert_eq!(client.get_server_info().await.unwrap(), 105);

        let mut ledgers = client.take_ledger_receiver().unwrap();
        assert!(client.take_ledger_receiver().is_none());
        client.subscribe().await.unwrap();

        let ledger = tokio::time::timeout(Duration::from_secs(5), ledgers.recv()).await.unwrap().unwrap();
        assert_eq!(ledger.ledger_index, 106);
        assert_eq!(ledger.ledger_hash, "HASH106");
        assert_eq!(ledger.transactions.len(), 1);
        assert_eq!(ledger.transactions[0].hash, "TX106");
    }

    #[tokio::test]
    async fn test_fetch_ledger_and_missing_ledger() {
        let url = spawn_fake_rippled().await;
        let mut client = LedgerClient::with_buffer(url, BACKFILL_BUFFER).with_request_timeout(Duration::from_secs(5));
        client.connect().await.unwrap();

        let ledger = client.fetch_ledger(90).await.unwrap();
        assert_eq!(ledger.ledger_index, 90);
        assert_eq!(ledger.ledger_time, 750000090);

        match client.fetch_ledger(13).await {
            Err(SourceError::Fetch { ledger_index, reason }) => {
                assert_eq!(ledger_index, 13);
                assert!(reason.contains("lgrNotFound"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (audit, mut events) = AuditSink::channel();
        let mut client = LedgerClient::new(format!("ws://{}", addr)).with_audit(audit, "rippled-ws");

        assert!(matches!(client.connect().await, Err(SourceError::Connection(_))));
        assert_eq!(events.recv().await.unwrap().event, ConnectionEventKind::Attempt);
        assert_eq!(events.recv().await.unwrap().event, ConnectionEventKind::Failure);
    }

    fn text(value: Value) -> Message {
        Message::Text(value.to_string().into())
    }

    fn reply(request: &Value, result: Value) -> Message {
        text(json!({"id": request["id"], "status": "success", "type": "response", "result": result}))
    }

    fn parse_request(message: &Message) -> Option<Value> {
        if !message.is_text() {
            return None;
        }
        serde_json::from_str(message.to_text().ok()?).ok()
    }

    /// rippled that drops the first session when a ledger is requested, refuses
    /// the next handshake, then serves normally and announces ledger 201. With
    /// `reject_resubscribe` the last session refuses the subscription instead.
    /// Every command is reported as (session number, command).
    async fn spawn_flaky_rippled(reject_resubscribe: bool) -> (String, mpsc::UnboundedReceiver<(u32, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let Some(request) = parse_request(&message) else { continue };
                let command = request["command"].as_str().unwrap_or_default().to_string();
                let _ = seen_tx.send((1, command.clone()));
                if command != "subscribe" {
                    break;
                }
                ws.send(reply(&request, json!({}))).await.unwrap();
            }
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let Some(request) = parse_request(&message) else { continue };
                let command = request["command"].as_str().unwrap_or_default().to_string();
                let _ = seen_tx.send((3, command.clone()));

                match command.as_str() {
                    "subscribe" if reject_resubscribe => {
                        let refusal = json!({
                            "id": request["id"], "status": "error", "type": "response",
                            "error": "noPermission", "error_message": "You don't have permission for this command."
                        });
                        ws.send(text(refusal)).await.unwrap();
                    }
                    "subscribe" => {
                        ws.send(reply(&request, json!({}))).await.unwrap();
                        let closed = json!({
                            "type": "ledgerClosed", "ledger_index": 201, "ledger_hash": "HASH201",
                            "ledger_time": 750000201, "txn_count": 1
                        });
                        ws.send(text(closed)).await.unwrap();
                    }
                    "ledger" => {
                        let index = request["ledger_index"].as_u64().unwrap();
                        ws.send(reply(&request, ledger_result(index))).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        (format!("ws://{}", addr), seen_rx)
    }

    async fn flaky_client(url: String, audit: AuditSink) -> LedgerClient {
        let mut client = LedgerClient::new(url)
            .with_request_timeout(Duration::from_secs(5))
            .with_reconnect_delay(Duration::from_millis(50))
            .with_audit(audit, "rippled-ws");
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_and_resumes_feed() {
        let (url, mut commands) = spawn_flaky_rippled(false).await;
        let (audit, mut events) = AuditSink::channel();
        let mut client = flaky_client(url, audit).await;

        let mut ledgers = client.take_ledger_receiver().unwrap();
        let mut errors = client.take_error_receiver().unwrap();
        client.subscribe().await.unwrap();

        // In-flight requests fail with the socket
        match client.fetch_ledger(50).await {
            Err(SourceError::Fetch { ledger_index, reason }) => {
                assert_eq!(ledger_index, 50);
                assert!(reason.starts_with("connection error"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv()).await.unwrap().unwrap();
        assert!(matches!(error, SourceError::Connection(_)));

        let ledger = tokio::time::timeout(Duration::from_secs(5), ledgers.recv()).await.unwrap().unwrap();
        assert_eq!(ledger.ledger_index, 201);
        assert_eq!(ledger.transactions[0].hash, "TX201");

        let mut seen = Vec::new();
        while let Ok(command) = commands.try_recv() {
            seen.push(command);
        }
        assert!(seen.contains(&(3, "subscribe".to_string())));

        let mut audit_trail = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.service, "rippled-ws");
            audit_trail.push((event.event, event.attempt, event.metadata["retry_delay_ms"].as_u64()));
        }
        assert_eq!(
            audit_trail,
            vec![
                (ConnectionEventKind::Attempt, 1, None),
                (ConnectionEventKind::Success, 1, None),
                (ConnectionEventKind::Retry, 1, Some(50)),
                (ConnectionEventKind::Failure, 1, None),
                (ConnectionEventKind::Retry, 2, Some(100)),
                (ConnectionEventKind::Success, 2, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_resubscribe_is_reported() {
        let (url, _commands) = spawn_flaky_rippled(true).await;
        let mut client = flaky_client(url, AuditSink::disabled()).await;

        let mut errors = client.take_error_receiver().unwrap();
        client.subscribe().await.unwrap();
        assert!(client.fetch_ledger(50).await.is_err());

        let rejection = loop {
            match tokio::time::timeout(Duration::from_secs(5), errors.recv()).await.unwrap().unwrap() {
                SourceError::Rpc(reason) => break reason,
                SourceError::Connection(_) => continue,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert!(rejection.contains("subscription not restored"));
        assert!(rejection.contains("noPermission"));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut client = LedgerClient::new(format!("ws://{}", addr)).with_request_timeout(Duration::from_millis(200));
        client.connect().await.unwrap();

        match client.get_server_info().await {
            Err(SourceError::Rpc(reason)) => assert!(reason.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        let client = LedgerClient::new("ws://127.0.0.1:1");
        assert!(matches!(client.get_server_info().await, Err(SourceError::Connection(_))));
    }
}
