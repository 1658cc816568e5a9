//! DAP client - owns one socket to a debug adapter
//!
//! The client handles:
//! - Content-Length framing in both directions
//! - Sequence number generation
//! - Request/response correlation by `request_seq`
//! - Event broadcasting to subscribers
//! - Reverse requests (adapter to client), answered through the adapter policy

use crate::constants::reverse_requests;
use crate::error::{Error, Result};
use crate::framing::{encode_message, FrameDecoder};
use crate::policy::{default_reverse_request, AdapterPolicy, ChildSessionRequest};
use crate::protocol::{Event, ProtocolMessage, Request, Response};
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
use dapx_config::DEFAULT_TCP_KEEPALIVE_RETRIES;
use dapx_config::{
    ConnectionConfig, DEFAULT_TCP_KEEPALIVE_INTERVAL_SECS, DEFAULT_TCP_KEEPALIVE_TIME_SECS,
    LOCALHOST_IPV4,
};
use socket2::{SockRef, TcpKeepalive};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Channel for sending responses back to request callers
type ResponseSender = oneshot::Sender<Result<Response>>;

type PendingMap = Arc<RwLock<HashMap<i64, ResponseSender>>>;
type Subscribers = Arc<RwLock<Vec<mpsc::Sender<ClientEvent>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

const READ_BUFFER_SIZE: usize = 8192;

/// What subscribers of a [`DapClient`] receive
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A DAP event from the adapter
    Event(Event),
    /// The adapter asked for a secondary session and the policy accepted it
    ChildSessionRequested(ChildSessionRequest),
    /// Socket read failed; a `Closed` follows
    Error(String),
    /// The adapter closed the connection
    Closed(String),
}

/// Timeouts and channel sizes for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ClientConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            event_channel_capacity: config.event_channel_capacity.max(1),
        }
    }
}

/// Shared state the reader task needs
struct ReaderContext {
    next_seq: Arc<Mutex<i64>>,
    pending: PendingMap,
    subscribers: Subscribers,
    writer: SharedWriter,
    closed: Arc<AtomicBool>,
    policy: Option<Arc<dyn AdapterPolicy>>,
    adopted_targets: Arc<std::sync::Mutex<HashSet<String>>>,
    peer: String,
}

/// DAP client for one adapter connection
pub struct DapClient {
    next_seq: Arc<Mutex<i64>>,
    pending: PendingMap,
    subscribers: Subscribers,
    writer: SharedWriter,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    config: ClientConfig,
    peer: String,
}

impl std::fmt::Debug for DapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapClient")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("config", &self.config)
            .finish()
    }
}

/// A request on the wire whose response has not arrived yet
#[derive(Debug)]
pub struct PendingResponse {
    seq: i64,
    command: String,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Response>>,
    pending: PendingMap,
}

impl PendingResponse {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the response, failing on timeout or a `success: false` reply.
    pub async fn wait(self) -> Result<Response> {
        let Self {
            seq,
            command,
            timeout,
            rx,
            pending,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                if response.success {
                    Ok(response)
                } else {
                    let message = response
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("DAP request failed (seq: {})", seq));
                    debug!(command = %command, error = %message, "DAP request failed");
                    Err(Error::RequestFailed { command, message })
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::Communication("Response channel closed".to_string())),
            Err(_) => {
                pending.write().await.remove(&seq);
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(command = %command, timeout_ms, "DAP request timed out");
                Err(Error::Timeout(timeout_ms))
            }
        }
    }
}

impl DapClient {
    /// Open a TCP connection to an adapter.
    pub async fn connect(
        host: &str,
        port: u16,
        config: ClientConfig,
        policy: Option<Arc<dyn AdapterPolicy>>,
    ) -> Result<Self> {
        let ip = normalize_host(host);
        let stream = TcpStream::connect((ip, port)).await?;
        configure_tcp_keepalive(&stream);
        info!("Connected to {}:{}", ip, port);

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::new_with_config(
            reader,
            writer,
            config,
            policy,
            format!("{}:{}", ip, port),
        ))
    }

    /// Wrap an already-connected byte stream pair.
    pub fn new_with_config<R, W>(
        reader: R,
        writer: W,
        config: ClientConfig,
        policy: Option<Arc<dyn AdapterPolicy>>,
        peer: impl Into<String>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let next_seq = Arc::new(Mutex::new(1));
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let writer: SharedWriter = Arc::new(Mutex::new(
            Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
        ));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            reader,
            ReaderContext {
                next_seq: next_seq.clone(),
                pending: pending.clone(),
                subscribers: subscribers.clone(),
                writer: writer.clone(),
                closed: closed.clone(),
                policy,
                adopted_targets: Arc::new(std::sync::Mutex::new(HashSet::new())),
                peer: peer.clone(),
            },
        ));

        Self {
            next_seq,
            pending,
            subscribers,
            writer,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            closed,
            config,
            peer,
        }
    }

    /// Wrap a stream pair with default timeouts and no policy.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new_with_config(reader, writer, ClientConfig::default(), None, "stream")
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get next sequence number
    pub async fn next_sequence(&self) -> i64 {
        next_sequence(&self.next_seq).await
    }

    /// Send a request and wait for its response with the default timeout.
    pub async fn send_request(
        &self,
        command: impl Into<String>,
        arguments: Option<serde_json::Value>,
    ) -> Result<Response> {
        self.send_request_with_timeout(command, arguments, self.config.request_timeout)
            .await
    }

    /// Send a request and wait for its response.
    ///
    /// A response with `success: false` becomes [`Error::RequestFailed`]
    /// carrying the adapter's message.
    pub async fn send_request_with_timeout(
        &self,
        command: impl Into<String>,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Response> {
        self.start_request(command, arguments, timeout)
            .await?
            .wait()
            .await
    }

    /// Write a request and return without waiting for the response.
    ///
    /// Requests reach the socket in the order `start_request` calls
    /// complete, so callers that await this in sequence keep their order
    /// while the responses are awaited concurrently.
    #[tracing::instrument(skip(self, command, arguments), fields(seq, peer = %self.peer))]
    pub async fn start_request(
        &self,
        command: impl Into<String>,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        let command: String = command.into();
        if self.is_closed() {
            return Err(Error::Communication(
                "Socket not connected or destroyed".to_string(),
            ));
        }

        // Held across seq allocation and the write so seq order is wire order
        let mut writer = self.writer.lock().await;
        let seq = self.next_sequence().await;
        tracing::Span::current().record("seq", seq);
        debug!(command = %command, "Sending DAP request");

        let mut request = Request::new(seq, command.clone());
        request.arguments = arguments;

        // Registered before sending so a fast response cannot be missed
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(seq, tx);

        if let Err(e) = write_locked(&mut writer, &ProtocolMessage::Request(request)).await {
            self.pending.write().await.remove(&seq);
            return Err(e);
        }

        Ok(PendingResponse {
            seq,
            command,
            timeout,
            rx,
            pending: self.pending.clone(),
        })
    }

    /// Subscribe to client events (bounded channel).
    ///
    /// Closed subscribers are pruned before the new one is added.
    pub async fn subscribe(&self) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|existing| !existing.is_closed());
        subscribers.push(tx);
        debug!(
            "New event subscriber registered (capacity: {}, total subscribers: {})",
            self.config.event_channel_capacity,
            subscribers.len()
        );
        rx
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn pending_request_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Close the connection and reject every pending request with `reason`.
    ///
    /// Idempotent. Subscribers see their channels close without a
    /// [`ClientEvent::Closed`], which is reserved for adapter-side closes.
    pub async fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress or completed");
            return;
        }
        info!(peer = %self.peer, "DAP client shutdown initiated. Reason: {}", reason);

        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = reader_task {
            handle.abort();
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Socket shutdown failed: {}", e);
            }
        }

        reject_pending(&self.pending, reason).await;
        self.subscribers.write().await.clear();
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        let reader_task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = reader_task {
            handle.abort();
        }
    }
}

/// Wait until an event named `name` arrives, up to `timeout`.
///
/// Other events received meanwhile are dropped. Returns `None` on timeout
/// or when the client closed.
pub async fn wait_for_event(
    events: &mut mpsc::Receiver<ClientEvent>,
    name: &str,
    timeout: Duration,
) -> Option<Event> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Event(event) if event.event == name => return Some(event),
                ClientEvent::Closed(_) => return None,
                _ => {}
            }
        }
        None
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

async fn next_sequence(next_seq: &Mutex<i64>) -> i64 {
    let mut seq = next_seq.lock().await;
    let current = *seq;
    *seq += 1;
    current
}

async fn write_message(writer: &SharedWriter, message: &ProtocolMessage) -> Result<()> {
    let mut writer = writer.lock().await;
    write_locked(&mut writer, message).await
}

async fn write_locked(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    message: &ProtocolMessage,
) -> Result<()> {
    let frame = encode_message(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!("Sent {} '{}' (seq {})", kind(message), message.name(), message.seq());
    Ok(())
}

fn kind(message: &ProtocolMessage) -> &'static str {
    match message {
        ProtocolMessage::Request(_) => "request",
        ProtocolMessage::Response(_) => "response",
        ProtocolMessage::Event(_) => "event",
    }
}

async fn reject_pending(pending: &PendingMap, reason: &str) {
    let mut pending = pending.write().await;
    if !pending.is_empty() {
        info!("Rejecting {} pending request(s): {}", pending.len(), reason);
    }
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::Disconnected(reason.to_string())));
    }
}

/// Broadcast to every subscriber without blocking on slow ones
async fn broadcast(subscribers: &Subscribers, event: ClientEvent) {
    let mut subscribers = subscribers.write().await;
    let mut dropped = 0;
    subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped += 1;
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
    if dropped > 0 {
        warn!("Dropped {:?} for {} slow subscriber(s)", event, dropped);
    }
}

async fn read_loop<R>(mut reader: R, ctx: ReaderContext)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    debug!(peer = %ctx.peer, "Reader task started");
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let close_reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!(peer = %ctx.peer, "Adapter connection closed (EOF received)");
                break "Adapter disconnected".to_string();
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(message) = decoder.next_message() {
                    match message {
                        Ok(message) => handle_message(message, &ctx).await,
                        Err(e) => warn!("Error parsing DAP message JSON: {}", e),
                    }
                }
            }
            Err(e) => {
                info!(peer = %ctx.peer, "Adapter connection error: {}", e);
                if !ctx.closed.load(Ordering::SeqCst) {
                    broadcast(&ctx.subscribers, ClientEvent::Error(e.to_string())).await;
                }
                break format!("Adapter connection error: {}", e);
            }
        }
    };

    // An explicit shutdown already handled pending requests and subscribers
    if ctx.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    reject_pending(&ctx.pending, &close_reason).await;
    broadcast(&ctx.subscribers, ClientEvent::Closed(close_reason)).await;
    ctx.subscribers.write().await.clear();
}

async fn handle_message(message: ProtocolMessage, ctx: &ReaderContext) {
    match message {
        ProtocolMessage::Response(response) => {
            let sender = ctx.pending.write().await.remove(&response.request_seq);
            match sender {
                Some(tx) => {
                    if tx.send(Ok(response)).is_err() {
                        debug!("Response receiver dropped");
                    }
                }
                None => warn!(
                    "Received response for unknown request_seq: {}",
                    response.request_seq
                ),
            }
        }
        ProtocolMessage::Event(event) => {
            trace!("Broadcasting event '{}'", event.event);
            broadcast(&ctx.subscribers, ClientEvent::Event(event)).await;
        }
        ProtocolMessage::Request(request) => handle_reverse_request(request, ctx).await,
    }
}

async fn handle_reverse_request(request: Request, ctx: &ReaderContext) {
    info!("Received reverse request '{}' (seq {})", request.command, request.seq);

    let result = {
        let adopted = ctx
            .adopted_targets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &ctx.policy {
            Some(policy) => policy.handle_reverse_request(&request, &adopted),
            None => default_reverse_request(&request),
        }
    };

    let seq = next_sequence(&ctx.next_seq).await;
    let response = if result.handled {
        Response::success(seq, request.seq, request.command.clone())
            .with_body(result.response_body.unwrap_or_else(|| serde_json::json!({})))
    } else {
        warn!("Unsupported reverse request '{}'", request.command);
        Response::error(
            seq,
            request.seq,
            request.command.clone(),
            format!("Unsupported reverse request: {}", request.command),
        )
    };

    if let Err(e) = write_message(&ctx.writer, &ProtocolMessage::Response(response)).await {
        warn!("Failed to answer reverse request '{}': {}", request.command, e);
        return;
    }

    if result.create_child_session {
        if let Some(child) = result.child_config {
            let newly_adopted = ctx
                .adopted_targets
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(child.pending_id.clone());
            if newly_adopted {
                info!(
                    "'{}' requested child session for pending target {}",
                    reverse_requests::START_DEBUGGING,
                    child.pending_id
                );
                broadcast(&ctx.subscribers, ClientEvent::ChildSessionRequested(child)).await;
            }
        }
    }
}

/// Map a host string to an IPv4 address.
///
/// `localhost` is pinned to 127.0.0.1 so it never resolves to `::1`.
pub fn normalize_host(host: &str) -> Ipv4Addr {
    if host == "localhost" {
        return LOCALHOST_IPV4;
    }
    match host.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid host '{}': {}. Falling back to 127.0.0.1", host, e);
            LOCALHOST_IPV4
        }
    }
}

/// Disable Nagle and enable TCP keep-alive on an adapter socket.
///
/// Windows closes idle connections aggressively; keep-alive probes hold
/// the connection open while the debuggee runs without DAP traffic.
pub fn configure_tcp_keepalive(stream: &TcpStream) {
    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(DEFAULT_TCP_KEEPALIVE_TIME_SECS))
        .with_interval(Duration::from_secs(DEFAULT_TCP_KEEPALIVE_INTERVAL_SECS));

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(DEFAULT_TCP_KEEPALIVE_RETRIES);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keep-alive: {}", e);
    } else {
        debug!("TCP keep-alive configured successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_body;
    use crate::policy::JsDebugPolicy;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn create_test_streams() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(8192)
    }

    fn client_over(stream: DuplexStream, policy: Option<Arc<dyn AdapterPolicy>>) -> DapClient {
        let (read, write) = tokio::io::split(stream);
        DapClient::new_with_config(read, write, ClientConfig::default(), policy, "test")
    }

    async fn read_one(server: &mut DuplexStream, decoder: &mut FrameDecoder) -> ProtocolMessage {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(message) = decoder.next_message() {
                return message.unwrap();
            }
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            decoder.push(&buf[..n]);
        }
    }

    async fn write_one(server: &mut DuplexStream, message: &ProtocolMessage) {
        server.write_all(&encode_message(message).unwrap()).await.unwrap();
        server.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let (client_stream, _server) = create_test_streams();
        let client = Arc::new(client_over(client_stream, None));

        let mut handles = vec![];
        for _ in 0..10 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.next_sequence().await }));
        }
        let mut seqs = vec![];
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_request_response_correlation_out_of_order() {
        let (client_stream, mut server) = create_test_streams();
        let client = Arc::new(client_over(client_stream, None));

        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut requests = Vec::new();
            for _ in 0..2 {
                if let ProtocolMessage::Request(req) = read_one(&mut server, &mut decoder).await {
                    requests.push(req);
                }
            }
            // Answer in reverse order
            for (i, req) in requests.iter().rev().enumerate() {
                let response = Response::success(100 + i as i64, req.seq, req.command.clone())
                    .with_body(json!({ "command": req.command }));
                write_one(&mut server, &ProtocolMessage::Response(response)).await;
            }
            std::future::pending::<()>().await;
        });

        let (a, b) = tokio::join!(
            client.send_request("threads", None),
            client.send_request("stackTrace", Some(json!({"threadId": 1}))),
        );
        assert_eq!(a.unwrap().body.unwrap()["command"], "threads");
        assert_eq!(b.unwrap().body.unwrap()["command"], "stackTrace");
    }

    #[tokio::test]
    async fn test_failed_response_carries_adapter_message() {
        let (client_stream, mut server) = create_test_streams();
        let client = client_over(client_stream, None);

        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            if let ProtocolMessage::Request(req) = read_one(&mut server, &mut decoder).await {
                let response = Response::error(9, req.seq, req.command, "Unable to find thread");
                write_one(&mut server, &ProtocolMessage::Response(response)).await;
            }
            std::future::pending::<()>().await;
        });

        let err = client.send_request("pause", None).await.unwrap_err();
        assert_eq!(
            err,
            Error::RequestFailed {
                command: "pause".to_string(),
                message: "Unable to find thread".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (client_stream, _server) = create_test_streams();
        let client = client_over(client_stream, None);

        let err = client
            .send_request_with_timeout("initialize", None, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout(500));
        assert_eq!(client.pending_request_count().await, 0);
    }

    #[tokio::test]
    async fn test_events_broadcast_to_all_subscribers() {
        let (client_stream, mut server) = create_test_streams();
        let client = client_over(client_stream, None);
        let mut sub1 = client.subscribe().await;
        let mut sub2 = client.subscribe().await;

        let event = Event::new(1, "output").with_body(json!({"output": "hello"}));
        write_one(&mut server, &ProtocolMessage::Event(event)).await;

        for sub in [&mut sub1, &mut sub2] {
            let received = wait_for_event(sub, "output", Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(received.body.unwrap()["output"], "hello");
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_is_idempotent() {
        let (client_stream, _server) = create_test_streams();
        let client = Arc::new(client_over(client_stream, None));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("continue", None).await })
        };
        while client.pending_request_count().await == 0 {
            tokio::task::yield_now().await;
        }

        client.shutdown("worker shutdown").await;
        client.shutdown("second call").await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, Error::Disconnected("worker shutdown".to_string()));
        assert!(client.is_closed());
        assert!(client.send_request("threads", None).await.is_err());
    }

    #[tokio::test]
    async fn test_adapter_close_emits_closed() {
        let (client_stream, server) = create_test_streams();
        let client = client_over(client_stream, None);
        let mut events = client.subscribe().await;

        drop(server);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ClientEvent::Closed(_))));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_response_is_discarded() {
        let (client_stream, mut server) = create_test_streams();
        let client = client_over(client_stream, None);
        let mut events = client.subscribe().await;

        let stray = Response::success(5, 999, "threads");
        write_one(&mut server, &ProtocolMessage::Response(stray)).await;
        let event = Event::new(6, "thread");
        write_one(&mut server, &ProtocolMessage::Event(event)).await;

        assert!(wait_for_event(&mut events, "thread", Duration::from_secs(1))
            .await
            .is_some());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_close_connection() {
        let (client_stream, mut server) = create_test_streams();
        let client = client_over(client_stream, None);
        let mut events = client.subscribe().await;

        server.write_all(&encode_body(b"{broken")).await.unwrap();
        write_one(&mut server, &ProtocolMessage::Event(Event::new(2, "stopped"))).await;

        assert!(wait_for_event(&mut events, "stopped", Duration::from_secs(1))
            .await
            .is_some());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_absurd_content_length_keeps_connection_usable() {
        let (client_stream, mut server) = create_test_streams();
        let client = client_over(client_stream, None);
        let mut events = client.subscribe().await;

        server
            .write_all(b"Content-Length: 18446744073709551615\r\n\r\n{}")
            .await
            .unwrap();
        write_one(&mut server, &ProtocolMessage::Event(Event::new(3, "stopped"))).await;

        assert!(wait_for_event(&mut events, "stopped", Duration::from_secs(1))
            .await
            .is_some());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_run_in_terminal_is_acknowledged() {
        let (client_stream, mut server) = create_test_streams();
        let _client = client_over(client_stream, None);

        let request = Request::new(40, reverse_requests::RUN_IN_TERMINAL)
            .with_arguments(json!({"args": ["python", "app.py"]}));
        write_one(&mut server, &ProtocolMessage::Request(request)).await;

        let mut decoder = FrameDecoder::new();
        match read_one(&mut server, &mut decoder).await {
            ProtocolMessage::Response(response) => {
                assert!(response.success);
                assert_eq!(response.request_seq, 40);
                assert_eq!(response.command, "runInTerminal");
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_debugging_requests_child_once() {
        let (client_stream, mut server) = create_test_streams();
        let policy: Arc<dyn AdapterPolicy> = Arc::new(JsDebugPolicy);
        let client = client_over(client_stream, Some(policy));
        let mut events = client.subscribe().await;

        let start = |seq| {
            Request::new(seq, reverse_requests::START_DEBUGGING).with_arguments(json!({
                "request": "attach",
                "configuration": {"type": "pwa-node", "__pendingTargetId": "child-1"}
            }))
        };
        write_one(&mut server, &ProtocolMessage::Request(start(10))).await;
        write_one(&mut server, &ProtocolMessage::Request(start(11))).await;

        let mut decoder = FrameDecoder::new();
        for expected in [10, 11] {
            match read_one(&mut server, &mut decoder).await {
                ProtocolMessage::Response(response) => {
                    assert!(response.success);
                    assert_eq!(response.request_seq, expected);
                }
                other => panic!("Expected response, got {:?}", other),
            }
        }

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        match first {
            Some(ClientEvent::ChildSessionRequested(child)) => {
                assert_eq!(child.pending_id, "child-1")
            }
            other => panic!("Expected child request, got {:?}", other),
        }

        // Second request for the same target is answered but not adopted again
        write_one(&mut server, &ProtocolMessage::Event(Event::new(12, "output"))).await;
        let next = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(matches!(next, Some(ClientEvent::Event(e)) if e.event == "output"));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("localhost"), LOCALHOST_IPV4);
        assert_eq!(normalize_host("10.0.0.2"), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(normalize_host("not a host"), LOCALHOST_IPV4);
    }
}
