//! Push transport client
//!
//! Owns the single push connection, its reconnect timer and the handler table.
//! Frames are dispatched to handlers in arrival order on the connection task.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::backoff::{Backoff, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use crate::frame::Frame;
use crate::transport::{Connector, FrameStream};
use crate::{PING, PONG};

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Where the transport gets its backend address and bearer token from.
///
/// Both are read on every connection attempt so a token refreshed between
/// attempts is picked up by the next reconnect.
pub trait CredentialSource: Send + Sync {
    fn backend_url(&self) -> Option<String>;
    fn auth_token(&self) -> Option<String>;
}

/// Fixed credentials
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub backend_url: Option<String>,
    pub auth_token: Option<String>,
}

impl StaticCredentials {
    pub fn new(backend_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            backend_url: Some(backend_url.into()),
            auth_token: Some(auth_token.into()),
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn backend_url(&self) -> Option<String> {
        self.backend_url.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token.clone()
    }
}

/// Tunables for the push connection
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Path appended to the backend address, e.g. `/ws`
    pub push_path: String,
    /// Query parameter carrying the bearer token
    pub token_param: String,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            push_path: "/ws".to_string(),
            token_param: "token".to_string(),
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

/// Lifecycle of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or a reconnect found no credentials
    Idle,
    Connecting,
    Open,
    /// A reconnect timer is pending
    Reconnecting,
    /// Closed on purpose; no reconnect until `connect` is called again
    Closed,
}

struct ActiveConnection {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
}

struct ConnState {
    phase: ConnectionState,
    /// Publishes every phase change to `watch_state` receivers
    phase_tx: watch::Sender<ConnectionState>,
    intentional_close: bool,
    backoff: Backoff,
    reconnect_timer: Option<JoinHandle<()>>,
    connection: Option<ActiveConnection>,
    /// Bumped on every attempt; stale connection tasks compare against it
    epoch: u64,
    /// Frames re-sent on every successful open, keyed for replacement
    announcements: Vec<(String, Frame)>,
}

impl ConnState {
    fn set_phase(&mut self, phase: ConnectionState) {
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    options: TransportOptions,
    handlers: RwLock<HashMap<String, Vec<(u64, Handler)>>>,
    next_handler_id: AtomicU64,
    state: Mutex<ConnState>,
}

/// Handle to the push connection. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct PushTransport {
    inner: Arc<Inner>,
}

impl PushTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        options: TransportOptions,
    ) -> Self {
        let backoff = Backoff::new(options.initial_delay, options.max_delay);
        Self {
            inner: Arc::new(Inner {
                connector,
                credentials,
                options,
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                state: Mutex::new(ConnState {
                    phase: ConnectionState::Idle,
                    phase_tx: watch::Sender::new(ConnectionState::Idle),
                    intentional_close: false,
                    backoff,
                    reconnect_timer: None,
                    connection: None,
                    epoch: 0,
                    announcements: Vec::new(),
                }),
            }),
        }
    }

    /// Open the connection if it isn't already open or opening.
    ///
    /// Returns `MissingCredentials` without doing anything when the backend
    /// address or token is absent; the caller may retry later. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> Result<(), PushError> {
        self.inner.connect()
    }

    /// Close on purpose. Suppresses auto-reconnect until the next `connect`.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        state.intentional_close = true;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(connection) = state.connection.take() {
            connection.cancel.cancel();
        }
        state.set_phase(ConnectionState::Closed);
        info!("Push connection closed by client");
    }

    /// Register a handler for one event type.
    ///
    /// Any number of handlers may share a type. Dropping the returned
    /// subscription removes this handler and no other.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let kind = event_type.into();
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .handlers
            .write()
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Send one frame on the open connection
    pub fn send(&self, kind: impl Into<String>, data: Value) -> Result<(), PushError> {
        let text = Frame::new(kind, data).to_text();
        let state = self.inner.state.lock();
        match (state.phase, state.connection.as_ref()) {
            (ConnectionState::Open, Some(connection)) => connection
                .outbound
                .send(text)
                .map_err(|_| PushError::Closed),
            _ => Err(PushError::Closed),
        }
    }

    /// Register a frame that is sent now (if open) and again after every
    /// reconnect. A second announcement under the same key replaces the first.
    pub fn announce(&self, key: impl Into<String>, kind: impl Into<String>, data: Value) {
        let key = key.into();
        let frame = Frame::new(kind, data);
        let mut state = self.inner.state.lock();
        state.announcements.retain(|(existing, _)| existing != &key);
        if state.phase == ConnectionState::Open {
            if let Some(connection) = state.connection.as_ref() {
                let _ = connection.outbound.send(frame.to_text());
            }
        }
        state.announcements.push((key, frame));
    }

    /// Stop re-sending an announcement. Returns whether one was registered.
    pub fn withdraw(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.announcements.len();
        state.announcements.retain(|(existing, _)| existing != key);
        state.announcements.len() != before
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Receiver that sees every connection phase change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.lock().phase_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether a reconnect timer is currently pending
    pub fn reconnect_pending(&self) -> bool {
        self.inner.state.lock().reconnect_timer.is_some()
    }

    /// Number of handlers registered for a type
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Inner {
    fn connection_url(&self) -> Option<String> {
        let base = self.credentials.backend_url().filter(|u| !u.is_empty())?;
        let token = self.credentials.auth_token().filter(|t| !t.is_empty())?;

        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid backend address for push connection");
                return None;
            }
        };
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).ok()?;
        let path = format!(
            "{}{}",
            url.path().trim_end_matches('/'),
            self.options.push_path
        );
        url.set_path(&path);
        url.query_pairs_mut()
            .append_pair(&self.options.token_param, &token);
        Some(url.to_string())
    }

    fn connect(self: &Arc<Self>) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if matches!(
            state.phase,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return Ok(());
        }
        let Some(url) = self.connection_url() else {
            debug!("Push connect skipped: backend address or auth token missing");
            return Err(PushError::MissingCredentials);
        };

        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        state.intentional_close = false;
        state.epoch += 1;
        let epoch = state.epoch;
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        state.connection = Some(ActiveConnection {
            cancel: cancel.clone(),
            outbound: outbound_tx,
        });
        state.set_phase(ConnectionState::Connecting);
        drop(state);

        debug!(epoch, "Opening push connection");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_connection(url, epoch, cancel, outbound_rx).await;
        });
        Ok(())
    }

    async fn run_connection(
        self: Arc<Self>,
        url: String,
        epoch: u64,
        cancel: CancellationToken,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.connector.connect(&url) => result,
        };
        let mut stream = match attempt {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Push connection attempt failed");
                self.handle_close(epoch);
                return;
            }
        };

        let Some(announcements) = self.mark_open(epoch) else {
            let _ = stream.close().await;
            return;
        };
        if self.replay_announcements(stream.as_mut(), announcements).await {
            let period = self.options.heartbeat_interval;
            let mut heartbeat =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = stream.close().await;
                        break;
                    }
                    incoming = stream.receive() => match incoming {
                        Ok(Some(text)) => self.dispatch(&text),
                        Ok(None) => {
                            debug!("Push connection closed by server");
                            break;
                        }
                        Err(e) => {
                            debug!(error = %e, "Push connection dropped");
                            break;
                        }
                    },
                    Some(text) = outbound.recv() => {
                        if let Err(e) = stream.send(text).await {
                            debug!(error = %e, "Push send failed");
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let ping = Frame::new(PING, Value::Null).to_text();
                        if let Err(e) = stream.send(ping).await {
                            debug!(error = %e, "Heartbeat failed");
                            break;
                        }
                    }
                }
            }
        }

        self.handle_close(epoch);
    }

    /// Returns the frames to replay, or `None` if this attempt was superseded
    fn mark_open(&self, epoch: u64) -> Option<Vec<String>> {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.intentional_close {
            return None;
        }
        state.set_phase(ConnectionState::Open);
        state.backoff.reset();
        info!("Push connection open");
        Some(
            state
                .announcements
                .iter()
                .map(|(_, frame)| frame.to_text())
                .collect(),
        )
    }

    async fn replay_announcements(
        &self,
        stream: &mut dyn FrameStream,
        frames: Vec<String>,
    ) -> bool {
        for text in frames {
            if let Err(e) = stream.send(text).await {
                debug!(error = %e, "Failed to replay announcement");
                return false;
            }
        }
        true
    }

    fn handle_close(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.connection = None;
        if state.intentional_close {
            state.set_phase(ConnectionState::Closed);
            return;
        }
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ConnState) {
        if state.reconnect_timer.is_some() {
            return;
        }
        let delay = state.backoff.next_delay();
        state.set_phase(ConnectionState::Reconnecting);
        info!(delay_ms = delay.as_millis() as u64, "Scheduling push reconnect");

        let weak = Arc::downgrade(self);
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect();
            }
        }));
    }

    fn fire_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.reconnect_timer = None;
            if state.intentional_close {
                return;
            }
            state.set_phase(ConnectionState::Idle);
        }
        if let Err(e) = self.connect() {
            debug!(error = %e, "Reconnect skipped");
        }
    }

    fn dispatch(&self, text: &str) {
        let Some(frame) = Frame::parse(text) else {
            debug!(len = text.len(), "Dropping malformed push frame");
            return;
        };
        if frame.kind == PONG {
            trace!("Heartbeat acknowledged");
            return;
        }

        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&frame.kind)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!(kind = %frame.kind, "No subscribers for push event");
            return;
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&frame.data))).is_err() {
                warn!(kind = %frame.kind, "Push event handler panicked");
            }
        }
    }
}

/// Registration returned by [`PushTransport::on`]. Dropping it removes the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    inner: Weak<Inner>,
    kind: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn event_type(&self) -> &str {
        &self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.write();
        if let Some(list) = handlers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                handlers.remove(&self.kind);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Push transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("Connect error: {0}")]
    Connect(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connection closed")]
    Closed,
    #[error("Backend address or auth token missing")]
    MissingCredentials,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WsConnector;

    fn transport_with(credentials: StaticCredentials) -> PushTransport {
        PushTransport::new(
            Arc::new(WsConnector),
            Arc::new(credentials),
            TransportOptions::default(),
        )
    }

    #[test]
    fn test_connection_url_carries_token() {
        let transport = transport_with(StaticCredentials::new("https://api.example.com", "abc"));
        let url = transport.inner.connection_url().unwrap();
        assert_eq!(url, "wss://api.example.com/ws?token=abc");
    }

    #[test]
    fn test_connection_url_keeps_base_path() {
        let transport = transport_with(StaticCredentials::new("http://localhost:8080/v1/", "t k"));
        let url = transport.inner.connection_url().unwrap();
        assert_eq!(url, "ws://localhost:8080/v1/ws?token=t+k");
    }

    #[test]
    fn test_connection_url_requires_both_parts() {
        let no_token = transport_with(StaticCredentials {
            backend_url: Some("https://api.example.com".to_string()),
            auth_token: None,
        });
        assert!(no_token.inner.connection_url().is_none());

        let empty_url = transport_with(StaticCredentials {
            backend_url: Some(String::new()),
            auth_token: Some("abc".to_string()),
        });
        assert!(empty_url.inner.connection_url().is_none());
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let transport = transport_with(StaticCredentials::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = transport.on("chunk", move |data| {
            sink.lock().push(data["delta"].as_str().unwrap_or_default().to_string());
        });

        transport.inner.dispatch(r#"{"type":"chunk","data":{"delta":"a"}}"#);
        transport.inner.dispatch(r#"{"type":"other","data":{"delta":"b"}}"#);
        transport.inner.dispatch(r#"{"type":"pong"}"#);

        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_dropping_subscription_removes_only_that_handler() {
        let transport = transport_with(StaticCredentials::default());
        let first = transport.on("chunk", |_| {});
        let _second = transport.on("chunk", |_| {});
        assert_eq!(transport.handler_count("chunk"), 2);

        first.unsubscribe();
        assert_eq!(transport.handler_count("chunk"), 1);
    }

    #[test]
    fn test_send_requires_open_connection() {
        let transport = transport_with(StaticCredentials::default());
        assert_eq!(
            transport.send("ping", Value::Null),
            Err(PushError::Closed)
        );
    }
}
