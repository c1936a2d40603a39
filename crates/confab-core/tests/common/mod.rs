//! Shared fakes for confab-core integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use confab_core::{
    ApiError, ChannelActivator, ChannelStore, ChatApi, ChatCoordinator, MemoryTabStorage,
    ModelSelection, PushTransport, RemoteMessage, Result, Role, SendReceipt, Session,
    StaticCredentials, TabStorage, Topic, TopicPatch, TransportOptions,
};
use confab_push::{Connector, FrameStream, PushError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn topic(id: &str, title: Option<&str>, minutes: i64) -> Topic {
    Topic {
        id: id.to_string(),
        session_id: "s1".to_string(),
        title: title.map(str::to_string),
        updated_at: at(minutes),
    }
}

pub fn remote(id: &str, db_id: &str, role: Role, content: &str) -> RemoteMessage {
    RemoteMessage {
        id: id.to_string(),
        db_id: db_id.to_string(),
        role,
        content: content.to_string(),
        status: confab_core::MessageStatus::Completed,
        tool_calls: Vec::new(),
        attachments: Vec::new(),
        citations: Vec::new(),
        error: None,
        created_at: at(0),
    }
}

/// Async point a test can hold closed
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// In-memory REST collaborators with switchable failures
#[derive(Default)]
pub struct FakeApi {
    pub session: Mutex<Option<Session>>,
    pub history: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    pub fail_fetch_messages: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_abort: AtomicBool,
    pub fail_model: AtomicBool,
    pub send_db_id: Mutex<Option<String>>,
    pub fetch_gate: Mutex<Option<Arc<Gate>>>,
    pub calls: Mutex<Vec<String>>,
    created: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_session(topics: Vec<Topic>) -> Arc<Self> {
        let api = Self::default();
        *api.session.lock() = Some(Session {
            id: "s1".to_string(),
            agent_id: "agent-1".to_string(),
            topics,
        });
        Arc::new(api)
    }

    pub fn rename(&self, topic_id: &str, title: &str) {
        if let Some(session) = self.session.lock().as_mut() {
            for topic in session.topics.iter_mut().filter(|t| t.id == topic_id) {
                topic.title = Some(title.to_string());
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn refuse(flag: &AtomicBool) -> std::result::Result<(), ApiError> {
        if flag.load(Ordering::SeqCst) {
            return Err(ApiError::Http {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_session_by_agent(
        &self,
        agent_id: &str,
    ) -> std::result::Result<Session, ApiError> {
        self.record(format!("fetch_session:{agent_id}"));
        self.session
            .lock()
            .clone()
            .ok_or_else(|| ApiError::Network("offline".to_string()))
    }

    async fn create_topic(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> std::result::Result<Topic, ApiError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("create_topic:{session_id}"));
        let mut created = topic(&format!("new-{n}"), title, 1_000 + n as i64);
        created.session_id = session_id.to_string();
        Ok(created)
    }

    async fn fetch_messages(
        &self,
        topic_id: &str,
    ) -> std::result::Result<Vec<RemoteMessage>, ApiError> {
        self.record(format!("fetch_messages:{topic_id}"));
        let gate = self.fetch_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Self::refuse(&self.fail_fetch_messages)?;
        Ok(self.history.lock().get(topic_id).cloned().unwrap_or_default())
    }

    async fn update_topic(
        &self,
        topic_id: &str,
        patch: &TopicPatch,
    ) -> std::result::Result<Topic, ApiError> {
        self.record(format!("update_topic:{topic_id}"));
        if let Some(title) = &patch.title {
            self.rename(topic_id, title);
        }
        Ok(topic(topic_id, patch.title.as_deref(), 2_000))
    }

    async fn delete_topic(&self, topic_id: &str) -> std::result::Result<(), ApiError> {
        self.record(format!("delete_topic:{topic_id}"));
        if let Some(session) = self.session.lock().as_mut() {
            session.topics.retain(|t| t.id != topic_id);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        topic_id: &str,
        _message_id: &str,
        _content: &str,
    ) -> std::result::Result<SendReceipt, ApiError> {
        self.record(format!("send_message:{topic_id}"));
        Self::refuse(&self.fail_send)?;
        Ok(SendReceipt {
            db_id: self.send_db_id.lock().clone(),
        })
    }

    async fn abort_generation(
        &self,
        topic_id: &str,
        _stream_id: Option<&str>,
    ) -> std::result::Result<(), ApiError> {
        self.record(format!("abort:{topic_id}"));
        Self::refuse(&self.fail_abort)
    }

    async fn update_channel_model(
        &self,
        topic_id: &str,
        selection: &ModelSelection,
    ) -> std::result::Result<(), ApiError> {
        self.record(format!("model:{topic_id}:{}", selection.model));
        Self::refuse(&self.fail_model)
    }
}

/// Records activations together with the tab list persisted at that moment
pub struct FakeActivator {
    pub storage: Arc<MemoryTabStorage>,
    pub agent_id: String,
    pub live: Mutex<HashSet<String>>,
    pub activations: Mutex<Vec<(String, Vec<String>)>>,
    pub releases: Mutex<Vec<String>>,
}

impl FakeActivator {
    pub fn new(storage: Arc<MemoryTabStorage>, agent_id: &str) -> Arc<Self> {
        Arc::new(Self {
            storage,
            agent_id: agent_id.to_string(),
            live: Mutex::new(HashSet::new()),
            activations: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        })
    }

    pub fn activated_topics(&self) -> Vec<String> {
        self.activations.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl ChannelActivator for FakeActivator {
    async fn activate_channel(
        &self,
        _session_id: &str,
        topic_id: &str,
        _agent_id: &str,
    ) -> Result<bool> {
        let persisted = self
            .storage
            .load(&self.agent_id)?
            .map(|s| s.tabs.into_iter().map(|t| t.id).collect())
            .unwrap_or_default();
        self.activations.lock().push((topic_id.to_string(), persisted));
        Ok(self.live.lock().insert(topic_id.to_string()))
    }

    fn release_channel(&self, topic_id: &str) {
        self.live.lock().remove(topic_id);
        self.releases.lock().push(topic_id.to_string());
    }
}

/// Connector whose server side is driven by the test
pub struct LoopbackConnector {
    streams: Mutex<Vec<LoopbackStream>>,
}

pub struct LoopbackStream {
    incoming: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

pub struct Server {
    tx: mpsc::UnboundedSender<String>,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl Server {
    pub fn push(&self, kind: &str, data: Value) {
        let _ = self
            .tx
            .send(serde_json::json!({ "type": kind, "data": data }).to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, Server) {
        let (connector, mut servers) = Self::sessions(1);
        (connector, servers.remove(0))
    }

    /// Accepts `count` connections in order, then refuses
    pub fn sessions(count: usize) -> (Arc<Self>, Vec<Server>) {
        let mut streams = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..count {
            let (tx, incoming) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            streams.push(LoopbackStream {
                incoming,
                sent: Arc::clone(&sent),
            });
            servers.push(Server { tx, sent });
        }
        // Connections are popped from the back
        streams.reverse();
        let connector = Arc::new(Self {
            streams: Mutex::new(streams),
        });
        (connector, servers)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &str) -> std::result::Result<Box<dyn FrameStream>, PushError> {
        match self.streams.lock().pop() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(PushError::Connect("refused".to_string())),
        }
    }
}

#[async_trait]
impl FrameStream for LoopbackStream {
    async fn send(&mut self, text: String) -> std::result::Result<(), PushError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn receive(&mut self) -> std::result::Result<Option<String>, PushError> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) -> std::result::Result<(), PushError> {
        self.incoming.close();
        Ok(())
    }
}

/// Transport that never gets credentials, so it never connects
pub fn offline_transport() -> PushTransport {
    let (connector, _server) = LoopbackConnector::new();
    PushTransport::new(
        connector,
        Arc::new(StaticCredentials::default()),
        TransportOptions::default(),
    )
}

pub fn loopback_transport() -> (PushTransport, Server) {
    let (connector, server) = LoopbackConnector::new();
    let transport = PushTransport::new(
        connector,
        Arc::new(StaticCredentials::new("https://chat.example.com", "secret")),
        TransportOptions::default(),
    );
    (transport, server)
}

/// Transport over `sessions` loopback connections with a short reconnect delay
pub fn reconnecting_transport(sessions: usize) -> (PushTransport, Vec<Server>) {
    let (connector, servers) = LoopbackConnector::sessions(sessions);
    let options = TransportOptions {
        initial_delay: std::time::Duration::from_millis(50),
        ..TransportOptions::default()
    };
    let transport = PushTransport::new(
        connector,
        Arc::new(StaticCredentials::new("https://chat.example.com", "secret")),
        options,
    );
    (transport, servers)
}

pub fn coordinator(api: Arc<FakeApi>) -> Arc<ChatCoordinator> {
    ChatCoordinator::new(Arc::new(ChannelStore::new()), api, offline_transport())
}
