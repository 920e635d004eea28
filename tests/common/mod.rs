//! Shared harness for the integration tests
//!
//! Drives sessions through the real dispatcher over the in-memory backend,
//! reading what each client would receive straight off its outbound queue.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Notify};

use realm_server::config::StoreBackend;
use realm_server::game::slots::CollectionKind;
use realm_server::net::dispatcher::{Flow, SessionDispatcher};
use realm_server::net::session::Session;
use realm_server::protocol::{decode_event, encode_command, Command, Event};
use realm_server::error::StoreError;
use realm_server::store::{HashWrite, KeySpace, KvBackend, MemoryBackend, SharedBackend};
use realm_server::{AppState, ServerConfig};

pub const CLIENT_VERSION: u16 = 1;

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.dev_mode = true;
    config.client_version = CLIENT_VERSION;
    config.store.backend = StoreBackend::Memory;
    config.store.retry_backoff_ms = 0;
    config.net.max_per_ip = 1000;
    config
}

/// Fresh application state plus a handle on its backend
pub fn test_state() -> (Arc<AppState>, Arc<MemoryBackend>) {
    test_state_with(test_config())
}

pub fn test_state_with(config: ServerConfig) -> (Arc<AppState>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (test_state_on(config, backend.clone()), backend)
}

pub fn test_state_on(config: ServerConfig, backend: SharedBackend) -> Arc<AppState> {
    let (shutdown_tx, _) = broadcast::channel(1);
    Arc::new(AppState::new(config, backend, shutdown_tx))
}

/// Application state over a backend whose commits can be slowed down
pub fn slow_state(delay: Duration) -> (Arc<AppState>, Arc<SlowBackend>) {
    let backend = Arc::new(SlowBackend::new(delay));
    (test_state_on(test_config(), backend.clone()), backend)
}

/// Memory backend whose multi-key commits stall, and optionally fail, while
/// armed
pub struct SlowBackend {
    pub inner: Arc<MemoryBackend>,
    delay: Duration,
    armed: AtomicBool,
    failing: AtomicBool,
    commits_started: AtomicU32,
    started: Notify,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryBackend::new()),
            delay,
            armed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            commits_started: AtomicU32::new(0),
            started: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Armed commits report the backend as unavailable after their delay
    pub fn fail_commits(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Resolves once an armed commit has begun
    pub async fn commit_started(&self) {
        loop {
            let notified = self.started.notified();
            if self.commits_started.load(Ordering::SeqCst) > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl KvBackend for SlowBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hgetall(key).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.inner.hset(key, field, value).await
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        self.inner.hset_multiple(key, fields).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.inner.hdel(key, field).await
    }

    async fn hcompare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner
            .hcompare_and_swap(key, field, expected, new)
            .await
    }

    async fn hcommit(&self, writes: &[HashWrite]) -> Result<bool, StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            self.commits_started.fetch_add(1, Ordering::SeqCst);
            self.started.notify_waiters();
            tokio::time::sleep(self.delay).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("commit timed out".to_string()));
            }
        }
        self.inner.hcommit(writes).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Raw stored contents of one collection
pub fn stored(
    state: &AppState,
    backend: &MemoryBackend,
    owner: u32,
    kind: CollectionKind,
) -> std::collections::HashMap<String, String> {
    let keys = KeySpace::new(state.config.redis.key_prefix.clone());
    backend.snapshot(&keys.slots(kind.as_str(), owner))
}

/// An in-process client
pub struct TestClient {
    pub session: Arc<Session>,
    pub dispatcher: SessionDispatcher,
    rx: mpsc::Receiver<Bytes>,
}

impl TestClient {
    pub fn connect(state: &Arc<AppState>) -> Self {
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (session, rx) = state.sessions.create_session(addr, false).unwrap();
        let dispatcher = SessionDispatcher::new(state.clone(), session.clone());
        Self {
            session,
            dispatcher,
            rx,
        }
    }

    /// Connect and log in, returning the owner id
    pub async fn login(state: &Arc<AppState>, username: &str) -> (Self, u32) {
        let mut client = Self::connect(state);
        let flow = client
            .send(Command::Login {
                username: username.to_string(),
                password: "password".to_string(),
                client_version: CLIENT_VERSION,
            })
            .await;
        assert_eq!(flow, Flow::Continue);

        let owner = match client.events().as_slice() {
            [Event::LoginAccepted { owner_id }] => *owner_id,
            other => panic!("unexpected login reply: {:?}", other),
        };
        (client, owner)
    }

    /// Connect, log in and enter the world, discarding the entry events
    pub async fn in_world(state: &Arc<AppState>, username: &str) -> (Self, u32) {
        let (mut client, owner) = Self::login(state, username).await;
        assert_eq!(client.send(Command::EnterWorld).await, Flow::Continue);
        client.events();
        (client, owner)
    }

    pub async fn send(&self, command: Command) -> Flow {
        self.send_raw(&encode_command(&command)).await
    }

    pub async fn send_raw(&self, frame: &[u8]) -> Flow {
        self.dispatcher.handle_frame(frame).await
    }

    /// Everything queued for this client so far
    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            events.push(decode_event(&frame).unwrap());
        }
        events
    }

    pub fn entity_id(&self) -> u32 {
        self.session.placement().unwrap().entity_id
    }

    pub async fn disconnect(self) {
        self.dispatcher.teardown().await;
    }
}

pub fn console_messages(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ConsoleMessage { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn slot_updates(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::InventorySlotUpdate(_)
                    | Event::VaultSlotUpdate(_)
                    | Event::CommerceSlotUpdate(_)
            )
        })
        .count()
}
