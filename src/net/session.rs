//! Session management module
//!
//! Manages client sessions including:
//! - Session lifecycle (creation, tracking, cleanup)
//! - Session state machine (handshake -> authenticated -> in world)
//! - Per-session data (owner, placement, outbound queue, in-flight transfers)
//! - Thread-safe session registry, which is also the broadcast subscriber set

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, RealmError, Result};
use crate::game::broadcast::{Delivery, Subscribers};
use crate::game::{EntityId, MapId, OwnerId, SessionId};
use crate::protocol::{encode, Event};

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, waiting for credentials
    Handshake,
    /// Logged in, not yet in the world
    Authenticated,
    /// Indexed on a map
    InWorld,
    /// Crossing between maps
    MapTransition,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether credentials have been accepted
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticated | SessionState::InWorld | SessionState::MapTransition
        )
    }

    /// Whether the session's player is indexed on a map
    pub fn is_in_world(&self) -> bool {
        matches!(self, SessionState::InWorld | SessionState::MapTransition)
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Handshake => "Handshake",
            SessionState::Authenticated => "Authenticated",
            SessionState::InWorld => "InWorld",
            SessionState::MapTransition => "MapTransition",
            SessionState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a session's player currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub entity_id: EntityId,
    pub map_id: MapId,
    pub x: u16,
    pub y: u16,
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Whether this is a WebSocket connection
    pub is_websocket: bool,
    state: RwLock<SessionState>,
    owner: RwLock<Option<OwnerId>>,
    username: RwLock<Option<String>>,
    placement: RwLock<Option<Placement>>,
    vault_open: AtomicBool,
    /// Outbound frame queue drained by the writer task
    outbound_tx: mpsc::Sender<Bytes>,
    stalled: AtomicBool,
    closing: AtomicBool,
    close_notify: Notify,
    in_flight: AtomicUsize,
    idle_notify: Notify,
    /// Time of session creation
    pub created_at: Instant,
    last_activity: RwLock<Instant>,
}

impl Session {
    pub fn new(
        id: SessionId,
        address: SocketAddr,
        is_websocket: bool,
        outbound_tx: mpsc::Sender<Bytes>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            is_websocket,
            state: RwLock::new(SessionState::Handshake),
            owner: RwLock::new(None),
            username: RwLock::new(None),
            placement: RwLock::new(None),
            vault_open: AtomicBool::new(false),
            outbound_tx,
            stalled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            idle_notify: Notify::new(),
            created_at: now,
            last_activity: RwLock::new(now),
        }
    }

    /// Get the IP address as a string (without port)
    pub fn ip(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, new_state: SessionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        debug!(
            session_id = self.id,
            old_state = %old_state,
            new_state = %new_state,
            "Session state changed"
        );
    }

    pub fn is_state(&self, check_state: SessionState) -> bool {
        *self.state.read() == check_state
    }

    /// Record the logged-in identity
    pub fn set_identity(&self, owner: OwnerId, username: &str) {
        *self.owner.write() = Some(owner);
        *self.username.write() = Some(username.to_string());
    }

    pub fn owner(&self) -> Option<OwnerId> {
        *self.owner.read()
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn placement(&self) -> Option<Placement> {
        *self.placement.read()
    }

    pub fn set_placement(&self, placement: Placement) {
        *self.placement.write() = Some(placement);
    }

    pub fn take_placement(&self) -> Option<Placement> {
        self.placement.write().take()
    }

    pub fn vault_open(&self) -> bool {
        self.vault_open.load(Ordering::SeqCst)
    }

    pub fn set_vault_open(&self, open: bool) {
        self.vault_open.store(open, Ordering::SeqCst);
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Queue an event for this client
    pub fn send(&self, event: &Event) -> Delivery {
        self.send_frame(Bytes::from(encode(event)))
    }

    /// Queue an encoded frame without waiting.
    ///
    /// A full queue marks the session stalled and asks it to close.
    pub fn send_frame(&self, frame: Bytes) -> Delivery {
        if self.stalled.load(Ordering::SeqCst) {
            return Delivery::Stalled;
        }
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    warn!(session_id = self.id, "Outbound queue full, closing session");
                    self.request_close();
                }
                Delivery::Stalled
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Ask the connection task to shut down
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once [`Session::request_close`] has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }

    /// Track a transfer running on behalf of this session
    pub fn begin_transfer(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            session: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every tracked transfer has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("is_websocket", &self.is_websocket)
            .field("owner", &self.owner())
            .field("username", &self.username())
            .field("placement", &self.placement())
            .field("in_flight", &self.in_flight())
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Token held by a running transfer; dropping it marks the transfer finished
pub struct InFlight {
    session: Arc<Session>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.idle_notify.notify_waiters();
        }
    }
}

/// Thread-safe session manager
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Owners currently logged in, to their session
    online_owners: DashMap<OwnerId, SessionId>,
    /// Map of IP address to list of session IDs (for connection limiting)
    ip_to_sessions: DashMap<String, Vec<SessionId>>,
    next_id: AtomicU64,
    max_per_ip: usize,
    outbound_queue: usize,
    /// Woken when the last session is removed
    drained: Notify,
}

impl SessionManager {
    pub fn new(max_per_ip: usize, outbound_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            online_owners: DashMap::new(),
            ip_to_sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_per_ip,
            outbound_queue: outbound_queue.max(1),
            drained: Notify::new(),
        }
    }

    /// Create and register a session, returning it with the receiving end of
    /// its outbound queue
    pub fn create_session(
        &self,
        address: SocketAddr,
        is_websocket: bool,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Bytes>)> {
        let ip = address.ip().to_string();

        let current_count = self.ip_to_sessions.get(&ip).map(|v| v.len()).unwrap_or(0);
        if current_count >= self.max_per_ip {
            warn!(
                ip = %ip,
                count = current_count,
                max = self.max_per_ip,
                "Connection limit exceeded for IP"
            );
            return Err(RealmError::Network(NetworkError::TooManyConnections(ip)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let session = Arc::new(Session::new(id, address, is_websocket, outbound_tx));

        self.sessions.insert(id, session.clone());
        self.ip_to_sessions.entry(ip).or_default().push(id);

        info!(
            session_id = id,
            address = %address,
            is_websocket = is_websocket,
            "Session created"
        );

        Ok((session, outbound_rx))
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Mark `owner` online for `session_id`; false if already online elsewhere
    pub fn claim_owner(&self, owner: OwnerId, session_id: SessionId) -> bool {
        match self.online_owners.entry(owner) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session_id);
                true
            }
        }
    }

    pub fn is_online(&self, owner: OwnerId) -> bool {
        self.online_owners.contains_key(&owner)
    }

    pub fn get_by_owner(&self, owner: OwnerId) -> Option<Arc<Session>> {
        self.online_owners
            .get(&owner)
            .and_then(|id| self.get(*id))
    }

    /// Unregister a session
    pub fn remove(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(owner) = session.owner() {
                self.online_owners.remove_if(&owner, |_, sid| *sid == id);
            }

            let ip = session.ip();
            if let Some(mut sessions) = self.ip_to_sessions.get_mut(&ip) {
                sessions.retain(|&sid| sid != id);
            }
            self.ip_to_sessions.retain(|_, v| !v.is_empty());

            info!(
                session_id = id,
                username = ?session.username(),
                "Session removed"
            );

            if self.sessions.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    /// Ask every session to close; each connection tears itself down
    pub fn close_all(&self) {
        for session in self.sessions.iter() {
            session.request_close();
        }
    }

    /// Wait until every session has been removed, for at most `limit`.
    /// Returns whether the registry emptied in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        let emptied = async {
            loop {
                let notified = self.drained.notified();
                if self.sessions.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, emptied).await.is_ok()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the count of logged-in players
    pub fn player_count(&self) -> usize {
        self.online_owners.len()
    }
}

impl Subscribers for SessionManager {
    fn deliver(&self, session_id: SessionId, frame: Bytes) -> Delivery {
        match self.get(session_id) {
            Some(session) => session.send_frame(frame),
            None => Delivery::Gone,
        }
    }
}
