//! Application state module
//!
//! Contains the shared state used across all server connections.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::auth::{AuthService, Authenticator};
use crate::config::ServerConfig;
use crate::game::broadcast::BroadcastRouter;
use crate::game::catalog::{Catalog, StaticCatalog};
use crate::game::index::WorldIndex;
use crate::game::persistence::PositionStore;
use crate::game::slots::SlotStore;
use crate::game::transfer::TransferEngine;
use crate::game::world::GameWorld;
use crate::net::session::SessionManager;
use crate::store::{KeySpace, RetryPolicy, SharedBackend};

/// Application state shared across all connections
pub struct AppState {
    pub config: ServerConfig,
    pub backend: SharedBackend,
    pub slots: Arc<SlotStore>,
    pub transfers: Arc<TransferEngine>,
    pub index: Arc<WorldIndex>,
    pub router: Arc<BroadcastRouter>,
    pub sessions: Arc<SessionManager>,
    pub positions: Arc<PositionStore>,
    pub catalog: Arc<dyn Catalog>,
    pub auth: Arc<dyn Authenticator>,
    pub world: Arc<GameWorld>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Wire every component over `backend`
    pub fn new(
        config: ServerConfig,
        backend: SharedBackend,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(config.dev_mode));
        if config.dev_mode {
            info!("Auth service running in DEVELOPMENT mode - all logins accepted");
        }
        Self::with_collaborators(
            config,
            backend,
            auth,
            Arc::new(StaticCatalog::with_common_items()),
            shutdown_tx,
        )
    }

    /// Wire every component with explicit authentication and catalog
    pub fn with_collaborators(
        config: ServerConfig,
        backend: SharedBackend,
        auth: Arc<dyn Authenticator>,
        catalog: Arc<dyn Catalog>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let keys = KeySpace::new(config.redis.key_prefix.clone());
        let retry = RetryPolicy::from_config(&config.store);

        let slots = Arc::new(SlotStore::new(
            backend.clone(),
            keys.clone(),
            config.slots.clone(),
            retry.clone(),
        ));
        let transfers = Arc::new(TransferEngine::new(slots.clone()));
        let positions = Arc::new(PositionStore::new(backend.clone(), keys, retry));

        let index = Arc::new(WorldIndex::new(&config.world));
        let sessions = Arc::new(SessionManager::new(
            config.net.max_per_ip,
            config.net.outbound_queue,
        ));
        let router = Arc::new(BroadcastRouter::new(index.clone(), sessions.clone()));
        let world = Arc::new(GameWorld::new(
            &config,
            index.clone(),
            router.clone(),
            positions.clone(),
        ));

        info!(
            maps = config.world.maps.len(),
            inventory = config.slots.inventory_size,
            vault = config.slots.vault_size,
            commerce = config.slots.commerce_size,
            "Application state initialized"
        );

        Self {
            config,
            backend,
            slots,
            transfers,
            index,
            router,
            sessions,
            positions,
            catalog,
            auth,
            world,
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
