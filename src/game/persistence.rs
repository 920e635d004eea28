//! Player position persistence
//!
//! Saves and loads the last known map and tile of each owner through the
//! key-value backend. Positions are written on map transition, on
//! disconnect, by the autosave tick and on shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::WorldConfig;
use crate::error::StoreError;
use crate::game::slots::OwnerId;
use crate::game::MapId;
use crate::store::{KeySpace, RetryPolicy, SharedBackend};

/// A stored player position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPosition {
    pub map_id: MapId,
    pub x: u16,
    pub y: u16,
    pub saved_at: DateTime<Utc>,
}

impl SavedPosition {
    pub fn new(map_id: MapId, x: u16, y: u16) -> Self {
        Self {
            map_id,
            x,
            y,
            saved_at: Utc::now(),
        }
    }
}

/// Position storage over the key-value backend
pub struct PositionStore {
    backend: SharedBackend,
    keys: KeySpace,
    retry: RetryPolicy,
}

impl PositionStore {
    pub fn new(backend: SharedBackend, keys: KeySpace, retry: RetryPolicy) -> Self {
        Self {
            backend,
            keys,
            retry,
        }
    }

    /// Save a position
    pub async fn save(&self, owner: OwnerId, position: &SavedPosition) -> Result<(), StoreError> {
        let key = self.keys.position(owner);
        let backend = &self.backend;
        let (map, x, y) = (
            position.map_id.to_string(),
            position.x.to_string(),
            position.y.to_string(),
        );
        let saved_at = position.saved_at.to_rfc3339();
        let fields = [
            ("map", map.as_str()),
            ("x", x.as_str()),
            ("y", y.as_str()),
            ("saved_at", saved_at.as_str()),
        ];

        // One write, so a failed save never leaves a mix of old and new fields
        self.retry
            .run("position.save", || backend.hset_multiple(&key, &fields))
            .await?;

        debug!(
            owner = owner,
            map_id = position.map_id,
            x = position.x,
            y = position.y,
            "Position saved"
        );
        Ok(())
    }

    /// Load a stored position, `None` if absent or unreadable
    pub async fn load(&self, owner: OwnerId) -> Result<Option<SavedPosition>, StoreError> {
        let key = self.keys.position(owner);
        let backend = &self.backend;
        let hash = self
            .retry
            .run("position.load", || backend.hgetall(&key))
            .await?;

        if hash.is_empty() {
            return Ok(None);
        }

        let parsed = (|| {
            Some(SavedPosition {
                map_id: hash.get("map")?.parse().ok()?,
                x: hash.get("x")?.parse().ok()?,
                y: hash.get("y")?.parse().ok()?,
                saved_at: hash
                    .get("saved_at")
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })
        })();

        if parsed.is_none() {
            warn!(owner = owner, key = %key, "Stored position is unreadable");
        }
        Ok(parsed)
    }

    /// Position to enter the world at: the stored one if it is still valid,
    /// otherwise the configured spawn
    pub async fn resolve(&self, owner: OwnerId, world: &WorldConfig) -> (MapId, u16, u16) {
        let spawn = (world.spawn.map_id, world.spawn.x, world.spawn.y);
        match self.load(owner).await {
            Ok(Some(p)) if world.is_valid_position(p.map_id, p.x, p.y) => (p.map_id, p.x, p.y),
            Ok(Some(p)) => {
                warn!(
                    owner = owner,
                    map_id = p.map_id,
                    x = p.x,
                    y = p.y,
                    "Stored position no longer valid, using spawn"
                );
                spawn
            }
            Ok(None) => spawn,
            Err(e) => {
                warn!(owner = owner, error = %e, "Could not load position, using spawn");
                spawn
            }
        }
    }
}
