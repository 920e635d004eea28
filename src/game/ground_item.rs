//! Ground items
//!
//! Resources lying at a map coordinate, owned by no slot collection.
//! Dropped items live for a configured number of ticks and are then
//! removed by the world tick loop.

use serde::{Deserialize, Serialize};

use crate::game::slots::{OwnerId, ResourceId};
use crate::protocol::Event;

/// Maximum ground items on one map
pub const MAX_ITEMS_PER_MAP: usize = 512;

/// Reach for picking an item up, in tiles
pub const PICKUP_RADIUS: u16 = 1;

/// A ground item placed on a map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundItem {
    pub entity_id: u32,
    pub resource_id: ResourceId,
    pub quantity: u32,
    pub x: u16,
    pub y: u16,
    /// Owner who dropped it, `None` for world spawns
    pub dropped_by: Option<OwnerId>,
    /// Tick the item was placed
    pub spawn_tick: u64,
    /// Tick the item disappears
    pub despawn_tick: u64,
}

impl GroundItem {
    /// Item dropped by a player at `current_tick`
    pub fn dropped(
        entity_id: u32,
        resource_id: ResourceId,
        quantity: u32,
        (x, y): (u16, u16),
        owner: OwnerId,
        current_tick: u64,
        lifetime_ticks: u64,
    ) -> Self {
        Self {
            entity_id,
            resource_id,
            quantity,
            x,
            y,
            dropped_by: Some(owner),
            spawn_tick: current_tick,
            despawn_tick: current_tick.saturating_add(lifetime_ticks),
        }
    }

    /// Check if this item should despawn
    pub fn should_despawn(&self, current_tick: u64) -> bool {
        current_tick >= self.despawn_tick
    }

    /// Check if `(x, y)` is close enough to pick this item up
    pub fn within_reach(&self, x: u16, y: u16) -> bool {
        self.x.abs_diff(x) <= PICKUP_RADIUS && self.y.abs_diff(y) <= PICKUP_RADIUS
    }

    /// Event announcing this item to observers
    pub fn appeared_event(&self) -> Event {
        Event::GroundItemAppeared {
            entity_id: self.entity_id,
            item_id: self.resource_id,
            quantity: self.quantity.min(u16::MAX as u32) as u16,
            x: self.x,
            y: self.y,
        }
    }

    pub fn removed_event(&self) -> Event {
        Event::GroundItemRemoved {
            entity_id: self.entity_id,
        }
    }
}
