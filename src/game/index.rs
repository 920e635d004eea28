//! World index
//!
//! Spatial partition of every live entity, one partition per map. Each
//! partition sits behind its own lock, so all mutations of one map are
//! serialized and anything published while the lock is held matches the
//! index state at that moment.
//!
//! Map transitions lock both partitions (lowest map id first) and move the
//! entity across in one step, so no reader ever sees it in two maps or in
//! none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{MapConfig, WorldConfig};
use crate::error::WorldError;
use crate::game::ground_item::{GroundItem, MAX_ITEMS_PER_MAP};
use crate::game::npc::Npc;
use crate::game::slots::OwnerId;
use crate::game::{EntityId, MapId, SessionId};
use crate::protocol::Event;

/// Width and height of a grid cell in tiles
pub const CELL_SIZE: u16 = 8;

/// Kind of indexed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Player,
    Npc,
    GroundItem,
}

/// One entity's placement as seen by queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub entity_id: EntityId,
    pub map_id: MapId,
    pub x: u16,
    pub y: u16,
    pub kind: EntityKind,
}

/// A player present on a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub entity_id: EntityId,
    pub session_id: SessionId,
    pub owner: OwnerId,
    pub name: String,
    pub x: u16,
    pub y: u16,
}

impl PlayerEntry {
    pub fn appeared_event(&self) -> Event {
        Event::PlayerAppeared {
            entity_id: self.entity_id,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
        }
    }

    pub fn departed_event(&self) -> Event {
        Event::PlayerDeparted {
            entity_id: self.entity_id,
        }
    }
}

fn cell_of(x: u16, y: u16) -> (u16, u16) {
    (x / CELL_SIZE, y / CELL_SIZE)
}

/// Contents of one map
pub struct MapState {
    config: MapConfig,
    players: BTreeMap<EntityId, PlayerEntry>,
    npcs: BTreeMap<EntityId, Npc>,
    ground_items: BTreeMap<EntityId, GroundItem>,
    cells: HashMap<(u16, u16), BTreeSet<EntityId>>,
}

impl MapState {
    fn new(config: MapConfig) -> Self {
        Self {
            config,
            players: BTreeMap::new(),
            npcs: BTreeMap::new(),
            ground_items: BTreeMap::new(),
            cells: HashMap::new(),
        }
    }

    pub fn map_id(&self) -> MapId {
        self.config.id
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerEntry> {
        self.players.values()
    }

    pub fn player(&self, entity_id: EntityId) -> Option<&PlayerEntry> {
        self.players.get(&entity_id)
    }

    pub fn npcs(&self) -> impl Iterator<Item = &Npc> {
        self.npcs.values()
    }

    pub fn npcs_mut(&mut self) -> impl Iterator<Item = &mut Npc> {
        self.npcs.values_mut()
    }

    pub fn ground_items(&self) -> impl Iterator<Item = &GroundItem> {
        self.ground_items.values()
    }

    pub fn ground_item(&self, entity_id: EntityId) -> Option<&GroundItem> {
        self.ground_items.get(&entity_id)
    }

    /// Sessions of every player on this map, in entity id order
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.players.values().map(|p| p.session_id).collect()
    }

    fn position_of(&self, entity_id: EntityId) -> Option<(u16, u16, EntityKind)> {
        if let Some(p) = self.players.get(&entity_id) {
            return Some((p.x, p.y, EntityKind::Player));
        }
        if let Some(n) = self.npcs.get(&entity_id) {
            return Some((n.x, n.y, EntityKind::Npc));
        }
        self.ground_items
            .get(&entity_id)
            .map(|g| (g.x, g.y, EntityKind::GroundItem))
    }

    fn cell_insert(&mut self, entity_id: EntityId, x: u16, y: u16) {
        self.cells.entry(cell_of(x, y)).or_default().insert(entity_id);
    }

    fn cell_remove(&mut self, entity_id: EntityId, x: u16, y: u16) {
        let cell = cell_of(x, y);
        if let Some(ids) = self.cells.get_mut(&cell) {
            ids.remove(&entity_id);
            if ids.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Entities within Chebyshev distance `radius` of `(x, y)`, ordered by id
    pub fn entities_near(&self, x: u16, y: u16, radius: u16) -> Vec<IndexEntry> {
        let (min_cx, min_cy) = cell_of(x.saturating_sub(radius), y.saturating_sub(radius));
        let (max_cx, max_cy) = cell_of(x.saturating_add(radius), y.saturating_add(radius));

        let mut found = Vec::new();
        for cx in min_cx..=max_cx {
            for cy in min_cy..=max_cy {
                let Some(ids) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for id in ids {
                    let Some((ex, ey, kind)) = self.position_of(*id) else {
                        continue;
                    };
                    if ex.abs_diff(x) <= radius && ey.abs_diff(y) <= radius {
                        found.push(IndexEntry {
                            entity_id: *id,
                            map_id: self.config.id,
                            x: ex,
                            y: ey,
                            kind,
                        });
                    }
                }
            }
        }
        found.sort_by_key(|e| e.entity_id);
        found
    }

    /// Events describing everything on this map, for a client entering it
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events =
            Vec::with_capacity(self.players.len() + self.npcs.len() + self.ground_items.len());
        events.extend(self.players.values().map(PlayerEntry::appeared_event));
        events.extend(self.npcs.values().map(Npc::appeared_event));
        events.extend(self.ground_items.values().map(GroundItem::appeared_event));
        events
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.npcs.is_empty() && self.ground_items.is_empty()
    }
}

/// Mutable access to one locked map
pub struct MapView<'a> {
    state: &'a mut MapState,
    placements: &'a DashMap<EntityId, MapId>,
}

impl MapView<'_> {
    pub fn state(&self) -> &MapState {
        self.state
    }

    pub fn map_id(&self) -> MapId {
        self.state.config.id
    }

    fn claim(&self, entity_id: EntityId) -> Result<(), WorldError> {
        use dashmap::mapref::entry::Entry;
        match self.placements.entry(entity_id) {
            Entry::Occupied(_) => Err(WorldError::AlreadyPlaced(entity_id)),
            Entry::Vacant(slot) => {
                slot.insert(self.state.config.id);
                Ok(())
            }
        }
    }

    fn release(&self, entity_id: EntityId) {
        self.placements.remove(&entity_id);
    }

    pub fn add_player(&mut self, player: PlayerEntry) -> Result<(), WorldError> {
        self.claim(player.entity_id)?;
        self.state.cell_insert(player.entity_id, player.x, player.y);
        trace!(
            map_id = self.map_id(),
            entity_id = player.entity_id,
            "Player indexed"
        );
        self.state.players.insert(player.entity_id, player);
        Ok(())
    }

    pub fn remove_player(&mut self, entity_id: EntityId) -> Option<PlayerEntry> {
        let player = self.state.players.remove(&entity_id)?;
        self.state.cell_remove(entity_id, player.x, player.y);
        self.release(entity_id);
        Some(player)
    }

    pub fn add_npc(&mut self, npc: Npc) -> Result<(), WorldError> {
        self.claim(npc.entity_id)?;
        self.state.cell_insert(npc.entity_id, npc.x, npc.y);
        self.state.npcs.insert(npc.entity_id, npc);
        Ok(())
    }

    pub fn remove_npc(&mut self, entity_id: EntityId) -> Option<Npc> {
        let npc = self.state.npcs.remove(&entity_id)?;
        self.state.cell_remove(entity_id, npc.x, npc.y);
        self.release(entity_id);
        Some(npc)
    }

    pub fn npcs_mut(&mut self) -> impl Iterator<Item = &mut Npc> {
        self.state.npcs_mut()
    }

    pub fn add_ground_item(&mut self, item: GroundItem) -> Result<(), WorldError> {
        if self.state.ground_items.len() >= MAX_ITEMS_PER_MAP {
            return Err(WorldError::MapFull(self.map_id()));
        }
        self.claim(item.entity_id)?;
        self.state.cell_insert(item.entity_id, item.x, item.y);
        self.state.ground_items.insert(item.entity_id, item);
        Ok(())
    }

    pub fn remove_ground_item(&mut self, entity_id: EntityId) -> Option<GroundItem> {
        let item = self.state.ground_items.remove(&entity_id)?;
        self.state.cell_remove(entity_id, item.x, item.y);
        self.release(entity_id);
        Some(item)
    }

    /// Ground items due to despawn, removed from the map
    pub fn expire_ground_items(&mut self, current_tick: u64) -> Vec<GroundItem> {
        let due: Vec<EntityId> = self
            .state
            .ground_items
            .values()
            .filter(|item| item.should_despawn(current_tick))
            .map(|item| item.entity_id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.remove_ground_item(id))
            .collect()
    }

    /// Move a player or NPC within this map
    pub fn move_entity(&mut self, entity_id: EntityId, x: u16, y: u16) -> Result<(), WorldError> {
        let map_id = self.map_id();
        let (old_x, old_y) = if let Some(p) = self.state.players.get_mut(&entity_id) {
            let old = (p.x, p.y);
            p.x = x;
            p.y = y;
            old
        } else if let Some(n) = self.state.npcs.get_mut(&entity_id) {
            let old = (n.x, n.y);
            n.x = x;
            n.y = y;
            old
        } else {
            return Err(WorldError::NotPlaced(entity_id, map_id));
        };

        if cell_of(old_x, old_y) != cell_of(x, y) {
            self.state.cell_remove(entity_id, old_x, old_y);
            self.state.cell_insert(entity_id, x, y);
        }
        Ok(())
    }

    /// Move a player from this map onto `dest` at `(x, y)`.
    ///
    /// The placement record switches maps in a single write.
    pub fn transfer_player(
        &mut self,
        dest: &mut MapView<'_>,
        entity_id: EntityId,
        x: u16,
        y: u16,
    ) -> Result<PlayerEntry, WorldError> {
        let mut player = self
            .state
            .players
            .remove(&entity_id)
            .ok_or(WorldError::NotPlaced(entity_id, self.map_id()))?;
        self.state.cell_remove(entity_id, player.x, player.y);

        player.x = x;
        player.y = y;
        dest.state.cell_insert(entity_id, x, y);
        dest.state.players.insert(entity_id, player.clone());
        self.placements.insert(entity_id, dest.map_id());
        Ok(player)
    }
}

struct MapPartition {
    state: Mutex<MapState>,
}

/// Spatial index over every map
pub struct WorldIndex {
    partitions: HashMap<MapId, Arc<MapPartition>>,
    placements: DashMap<EntityId, MapId>,
    next_entity_id: AtomicU32,
}

impl WorldIndex {
    pub fn new(config: &WorldConfig) -> Self {
        let partitions = config
            .maps
            .iter()
            .map(|map| {
                (
                    map.id,
                    Arc::new(MapPartition {
                        state: Mutex::new(MapState::new(map.clone())),
                    }),
                )
            })
            .collect();
        debug!(maps = config.maps.len(), "World index created");
        Self {
            partitions,
            placements: DashMap::new(),
            next_entity_id: AtomicU32::new(1),
        }
    }

    /// Allocate a fresh entity id
    pub fn allocate_id(&self) -> EntityId {
        self.next_entity_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn map_ids(&self) -> Vec<MapId> {
        let mut ids: Vec<MapId> = self.partitions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn partition(&self, map_id: MapId) -> Result<&Arc<MapPartition>, WorldError> {
        self.partitions
            .get(&map_id)
            .ok_or(WorldError::UnknownMap(map_id))
    }

    /// Run `f` with the map locked
    pub fn with_map<R>(
        &self,
        map_id: MapId,
        f: impl FnOnce(&mut MapView<'_>) -> R,
    ) -> Result<R, WorldError> {
        let partition = self.partition(map_id)?;
        let mut state = partition.state.lock();
        let mut view = MapView {
            state: &mut state,
            placements: &self.placements,
        };
        Ok(f(&mut view))
    }

    /// Run `f` with two distinct maps locked, lowest id first
    pub fn with_maps<R>(
        &self,
        from: MapId,
        to: MapId,
        f: impl FnOnce(&mut MapView<'_>, &mut MapView<'_>) -> R,
    ) -> Result<R, WorldError> {
        if from == to {
            return Err(WorldError::SameMap(from));
        }
        let (a, b) = (self.partition(from)?, self.partition(to)?);
        let (mut from_state, mut to_state) = if from < to {
            let first = a.state.lock();
            let second = b.state.lock();
            (first, second)
        } else {
            let second = b.state.lock();
            let first = a.state.lock();
            (first, second)
        };

        let mut from_view = MapView {
            state: &mut from_state,
            placements: &self.placements,
        };
        let mut to_view = MapView {
            state: &mut to_state,
            placements: &self.placements,
        };
        Ok(f(&mut from_view, &mut to_view))
    }

    pub fn add_player(&self, map_id: MapId, player: PlayerEntry) -> Result<(), WorldError> {
        self.with_map(map_id, |view| view.add_player(player))?
    }

    pub fn remove_player(&self, map_id: MapId, entity_id: EntityId) -> Option<PlayerEntry> {
        self.with_map(map_id, |view| view.remove_player(entity_id))
            .ok()
            .flatten()
    }

    pub fn add_npc(&self, map_id: MapId, npc: Npc) -> Result<(), WorldError> {
        self.with_map(map_id, |view| view.add_npc(npc))?
    }

    pub fn remove_npc(&self, map_id: MapId, entity_id: EntityId) -> Option<Npc> {
        self.with_map(map_id, |view| view.remove_npc(entity_id))
            .ok()
            .flatten()
    }

    pub fn add_ground_item(&self, map_id: MapId, item: GroundItem) -> Result<(), WorldError> {
        self.with_map(map_id, |view| view.add_ground_item(item))?
    }

    pub fn remove_ground_item(&self, map_id: MapId, entity_id: EntityId) -> Option<GroundItem> {
        self.with_map(map_id, |view| view.remove_ground_item(entity_id))
            .ok()
            .flatten()
    }

    /// Sessions of every player on `map_id`
    pub fn players_in(&self, map_id: MapId) -> Vec<SessionId> {
        self.with_map(map_id, |view| view.state().session_ids())
            .unwrap_or_default()
    }

    pub fn entities_near(&self, map_id: MapId, x: u16, y: u16, radius: u16) -> Vec<IndexEntry> {
        self.with_map(map_id, |view| view.state().entities_near(x, y, radius))
            .unwrap_or_default()
    }

    /// Map currently holding `entity_id`
    pub fn locate(&self, entity_id: EntityId) -> Option<MapId> {
        self.placements.get(&entity_id).map(|m| *m)
    }

    /// Total indexed entities
    pub fn entity_count(&self) -> usize {
        self.placements.len()
    }
}
