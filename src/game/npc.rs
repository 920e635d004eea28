//! Non-player characters
//!
//! The world tick asks each live NPC's behavior for its next action. What
//! an NPC decides is up to the behavior; the index only applies the result
//! (step within the map, or despawn and schedule a respawn).

use rand::Rng;

use crate::config::NpcSpawnConfig;
use crate::protocol::Event;

/// What an NPC does this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpcAction {
    Idle,
    /// Move by the given offset (each component -1, 0 or 1)
    Step { dx: i8, dy: i8 },
    Despawn,
}

/// Read-only view passed to behaviors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpcView {
    pub entity_id: u32,
    pub x: u16,
    pub y: u16,
    pub home_x: u16,
    pub home_y: u16,
    /// Ticks since this NPC appeared
    pub age: u64,
}

/// Per-tick decision making for one NPC
pub trait NpcBehavior: Send + Sync {
    fn next_action(&mut self, npc: &NpcView) -> NpcAction;
}

/// Never moves
pub struct Stationary;

impl NpcBehavior for Stationary {
    fn next_action(&mut self, _npc: &NpcView) -> NpcAction {
        NpcAction::Idle
    }
}

/// Random walk around the spawn point
pub struct Wander {
    pub radius: u16,
    /// Chance of stepping on a given tick
    pub step_chance: f64,
}

impl Wander {
    pub fn new(radius: u16) -> Self {
        Self {
            radius,
            step_chance: 0.25,
        }
    }
}

impl NpcBehavior for Wander {
    fn next_action(&mut self, npc: &NpcView) -> NpcAction {
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(self.step_chance) {
            return NpcAction::Idle;
        }

        let dx: i8 = rng.gen_range(-1..=1);
        let dy: i8 = rng.gen_range(-1..=1);
        let (Some(x), Some(y)) = (offset(npc.x, dx), offset(npc.y, dy)) else {
            return NpcAction::Idle;
        };
        if x.abs_diff(npc.home_x) > self.radius || y.abs_diff(npc.home_y) > self.radius {
            return NpcAction::Idle;
        }
        if dx == 0 && dy == 0 {
            return NpcAction::Idle;
        }
        NpcAction::Step { dx, dy }
    }
}

/// Wraps another behavior and despawns after a fixed number of ticks
pub struct Expiring<B> {
    pub inner: B,
    pub lifetime_ticks: u64,
}

impl<B: NpcBehavior> NpcBehavior for Expiring<B> {
    fn next_action(&mut self, npc: &NpcView) -> NpcAction {
        if npc.age >= self.lifetime_ticks {
            return NpcAction::Despawn;
        }
        self.inner.next_action(npc)
    }
}

/// Apply a signed step to a coordinate
pub fn offset(value: u16, delta: i8) -> Option<u16> {
    value.checked_add_signed(i16::from(delta))
}

/// Behavior for an NPC spawned from config
pub fn behavior_for(spawn: &NpcSpawnConfig) -> Box<dyn NpcBehavior> {
    let base: Box<dyn NpcBehavior> = if spawn.wander_radius == 0 {
        Box::new(Stationary)
    } else {
        Box::new(Wander::new(spawn.wander_radius))
    };
    match spawn.lifetime_ticks {
        Some(lifetime_ticks) => Box::new(Expiring {
            inner: base,
            lifetime_ticks,
        }),
        None => base,
    }
}

impl NpcBehavior for Box<dyn NpcBehavior> {
    fn next_action(&mut self, npc: &NpcView) -> NpcAction {
        (**self).next_action(npc)
    }
}

/// A live NPC
pub struct Npc {
    pub entity_id: u32,
    pub npc_type: u16,
    pub x: u16,
    pub y: u16,
    pub home_x: u16,
    pub home_y: u16,
    /// Index into the configured spawn list, used for respawning
    pub spawn_index: Option<usize>,
    pub spawned_tick: u64,
    pub behavior: Box<dyn NpcBehavior>,
}

impl Npc {
    pub fn new(
        entity_id: u32,
        npc_type: u16,
        (x, y): (u16, u16),
        behavior: Box<dyn NpcBehavior>,
        spawned_tick: u64,
    ) -> Self {
        Self {
            entity_id,
            npc_type,
            x,
            y,
            home_x: x,
            home_y: y,
            spawn_index: None,
            spawned_tick,
            behavior,
        }
    }

    pub fn view(&self, current_tick: u64) -> NpcView {
        NpcView {
            entity_id: self.entity_id,
            x: self.x,
            y: self.y,
            home_x: self.home_x,
            home_y: self.home_y,
            age: current_tick.saturating_sub(self.spawned_tick),
        }
    }

    pub fn appeared_event(&self) -> Event {
        Event::NpcAppeared {
            entity_id: self.entity_id,
            npc_type: self.npc_type,
            x: self.x,
            y: self.y,
        }
    }
}

/// A despawned NPC waiting to come back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRespawn {
    pub spawn_index: usize,
    pub due_tick: u64,
}
