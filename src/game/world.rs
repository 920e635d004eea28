//! World module
//!
//! Runs the world tick loop:
//! - NPC scheduling (one decision per live NPC per tick, respawns)
//! - Ground item expiry
//! - Periodic autosave of online player positions, plus a final save
//!   when the server shuts down

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, WorldConfig};
use crate::game::broadcast::BroadcastRouter;
use crate::game::index::WorldIndex;
use crate::game::npc::{behavior_for, offset, Npc, NpcAction, PendingRespawn};
use crate::game::persistence::{PositionStore, SavedPosition};
use crate::game::slots::OwnerId;
use crate::game::{EntityId, MapId};
use crate::protocol::Event;

/// World lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Counts from one autosave pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: usize,
}

/// Game world - drives the tick and entity lifecycle
pub struct GameWorld {
    config: WorldConfig,
    tick_rate: Duration,
    autosave_ticks: u64,
    index: Arc<WorldIndex>,
    router: Arc<BroadcastRouter>,
    positions: Arc<PositionStore>,
    state: RwLock<WorldState>,
    tick: AtomicU64,
    running: AtomicBool,
    start_time: RwLock<Option<Instant>>,
    ticks_since_autosave: AtomicU64,
    respawns: Mutex<Vec<PendingRespawn>>,
}

impl GameWorld {
    pub fn new(
        config: &ServerConfig,
        index: Arc<WorldIndex>,
        router: Arc<BroadcastRouter>,
        positions: Arc<PositionStore>,
    ) -> Self {
        info!(
            world_id = config.world_id,
            name = %config.server_name,
            maps = config.world.maps.len(),
            "Creating game world"
        );
        Self {
            config: config.world.clone(),
            tick_rate: Duration::from_millis(config.tick_rate_ms),
            autosave_ticks: config.autosave_ticks(),
            index,
            router,
            positions,
            state: RwLock::new(WorldState::Initializing),
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: RwLock::new(None),
            ticks_since_autosave: AtomicU64::new(0),
            respawns: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    pub fn set_state(&self, new_state: WorldState) {
        let mut state = self.state.write();
        let old_state = *state;
        *state = new_state;
        info!(
            old_state = ?old_state,
            new_state = ?new_state,
            "World state changed"
        );
    }

    /// Current tick number
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Place every configured NPC
    pub fn spawn_npcs(&self) {
        let tick = self.tick();
        for index in 0..self.config.npc_spawns.len() {
            self.spawn_npc(index, tick);
        }
    }

    fn spawn_npc(&self, spawn_index: usize, tick: u64) -> Option<EntityId> {
        let spawn = self.config.npc_spawns.get(spawn_index)?;
        let entity_id = self.index.allocate_id();
        let mut npc = Npc::new(
            entity_id,
            spawn.npc_type,
            (spawn.x, spawn.y),
            behavior_for(spawn),
            tick,
        );
        npc.spawn_index = Some(spawn_index);

        let router = &self.router;
        let placed = self.index.with_map(spawn.map_id, |view| {
            let event = npc.appeared_event();
            view.add_npc(npc)?;
            router.deliver(view.state(), &event, None);
            Ok::<_, crate::error::WorldError>(())
        });

        match placed {
            Ok(Ok(())) => {
                debug!(
                    entity_id = entity_id,
                    npc_type = spawn.npc_type,
                    map_id = spawn.map_id,
                    "NPC spawned"
                );
                Some(entity_id)
            }
            Ok(Err(e)) | Err(e) => {
                warn!(spawn_index = spawn_index, error = %e, "Failed to spawn NPC");
                None
            }
        }
    }

    /// Run the tick loop until shutdown
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!(
            tick_rate_ms = self.tick_rate.as_millis() as u64,
            autosave_ticks = self.autosave_ticks,
            "Starting game world"
        );

        self.running.store(true, Ordering::SeqCst);
        *self.start_time.write() = Some(Instant::now());
        self.spawn_npcs();
        self.set_state(WorldState::Running);

        let mut tick_interval = interval(self.tick_rate);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    self.process_tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.set_state(WorldState::ShuttingDown);
        info!("Performing final save before shutdown");
        self.save_positions().await;

        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorldState::Stopped);

        info!(
            total_ticks = self.tick(),
            uptime_secs = self.uptime_secs(),
            "Game world stopped"
        );
    }

    /// Process a single tick
    pub async fn process_tick(&self) {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;

        if tick % 1000 == 0 {
            debug!(
                tick = tick,
                entities = self.index.entity_count(),
                "Game tick milestone"
            );
        }

        for map_id in self.index.map_ids() {
            self.tick_npcs(map_id, tick);
            self.expire_ground_items(map_id, tick);
        }
        self.process_respawns(tick);

        if self.autosave_ticks > 0 {
            let ticks = self.ticks_since_autosave.fetch_add(1, Ordering::SeqCst) + 1;
            if ticks >= self.autosave_ticks {
                self.ticks_since_autosave.store(0, Ordering::SeqCst);
                self.save_positions().await;
            }
        }
    }

    fn tick_npcs(&self, map_id: MapId, tick: u64) {
        let router = &self.router;
        let mut despawned = Vec::new();

        let result = self.index.with_map(map_id, |view| {
            let decisions: Vec<(EntityId, u16, u16, NpcAction, Option<usize>)> = view
                .npcs_mut()
                .map(|npc| {
                    let view = npc.view(tick);
                    let action = npc.behavior.next_action(&view);
                    (npc.entity_id, npc.x, npc.y, action, npc.spawn_index)
                })
                .collect();

            for (entity_id, x, y, action, spawn_index) in decisions {
                match action {
                    NpcAction::Idle => {}
                    NpcAction::Step { dx, dy } => {
                        let (Some(nx), Some(ny)) = (offset(x, dx), offset(y, dy)) else {
                            continue;
                        };
                        if !view.state().config().contains(nx, ny) {
                            continue;
                        }
                        if view.move_entity(entity_id, nx, ny).is_ok() {
                            let event = Event::EntityMoved {
                                entity_id,
                                x: nx,
                                y: ny,
                            };
                            router.deliver(view.state(), &event, None);
                        }
                    }
                    NpcAction::Despawn => {
                        if view.remove_npc(entity_id).is_some() {
                            router.deliver(view.state(), &Event::NpcRemoved { entity_id }, None);
                            despawned.push(spawn_index);
                        }
                    }
                }
            }
        });

        if let Err(e) = result {
            error!(map_id = map_id, error = %e, "NPC tick failed");
        }

        let mut respawns = self.respawns.lock();
        for spawn_index in despawned.into_iter().flatten() {
            let delay = self
                .config
                .npc_spawns
                .get(spawn_index)
                .map_or(0, |s| s.respawn_ticks);
            respawns.push(PendingRespawn {
                spawn_index,
                due_tick: tick + delay,
            });
        }
    }

    fn process_respawns(&self, tick: u64) {
        let due: Vec<PendingRespawn> = {
            let mut respawns = self.respawns.lock();
            let (due, waiting) = respawns.drain(..).partition(|r| r.due_tick <= tick);
            *respawns = waiting;
            due
        };
        for respawn in due {
            self.spawn_npc(respawn.spawn_index, tick);
        }
    }

    fn expire_ground_items(&self, map_id: MapId, tick: u64) {
        let router = &self.router;
        let result = self.index.with_map(map_id, |view| {
            let expired = view.expire_ground_items(tick);
            for item in &expired {
                router.deliver(view.state(), &item.removed_event(), None);
            }
            expired.len()
        });
        if let Ok(count) = result {
            if count > 0 {
                debug!(map_id = map_id, count = count, "Ground items expired");
            }
        }
    }

    /// Save the position of every player in the world
    pub async fn save_positions(&self) -> SaveReport {
        let mut online: Vec<(OwnerId, SavedPosition)> = Vec::new();
        for map_id in self.index.map_ids() {
            let _ = self.index.with_map(map_id, |view| {
                online.extend(
                    view.state()
                        .players()
                        .map(|p| (p.owner, SavedPosition::new(map_id, p.x, p.y))),
                );
            });
        }

        let mut report = SaveReport::default();
        if online.is_empty() {
            return report;
        }

        info!(player_count = online.len(), "Saving player positions");
        for (owner, position) in online {
            match self.positions.save(owner, &position).await {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(owner = owner, error = %e, "Failed to save position");
                }
            }
        }
        info!(
            saved = report.saved,
            failed = report.failed,
            "Position save complete"
        );
        report
    }

    pub fn pending_respawns(&self) -> usize {
        self.respawns.lock().len()
    }
}

impl std::fmt::Debug for GameWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameWorld")
            .field("state", &self.state())
            .field("tick", &self.tick())
            .field("running", &self.is_running())
            .field("entities", &self.index.entity_count())
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NpcSpawnConfig;
    use crate::game::broadcast::{Delivery, Subscribers};
    use crate::game::ground_item::GroundItem;
    use crate::game::index::PlayerEntry;
    use crate::store::{KeySpace, MemoryBackend, RetryPolicy};
    use bytes::Bytes;

    struct Sink;

    impl Subscribers for Sink {
        fn deliver(&self, _session_id: u64, _frame: Bytes) -> Delivery {
            Delivery::Delivered
        }
    }

    fn world(config: ServerConfig) -> (GameWorld, Arc<WorldIndex>, Arc<PositionStore>) {
        let index = Arc::new(WorldIndex::new(&config.world));
        let router = Arc::new(BroadcastRouter::new(index.clone(), Arc::new(Sink)));
        let positions = Arc::new(PositionStore::new(
            Arc::new(MemoryBackend::new()),
            KeySpace::new("test"),
            RetryPolicy::immediate(),
        ));
        (
            GameWorld::new(&config, index.clone(), router, positions.clone()),
            index,
            positions,
        )
    }

    #[test]
    fn test_world_state() {
        let (world, _, _) = world(ServerConfig::default());
        assert_eq!(world.state(), WorldState::Initializing);

        world.set_state(WorldState::Running);
        assert_eq!(world.state(), WorldState::Running);
    }

    #[test]
    fn test_spawn_npcs() {
        let config = ServerConfig::default();
        let expected = config.world.npc_spawns.len();
        let (world, index, _) = world(config);

        world.spawn_npcs();
        assert_eq!(index.entity_count(), expected);
    }

    #[tokio::test]
    async fn test_npc_despawns_and_respawns() {
        let mut config = ServerConfig::default();
        config.autosave_interval_secs = 0;
        config.world.npc_spawns = vec![NpcSpawnConfig {
            npc_type: 3,
            map_id: 0,
            x: 10,
            y: 10,
            wander_radius: 0,
            respawn_ticks: 2,
            lifetime_ticks: Some(1),
        }];
        let (world, index, _) = world(config);
        world.spawn_npcs();
        assert_eq!(index.entity_count(), 1);

        // Age reaches the lifetime on the first tick
        world.process_tick().await;
        assert_eq!(index.entity_count(), 0);
        assert_eq!(world.pending_respawns(), 1);

        world.process_tick().await;
        assert_eq!(index.entity_count(), 0);

        world.process_tick().await;
        assert_eq!(index.entity_count(), 1);
        assert_eq!(world.pending_respawns(), 0);
    }

    #[tokio::test]
    async fn test_ground_items_expire() {
        let mut config = ServerConfig::default();
        config.world.npc_spawns.clear();
        let (world, index, _) = world(config);

        let id = index.allocate_id();
        index
            .add_ground_item(0, GroundItem::dropped(id, 1, 1, (5, 5), 1, 0, 2))
            .unwrap();

        world.process_tick().await;
        assert_eq!(index.locate(id), Some(0));
        world.process_tick().await;
        assert_eq!(index.locate(id), None);
    }

    #[tokio::test]
    async fn test_save_positions() {
        let (world, index, positions) = world(ServerConfig::default());
        index
            .add_player(
                1,
                PlayerEntry {
                    entity_id: index.allocate_id(),
                    session_id: 1,
                    owner: 42,
                    name: "tester".to_string(),
                    x: 7,
                    y: 8,
                },
            )
            .unwrap();

        let report = world.save_positions().await;
        assert_eq!(report, SaveReport { saved: 1, failed: 0 });

        let saved = positions.load(42).await.unwrap().unwrap();
        assert_eq!((saved.map_id, saved.x, saved.y), (1, 7, 8));
    }
}
