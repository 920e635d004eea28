//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name displayed to players
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// World ID (1-255)
    #[serde(default = "default_world_id")]
    pub world_id: u8,

    /// Game port (TCP)
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// WebSocket port for browser clients
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Maximum number of players
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Game tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Autosave interval in seconds (0 to disable)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    /// Client version accepted at login
    #[serde(default = "default_client_version")]
    pub client_version: u16,

    /// Development mode flag (auto-registers accounts)
    #[serde(default)]
    pub dev_mode: bool,

    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Connection settings
    #[serde(default)]
    pub net: NetConfig,

    /// Key-value backend selection and retry policy
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// Slot collection capacities
    #[serde(default)]
    pub slots: SlotConfig,

    /// Maps, portals and spawns
    #[serde(default)]
    pub world: WorldConfig,
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Outbound queue depth per session
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Largest accepted inbound frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum concurrent connections per IP
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: usize,

    /// Seconds of silence before a connection is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds shutdown waits for sessions to finish tearing down
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Which key-value backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Key-value backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend implementation
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Attempts for an unavailable backend before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff between retries in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Re-runs of a read-modify-write after a compare-and-swap conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Maximum connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Prefix for every key written by this server
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Slot collection capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    #[serde(default = "default_inventory_size")]
    pub inventory_size: u8,

    #[serde(default = "default_vault_size")]
    pub vault_size: u8,

    #[serde(default = "default_commerce_size")]
    pub commerce_size: u8,
}

/// A position on a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnPoint {
    pub map_id: u16,
    pub x: u16,
    pub y: u16,
}

/// A map and its dimensions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub id: u16,
    pub name: String,
    pub width: u16,
    pub height: u16,
}

impl MapConfig {
    /// Check whether a tile lies inside the map
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }
}

/// A tile that moves the player to another map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    pub map_id: u16,
    pub x: u16,
    pub y: u16,
    pub dest_map: u16,
    pub dest_x: u16,
    pub dest_y: u16,
}

/// An NPC placed when the world starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcSpawnConfig {
    pub npc_type: u16,
    pub map_id: u16,
    pub x: u16,
    pub y: u16,
    /// Tiles the NPC may stray from its spawn (0 = stationary)
    #[serde(default)]
    pub wander_radius: u16,
    /// Ticks before a despawned NPC comes back
    #[serde(default = "default_respawn_ticks")]
    pub respawn_ticks: u64,
    /// Ticks an NPC stays before despawning (unset = stays until removed)
    #[serde(default)]
    pub lifetime_ticks: Option<u64>,
}

/// World layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Where new players appear
    #[serde(default = "default_spawn")]
    pub spawn: SpawnPoint,

    #[serde(default = "default_maps")]
    pub maps: Vec<MapConfig>,

    #[serde(default = "default_portals")]
    pub portals: Vec<PortalConfig>,

    #[serde(default = "default_npc_spawns")]
    pub npc_spawns: Vec<NpcSpawnConfig>,

    /// Ticks before a dropped item disappears
    #[serde(default = "default_ground_item_lifetime")]
    pub ground_item_lifetime_ticks: u64,

    /// Largest single movement step in tiles
    #[serde(default = "default_max_step")]
    pub max_step: u16,
}

// Default value functions
fn default_server_name() -> String {
    "Realm".to_string()
}

fn default_world_id() -> u8 {
    1
}

fn default_game_port() -> u16 {
    40100
}

fn default_websocket_port() -> u16 {
    40101
}

fn default_max_players() -> u32 {
    2000
}

fn default_tick_rate() -> u64 {
    600
}

fn default_autosave_interval() -> u64 {
    300 // 5 minutes
}

fn default_client_version() -> u16 {
    1
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    4096
}

fn default_max_per_ip() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    16
}

fn default_key_prefix() -> String {
    "realm".to_string()
}

fn default_inventory_size() -> u8 {
    28
}

fn default_vault_size() -> u8 {
    20
}

fn default_commerce_size() -> u8 {
    12
}

fn default_respawn_ticks() -> u64 {
    50
}

fn default_ground_item_lifetime() -> u64 {
    200 // 2 minutes at 600ms
}

fn default_max_step() -> u16 {
    2
}

fn default_spawn() -> SpawnPoint {
    SpawnPoint {
        map_id: 0,
        x: 32,
        y: 32,
    }
}

fn default_maps() -> Vec<MapConfig> {
    vec![
        MapConfig {
            id: 0,
            name: "Town".to_string(),
            width: 64,
            height: 64,
        },
        MapConfig {
            id: 1,
            name: "Fields".to_string(),
            width: 64,
            height: 64,
        },
    ]
}

fn default_portals() -> Vec<PortalConfig> {
    vec![
        PortalConfig {
            map_id: 0,
            x: 63,
            y: 32,
            dest_map: 1,
            dest_x: 1,
            dest_y: 32,
        },
        PortalConfig {
            map_id: 1,
            x: 0,
            y: 32,
            dest_map: 0,
            dest_x: 62,
            dest_y: 32,
        },
    ]
}

fn default_npc_spawns() -> Vec<NpcSpawnConfig> {
    vec![
        NpcSpawnConfig {
            npc_type: 1,
            map_id: 0,
            x: 30,
            y: 30,
            wander_radius: 0,
            respawn_ticks: default_respawn_ticks(),
            lifetime_ticks: None,
        },
        NpcSpawnConfig {
            npc_type: 2,
            map_id: 1,
            x: 20,
            y: 20,
            wander_radius: 4,
            respawn_ticks: default_respawn_ticks(),
            lifetime_ticks: None,
        },
    ]
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            max_frame_size: default_max_frame_size(),
            max_per_ip: default_max_per_ip(),
            idle_timeout_secs: default_idle_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Connection URL for the pool
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            inventory_size: default_inventory_size(),
            vault_size: default_vault_size(),
            commerce_size: default_commerce_size(),
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            spawn: default_spawn(),
            maps: default_maps(),
            portals: default_portals(),
            npc_spawns: default_npc_spawns(),
            ground_item_lifetime_ticks: default_ground_item_lifetime(),
            max_step: default_max_step(),
        }
    }
}

impl WorldConfig {
    /// Look up a map by id
    pub fn map(&self, id: u16) -> Option<&MapConfig> {
        self.maps.iter().find(|m| m.id == id)
    }

    /// Portal on a given tile, if any
    pub fn portal_at(&self, map_id: u16, x: u16, y: u16) -> Option<&PortalConfig> {
        self.portals
            .iter()
            .find(|p| p.map_id == map_id && p.x == x && p.y == y)
    }

    /// Check whether a position is a valid tile
    pub fn is_valid_position(&self, map_id: u16, x: u16, y: u16) -> bool {
        self.map(map_id).map(|m| m.contains(x, y)).unwrap_or(false)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            world_id: default_world_id(),
            game_port: default_game_port(),
            websocket_port: default_websocket_port(),
            max_players: default_max_players(),
            tick_rate_ms: default_tick_rate(),
            autosave_interval_secs: default_autosave_interval(),
            client_version: default_client_version(),
            dev_mode: false,
            log_format: default_log_format(),
            net: NetConfig::default(),
            store: StoreConfig::default(),
            redis: RedisConfig::default(),
            slots: SlotConfig::default(),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("REALM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REALM_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("REALM_WORLD_ID") {
            if let Ok(id) = val.parse() {
                self.world_id = id;
            }
        }
        if let Ok(val) = env::var("REALM_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.game_port = port;
            }
        }
        if let Ok(val) = env::var("REALM_WEBSOCKET_PORT") {
            if let Ok(port) = val.parse() {
                self.websocket_port = port;
            }
        }
        if let Ok(val) = env::var("REALM_MAX_PLAYERS") {
            if let Ok(max) = val.parse() {
                self.max_players = max;
            }
        }
        if let Ok(val) = env::var("REALM_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("REALM_LOG_FORMAT") {
            self.log_format = val;
        }
        if let Ok(val) = env::var("REALM_STORE_BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => self.store.backend = StoreBackend::Memory,
                "redis" => self.store.backend = StoreBackend::Redis,
                other => tracing::warn!(backend = %other, "Ignoring unknown store backend"),
            }
        }

        if let Ok(val) = env::var("REALM_REDIS_HOST") {
            self.redis.host = val;
        }
        if let Ok(val) = env::var("REALM_REDIS_PORT") {
            if let Ok(port) = val.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(val) = env::var("REALM_REDIS_KEY_PREFIX") {
            self.redis.key_prefix = val;
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.world_id == 0 {
            anyhow::bail!("World ID must be between 1 and 255");
        }

        if self.game_port == self.websocket_port {
            anyhow::bail!("Game port and WebSocket port must be different");
        }

        if self.max_players == 0 || self.max_players > 10000 {
            anyhow::bail!("Max players must be between 1 and 10000");
        }

        if self.tick_rate_ms < 100 || self.tick_rate_ms > 5000 {
            anyhow::bail!("Tick rate must be between 100ms and 5000ms");
        }

        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("Log format must be \"pretty\" or \"json\"");
        }

        if self.net.outbound_queue == 0 {
            anyhow::bail!("Outbound queue depth must be at least 1");
        }
        if self.net.max_frame_size < 64 || self.net.max_frame_size > u16::MAX as usize {
            anyhow::bail!("Max frame size must be between 64 and 65535 bytes");
        }

        if self.store.retry_attempts == 0 {
            anyhow::bail!("Store retry attempts must be at least 1");
        }

        if self.slots.inventory_size == 0 || self.slots.vault_size == 0 || self.slots.commerce_size == 0
        {
            anyhow::bail!("Slot collections must have at least one slot");
        }

        self.validate_world()
    }

    fn validate_world(&self) -> Result<()> {
        let world = &self.world;

        if world.maps.is_empty() {
            anyhow::bail!("At least one map must be configured");
        }

        let mut ids = HashSet::new();
        for map in &world.maps {
            if !ids.insert(map.id) {
                anyhow::bail!("Duplicate map id {}", map.id);
            }
            if map.width == 0 || map.height == 0 {
                anyhow::bail!("Map {} has no tiles", map.id);
            }
        }

        let spawn = world.spawn;
        if !world.is_valid_position(spawn.map_id, spawn.x, spawn.y) {
            anyhow::bail!(
                "Spawn point ({}, {}) is not on map {}",
                spawn.x,
                spawn.y,
                spawn.map_id
            );
        }

        for portal in &world.portals {
            if portal.dest_map == portal.map_id {
                anyhow::bail!(
                    "Portal at ({}, {}) on map {} leads back to the same map",
                    portal.x,
                    portal.y,
                    portal.map_id
                );
            }
            if !world.is_valid_position(portal.map_id, portal.x, portal.y) {
                anyhow::bail!(
                    "Portal at ({}, {}) is not on map {}",
                    portal.x,
                    portal.y,
                    portal.map_id
                );
            }
            if !world.is_valid_position(portal.dest_map, portal.dest_x, portal.dest_y) {
                anyhow::bail!(
                    "Portal destination ({}, {}) is not on map {}",
                    portal.dest_x,
                    portal.dest_y,
                    portal.dest_map
                );
            }
            if world
                .portal_at(portal.dest_map, portal.dest_x, portal.dest_y)
                .is_some()
            {
                anyhow::bail!(
                    "Portal destination ({}, {}) on map {} is itself a portal",
                    portal.dest_x,
                    portal.dest_y,
                    portal.dest_map
                );
            }
        }

        for spawn in &world.npc_spawns {
            if !world.is_valid_position(spawn.map_id, spawn.x, spawn.y) {
                anyhow::bail!(
                    "NPC spawn ({}, {}) is not on map {}",
                    spawn.x,
                    spawn.y,
                    spawn.map_id
                );
            }
        }

        if world.max_step == 0 {
            anyhow::bail!("Movement step limit must be at least 1");
        }

        Ok(())
    }

    /// Autosave interval converted to world ticks (0 when disabled)
    pub fn autosave_ticks(&self) -> u64 {
        if self.autosave_interval_secs == 0 {
            return 0;
        }
        (self.autosave_interval_secs * 1000 / self.tick_rate_ms.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server_name, "Realm");
        assert_eq!(config.world_id, 1);
        assert_eq!(config.tick_rate_ms, 600);
        assert_eq!(config.slots.inventory_size, 28);
        assert_eq!(config.slots.vault_size, 20);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();

        config.world_id = 0;
        assert!(config.validate().is_err());
        config.world_id = 1;

        config.websocket_port = config.game_port;
        assert!(config.validate().is_err());
        config.websocket_port = default_websocket_port();

        config.slots.vault_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_world_validation() {
        let mut config = ServerConfig::default();
        config.world.spawn = SpawnPoint {
            map_id: 9,
            x: 0,
            y: 0,
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.world.portals[0].dest_map = 42;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        let portal = &mut config.world.portals[0];
        portal.dest_map = portal.map_id;
        let (map_id, dest_x, dest_y) = (portal.map_id, portal.dest_x, portal.dest_y);
        assert!(config.world.is_valid_position(map_id, dest_x, dest_y));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("same map"));

        let mut config = ServerConfig::default();
        let duplicate = config.world.maps[0].clone();
        config.world.maps.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            server_name = "Test"
            dev_mode = true

            [store]
            backend = "redis"

            [slots]
            vault_size = 8

            [world]
            spawn = { map_id = 5, x = 1, y = 1 }
            maps = [{ id = 5, name = "Only", width = 10, height = 10 }]
            portals = []
            npc_spawns = []
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "Test");
        assert!(config.dev_mode);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.slots.vault_size, 8);
        assert_eq!(config.slots.inventory_size, 28);
        assert_eq!(config.world.maps.len(), 1);
        assert!(config.world.is_valid_position(5, 9, 9));
        assert!(!config.world.is_valid_position(5, 10, 9));
    }

    #[test]
    fn test_portal_lookup() {
        let config = ServerConfig::default();
        let portal = config.world.portal_at(0, 63, 32).unwrap();
        assert_eq!(portal.dest_map, 1);
        assert!(config.world.portal_at(0, 10, 10).is_none());
    }

    #[test]
    fn test_autosave_ticks() {
        let mut config = ServerConfig::default();
        assert_eq!(config.autosave_ticks(), 500);

        config.autosave_interval_secs = 0;
        assert_eq!(config.autosave_ticks(), 0);
    }
}
