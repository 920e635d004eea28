//! Game module
//!
//! This module contains the world state and the rules that change it:
//! - Slot collections (inventory, vault, commerce) and atomic transfers
//! - Spatial world index and broadcast fan-out
//! - NPCs and ground items
//! - The world tick loop and position persistence

pub mod broadcast;
pub mod catalog;
pub mod ground_item;
pub mod index;
pub mod npc;
pub mod persistence;
pub mod slots;
pub mod transfer;
pub mod world;

pub use slots::{OwnerId, ResourceId};

/// Identifier of a live entity (player, NPC or ground item)
pub type EntityId = u32;

/// Identifier of a map
pub type MapId = u16;

/// Identifier of a connection
pub type SessionId = u64;
