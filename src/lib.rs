//! Realm Server Library
//!
//! Authoritative core of a persistent multiplayer world server.
//!
//! ## Modules
//!
//! - `auth` - Authentication collaborator
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Slot collections, transfers, world index, broadcast and tick loop
//! - `net` - Framing, sessions and command dispatch
//! - `protocol` - Binary message table and codec
//! - `store` - Key-value backends

pub mod auth;
pub mod config;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{RealmError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
