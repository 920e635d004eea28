//! Networking module
//!
//! This module handles all network-related functionality for the realm server:
//! - TCP and WebSocket framing
//! - Session management
//! - Command dispatch
//! - Connection lifecycle

pub mod buffer;
pub mod dispatcher;
pub mod handler;
pub mod session;
pub mod transport;
