//! Protocol module
//!
//! Binary protocol for the realm server:
//! - Message table (kinds and typed field layouts)
//! - Codec between frames and typed commands/events

pub mod codec;
pub mod packets;

pub use codec::{decode, decode_event, encode, encode_command, Command, Event, SlotUpdate};
pub use packets::ConsoleStyle;
