//! Error handling module
//!
//! Defines the error taxonomy for the realm server:
//! - `DecodeError` for malformed frames (connection-fatal)
//! - `ValidationError` for requests that are well formed but not allowed
//! - `SlotError` / `TransferError` for slot collection business rules
//! - `StoreError` for the key-value backend
//! - `WorldError` for world index placement
//!
//! Everything except decode and network failures is converted into a console
//! message for the player via [`RealmError::user_message`].

use std::io;

use thiserror::Error;

/// Main error type for the realm server
#[derive(Error, Debug)]
pub enum RealmError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Malformed frame
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Slot collection errors
    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    /// Transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Key-value backend errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// World index errors
    #[error("World error: {0}")]
    World(#[from] WorldError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealmError {
    /// Whether this error must terminate the connection that produced it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RealmError::Network(_) | RealmError::Decode(_) | RealmError::Io(_)
        )
    }

    /// Text shown to the player when a request fails
    pub fn user_message(&self) -> String {
        match self {
            RealmError::Validation(e) => e.to_string(),
            RealmError::Slot(e) => e.user_message(),
            RealmError::Transfer(e) => e.user_message(),
            RealmError::Auth(e) => e.to_string(),
            RealmError::Store(_) => StoreError::USER_MESSAGE.to_string(),
            RealmError::World(WorldError::UnknownMap(_)) => {
                ValidationError::UnknownMap(0).to_string()
            }
            RealmError::World(WorldError::MapFull(_)) => "There is no room here.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Frame decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid username or password.")]
    InvalidCredentials,

    #[error("Your account has been disabled.")]
    AccountDisabled,

    #[error("Your account is already logged in.")]
    AlreadyLoggedIn,

    #[error("The world is full.")]
    WorldFull,

    #[error("Client version {actual} is not supported (expected {expected}).")]
    BadClientVersion { expected: u16, actual: u16 },

    #[error("Invalid username format")]
    InvalidUsername,

    #[error("Invalid password format")]
    InvalidPassword,

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

/// Requests that decode correctly but are not allowed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("You are not logged in.")]
    NotLoggedIn,

    #[error("You are already in the world.")]
    AlreadyInWorld,

    #[error("Your vault is not open.")]
    VaultClosed,

    #[error("You must enter a quantity greater than zero.")]
    ZeroQuantity,

    #[error("You can't move there.")]
    InvalidLocation { map_id: u16, x: u16, y: u16 },

    #[error("That map does not exist.")]
    UnknownMap(u16),

    #[error("You can't reach that.")]
    OutOfReach,

    #[error("That item is no longer there.")]
    EntityNotFound(u32),

    #[error("You can't say that.")]
    InvalidChat,
}

/// Slot collection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Slot {slot} is not a valid {kind} slot")]
    InvalidSlot { kind: &'static str, slot: u8 },

    #[error("Slot {slot} already holds item {held}")]
    SlotOccupied { slot: u8, held: u16 },

    #[error("Slot {slot} holds {held}, cannot remove {requested}")]
    InsufficientQuantity { slot: u8, held: u32, requested: u32 },

    #[error("No free {kind} slot")]
    SlotsFull { kind: &'static str },

    #[error("Quantity must be greater than zero")]
    ZeroQuantity,

    #[error("Slot {slot} cannot hold that many items")]
    Overflow { slot: u8 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SlotError {
    pub fn user_message(&self) -> String {
        match self {
            SlotError::InvalidSlot { .. } => "That slot does not exist.".to_string(),
            SlotError::SlotOccupied { .. } => "That slot is already in use.".to_string(),
            SlotError::InsufficientQuantity { .. } => {
                "You don't have that many of that item.".to_string()
            }
            SlotError::SlotsFull { kind } => format!("Your {} is full.", kind),
            SlotError::ZeroQuantity => ValidationError::ZeroQuantity.to_string(),
            SlotError::Overflow { .. } => "You can't carry any more of that item.".to_string(),
            SlotError::Store(_) => StoreError::USER_MESSAGE.to_string(),
        }
    }
}

/// Resource transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Not enough of item {resource_id}: held {held}, requested {requested}")]
    InsufficientQuantity {
        resource_id: u16,
        held: u32,
        requested: u32,
    },

    #[error("No space in {kind}")]
    InsufficientSpace { kind: &'static str },

    #[error("Source and destination are the same collection")]
    SameCollection,

    #[error(transparent)]
    Slot(SlotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    pub fn user_message(&self) -> String {
        match self {
            TransferError::InsufficientQuantity { .. } => {
                "You don't have that many of that item.".to_string()
            }
            TransferError::InsufficientSpace { kind } => format!("Your {} is full.", kind),
            TransferError::SameCollection => "You can't do that.".to_string(),
            TransferError::Slot(e) => e.user_message(),
            TransferError::Store(_) => StoreError::USER_MESSAGE.to_string(),
        }
    }
}

/// World index errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("Map {0} does not exist")]
    UnknownMap(u16),

    #[error("Entity {0} is already placed")]
    AlreadyPlaced(u32),

    #[error("Entity {0} is not placed on map {1}")]
    NotPlaced(u32, u16),

    #[error("Map {0} cannot hold more entities")]
    MapFull(u16),

    #[error("Transition from map {0} to itself")]
    SameMap(u16),
}

/// Key-value backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Concurrent modification of {key}")]
    ConcurrencyConflict { key: String },

    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Generic text shown when the backend gives up
    pub const USER_MESSAGE: &'static str = "The server is busy. Please try again shortly.";
}

/// Result type alias for realm operations
pub type Result<T> = std::result::Result<T, RealmError>;

/// Reason codes carried by a login rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginRejection {
    /// Invalid username or password
    InvalidCredentials = 1,
    /// Account is disabled
    AccountDisabled = 2,
    /// Account is already logged in
    AlreadyLoggedIn = 3,
    /// World is full
    WorldFull = 4,
    /// Client version not supported
    BadClientVersion = 5,
}

impl LoginRejection {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::InvalidCredentials),
            2 => Some(Self::AccountDisabled),
            3 => Some(Self::AlreadyLoggedIn),
            4 => Some(Self::WorldFull),
            5 => Some(Self::BadClientVersion),
            _ => None,
        }
    }
}

impl From<&AuthError> for LoginRejection {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::AccountDisabled => LoginRejection::AccountDisabled,
            AuthError::AlreadyLoggedIn => LoginRejection::AlreadyLoggedIn,
            AuthError::WorldFull => LoginRejection::WorldFull,
            AuthError::BadClientVersion { .. } => LoginRejection::BadClientVersion,
            _ => LoginRejection::InvalidCredentials,
        }
    }
}
