//! Message codec
//!
//! Converts between frames and the closed set of typed messages:
//! [`Command`] for client requests, [`Event`] for server notifications.
//! Decoding never panics; every malformed frame is reported as a
//! [`DecodeError`]. Encoding is total.

use crate::error::{DecodeError, LoginRejection};
use crate::net::buffer::PacketBuffer;
use crate::protocol::packets::{
    command_kind, command_layout, event_kind, event_layout, read_fields, write_fields,
    ConsoleStyle, FieldReader, FieldValue, MessageLayout,
};

/// A request sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    KeepAlive,
    Login {
        username: String,
        password: String,
        client_version: u16,
    },
    EnterWorld,
    Logout,
    Chat {
        message: String,
    },
    Move {
        x: u16,
        y: u16,
    },
    OpenVault,
    CloseVault,
    DropItem {
        slot: u8,
        quantity: u16,
    },
    PickUpItem {
        entity_id: u32,
    },
    Withdraw {
        slot: u8,
        quantity: u16,
    },
    Deposit {
        slot: u8,
        quantity: u16,
    },
    CommerceOffer {
        slot: u8,
        quantity: u16,
    },
    CommerceRetract {
        slot: u8,
        quantity: u16,
    },
}

impl Command {
    /// Message kind byte
    pub fn kind(&self) -> u8 {
        match self {
            Command::KeepAlive => command_kind::KEEP_ALIVE,
            Command::Login { .. } => command_kind::LOGIN,
            Command::EnterWorld => command_kind::ENTER_WORLD,
            Command::Logout => command_kind::LOGOUT,
            Command::Chat { .. } => command_kind::CHAT,
            Command::Move { .. } => command_kind::MOVE,
            Command::OpenVault => command_kind::OPEN_VAULT,
            Command::CloseVault => command_kind::CLOSE_VAULT,
            Command::DropItem { .. } => command_kind::DROP_ITEM,
            Command::PickUpItem { .. } => command_kind::PICK_UP_ITEM,
            Command::Withdraw { .. } => command_kind::WITHDRAW,
            Command::Deposit { .. } => command_kind::DEPOSIT,
            Command::CommerceOffer { .. } => command_kind::COMMERCE_OFFER,
            Command::CommerceRetract { .. } => command_kind::COMMERCE_RETRACT,
        }
    }

    /// Human-readable message name, for logging
    pub fn name(&self) -> &'static str {
        command_layout(self.kind()).map(|l| l.name).unwrap_or("Unknown")
    }

    fn fields(&self) -> Vec<FieldValue> {
        use FieldValue::*;
        match self {
            Command::KeepAlive
            | Command::EnterWorld
            | Command::Logout
            | Command::OpenVault
            | Command::CloseVault => vec![],
            Command::Login {
                username,
                password,
                client_version,
            } => vec![
                Text(username.clone()),
                Text(password.clone()),
                U16(*client_version),
            ],
            Command::Chat { message } => vec![Text(message.clone())],
            Command::Move { x, y } => vec![U16(*x), U16(*y)],
            Command::PickUpItem { entity_id } => vec![U32(*entity_id)],
            Command::DropItem { slot, quantity }
            | Command::Withdraw { slot, quantity }
            | Command::Deposit { slot, quantity }
            | Command::CommerceOffer { slot, quantity }
            | Command::CommerceRetract { slot, quantity } => vec![U8(*slot), U16(*quantity)],
        }
    }
}

/// Contents of one slot as shown to the client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotUpdate {
    pub slot: u8,
    pub item_id: u16,
    pub name: String,
    pub quantity: u16,
    pub graphic_id: u16,
    pub object_type: u8,
    pub max_hit: u16,
    pub min_hit: u16,
    pub max_def: u16,
    pub min_def: u16,
}

impl SlotUpdate {
    /// Update clearing a slot
    pub fn empty(slot: u8) -> Self {
        Self {
            slot,
            ..Default::default()
        }
    }

    fn fields(&self) -> Vec<FieldValue> {
        use FieldValue::*;
        vec![
            U8(self.slot),
            U16(self.item_id),
            Text(self.name.clone()),
            U16(self.quantity),
            U16(self.graphic_id),
            U8(self.object_type),
            U16(self.max_hit),
            U16(self.min_hit),
            U16(self.max_def),
            U16(self.min_def),
        ]
    }

    fn read(f: &mut FieldReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            slot: f.slot()?,
            item_id: f.u16()?,
            name: f.text()?,
            quantity: f.u16()?,
            graphic_id: f.u16()?,
            object_type: f.u8()?,
            max_hit: f.u16()?,
            min_hit: f.u16()?,
            max_def: f.u16()?,
            min_def: f.u16()?,
        })
    }
}

/// A notification sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    VaultOpened,
    VaultClosed,
    LoginAccepted {
        owner_id: u32,
    },
    LoginRejected {
        reason: LoginRejection,
    },
    MapLoaded {
        map_id: u16,
        x: u16,
        y: u16,
    },
    PlayerAppeared {
        entity_id: u32,
        name: String,
        x: u16,
        y: u16,
    },
    PlayerDeparted {
        entity_id: u32,
    },
    EntityMoved {
        entity_id: u32,
        x: u16,
        y: u16,
    },
    NpcAppeared {
        entity_id: u32,
        npc_type: u16,
        x: u16,
        y: u16,
    },
    NpcRemoved {
        entity_id: u32,
    },
    GroundItemAppeared {
        entity_id: u32,
        item_id: u16,
        quantity: u16,
        x: u16,
        y: u16,
    },
    GroundItemRemoved {
        entity_id: u32,
    },
    ConsoleMessage {
        text: String,
        style: ConsoleStyle,
    },
    ChatMessage {
        entity_id: u32,
        text: String,
    },
    InventorySlotUpdate(SlotUpdate),
    VaultSlotUpdate(SlotUpdate),
    CommerceSlotUpdate(SlotUpdate),
}

impl Event {
    /// Console message with the given style
    pub fn console(text: impl Into<String>, style: ConsoleStyle) -> Self {
        Event::ConsoleMessage {
            text: text.into(),
            style,
        }
    }

    /// Message kind byte
    pub fn kind(&self) -> u8 {
        match self {
            Event::VaultOpened => event_kind::VAULT_OPENED,
            Event::VaultClosed => event_kind::VAULT_CLOSED,
            Event::LoginAccepted { .. } => event_kind::LOGIN_ACCEPTED,
            Event::LoginRejected { .. } => event_kind::LOGIN_REJECTED,
            Event::MapLoaded { .. } => event_kind::MAP_LOADED,
            Event::PlayerAppeared { .. } => event_kind::PLAYER_APPEARED,
            Event::PlayerDeparted { .. } => event_kind::PLAYER_DEPARTED,
            Event::EntityMoved { .. } => event_kind::ENTITY_MOVED,
            Event::NpcAppeared { .. } => event_kind::NPC_APPEARED,
            Event::NpcRemoved { .. } => event_kind::NPC_REMOVED,
            Event::GroundItemAppeared { .. } => event_kind::GROUND_ITEM_APPEARED,
            Event::GroundItemRemoved { .. } => event_kind::GROUND_ITEM_REMOVED,
            Event::ConsoleMessage { .. } => event_kind::CONSOLE_MESSAGE,
            Event::ChatMessage { .. } => event_kind::CHAT_MESSAGE,
            Event::InventorySlotUpdate(_) => event_kind::INVENTORY_SLOT_UPDATE,
            Event::VaultSlotUpdate(_) => event_kind::VAULT_SLOT_UPDATE,
            Event::CommerceSlotUpdate(_) => event_kind::COMMERCE_SLOT_UPDATE,
        }
    }

    /// Human-readable message name, for logging
    pub fn name(&self) -> &'static str {
        event_layout(self.kind()).map(|l| l.name).unwrap_or("Unknown")
    }

    fn fields(&self) -> Vec<FieldValue> {
        use FieldValue::*;
        match self {
            Event::VaultOpened | Event::VaultClosed => vec![],
            Event::LoginAccepted { owner_id } => vec![U32(*owner_id)],
            Event::LoginRejected { reason } => vec![U8(reason.as_u8())],
            Event::MapLoaded { map_id, x, y } => vec![U16(*map_id), U16(*x), U16(*y)],
            Event::PlayerAppeared {
                entity_id,
                name,
                x,
                y,
            } => vec![U32(*entity_id), Text(name.clone()), U16(*x), U16(*y)],
            Event::PlayerDeparted { entity_id }
            | Event::NpcRemoved { entity_id }
            | Event::GroundItemRemoved { entity_id } => vec![U32(*entity_id)],
            Event::EntityMoved { entity_id, x, y } => vec![U32(*entity_id), U16(*x), U16(*y)],
            Event::NpcAppeared {
                entity_id,
                npc_type,
                x,
                y,
            } => vec![U32(*entity_id), U16(*npc_type), U16(*x), U16(*y)],
            Event::GroundItemAppeared {
                entity_id,
                item_id,
                quantity,
                x,
                y,
            } => vec![
                U32(*entity_id),
                U16(*item_id),
                U16(*quantity),
                U16(*x),
                U16(*y),
            ],
            Event::ConsoleMessage { text, style } => vec![Text(text.clone()), U8(style.as_u8())],
            Event::ChatMessage { entity_id, text } => vec![U32(*entity_id), Text(text.clone())],
            Event::InventorySlotUpdate(update)
            | Event::VaultSlotUpdate(update)
            | Event::CommerceSlotUpdate(update) => update.fields(),
        }
    }
}

fn read_payload(
    bytes: &[u8],
    lookup: fn(u8) -> Option<&'static MessageLayout>,
) -> Result<(u8, &'static MessageLayout, Vec<FieldValue>), DecodeError> {
    let mut buffer = PacketBuffer::from_bytes(bytes);
    let kind = buffer.read_ubyte("kind")?;
    let layout = lookup(kind).ok_or(DecodeError::UnknownKind(kind))?;
    let values = read_fields(&mut buffer, layout)?;
    Ok((kind, layout, values))
}

/// Decode a client frame into a command
pub fn decode(bytes: &[u8]) -> Result<Command, DecodeError> {
    let (kind, layout, values) = read_payload(bytes, command_layout)?;
    let mut f = FieldReader::new(layout, &values);

    let command = match kind {
        command_kind::KEEP_ALIVE => Command::KeepAlive,
        command_kind::LOGIN => Command::Login {
            username: f.text()?,
            password: f.text()?,
            client_version: f.u16()?,
        },
        command_kind::ENTER_WORLD => Command::EnterWorld,
        command_kind::LOGOUT => Command::Logout,
        command_kind::CHAT => Command::Chat { message: f.text()? },
        command_kind::MOVE => Command::Move {
            x: f.u16()?,
            y: f.u16()?,
        },
        command_kind::OPEN_VAULT => Command::OpenVault,
        command_kind::CLOSE_VAULT => Command::CloseVault,
        command_kind::DROP_ITEM => Command::DropItem {
            slot: f.slot()?,
            quantity: f.u16()?,
        },
        command_kind::PICK_UP_ITEM => Command::PickUpItem {
            entity_id: f.u32()?,
        },
        command_kind::WITHDRAW => Command::Withdraw {
            slot: f.slot()?,
            quantity: f.u16()?,
        },
        command_kind::DEPOSIT => Command::Deposit {
            slot: f.slot()?,
            quantity: f.u16()?,
        },
        command_kind::COMMERCE_OFFER => Command::CommerceOffer {
            slot: f.slot()?,
            quantity: f.u16()?,
        },
        command_kind::COMMERCE_RETRACT => Command::CommerceRetract {
            slot: f.slot()?,
            quantity: f.u16()?,
        },
        _ => return Err(DecodeError::UnknownKind(kind)),
    };

    Ok(command)
}

/// Encode a command into a client frame
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut buffer = PacketBuffer::with_capacity(16);
    write_fields(&mut buffer, command.kind(), &command.fields());
    buffer.into_vec()
}

/// Encode an event into a server frame
pub fn encode(event: &Event) -> Vec<u8> {
    let mut buffer = PacketBuffer::with_capacity(32);
    write_fields(&mut buffer, event.kind(), &event.fields());
    buffer.into_vec()
}

/// Decode a server frame into an event
pub fn decode_event(bytes: &[u8]) -> Result<Event, DecodeError> {
    let (kind, layout, values) = read_payload(bytes, event_layout)?;
    let mut f = FieldReader::new(layout, &values);

    let event = match kind {
        event_kind::VAULT_OPENED => Event::VaultOpened,
        event_kind::VAULT_CLOSED => Event::VaultClosed,
        event_kind::LOGIN_ACCEPTED => Event::LoginAccepted { owner_id: f.u32()? },
        event_kind::LOGIN_REJECTED => {
            let value = f.u8()?;
            let reason = LoginRejection::from_u8(value).ok_or(DecodeError::OutOfRange {
                field: "reason",
                value: value as u64,
            })?;
            Event::LoginRejected { reason }
        }
        event_kind::MAP_LOADED => Event::MapLoaded {
            map_id: f.u16()?,
            x: f.u16()?,
            y: f.u16()?,
        },
        event_kind::PLAYER_APPEARED => Event::PlayerAppeared {
            entity_id: f.u32()?,
            name: f.text()?,
            x: f.u16()?,
            y: f.u16()?,
        },
        event_kind::PLAYER_DEPARTED => Event::PlayerDeparted {
            entity_id: f.u32()?,
        },
        event_kind::ENTITY_MOVED => Event::EntityMoved {
            entity_id: f.u32()?,
            x: f.u16()?,
            y: f.u16()?,
        },
        event_kind::NPC_APPEARED => Event::NpcAppeared {
            entity_id: f.u32()?,
            npc_type: f.u16()?,
            x: f.u16()?,
            y: f.u16()?,
        },
        event_kind::NPC_REMOVED => Event::NpcRemoved {
            entity_id: f.u32()?,
        },
        event_kind::GROUND_ITEM_APPEARED => Event::GroundItemAppeared {
            entity_id: f.u32()?,
            item_id: f.u16()?,
            quantity: f.u16()?,
            x: f.u16()?,
            y: f.u16()?,
        },
        event_kind::GROUND_ITEM_REMOVED => Event::GroundItemRemoved {
            entity_id: f.u32()?,
        },
        event_kind::CONSOLE_MESSAGE => {
            let text = f.text()?;
            let value = f.u8()?;
            let style = ConsoleStyle::from_u8(value).ok_or(DecodeError::OutOfRange {
                field: "style",
                value: value as u64,
            })?;
            Event::ConsoleMessage { text, style }
        }
        event_kind::CHAT_MESSAGE => Event::ChatMessage {
            entity_id: f.u32()?,
            text: f.text()?,
        },
        event_kind::INVENTORY_SLOT_UPDATE => Event::InventorySlotUpdate(SlotUpdate::read(&mut f)?),
        event_kind::VAULT_SLOT_UPDATE => Event::VaultSlotUpdate(SlotUpdate::read(&mut f)?),
        event_kind::COMMERCE_SLOT_UPDATE => Event::CommerceSlotUpdate(SlotUpdate::read(&mut f)?),
        _ => return Err(DecodeError::UnknownKind(kind)),
    };

    Ok(event)
}
