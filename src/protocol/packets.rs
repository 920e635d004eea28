//! Packet definitions module
//!
//! The message table: every message kind maps to an ordered list of typed
//! fields. Decoding and encoding in [`crate::protocol::codec`] walk these
//! layouts, so the wire format of a message is defined in exactly one place.

use crate::error::DecodeError;
use crate::net::buffer::PacketBuffer;

/// Wire type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    /// u16 length prefix followed by UTF-8 bytes
    Text,
}

impl FieldType {
    /// Encoded size in bytes, `None` for variable-length text
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::U8 => Some(1),
            FieldType::U16 => Some(2),
            FieldType::U32 => Some(4),
            FieldType::Text => None,
        }
    }
}

/// A named field in a message layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty }
}

/// Layout of one message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLayout {
    pub kind: u8,
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl MessageLayout {
    /// Encoded payload size (excluding the kind byte), `None` if any field is text
    pub fn fixed_size(&self) -> Option<usize> {
        self.fields.iter().map(|f| f.ty.fixed_size()).sum()
    }
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Text(String),
}

// ============ Client -> Server kinds ============

pub mod command_kind {
    pub const KEEP_ALIVE: u8 = 0;
    pub const LOGIN: u8 = 1;
    pub const ENTER_WORLD: u8 = 2;
    pub const LOGOUT: u8 = 3;
    pub const CHAT: u8 = 4;
    pub const MOVE: u8 = 5;
    pub const OPEN_VAULT: u8 = 20;
    pub const CLOSE_VAULT: u8 = 21;
    pub const DROP_ITEM: u8 = 30;
    pub const PICK_UP_ITEM: u8 = 31;
    pub const WITHDRAW: u8 = 41;
    pub const DEPOSIT: u8 = 43;
    pub const COMMERCE_OFFER: u8 = 44;
    pub const COMMERCE_RETRACT: u8 = 45;
}

// ============ Server -> Client kinds ============

pub mod event_kind {
    pub const VAULT_OPENED: u8 = 8;
    pub const VAULT_CLOSED: u8 = 9;
    pub const LOGIN_ACCEPTED: u8 = 10;
    pub const LOGIN_REJECTED: u8 = 11;
    pub const MAP_LOADED: u8 = 12;
    pub const PLAYER_APPEARED: u8 = 13;
    pub const PLAYER_DEPARTED: u8 = 14;
    pub const ENTITY_MOVED: u8 = 15;
    pub const NPC_APPEARED: u8 = 16;
    pub const NPC_REMOVED: u8 = 17;
    pub const GROUND_ITEM_APPEARED: u8 = 18;
    pub const GROUND_ITEM_REMOVED: u8 = 19;
    pub const CONSOLE_MESSAGE: u8 = 24;
    pub const CHAT_MESSAGE: u8 = 25;
    pub const INVENTORY_SLOT_UPDATE: u8 = 47;
    pub const VAULT_SLOT_UPDATE: u8 = 48;
    pub const COMMERCE_SLOT_UPDATE: u8 = 49;
}

use FieldType::{Text, U16, U32, U8};

const SLOT_QUANTITY: &[FieldSpec] = &[field("slot", U8), field("quantity", U16)];

const SLOT_UPDATE: &[FieldSpec] = &[
    field("slot", U8),
    field("item_id", U16),
    field("name", Text),
    field("quantity", U16),
    field("graphic_id", U16),
    field("object_type", U8),
    field("max_hit", U16),
    field("min_hit", U16),
    field("max_def", U16),
    field("min_def", U16),
];

const ENTITY: &[FieldSpec] = &[field("entity_id", U32)];

const ENTITY_AT: &[FieldSpec] = &[field("entity_id", U32), field("x", U16), field("y", U16)];

/// Messages the client sends
pub const COMMAND_LAYOUTS: &[MessageLayout] = &[
    MessageLayout {
        kind: command_kind::KEEP_ALIVE,
        name: "KeepAlive",
        fields: &[],
    },
    MessageLayout {
        kind: command_kind::LOGIN,
        name: "Login",
        fields: &[
            field("username", Text),
            field("password", Text),
            field("client_version", U16),
        ],
    },
    MessageLayout {
        kind: command_kind::ENTER_WORLD,
        name: "EnterWorld",
        fields: &[],
    },
    MessageLayout {
        kind: command_kind::LOGOUT,
        name: "Logout",
        fields: &[],
    },
    MessageLayout {
        kind: command_kind::CHAT,
        name: "Chat",
        fields: &[field("message", Text)],
    },
    MessageLayout {
        kind: command_kind::MOVE,
        name: "Move",
        fields: &[field("x", U16), field("y", U16)],
    },
    MessageLayout {
        kind: command_kind::OPEN_VAULT,
        name: "OpenVault",
        fields: &[],
    },
    MessageLayout {
        kind: command_kind::CLOSE_VAULT,
        name: "CloseVault",
        fields: &[],
    },
    MessageLayout {
        kind: command_kind::DROP_ITEM,
        name: "DropItem",
        fields: SLOT_QUANTITY,
    },
    MessageLayout {
        kind: command_kind::PICK_UP_ITEM,
        name: "PickUpItem",
        fields: ENTITY,
    },
    MessageLayout {
        kind: command_kind::WITHDRAW,
        name: "Withdraw",
        fields: SLOT_QUANTITY,
    },
    MessageLayout {
        kind: command_kind::DEPOSIT,
        name: "Deposit",
        fields: SLOT_QUANTITY,
    },
    MessageLayout {
        kind: command_kind::COMMERCE_OFFER,
        name: "CommerceOffer",
        fields: SLOT_QUANTITY,
    },
    MessageLayout {
        kind: command_kind::COMMERCE_RETRACT,
        name: "CommerceRetract",
        fields: SLOT_QUANTITY,
    },
];

/// Messages the server sends
pub const EVENT_LAYOUTS: &[MessageLayout] = &[
    MessageLayout {
        kind: event_kind::VAULT_OPENED,
        name: "VaultOpened",
        fields: &[],
    },
    MessageLayout {
        kind: event_kind::VAULT_CLOSED,
        name: "VaultClosed",
        fields: &[],
    },
    MessageLayout {
        kind: event_kind::LOGIN_ACCEPTED,
        name: "LoginAccepted",
        fields: &[field("owner_id", U32)],
    },
    MessageLayout {
        kind: event_kind::LOGIN_REJECTED,
        name: "LoginRejected",
        fields: &[field("reason", U8)],
    },
    MessageLayout {
        kind: event_kind::MAP_LOADED,
        name: "MapLoaded",
        fields: &[field("map_id", U16), field("x", U16), field("y", U16)],
    },
    MessageLayout {
        kind: event_kind::PLAYER_APPEARED,
        name: "PlayerAppeared",
        fields: &[
            field("entity_id", U32),
            field("name", Text),
            field("x", U16),
            field("y", U16),
        ],
    },
    MessageLayout {
        kind: event_kind::PLAYER_DEPARTED,
        name: "PlayerDeparted",
        fields: ENTITY,
    },
    MessageLayout {
        kind: event_kind::ENTITY_MOVED,
        name: "EntityMoved",
        fields: ENTITY_AT,
    },
    MessageLayout {
        kind: event_kind::NPC_APPEARED,
        name: "NpcAppeared",
        fields: &[
            field("entity_id", U32),
            field("npc_type", U16),
            field("x", U16),
            field("y", U16),
        ],
    },
    MessageLayout {
        kind: event_kind::NPC_REMOVED,
        name: "NpcRemoved",
        fields: ENTITY,
    },
    MessageLayout {
        kind: event_kind::GROUND_ITEM_APPEARED,
        name: "GroundItemAppeared",
        fields: &[
            field("entity_id", U32),
            field("item_id", U16),
            field("quantity", U16),
            field("x", U16),
            field("y", U16),
        ],
    },
    MessageLayout {
        kind: event_kind::GROUND_ITEM_REMOVED,
        name: "GroundItemRemoved",
        fields: ENTITY,
    },
    MessageLayout {
        kind: event_kind::CONSOLE_MESSAGE,
        name: "ConsoleMessage",
        fields: &[field("text", Text), field("style", U8)],
    },
    MessageLayout {
        kind: event_kind::CHAT_MESSAGE,
        name: "ChatMessage",
        fields: &[field("entity_id", U32), field("text", Text)],
    },
    MessageLayout {
        kind: event_kind::INVENTORY_SLOT_UPDATE,
        name: "InventorySlotUpdate",
        fields: SLOT_UPDATE,
    },
    MessageLayout {
        kind: event_kind::VAULT_SLOT_UPDATE,
        name: "VaultSlotUpdate",
        fields: SLOT_UPDATE,
    },
    MessageLayout {
        kind: event_kind::COMMERCE_SLOT_UPDATE,
        name: "CommerceSlotUpdate",
        fields: SLOT_UPDATE,
    },
];

/// Look up the layout of a client message
pub fn command_layout(kind: u8) -> Option<&'static MessageLayout> {
    COMMAND_LAYOUTS.iter().find(|l| l.kind == kind)
}

/// Look up the layout of a server message
pub fn event_layout(kind: u8) -> Option<&'static MessageLayout> {
    EVENT_LAYOUTS.iter().find(|l| l.kind == kind)
}

/// Read every field of `layout` from `buffer`, rejecting trailing bytes
pub fn read_fields(
    buffer: &mut PacketBuffer,
    layout: &MessageLayout,
) -> Result<Vec<FieldValue>, DecodeError> {
    let mut values = Vec::with_capacity(layout.fields.len());
    for spec in layout.fields {
        let value = match spec.ty {
            FieldType::U8 => FieldValue::U8(buffer.read_ubyte(spec.name)?),
            FieldType::U16 => FieldValue::U16(buffer.read_ushort_le(spec.name)?),
            FieldType::U32 => FieldValue::U32(buffer.read_uint_le(spec.name)?),
            FieldType::Text => FieldValue::Text(buffer.read_text(spec.name)?),
        };
        values.push(value);
    }
    buffer.expect_end()?;
    Ok(values)
}

/// Write a kind byte followed by `values`
///
/// Callers build `values` from typed messages, so the values always match the
/// layout for `kind`; a mismatch is a programming error caught by the codec tests.
pub fn write_fields(buffer: &mut PacketBuffer, kind: u8, values: &[FieldValue]) {
    buffer.write_ubyte(kind);
    for value in values {
        match value {
            FieldValue::U8(v) => buffer.write_ubyte(*v),
            FieldValue::U16(v) => buffer.write_ushort_le(*v),
            FieldValue::U32(v) => buffer.write_uint_le(*v),
            FieldValue::Text(v) => buffer.write_text(v),
        }
    }
}

/// Sequential typed access to decoded field values
pub struct FieldReader<'a> {
    layout: &'static MessageLayout,
    values: std::slice::Iter<'a, FieldValue>,
    index: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(layout: &'static MessageLayout, values: &'a [FieldValue]) -> Self {
        Self {
            layout,
            values: values.iter(),
            index: 0,
        }
    }

    fn next(&mut self) -> (&'static str, Option<&'a FieldValue>) {
        let name = self
            .layout
            .fields
            .get(self.index)
            .map(|f| f.name)
            .unwrap_or("unknown");
        self.index += 1;
        (name, self.values.next())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        match self.next() {
            (_, Some(FieldValue::U8(v))) => Ok(*v),
            (field, _) => Err(DecodeError::Truncated { field }),
        }
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        match self.next() {
            (_, Some(FieldValue::U16(v))) => Ok(*v),
            (field, _) => Err(DecodeError::Truncated { field }),
        }
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        match self.next() {
            (_, Some(FieldValue::U32(v))) => Ok(*v),
            (field, _) => Err(DecodeError::Truncated { field }),
        }
    }

    pub fn text(&mut self) -> Result<String, DecodeError> {
        match self.next() {
            (_, Some(FieldValue::Text(v))) => Ok(v.clone()),
            (field, _) => Err(DecodeError::Truncated { field }),
        }
    }

    /// A 1-based slot index; zero is rejected
    pub fn slot(&mut self) -> Result<u8, DecodeError> {
        let slot = self.u8()?;
        if slot == 0 {
            return Err(DecodeError::OutOfRange {
                field: "slot",
                value: 0,
            });
        }
        Ok(slot)
    }
}

/// Presentation style of a console message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsoleStyle {
    Info = 0,
    Warning = 1,
    Error = 2,
    System = 3,
}

impl ConsoleStyle {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Info),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            3 => Some(Self::System),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_kinds_are_unique() {
        let commands: HashSet<u8> = COMMAND_LAYOUTS.iter().map(|l| l.kind).collect();
        assert_eq!(commands.len(), COMMAND_LAYOUTS.len());

        let events: HashSet<u8> = EVENT_LAYOUTS.iter().map(|l| l.kind).collect();
        assert_eq!(events.len(), EVENT_LAYOUTS.len());
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(command_layout(command_kind::DEPOSIT).unwrap().fixed_size(), Some(3));
        assert_eq!(command_layout(command_kind::MOVE).unwrap().fixed_size(), Some(4));
        assert_eq!(command_layout(command_kind::CLOSE_VAULT).unwrap().fixed_size(), Some(0));
        assert_eq!(command_layout(command_kind::CHAT).unwrap().fixed_size(), None);
        assert_eq!(
            event_layout(event_kind::VAULT_SLOT_UPDATE).unwrap().fixed_size(),
            None
        );
    }

    #[test]
    fn test_read_fields() {
        let layout = command_layout(command_kind::WITHDRAW).unwrap();
        let mut buffer = PacketBuffer::from_bytes(&[4, 0x2c, 0x01]);

        let values = read_fields(&mut buffer, layout).unwrap();
        assert_eq!(values, vec![FieldValue::U8(4), FieldValue::U16(300)]);
    }

    #[test]
    fn test_read_fields_rejects_trailing_bytes() {
        let layout = command_layout(command_kind::CLOSE_VAULT).unwrap();
        let mut buffer = PacketBuffer::from_bytes(&[1]);

        assert!(matches!(
            read_fields(&mut buffer, layout),
            Err(DecodeError::OutOfRange { field: "trailing", .. })
        ));
    }

    #[test]
    fn test_field_reader_rejects_zero_slot() {
        let layout = command_layout(command_kind::DEPOSIT).unwrap();
        let values = vec![FieldValue::U8(0), FieldValue::U16(1)];
        let mut reader = FieldReader::new(layout, &values);

        assert_eq!(
            reader.slot(),
            Err(DecodeError::OutOfRange {
                field: "slot",
                value: 0
            })
        );
    }

    #[test]
    fn test_console_style() {
        assert_eq!(ConsoleStyle::from_u8(2), Some(ConsoleStyle::Error));
        assert_eq!(ConsoleStyle::from_u8(9), None);
        assert_eq!(ConsoleStyle::System.as_u8(), 3);
    }
}
