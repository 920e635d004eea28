//! Resource catalog
//!
//! Read-only lookup of display data for resource ids, used when building
//! slot updates for the client:
//! - Name and inventory graphic
//! - Object type (what kind of thing the client should render)
//! - Hit and defence stat ranges

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::SlotUpdate;

/// Name shown for resource ids the catalog does not know
pub const UNKNOWN_ITEM_NAME: &str = "Unknown item";

/// Rendering category of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    #[default]
    Misc = 0,
    Weapon = 1,
    Armour = 2,
    Resource = 3,
    Currency = 4,
}

impl ObjectType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Display data for one resource id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDefinition {
    pub id: u16,
    pub name: String,
    pub graphic_id: u16,
    pub object_type: ObjectType,
    pub min_hit: u16,
    pub max_hit: u16,
    pub min_def: u16,
    pub max_def: u16,
}

impl ItemDefinition {
    pub fn new(id: u16, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            graphic_id: id,
            object_type: ObjectType::Misc,
            min_hit: 0,
            max_hit: 0,
            min_def: 0,
            max_def: 0,
        }
    }

    /// Placeholder for ids missing from the catalog
    pub fn unknown(id: u16) -> Self {
        Self {
            graphic_id: 0,
            ..Self::new(id, UNKNOWN_ITEM_NAME)
        }
    }

    /// Builder method - set graphic
    pub fn graphic(mut self, graphic_id: u16) -> Self {
        self.graphic_id = graphic_id;
        self
    }

    /// Builder method - set object type
    pub fn object_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = object_type;
        self
    }

    /// Builder method - set hit range
    pub fn hit(mut self, min: u16, max: u16) -> Self {
        self.min_hit = min;
        self.max_hit = max;
        self
    }

    /// Builder method - set defence range
    pub fn defence(mut self, min: u16, max: u16) -> Self {
        self.min_def = min;
        self.max_def = max;
        self
    }

    /// Slot update showing `quantity` of this resource in `slot`.
    ///
    /// Quantities above `u16::MAX` are clamped for the wire.
    pub fn slot_update(&self, slot: u8, quantity: u32) -> SlotUpdate {
        SlotUpdate {
            slot,
            item_id: self.id,
            name: self.name.clone(),
            quantity: quantity.min(u16::MAX as u32) as u16,
            graphic_id: self.graphic_id,
            object_type: self.object_type.as_u8(),
            max_hit: self.max_hit,
            min_hit: self.min_hit,
            max_def: self.max_def,
            min_def: self.min_def,
        }
    }
}

/// Catalog lookup contract
pub trait Catalog: Send + Sync {
    /// Definition for `resource_id`; unknown ids yield a placeholder
    fn lookup(&self, resource_id: u16) -> ItemDefinition;
}

/// Catalog backed by a built-in table
pub struct StaticCatalog {
    items: HashMap<u16, ItemDefinition>,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::with_common_items()
    }
}

impl StaticCatalog {
    /// Create an empty catalog
    pub fn empty() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Create a catalog with the built-in items loaded
    pub fn with_common_items() -> Self {
        let mut catalog = Self::empty();
        catalog.load_common_items();
        catalog
    }

    fn load_common_items(&mut self) {
        self.add(
            ItemDefinition::new(1, "Coins")
                .graphic(10)
                .object_type(ObjectType::Currency),
        );
        self.add(
            ItemDefinition::new(2, "Logs")
                .graphic(14)
                .object_type(ObjectType::Resource),
        );
        self.add(
            ItemDefinition::new(3, "Copper ore")
                .graphic(20)
                .object_type(ObjectType::Resource),
        );
        self.add(
            ItemDefinition::new(4, "Raw shrimp")
                .graphic(25)
                .object_type(ObjectType::Resource),
        );
        self.add(
            ItemDefinition::new(5, "Bronze dagger")
                .graphic(40)
                .object_type(ObjectType::Weapon)
                .hit(1, 4),
        );
        self.add(
            ItemDefinition::new(6, "Bronze sword")
                .graphic(41)
                .object_type(ObjectType::Weapon)
                .hit(2, 6),
        );
        self.add(
            ItemDefinition::new(7, "Wooden shield")
                .graphic(60)
                .object_type(ObjectType::Armour)
                .defence(1, 3),
        );
        self.add(
            ItemDefinition::new(8, "Leather body")
                .graphic(61)
                .object_type(ObjectType::Armour)
                .defence(2, 5),
        );
        self.add(
            ItemDefinition::new(9, "Bones")
                .graphic(30)
                .object_type(ObjectType::Resource),
        );
        self.add(ItemDefinition::new(10, "Tinderbox").graphic(31));
    }

    /// Add or replace a definition
    pub fn add(&mut self, item: ItemDefinition) {
        self.items.insert(item.id, item);
    }

    pub fn get(&self, id: u16) -> Option<&ItemDefinition> {
        self.items.get(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn lookup(&self, resource_id: u16) -> ItemDefinition {
        self.items
            .get(&resource_id)
            .cloned()
            .unwrap_or_else(|| ItemDefinition::unknown(resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_items_loaded() {
        let catalog = StaticCatalog::with_common_items();
        assert!(!catalog.is_empty());

        let coins = catalog.lookup(1);
        assert_eq!(coins.name, "Coins");
        assert_eq!(coins.object_type, ObjectType::Currency);
    }

    #[test]
    fn test_unknown_item() {
        let catalog = StaticCatalog::empty();
        let item = catalog.lookup(999);
        assert_eq!(item.id, 999);
        assert_eq!(item.name, UNKNOWN_ITEM_NAME);
        assert_eq!(item.max_hit, 0);
    }

    #[test]
    fn test_slot_update_clamps_quantity() {
        let item = ItemDefinition::new(5, "Bronze dagger").hit(1, 4);
        let update = item.slot_update(2, 100_000);
        assert_eq!(update.slot, 2);
        assert_eq!(update.quantity, u16::MAX);
        assert_eq!(update.min_hit, 1);
        assert_eq!(update.max_hit, 4);
    }
}
