//! Slot collections
//!
//! Every player owns three fixed-size slot collections (inventory, vault and
//! commerce shelf), stored as one backend hash per collection with a field
//! per non-empty slot. All access goes through [`SlotStore`]:
//! - A per-owner critical section ([`OwnerSlots`]) serializes operations on
//!   one owner's collections while different owners proceed concurrently
//! - Each single-slot write is a compare-and-swap, re-run on conflict
//! - Changes spanning collections are planned against a [`SlotsView`] and
//!   land in one multi-key commit, so they are never half-applied
//! - Backend outages are retried with backoff by the [`RetryPolicy`]

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::config::SlotConfig;
use crate::error::{SlotError, StoreError};
use crate::protocol::{Event, SlotUpdate};
use crate::store::{HashWrite, KeySpace, RetryPolicy, SharedBackend};

/// Account-level identity that owns slot collections
pub type OwnerId = u32;

/// Resource (item) id
pub type ResourceId = u16;

/// Named slot collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Inventory,
    Vault,
    Commerce,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Inventory,
        CollectionKind::Vault,
        CollectionKind::Commerce,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Inventory => "inventory",
            CollectionKind::Vault => "vault",
            CollectionKind::Commerce => "commerce",
        }
    }

    /// Wrap a slot update in the event for this collection
    pub fn slot_event(self, update: SlotUpdate) -> Event {
        match self {
            CollectionKind::Inventory => Event::InventorySlotUpdate(update),
            CollectionKind::Vault => Event::VaultSlotUpdate(update),
            CollectionKind::Commerce => Event::CommerceSlotUpdate(update),
        }
    }
}

/// Contents of a non-empty slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(rename = "id")]
    pub resource_id: ResourceId,
    #[serde(rename = "qty")]
    pub quantity: u32,
}

impl Slot {
    pub fn new(resource_id: ResourceId, quantity: u32) -> Self {
        Self {
            resource_id,
            quantity,
        }
    }
}

fn slot_field(slot: u8) -> String {
    format!("slot_{}", slot)
}

fn parse_field(field: &str) -> Option<u8> {
    field.strip_prefix("slot_")?.parse().ok()
}

fn decode_slot(key: &str, raw: Option<&str>) -> Result<Option<Slot>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let slot: Slot = serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if slot.quantity == 0 {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "stored slot with zero quantity".to_string(),
        });
    }
    Ok(Some(slot))
}

/// Non-empty slots of a stored hash within `capacity`, ordered by index
fn decode_collection(
    key: &str,
    capacity: u8,
    hash: &HashMap<String, String>,
) -> Result<Vec<(u8, Slot)>, StoreError> {
    let mut slots = Vec::with_capacity(hash.len());
    for (field, raw) in hash {
        let Some(index) = parse_field(field).filter(|i| (1..=capacity).contains(i)) else {
            continue;
        };
        if let Some(slot) = decode_slot(key, Some(raw))? {
            slots.push((index, slot));
        }
    }
    slots.sort_by_key(|(index, _)| *index);
    Ok(slots)
}

/// Lowest index not present in `occupied`, which is sorted
fn lowest_free(occupied: &[(u8, Slot)], capacity: u8) -> Option<u8> {
    let mut free = 1u16;
    for (index, _) in occupied {
        if u16::from(*index) != free {
            break;
        }
        free += 1;
    }
    (free <= u16::from(capacity)).then_some(free as u8)
}

fn encode_slot(key: &str, slot: &Slot) -> Result<String, StoreError> {
    serde_json::to_string(slot).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Atomic operations over per-owner slot collections
pub struct SlotStore {
    backend: SharedBackend,
    keys: KeySpace,
    capacities: SlotConfig,
    retry: RetryPolicy,
    locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

impl SlotStore {
    pub fn new(
        backend: SharedBackend,
        keys: KeySpace,
        capacities: SlotConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            keys,
            capacities,
            retry,
            locks: DashMap::new(),
        }
    }

    /// Number of slots in a collection
    pub fn capacity(&self, kind: CollectionKind) -> u8 {
        match kind {
            CollectionKind::Inventory => self.capacities.inventory_size,
            CollectionKind::Vault => self.capacities.vault_size,
            CollectionKind::Commerce => self.capacities.commerce_size,
        }
    }

    /// Enter the owner's critical section.
    ///
    /// Held across every step of a multi-slot operation; other callers for
    /// the same owner wait here.
    pub async fn lock(&self, owner: OwnerId) -> OwnerSlots<'_> {
        let mutex = self.locks.entry(owner).or_default().clone();
        let guard = mutex.lock_owned().await;
        OwnerSlots {
            store: self,
            owner,
            _guard: guard,
        }
    }

    /// Drop the owner's lock entry if nobody is using it
    pub fn release_owner(&self, owner: OwnerId) {
        self.locks
            .remove_if(&owner, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub async fn get(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        slot: u8,
    ) -> Result<Option<Slot>, SlotError> {
        self.lock(owner).await.get(kind, slot).await
    }

    pub async fn list_non_empty(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
    ) -> Result<Vec<(u8, Slot)>, SlotError> {
        self.lock(owner).await.list_non_empty(kind).await
    }

    pub async fn put(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        slot: u8,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Result<Slot, SlotError> {
        self.lock(owner)
            .await
            .put(kind, slot, resource_id, quantity)
            .await
    }

    pub async fn remove(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        slot: u8,
        quantity: u32,
    ) -> Result<Option<Slot>, SlotError> {
        self.lock(owner).await.remove(kind, slot, quantity).await
    }

    pub async fn find_free_or_stack(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        resource_id: ResourceId,
    ) -> Result<u8, SlotError> {
        self.lock(owner)
            .await
            .find_free_or_stack(kind, resource_id)
            .await
    }
}

/// One owner's collections, held exclusively
pub struct OwnerSlots<'a> {
    store: &'a SlotStore,
    owner: OwnerId,
    _guard: OwnedMutexGuard<()>,
}

impl OwnerSlots<'_> {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    fn check_slot(&self, kind: CollectionKind, slot: u8) -> Result<(), SlotError> {
        if slot == 0 || slot > self.store.capacity(kind) {
            return Err(SlotError::InvalidSlot {
                kind: kind.as_str(),
                slot,
            });
        }
        Ok(())
    }

    fn key(&self, kind: CollectionKind) -> String {
        self.store.keys.slots(kind.as_str(), self.owner)
    }

    /// Read one slot
    pub async fn get(&self, kind: CollectionKind, slot: u8) -> Result<Option<Slot>, SlotError> {
        self.check_slot(kind, slot)?;
        let key = self.key(kind);
        let field = slot_field(slot);
        let backend = &self.store.backend;

        let raw = self
            .store
            .retry
            .run("slots.get", || backend.hget(&key, &field))
            .await?;
        Ok(decode_slot(&key, raw.as_deref())?)
    }

    /// Every non-empty slot, ordered by slot index
    pub async fn list_non_empty(&self, kind: CollectionKind) -> Result<Vec<(u8, Slot)>, SlotError> {
        let key = self.key(kind);
        let backend = &self.store.backend;
        let capacity = self.store.capacity(kind);

        let hash = self
            .store
            .retry
            .run("slots.list", || backend.hgetall(&key))
            .await?;
        Ok(decode_collection(&key, capacity, &hash)?)
    }

    /// Add `quantity` of `resource_id` to `slot`, stacking onto a matching
    /// resource. Returns the slot's new contents.
    pub async fn put(
        &self,
        kind: CollectionKind,
        slot: u8,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Result<Slot, SlotError> {
        if quantity == 0 {
            return Err(SlotError::ZeroQuantity);
        }

        let updated = self
            .update(kind, slot, |current| match current {
                None => Ok(Some(Slot::new(resource_id, quantity))),
                Some(held) if held.resource_id == resource_id => {
                    let total = held
                        .quantity
                        .checked_add(quantity)
                        .ok_or(SlotError::Overflow { slot })?;
                    Ok(Some(Slot::new(resource_id, total)))
                }
                Some(held) => Err(SlotError::SlotOccupied {
                    slot,
                    held: held.resource_id,
                }),
            })
            .await?;

        Ok(updated.unwrap_or(Slot::new(resource_id, quantity)))
    }

    /// Take `quantity` out of `slot`. Returns the slot's new contents,
    /// `None` once it is empty.
    pub async fn remove(
        &self,
        kind: CollectionKind,
        slot: u8,
        quantity: u32,
    ) -> Result<Option<Slot>, SlotError> {
        if quantity == 0 {
            return Err(SlotError::ZeroQuantity);
        }

        self.update(kind, slot, |current| {
            let held = current.map_or(0, |s| s.quantity);
            if held < quantity {
                return Err(SlotError::InsufficientQuantity {
                    slot,
                    held,
                    requested: quantity,
                });
            }
            Ok(current
                .filter(|_| held > quantity)
                .map(|s| Slot::new(s.resource_id, held - quantity)))
        })
        .await
    }

    /// Slot already holding `resource_id`, else the lowest empty slot
    pub async fn find_free_or_stack(
        &self,
        kind: CollectionKind,
        resource_id: ResourceId,
    ) -> Result<u8, SlotError> {
        let occupied = self.list_non_empty(kind).await?;

        if let Some((index, _)) = occupied
            .iter()
            .find(|(_, slot)| slot.resource_id == resource_id)
        {
            return Ok(*index);
        }

        lowest_free(&occupied, self.store.capacity(kind)).ok_or(SlotError::SlotsFull {
            kind: kind.as_str(),
        })
    }

    /// Read `kinds`, plan against what was read, and write every planned
    /// change in one commit. A conflict re-reads and re-plans.
    pub async fn commit<T, F>(&self, kinds: &[CollectionKind], plan: F) -> Result<T, SlotError>
    where
        F: Fn(&SlotsView) -> Result<(T, Vec<SlotChange>), SlotError>,
    {
        let backend = &self.store.backend;
        let plan = &plan;

        let (value, changes) = self
            .store
            .retry
            .run("slots.commit", move || async move {
                let mut collections = Vec::with_capacity(kinds.len());
                for &kind in kinds {
                    let key = self.key(kind);
                    let raw = backend.hgetall(&key).await?;
                    let capacity = self.store.capacity(kind);
                    let slots = decode_collection(&key, capacity, &raw)?;
                    collections.push(ViewedCollection {
                        kind,
                        key,
                        capacity,
                        raw,
                        slots,
                    });
                }
                let view = SlotsView { collections };

                let (value, changes) = match plan(&view) {
                    Ok(planned) => planned,
                    Err(e) => return Ok(Err(e)),
                };
                let writes = match view.writes(&changes)? {
                    Ok(writes) => writes,
                    Err(e) => return Ok(Err(e)),
                };

                if !backend.hcommit(&writes).await? {
                    let keys: Vec<&str> = writes.iter().map(|w| w.key.as_str()).collect();
                    return Err(StoreError::ConcurrencyConflict {
                        key: keys.join(","),
                    });
                }
                Ok::<_, StoreError>(Ok((value, changes)))
            })
            .await??;

        for change in &changes {
            trace!(
                owner = self.owner,
                collection = change.kind.as_str(),
                slot = change.slot,
                "Slot committed"
            );
        }
        Ok(value)
    }

    /// Read-modify-write of one slot as a compare-and-swap loop
    async fn update<F>(
        &self,
        kind: CollectionKind,
        slot: u8,
        apply: F,
    ) -> Result<Option<Slot>, SlotError>
    where
        F: Fn(Option<Slot>) -> Result<Option<Slot>, SlotError>,
    {
        self.check_slot(kind, slot)?;

        let key = self.key(kind);
        let field = slot_field(slot);
        let backend = &self.store.backend;
        let (key_ref, field_ref, apply) = (&key, &field, &apply);

        let outcome = self
            .store
            .retry
            .run("slots.update", move || async move {
                let raw = backend.hget(key_ref, field_ref).await?;
                let current = decode_slot(key_ref, raw.as_deref())?;

                let next = match apply(current) {
                    Ok(next) => next,
                    Err(e) => return Ok(Err(e)),
                };
                let encoded = match &next {
                    Some(slot) => Some(encode_slot(key_ref, slot)?),
                    None => None,
                };

                let swapped = backend
                    .hcompare_and_swap(key_ref, field_ref, raw.as_deref(), encoded.as_deref())
                    .await?;
                if !swapped {
                    return Err(StoreError::ConcurrencyConflict {
                        key: format!("{}#{}", key_ref, field_ref),
                    });
                }
                Ok::<_, StoreError>(Ok(next))
            })
            .await?;

        if outcome.is_ok() {
            trace!(
                owner = self.owner,
                collection = kind.as_str(),
                slot = slot,
                "Slot updated"
            );
        }
        outcome
    }
}

/// Planned contents of one slot after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    pub kind: CollectionKind,
    pub slot: u8,
    /// `None` empties the slot
    pub after: Option<Slot>,
}

struct ViewedCollection {
    kind: CollectionKind,
    key: String,
    capacity: u8,
    raw: HashMap<String, String>,
    slots: Vec<(u8, Slot)>,
}

/// Collections as read at the start of a commit attempt
pub struct SlotsView {
    collections: Vec<ViewedCollection>,
}

impl SlotsView {
    fn collection(&self, kind: CollectionKind) -> Result<&ViewedCollection, SlotError> {
        self.collections
            .iter()
            .find(|c| c.kind == kind)
            .ok_or(SlotError::InvalidSlot {
                kind: kind.as_str(),
                slot: 0,
            })
    }

    /// Every non-empty slot of `kind`, ordered by index
    pub fn list(&self, kind: CollectionKind) -> Result<&[(u8, Slot)], SlotError> {
        Ok(&self.collection(kind)?.slots)
    }

    pub fn get(&self, kind: CollectionKind, slot: u8) -> Result<Option<Slot>, SlotError> {
        let collection = self.collection(kind)?;
        if slot == 0 || slot > collection.capacity {
            return Err(SlotError::InvalidSlot {
                kind: kind.as_str(),
                slot,
            });
        }
        Ok(collection
            .slots
            .iter()
            .find(|(index, _)| *index == slot)
            .map(|(_, held)| *held))
    }

    /// Lowest slot of `kind` holding `resource_id`
    pub fn find_resource(
        &self,
        kind: CollectionKind,
        resource_id: ResourceId,
    ) -> Result<Option<u8>, SlotError> {
        Ok(self
            .list(kind)?
            .iter()
            .find(|(_, held)| held.resource_id == resource_id)
            .map(|(index, _)| *index))
    }

    /// Take `quantity` of `resource_id` out of `slot`
    pub fn removal(
        &self,
        kind: CollectionKind,
        slot: u8,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Result<SlotChange, SlotError> {
        if quantity == 0 {
            return Err(SlotError::ZeroQuantity);
        }
        let held = self
            .get(kind, slot)?
            .filter(|s| s.resource_id == resource_id)
            .map_or(0, |s| s.quantity);
        if held < quantity {
            return Err(SlotError::InsufficientQuantity {
                slot,
                held,
                requested: quantity,
            });
        }
        Ok(SlotChange {
            kind,
            slot,
            after: (held > quantity).then(|| Slot::new(resource_id, held - quantity)),
        })
    }

    /// Stack onto a slot already holding `resource_id`, falling back to the
    /// lowest empty slot when there is none or every stack would overflow
    pub fn placement(
        &self,
        kind: CollectionKind,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Result<SlotChange, SlotError> {
        if quantity == 0 {
            return Err(SlotError::ZeroQuantity);
        }
        let collection = self.collection(kind)?;

        let stacked = collection.slots.iter().find_map(|(index, held)| {
            if held.resource_id != resource_id {
                return None;
            }
            let total = held.quantity.checked_add(quantity)?;
            Some(SlotChange {
                kind,
                slot: *index,
                after: Some(Slot::new(resource_id, total)),
            })
        });
        if let Some(change) = stacked {
            return Ok(change);
        }

        let slot = lowest_free(&collection.slots, collection.capacity).ok_or(
            SlotError::SlotsFull {
                kind: kind.as_str(),
            },
        )?;
        Ok(SlotChange {
            kind,
            slot,
            after: Some(Slot::new(resource_id, quantity)),
        })
    }

    /// Guarded writes for `changes`, each expecting the value read
    fn writes(
        &self,
        changes: &[SlotChange],
    ) -> Result<Result<Vec<HashWrite>, SlotError>, StoreError> {
        let mut writes = Vec::with_capacity(changes.len());
        for change in changes {
            let collection = match self.collection(change.kind) {
                Ok(collection) => collection,
                Err(e) => return Ok(Err(e)),
            };
            let field = slot_field(change.slot);
            let new = match &change.after {
                Some(slot) => Some(encode_slot(&collection.key, slot)?),
                None => None,
            };
            writes.push(HashWrite {
                key: collection.key.clone(),
                expected: collection.raw.get(&field).cloned(),
                field,
                new,
            });
        }
        Ok(Ok(writes))
    }
}
