//! Resource transfers between slot collections
//!
//! A transfer has two steps, taking the quantity out of the source and
//! stacking or placing it in the destination. Both are planned against one
//! read of the two collections and written in a single multi-key commit
//! inside the owner's critical section. When the second step cannot be
//! planned the first is discarded with it, and a backend failure at any
//! point leaves nothing written, so the combined quantity never changes.

use std::sync::Arc;

use tracing::debug;

use crate::error::{SlotError, TransferError};
use crate::game::catalog::Catalog;
use crate::game::slots::{CollectionKind, OwnerId, ResourceId, Slot, SlotStore};
use crate::protocol::{Event, SlotUpdate};

/// A single resource movement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: CollectionKind,
    pub dest: CollectionKind,
    pub owner: OwnerId,
    pub resource_id: ResourceId,
    pub quantity: u32,
    /// Source slot named by the client; found by resource id when absent
    pub source_slot: Option<u8>,
}

impl TransferRequest {
    pub fn new(
        source: CollectionKind,
        dest: CollectionKind,
        owner: OwnerId,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Self {
        Self {
            source,
            dest,
            owner,
            resource_id,
            quantity,
            source_slot: None,
        }
    }

    /// Pin the source slot
    pub fn from_slot(mut self, slot: u8) -> Self {
        self.source_slot = Some(slot);
        self
    }
}

/// Slots touched by a committed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub source: CollectionKind,
    pub source_slot: u8,
    /// Source slot contents afterwards, `None` when emptied
    pub source_after: Option<Slot>,
    pub dest: CollectionKind,
    pub dest_slot: u8,
    pub dest_after: Slot,
}

impl TransferOutcome {
    /// Slot updates for the client: source first, then destination
    pub fn slot_events(&self, catalog: &dyn Catalog) -> [Event; 2] {
        [
            self.source
                .slot_event(slot_update(catalog, self.source_slot, self.source_after)),
            self.dest
                .slot_event(slot_update(catalog, self.dest_slot, Some(self.dest_after))),
        ]
    }
}

/// Build the client view of one slot
pub fn slot_update(catalog: &dyn Catalog, slot: u8, contents: Option<Slot>) -> SlotUpdate {
    match contents {
        Some(held) => catalog
            .lookup(held.resource_id)
            .slot_update(slot, held.quantity),
        None => SlotUpdate::empty(slot),
    }
}

fn from_slot_error(resource_id: ResourceId, err: SlotError) -> TransferError {
    match err {
        SlotError::InsufficientQuantity {
            held, requested, ..
        } => TransferError::InsufficientQuantity {
            resource_id,
            held,
            requested,
        },
        SlotError::Store(e) => TransferError::Store(e),
        other => TransferError::Slot(other),
    }
}

/// Atomic movement of resources between collections
pub struct TransferEngine {
    slots: Arc<SlotStore>,
}

impl TransferEngine {
    pub fn new(slots: Arc<SlotStore>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &Arc<SlotStore> {
        &self.slots
    }

    /// Move `quantity` of a resource from one collection to another.
    ///
    /// On any error both collections are left exactly as they were.
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome, TransferError> {
        if request.source == request.dest {
            return Err(TransferError::SameCollection);
        }
        if request.quantity == 0 {
            return Err(TransferError::Slot(SlotError::ZeroQuantity));
        }

        let guard = self.slots.lock(request.owner).await;
        let committed = guard
            .commit(&[request.source, request.dest], |view| {
                let source_slot = match request.source_slot {
                    Some(slot) => slot,
                    None => view
                        .find_resource(request.source, request.resource_id)?
                        .ok_or(SlotError::InsufficientQuantity {
                            slot: 0,
                            held: 0,
                            requested: request.quantity,
                        })?,
                };
                let taken = view.removal(
                    request.source,
                    source_slot,
                    request.resource_id,
                    request.quantity,
                )?;
                let placed = view.placement(request.dest, request.resource_id, request.quantity)?;

                let outcome = TransferOutcome {
                    source: request.source,
                    source_slot,
                    source_after: taken.after,
                    dest: request.dest,
                    dest_slot: placed.slot,
                    dest_after: placed
                        .after
                        .unwrap_or(Slot::new(request.resource_id, request.quantity)),
                };
                Ok((outcome, vec![taken, placed]))
            })
            .await;

        match committed {
            Ok(outcome) => {
                debug!(
                    owner = request.owner,
                    resource_id = request.resource_id,
                    quantity = request.quantity,
                    from = request.source.as_str(),
                    to = request.dest.as_str(),
                    "Transfer committed"
                );
                Ok(outcome)
            }
            Err(SlotError::SlotsFull { .. }) => {
                debug!(
                    owner = request.owner,
                    resource_id = request.resource_id,
                    to = request.dest.as_str(),
                    "Transfer abandoned, destination full"
                );
                Err(TransferError::InsufficientSpace {
                    kind: request.dest.as_str(),
                })
            }
            Err(e) => Err(from_slot_error(request.resource_id, e)),
        }
    }

    /// Store `quantity` of a resource in the first fitting slot of `kind`
    pub async fn deposit_into(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        resource_id: ResourceId,
        quantity: u32,
    ) -> Result<(u8, Slot), TransferError> {
        let guard = self.slots.lock(owner).await;
        guard
            .commit(&[kind], |view| {
                let placed = view.placement(kind, resource_id, quantity)?;
                let after = placed.after.unwrap_or(Slot::new(resource_id, quantity));
                Ok(((placed.slot, after), vec![placed]))
            })
            .await
            .map_err(|e| match e {
                SlotError::SlotsFull { kind } => TransferError::InsufficientSpace { kind },
                other => from_slot_error(resource_id, other),
            })
    }

    /// Take `quantity` out of one slot of `kind`, returning what it held
    /// and what is left
    pub async fn take_from(
        &self,
        owner: OwnerId,
        kind: CollectionKind,
        slot: u8,
        quantity: u32,
    ) -> Result<(ResourceId, Option<Slot>), TransferError> {
        let guard = self.slots.lock(owner).await;
        guard
            .commit(&[kind], |view| {
                let held = view.get(kind, slot)?.ok_or(SlotError::InsufficientQuantity {
                    slot,
                    held: 0,
                    requested: quantity,
                })?;
                let taken = view.removal(kind, slot, held.resource_id, quantity)?;
                Ok(((held.resource_id, taken.after), vec![taken]))
            })
            .await
            .map_err(|e| from_slot_error(0, e))
    }
}
