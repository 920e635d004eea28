//! Session dispatcher
//!
//! Per-connection state machine. Every inbound frame is decoded once into a
//! [`Command`] and matched to exactly one handler. Decode failures end the
//! connection; every other failure becomes a console message for the player
//! and the connection carries on.
//!
//! Resource transfers run on their own task, tracked by the session, so a
//! connection that goes away mid-transfer still lets the transfer commit or
//! fail cleanly before teardown releases the player's index entries.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::error::{
    AuthError, DecodeError, LoginRejection, RealmError, Result, TransferError, ValidationError,
};
use crate::game::ground_item::GroundItem;
use crate::game::index::PlayerEntry;
use crate::game::persistence::SavedPosition;
use crate::game::slots::CollectionKind;
use crate::game::transfer::{slot_update, TransferOutcome, TransferRequest};
use crate::game::{MapId, OwnerId};
use crate::net::session::{Placement, Session, SessionState};
use crate::protocol::{decode, Command, ConsoleStyle, Event};
use crate::state::AppState;

/// Longest chat line accepted, in characters
pub const MAX_CHAT_LEN: usize = 80;

/// What the connection loop does after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Transfer-backed commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Deposit,
    Withdraw,
    CommerceOffer,
    CommerceRetract,
}

impl TransferKind {
    /// Source and destination collections
    pub fn route(self) -> (CollectionKind, CollectionKind) {
        match self {
            TransferKind::Deposit => (CollectionKind::Inventory, CollectionKind::Vault),
            TransferKind::Withdraw => (CollectionKind::Vault, CollectionKind::Inventory),
            TransferKind::CommerceOffer => (CollectionKind::Inventory, CollectionKind::Commerce),
            TransferKind::CommerceRetract => (CollectionKind::Commerce, CollectionKind::Inventory),
        }
    }

    fn needs_open_vault(self) -> bool {
        matches!(self, TransferKind::Deposit | TransferKind::Withdraw)
    }
}

/// Dispatches the commands of one session
pub struct SessionDispatcher {
    state: Arc<AppState>,
    session: Arc<Session>,
}

impl SessionDispatcher {
    pub fn new(state: Arc<AppState>, session: Arc<Session>) -> Self {
        Self { state, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Decode and handle one inbound frame
    pub async fn handle_frame(&self, frame: &[u8]) -> Flow {
        let command = match decode(frame) {
            Ok(command) => command,
            Err(DecodeError::UnknownKind(kind)) if self.session.state().is_authenticated() => {
                warn!(
                    session_id = self.session.id,
                    kind = kind,
                    "Ignoring unknown message kind"
                );
                return Flow::Continue;
            }
            Err(e) => {
                warn!(
                    session_id = self.session.id,
                    state = %self.session.state(),
                    error = %e,
                    "Malformed frame, closing connection"
                );
                return Flow::Close;
            }
        };

        trace!(
            session_id = self.session.id,
            command = command.name(),
            "Dispatching command"
        );

        match self.dispatch(command).await {
            Ok(flow) => flow,
            Err(e) if e.is_fatal() => {
                debug!(session_id = self.session.id, error = %e, "Connection error");
                Flow::Close
            }
            Err(e) => {
                debug!(session_id = self.session.id, error = %e, "Request failed");
                self.console(e.user_message(), ConsoleStyle::Error);
                Flow::Continue
            }
        }
    }

    /// Route a decoded command to its handler
    pub async fn dispatch(&self, command: Command) -> Result<Flow> {
        match command {
            Command::KeepAlive => Ok(Flow::Continue),
            Command::Login {
                username,
                password,
                client_version,
            } => self.handle_login(&username, &password, client_version).await,
            Command::EnterWorld => self.handle_enter_world().await,
            Command::Logout => {
                info!(session_id = self.session.id, "Logout requested");
                Ok(Flow::Close)
            }
            Command::Chat { message } => self.handle_chat(message),
            Command::Move { x, y } => self.handle_move(x, y).await,
            Command::OpenVault => self.handle_open_vault().await,
            Command::CloseVault => self.handle_close_vault(),
            Command::DropItem { slot, quantity } => self.handle_drop(slot, quantity).await,
            Command::PickUpItem { entity_id } => self.handle_pick_up(entity_id).await,
            Command::Withdraw { slot, quantity } => {
                self.handle_transfer(TransferKind::Withdraw, slot, quantity)
                    .await
            }
            Command::Deposit { slot, quantity } => {
                self.handle_transfer(TransferKind::Deposit, slot, quantity)
                    .await
            }
            Command::CommerceOffer { slot, quantity } => {
                self.handle_transfer(TransferKind::CommerceOffer, slot, quantity)
                    .await
            }
            Command::CommerceRetract { slot, quantity } => {
                self.handle_transfer(TransferKind::CommerceRetract, slot, quantity)
                    .await
            }
        }
    }

    fn send(&self, event: &Event) {
        self.session.send(event);
    }

    fn console(&self, text: impl Into<String>, style: ConsoleStyle) {
        self.send(&Event::console(text, style));
    }

    fn reject(&self, reason: LoginRejection) -> Result<Flow> {
        self.send(&Event::LoginRejected { reason });
        Ok(Flow::Close)
    }

    fn owner(&self) -> Result<OwnerId> {
        self.session
            .owner()
            .ok_or(RealmError::Validation(ValidationError::NotLoggedIn))
    }

    /// Placement of a session that is in the world
    fn placement(&self) -> Result<(OwnerId, Placement)> {
        let owner = self.owner()?;
        match self.session.placement() {
            Some(placement) if self.session.is_state(SessionState::InWorld) => {
                Ok((owner, placement))
            }
            _ => Err(RealmError::Validation(ValidationError::NotLoggedIn)),
        }
    }

    /// Run `work` on its own task, tracked by the session
    async fn tracked<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let token = self.session.begin_transfer();
        tokio::spawn(async move {
            let _token = token;
            work.await
        })
        .await
        .map_err(|e| RealmError::Internal(format!("Transfer task failed: {}", e)))
    }

    // ============ Login & world entry ============

    async fn handle_login(
        &self,
        username: &str,
        password: &str,
        client_version: u16,
    ) -> Result<Flow> {
        if !self.session.is_state(SessionState::Handshake) {
            warn!(session_id = self.session.id, "Login on an authenticated session");
            return Ok(Flow::Continue);
        }

        let expected = self.state.config.client_version;
        if client_version != expected {
            info!(
                session_id = self.session.id,
                expected = expected,
                actual = client_version,
                "Rejecting client version"
            );
            return self.reject(LoginRejection::BadClientVersion);
        }

        if self.state.sessions.player_count() >= self.state.config.max_players as usize {
            return self.reject(LoginRejection::WorldFull);
        }

        let identity = match self.state.auth.authenticate(username, password).await {
            Ok(identity) => identity,
            Err(e) => {
                info!(session_id = self.session.id, reason = %e, "Login rejected");
                return self.reject(LoginRejection::from(&e));
            }
        };

        if !self
            .state
            .sessions
            .claim_owner(identity.owner, self.session.id)
        {
            info!(
                session_id = self.session.id,
                owner = identity.owner,
                "Owner already online"
            );
            return self.reject(LoginRejection::from(&AuthError::AlreadyLoggedIn));
        }

        self.session.set_identity(identity.owner, &identity.username);
        self.session.set_state(SessionState::Authenticated);
        self.send(&Event::LoginAccepted {
            owner_id: identity.owner,
        });

        info!(
            session_id = self.session.id,
            owner = identity.owner,
            username = %identity.username,
            "Player logged in"
        );
        Ok(Flow::Continue)
    }

    async fn handle_enter_world(&self) -> Result<Flow> {
        match self.session.state() {
            SessionState::Authenticated => {}
            state if state.is_in_world() => {
                return Err(ValidationError::AlreadyInWorld.into());
            }
            _ => return Err(ValidationError::NotLoggedIn.into()),
        }
        let owner = self.owner()?;
        let name = self.session.username().unwrap_or_default();

        let (map_id, x, y) = self
            .state
            .positions
            .resolve(owner, &self.state.config.world)
            .await;

        let entry = PlayerEntry {
            entity_id: self.state.index.allocate_id(),
            session_id: self.session.id,
            owner,
            name,
            x,
            y,
        };
        let entity_id = entry.entity_id;

        let router = &self.state.router;
        let session = &self.session;
        self.state.index.with_map(map_id, |view| {
            let arrival = entry.appeared_event();
            view.add_player(entry)?;
            session.send(&Event::MapLoaded { map_id, x, y });
            for event in view.state().snapshot() {
                session.send(&event);
            }
            router.deliver(view.state(), &arrival, Some(session.id));
            Ok::<_, RealmError>(())
        })??;

        self.session.set_placement(Placement {
            entity_id,
            map_id,
            x,
            y,
        });
        self.session.set_state(SessionState::InWorld);

        for (slot, held) in self
            .state
            .slots
            .list_non_empty(owner, CollectionKind::Inventory)
            .await?
        {
            self.send(&CollectionKind::Inventory.slot_event(slot_update(
                self.state.catalog.as_ref(),
                slot,
                Some(held),
            )));
        }

        info!(
            session_id = self.session.id,
            owner = owner,
            entity_id = entity_id,
            map_id = map_id,
            x = x,
            y = y,
            "Player entered the world"
        );
        Ok(Flow::Continue)
    }

    // ============ Movement ============

    async fn handle_move(&self, x: u16, y: u16) -> Result<Flow> {
        let (owner, placement) = self.placement()?;
        let world = &self.state.config.world;

        let invalid = ValidationError::InvalidLocation {
            map_id: placement.map_id,
            x,
            y,
        };
        let map = world
            .map(placement.map_id)
            .ok_or(ValidationError::UnknownMap(placement.map_id))?;
        if !map.contains(x, y) {
            return Err(invalid.into());
        }
        let step = placement.x.abs_diff(x).max(placement.y.abs_diff(y));
        if step > world.max_step {
            return Err(invalid.into());
        }

        if let Some(portal) = world.portal_at(placement.map_id, x, y) {
            let (dest_map, dest_x, dest_y) = (portal.dest_map, portal.dest_x, portal.dest_y);
            return self
                .transition(owner, placement, dest_map, dest_x, dest_y)
                .await;
        }

        let router = &self.state.router;
        let session_id = self.session.id;
        self.state.index.with_map(placement.map_id, |view| {
            view.move_entity(placement.entity_id, x, y)?;
            let moved = Event::EntityMoved {
                entity_id: placement.entity_id,
                x,
                y,
            };
            router.deliver(view.state(), &moved, Some(session_id));
            Ok::<_, RealmError>(())
        })??;

        self.session.set_placement(Placement { x, y, ..placement });
        Ok(Flow::Continue)
    }

    /// Move the player onto another map
    async fn transition(
        &self,
        owner: OwnerId,
        placement: Placement,
        dest_map: MapId,
        x: u16,
        y: u16,
    ) -> Result<Flow> {
        self.session.set_state(SessionState::MapTransition);

        let router = &self.state.router;
        let session = &self.session;
        let moved = self
            .state
            .index
            .with_maps(placement.map_id, dest_map, |from, to| {
                let entry = from.transfer_player(to, placement.entity_id, x, y)?;
                router.deliver(from.state(), &entry.departed_event(), None);
                session.send(&Event::MapLoaded {
                    map_id: dest_map,
                    x,
                    y,
                });
                for event in to.state().snapshot() {
                    session.send(&event);
                }
                router.deliver(to.state(), &entry.appeared_event(), Some(session.id));
                Ok::<_, RealmError>(())
            })
            .map_err(RealmError::from)
            .and_then(|inner| inner);

        if let Err(e) = moved {
            self.session.set_state(SessionState::InWorld);
            return Err(e);
        }

        self.session.set_placement(Placement {
            entity_id: placement.entity_id,
            map_id: dest_map,
            x,
            y,
        });
        self.session.set_vault_open(false);
        self.session.set_state(SessionState::InWorld);

        info!(
            session_id = self.session.id,
            owner = owner,
            from_map = placement.map_id,
            to_map = dest_map,
            "Map transition"
        );

        if let Err(e) = self
            .state
            .positions
            .save(owner, &SavedPosition::new(dest_map, x, y))
            .await
        {
            warn!(owner = owner, error = %e, "Failed to save position after transition");
        }
        Ok(Flow::Continue)
    }

    // ============ Chat ============

    fn handle_chat(&self, message: String) -> Result<Flow> {
        let (_, placement) = self.placement()?;
        let text = message.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
            return Err(ValidationError::InvalidChat.into());
        }

        let event = Event::ChatMessage {
            entity_id: placement.entity_id,
            text: text.to_string(),
        };
        self.state
            .router
            .publish(placement.map_id, &event, Some(self.session.id))?;
        Ok(Flow::Continue)
    }

    // ============ Vault ============

    async fn handle_open_vault(&self) -> Result<Flow> {
        let (owner, _) = self.placement()?;
        let held = self
            .state
            .slots
            .list_non_empty(owner, CollectionKind::Vault)
            .await?;
        for (slot, contents) in held {
            self.send(&CollectionKind::Vault.slot_event(slot_update(
                self.state.catalog.as_ref(),
                slot,
                Some(contents),
            )));
        }
        self.session.set_vault_open(true);
        self.send(&Event::VaultOpened);
        Ok(Flow::Continue)
    }

    fn handle_close_vault(&self) -> Result<Flow> {
        self.placement()?;
        self.session.set_vault_open(false);
        self.send(&Event::VaultClosed);
        Ok(Flow::Continue)
    }

    // ============ Transfers ============

    async fn handle_transfer(&self, kind: TransferKind, slot: u8, quantity: u16) -> Result<Flow> {
        let (owner, _) = self.placement()?;
        if kind.needs_open_vault() && !self.session.vault_open() {
            return Err(ValidationError::VaultClosed.into());
        }
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }

        let (source, dest) = kind.route();
        let engine = self.state.transfers.clone();
        let quantity = u32::from(quantity);
        let outcome = self
            .tracked(async move {
                let held = engine
                    .slots()
                    .get(owner, source, slot)
                    .await
                    .map_err(TransferError::Slot)?
                    .ok_or(TransferError::InsufficientQuantity {
                        resource_id: 0,
                        held: 0,
                        requested: quantity,
                    })?;
                let request = TransferRequest::new(source, dest, owner, held.resource_id, quantity)
                    .from_slot(slot);
                engine.transfer(&request).await
            })
            .await?;

        match outcome {
            Ok(outcome) => {
                self.send_outcome(&outcome);
                Ok(Flow::Continue)
            }
            Err(e) => {
                if matches!(e, TransferError::Store(_)) {
                    error!(owner = owner, ?kind, error = %e, "Transfer failed");
                }
                Err(e.into())
            }
        }
    }

    fn send_outcome(&self, outcome: &TransferOutcome) {
        for event in outcome.slot_events(self.state.catalog.as_ref()) {
            self.send(&event);
        }
    }

    // ============ Ground items ============

    async fn handle_drop(&self, slot: u8, quantity: u16) -> Result<Flow> {
        let (owner, placement) = self.placement()?;
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }

        let engine = self.state.transfers.clone();
        let quantity = u32::from(quantity);
        let (resource_id, left) = self
            .tracked(async move {
                engine
                    .take_from(owner, CollectionKind::Inventory, slot, quantity)
                    .await
            })
            .await??;

        let item = GroundItem::dropped(
            self.state.index.allocate_id(),
            resource_id,
            quantity,
            (placement.x, placement.y),
            owner,
            self.state.world.tick(),
            self.state.config.world.ground_item_lifetime_ticks,
        );

        let router = &self.state.router;
        let placed = self
            .state
            .index
            .with_map(placement.map_id, |view| {
                let appeared = item.appeared_event();
                view.add_ground_item(item)?;
                router.deliver(view.state(), &appeared, None);
                Ok::<_, RealmError>(())
            })
            .map_err(RealmError::from)
            .and_then(|inner| inner);

        if let Err(e) = placed {
            // Nowhere to put it: hand it back
            let restored = self
                .state
                .slots
                .put(owner, CollectionKind::Inventory, slot, resource_id, quantity)
                .await;
            if let Err(restore_err) = restored {
                error!(
                    owner = owner,
                    slot = slot,
                    resource_id = resource_id,
                    quantity = quantity,
                    error = %restore_err,
                    "Failed to return dropped item"
                );
            }
            return Err(e);
        }

        self.send(&CollectionKind::Inventory.slot_event(slot_update(
            self.state.catalog.as_ref(),
            slot,
            left,
        )));
        Ok(Flow::Continue)
    }

    async fn handle_pick_up(&self, entity_id: u32) -> Result<Flow> {
        let (owner, placement) = self.placement()?;

        let router = &self.state.router;
        let item = self.state.index.with_map(placement.map_id, |view| {
            let item = view
                .state()
                .ground_item(entity_id)
                .ok_or(ValidationError::EntityNotFound(entity_id))?;
            if !item.within_reach(placement.x, placement.y) {
                return Err(ValidationError::OutOfReach.into());
            }
            let item = view
                .remove_ground_item(entity_id)
                .ok_or(ValidationError::EntityNotFound(entity_id))?;
            router.deliver(view.state(), &item.removed_event(), None);
            Ok::<_, RealmError>(item)
        })??;

        let engine = self.state.transfers.clone();
        let (resource_id, quantity) = (item.resource_id, item.quantity);
        let stored = self
            .tracked(async move {
                engine
                    .deposit_into(owner, CollectionKind::Inventory, resource_id, quantity)
                    .await
            })
            .await?;

        match stored {
            Ok((slot, after)) => {
                self.send(&CollectionKind::Inventory.slot_event(slot_update(
                    self.state.catalog.as_ref(),
                    slot,
                    Some(after),
                )));
                Ok(Flow::Continue)
            }
            Err(e) => {
                // Put the item back where it was
                let restored = self.state.index.with_map(placement.map_id, |view| {
                    let appeared = item.appeared_event();
                    view.add_ground_item(item)?;
                    router.deliver(view.state(), &appeared, None);
                    Ok::<_, RealmError>(())
                });
                if let Ok(Err(restore_err)) | Err(restore_err) =
                    restored.map_err(RealmError::from)
                {
                    warn!(
                        entity_id = entity_id,
                        error = %restore_err,
                        "Could not return ground item"
                    );
                }
                Err(e.into())
            }
        }
    }

    // ============ Teardown ============

    /// Release everything the session holds. Waits for in-flight transfers
    /// before the player leaves the index.
    pub async fn teardown(&self) {
        if self.session.in_flight() > 0 {
            debug!(
                session_id = self.session.id,
                in_flight = self.session.in_flight(),
                "Waiting for in-flight transfers"
            );
        }
        self.session.wait_idle().await;

        let owner = self.session.owner();
        if let Some(placement) = self.session.take_placement() {
            let router = &self.state.router;
            let left = self
                .state
                .index
                .with_map(placement.map_id, |view| {
                    let entry = view.remove_player(placement.entity_id)?;
                    router.deliver(view.state(), &entry.departed_event(), None);
                    Some((entry.x, entry.y))
                })
                .ok()
                .flatten();

            if let (Some(owner), Some((x, y))) = (owner, left) {
                if let Err(e) = self
                    .state
                    .positions
                    .save(owner, &SavedPosition::new(placement.map_id, x, y))
                    .await
                {
                    warn!(owner = owner, error = %e, "Failed to save position on logout");
                }
            }
        }

        if let Some(owner) = owner {
            self.state.slots.release_owner(owner);
        }

        self.session.set_state(SessionState::Closed);
        self.state.sessions.remove(self.session.id);
    }
}
