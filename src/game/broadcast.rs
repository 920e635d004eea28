//! Broadcast fan-out
//!
//! Delivers encoded events to every session indexed on a map. The router
//! reads the index at publish time while holding the map's lock, so events
//! for one map reach each subscriber in publication order and always match
//! the index state they describe.
//!
//! Delivery never waits: a subscriber whose queue is full is skipped and
//! told to close, and its own teardown removes it from the index.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::WorldError;
use crate::game::index::{MapState, WorldIndex};
use crate::game::{MapId, SessionId};
use crate::protocol::{encode, Event};

/// Result of handing a frame to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full; the subscriber has been asked to close
    Stalled,
    /// Subscriber already gone
    Gone,
}

/// Outbound queues, addressed by session id
pub trait Subscribers: Send + Sync {
    fn deliver(&self, session_id: SessionId, frame: Bytes) -> Delivery;
}

/// Counts from one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
}

/// Fans events out to the sessions on a map
pub struct BroadcastRouter {
    index: Arc<WorldIndex>,
    subscribers: Arc<dyn Subscribers>,
}

impl BroadcastRouter {
    pub fn new(index: Arc<WorldIndex>, subscribers: Arc<dyn Subscribers>) -> Self {
        Self { index, subscribers }
    }

    /// Deliver `event` to every session on `map_id` except `exclude`
    pub fn publish(
        &self,
        map_id: MapId,
        event: &Event,
        exclude: Option<SessionId>,
    ) -> Result<DeliveryReport, WorldError> {
        self.index
            .with_map(map_id, |view| self.deliver(view.state(), event, exclude))
    }

    /// Deliver to the players of a map that is already locked
    pub fn deliver(
        &self,
        map: &MapState,
        event: &Event,
        exclude: Option<SessionId>,
    ) -> DeliveryReport {
        let frame = Bytes::from(encode(event));
        let mut report = DeliveryReport::default();

        for player in map.players() {
            if Some(player.session_id) == exclude {
                continue;
            }
            match self.subscribers.deliver(player.session_id, frame.clone()) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Stalled | Delivery::Gone => report.skipped += 1,
            }
        }

        trace!(
            map_id = map.map_id(),
            event = event.name(),
            delivered = report.delivered,
            skipped = report.skipped,
            "Event published"
        );
        report
    }
}
