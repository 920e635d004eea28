//! Login, world presence, movement and broadcast scoping

mod common;

use pretty_assertions::assert_eq;

use common::{console_messages, test_config, test_state, test_state_with, TestClient, CLIENT_VERSION};
use realm_server::error::LoginRejection;
use realm_server::game::persistence::SavedPosition;
use realm_server::game::slots::CollectionKind;
use realm_server::net::dispatcher::Flow;
use realm_server::net::session::SessionState;
use realm_server::protocol::{Command, Event};

fn login(username: &str, client_version: u16) -> Command {
    Command::Login {
        username: username.to_string(),
        password: "password".to_string(),
        client_version,
    }
}

#[tokio::test]
async fn test_login_and_enter_world() {
    let (state, _backend) = test_state();
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    let (mut alice, owner) = TestClient::login(&state, "alice").await;

    assert_eq!(alice.session.state(), SessionState::Authenticated);
    assert!(state.sessions.is_online(owner));

    state
        .slots
        .put(owner, CollectionKind::Inventory, 2, 1, 25)
        .await
        .unwrap();
    assert_eq!(alice.send(Command::EnterWorld).await, Flow::Continue);
    assert_eq!(alice.session.state(), SessionState::InWorld);

    let events = alice.events();
    assert_eq!(events[0], Event::MapLoaded { map_id: 0, x: 32, y: 32 });
    let appeared = events
        .iter()
        .filter(|e| matches!(e, Event::PlayerAppeared { .. }))
        .count();
    assert_eq!(appeared, 2);
    assert!(matches!(
        events.last(),
        Some(Event::InventorySlotUpdate(update)) if update.slot == 2 && update.quantity == 25
    ));

    let seen_by_bob = bob.events();
    assert_eq!(
        seen_by_bob,
        vec![Event::PlayerAppeared {
            entity_id: alice.entity_id(),
            name: "alice".to_string(),
            x: 32,
            y: 32,
        }]
    );
}

#[tokio::test]
async fn test_enter_world_twice() {
    let (state, _backend) = test_state();
    let (mut client, _) = TestClient::in_world(&state, "alice").await;

    assert_eq!(client.send(Command::EnterWorld).await, Flow::Continue);
    assert_eq!(console_messages(&client.events()).len(), 1);
    assert_eq!(state.index.entity_count(), 1);
}

#[tokio::test]
async fn test_bad_client_version() {
    let (state, _backend) = test_state();
    let mut client = TestClient::connect(&state);

    let flow = client.send(login("alice", CLIENT_VERSION + 1)).await;

    assert_eq!(flow, Flow::Close);
    assert_eq!(
        client.events(),
        vec![Event::LoginRejected {
            reason: LoginRejection::BadClientVersion
        }]
    );
}

#[tokio::test]
async fn test_duplicate_login_rejected() {
    let (state, _backend) = test_state();
    let (first, owner) = TestClient::login(&state, "alice").await;
    let mut second = TestClient::connect(&state);

    let flow = second.send(login("alice", CLIENT_VERSION)).await;

    assert_eq!(flow, Flow::Close);
    assert_eq!(
        second.events(),
        vec![Event::LoginRejected {
            reason: LoginRejection::AlreadyLoggedIn
        }]
    );
    assert_eq!(
        state.sessions.get_by_owner(owner).map(|s| s.id),
        Some(first.session.id)
    );
}

#[tokio::test]
async fn test_world_full() {
    let mut config = test_config();
    config.max_players = 1;
    let (state, _backend) = test_state_with(config);
    let (_first, _) = TestClient::login(&state, "alice").await;
    let mut second = TestClient::connect(&state);

    assert_eq!(second.send(login("bob", CLIENT_VERSION)).await, Flow::Close);
    assert_eq!(
        second.events(),
        vec![Event::LoginRejected {
            reason: LoginRejection::WorldFull
        }]
    );
}

#[tokio::test]
async fn test_movement_broadcast() {
    let (state, _backend) = test_state();
    let (mut alice, _) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    alice.events();

    assert_eq!(alice.send(Command::Move { x: 34, y: 33 }).await, Flow::Continue);

    assert!(alice.events().is_empty());
    assert_eq!(
        bob.events(),
        vec![Event::EntityMoved {
            entity_id: alice.entity_id(),
            x: 34,
            y: 33,
        }]
    );
    let placement = alice.session.placement().unwrap();
    assert_eq!((placement.x, placement.y), (34, 33));
}

#[tokio::test]
async fn test_invalid_moves() {
    let (state, _backend) = test_state();
    let (mut alice, _) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    alice.events();

    // Too far in one step
    alice.send(Command::Move { x: 40, y: 32 }).await;
    // Off the map
    alice.send(Command::Move { x: 32, y: 500 }).await;

    assert_eq!(console_messages(&alice.events()).len(), 2);
    assert!(bob.events().is_empty());
    let placement = alice.session.placement().unwrap();
    assert_eq!((placement.x, placement.y), (32, 32));
}

#[tokio::test]
async fn test_map_transition() {
    let (state, _backend) = test_state();

    let (mut alice, alice_owner) = TestClient::login(&state, "alice").await;
    state
        .positions
        .save(alice_owner, &SavedPosition::new(0, 62, 32))
        .await
        .unwrap();
    alice.send(Command::EnterWorld).await;

    let (mut bob, _) = TestClient::in_world(&state, "bob").await;

    let (mut carol, carol_owner) = TestClient::login(&state, "carol").await;
    state
        .positions
        .save(carol_owner, &SavedPosition::new(1, 10, 10))
        .await
        .unwrap();
    carol.send(Command::EnterWorld).await;

    alice.events();
    bob.events();
    carol.events();
    let alice_id = alice.entity_id();

    // (63, 32) on the town is the portal to the fields
    assert_eq!(alice.send(Command::Move { x: 63, y: 32 }).await, Flow::Continue);

    let events = alice.events();
    assert_eq!(events[0], Event::MapLoaded { map_id: 1, x: 1, y: 32 });
    assert!(events.contains(&Event::PlayerAppeared {
        entity_id: carol.entity_id(),
        name: "carol".to_string(),
        x: 10,
        y: 10,
    }));

    assert_eq!(bob.events(), vec![Event::PlayerDeparted { entity_id: alice_id }]);
    assert_eq!(
        carol.events(),
        vec![Event::PlayerAppeared {
            entity_id: alice_id,
            name: "alice".to_string(),
            x: 1,
            y: 32,
        }]
    );

    // Present on exactly one map
    assert_eq!(state.index.locate(alice_id), Some(1));
    assert!(!state.index.players_in(0).contains(&alice.session.id));
    assert!(state.index.players_in(1).contains(&alice.session.id));
    assert_eq!(alice.session.state(), SessionState::InWorld);

    let saved = state.positions.load(alice_owner).await.unwrap().unwrap();
    assert_eq!((saved.map_id, saved.x, saved.y), (1, 1, 32));

    // Chat now reaches the new map only
    alice
        .send(Command::Chat {
            message: "hello fields".to_string(),
        })
        .await;
    assert!(bob.events().is_empty());
    assert_eq!(
        carol.events(),
        vec![Event::ChatMessage {
            entity_id: alice_id,
            text: "hello fields".to_string(),
        }]
    );
    assert!(alice.events().is_empty());
}

#[tokio::test]
async fn test_chat_validation() {
    let (state, _backend) = test_state();
    let (mut alice, _) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    alice.events();

    alice
        .send(Command::Chat {
            message: "   ".to_string(),
        })
        .await;
    alice
        .send(Command::Chat {
            message: "x".repeat(200),
        })
        .await;

    assert_eq!(console_messages(&alice.events()).len(), 2);
    assert!(bob.events().is_empty());
}

#[tokio::test]
async fn test_disconnect_releases_everything() {
    let (state, _backend) = test_state();
    let (alice, owner) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    let alice_id = alice.entity_id();
    alice.send(Command::Move { x: 33, y: 33 }).await;
    bob.events();

    alice.disconnect().await;

    assert_eq!(bob.events(), vec![Event::PlayerDeparted { entity_id: alice_id }]);
    assert_eq!(state.index.locate(alice_id), None);
    assert!(!state.sessions.is_online(owner));
    assert_eq!(state.sessions.count(), 1);

    let saved = state.positions.load(owner).await.unwrap().unwrap();
    assert_eq!((saved.map_id, saved.x, saved.y), (0, 33, 33));

    // Returns where they left
    let (mut again, again_owner) = TestClient::login(&state, "alice").await;
    assert_eq!(again_owner, owner);
    again.send(Command::EnterWorld).await;
    assert_eq!(
        again.events()[0],
        Event::MapLoaded { map_id: 0, x: 33, y: 33 }
    );
}

#[tokio::test]
async fn test_drop_and_pick_up() {
    let (state, _backend) = test_state();
    let (mut alice, owner) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 10)
        .await
        .unwrap();
    alice.events();

    alice
        .send(Command::DropItem {
            slot: 1,
            quantity: 4,
        })
        .await;

    let events = alice.events();
    let item_id = match &events[0] {
        Event::GroundItemAppeared {
            entity_id,
            item_id,
            quantity,
            x,
            y,
        } => {
            assert_eq!((*item_id, *quantity, *x, *y), (1, 4, 32, 32));
            *entity_id
        }
        other => panic!("expected ground item, got {:?}", other),
    };
    assert!(matches!(
        &events[1],
        Event::InventorySlotUpdate(update) if update.slot == 1 && update.quantity == 6
    ));
    assert!(matches!(
        bob.events().as_slice(),
        [Event::GroundItemAppeared { entity_id, .. }] if *entity_id == item_id
    ));

    alice.send(Command::PickUpItem { entity_id: item_id }).await;

    let events = alice.events();
    assert_eq!(events[0], Event::GroundItemRemoved { entity_id: item_id });
    assert!(matches!(
        &events[1],
        Event::InventorySlotUpdate(update) if update.slot == 1 && update.quantity == 10
    ));
    assert_eq!(
        bob.events(),
        vec![Event::GroundItemRemoved { entity_id: item_id }]
    );

    // Already gone
    alice.send(Command::PickUpItem { entity_id: item_id }).await;
    assert_eq!(console_messages(&alice.events()).len(), 1);
}

#[tokio::test]
async fn test_pick_up_out_of_reach() {
    let (state, _backend) = test_state();
    let (mut alice, owner) = TestClient::in_world(&state, "alice").await;
    let (mut bob, _) = TestClient::in_world(&state, "bob").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 2, 1)
        .await
        .unwrap();
    alice
        .send(Command::DropItem {
            slot: 1,
            quantity: 1,
        })
        .await;
    let item_id = match alice.events()[0] {
        Event::GroundItemAppeared { entity_id, .. } => entity_id,
        ref other => panic!("expected ground item, got {:?}", other),
    };
    bob.send(Command::Move { x: 34, y: 32 }).await;
    bob.send(Command::Move { x: 36, y: 32 }).await;
    bob.events();

    bob.send(Command::PickUpItem { entity_id: item_id }).await;

    assert_eq!(console_messages(&bob.events()).len(), 1);
    assert!(state
        .index
        .with_map(0, |view| view.state().ground_item(item_id).is_some())
        .unwrap());
}

#[tokio::test]
async fn test_stalled_session_does_not_block_others() {
    let mut config = test_config();
    config.net.outbound_queue = 4;
    let (state, _backend) = test_state_with(config);
    let (alice, _) = TestClient::in_world(&state, "alice").await;
    let (bob, _) = TestClient::in_world(&state, "bob").await;
    let (mut carol, _) = TestClient::in_world(&state, "carol").await;

    // Bob never reads his queue
    for i in 0..10 {
        assert_eq!(
            alice
                .send(Command::Chat {
                    message: format!("line {}", i),
                })
                .await,
            Flow::Continue
        );
        carol.events();
    }

    assert!(bob.session.is_stalled());
    assert!(bob.session.is_closing());
    assert!(!carol.session.is_stalled());
    assert!(!alice.session.is_closing());
}
