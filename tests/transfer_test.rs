//! Vault and commerce transfers driven through the session dispatcher

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};

use common::{console_messages, slot_updates, slow_state, stored, test_state, TestClient};
use realm_server::game::slots::{CollectionKind, Slot};
use realm_server::game::transfer::TransferRequest;
use realm_server::net::dispatcher::{Flow, SessionDispatcher};
use realm_server::protocol::{Command, Event};

async fn total(state: &realm_server::AppState, owner: u32, resource_id: u16) -> u32 {
    let mut sum = 0;
    for kind in [
        CollectionKind::Inventory,
        CollectionKind::Vault,
        CollectionKind::Commerce,
    ] {
        sum += state
            .slots
            .list_non_empty(owner, kind)
            .await
            .unwrap()
            .iter()
            .filter(|(_, held)| held.resource_id == resource_id)
            .map(|(_, held)| held.quantity)
            .sum::<u32>();
    }
    sum
}

#[tokio::test]
async fn test_withdraw_more_than_held() {
    let (state, backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "alice").await;

    state
        .slots
        .put(owner, CollectionKind::Vault, 1, 1, 50)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();
    let before = stored(&state, &backend, owner, CollectionKind::Vault);

    let flow = client
        .send(Command::Withdraw {
            slot: 1,
            quantity: 60,
        })
        .await;

    assert_eq!(flow, Flow::Continue);
    let events = client.events();
    assert_eq!(console_messages(&events).len(), 1);
    assert_eq!(slot_updates(&events), 0);
    assert_eq!(stored(&state, &backend, owner, CollectionKind::Vault), before);
    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Vault, 1)
            .await
            .unwrap(),
        Some(Slot::new(1, 50))
    );
}

#[tokio::test]
async fn test_deposit_reports_both_slots() {
    let (state, _backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "bob").await;

    state
        .slots
        .put(owner, CollectionKind::Inventory, 3, 9, 5)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();

    client
        .send(Command::Deposit {
            slot: 3,
            quantity: 5,
        })
        .await;

    let events = client.events();
    assert_eq!(events.len(), 2);
    match &events[0] {
        Event::InventorySlotUpdate(update) => {
            assert_eq!(update.slot, 3);
            assert_eq!(update.quantity, 0);
            assert_eq!(update.item_id, 0);
        }
        other => panic!("expected inventory update, got {:?}", other),
    }
    match &events[1] {
        Event::VaultSlotUpdate(update) => {
            assert_eq!(update.slot, 1);
            assert_eq!(update.item_id, 9);
            assert_eq!(update.quantity, 5);
        }
        other => panic!("expected vault update, got {:?}", other),
    }

    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Inventory, 3)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Vault, 1)
            .await
            .unwrap(),
        Some(Slot::new(9, 5))
    );
}

#[tokio::test]
async fn test_deposit_into_full_vault() {
    let (state, backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "carol").await;

    let vault_size = state.config.slots.vault_size;
    for slot in 1..=vault_size {
        state
            .slots
            .put(owner, CollectionKind::Vault, slot, 100 + slot as u16, 1)
            .await
            .unwrap();
    }
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 7, 3)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();

    let vault_before = stored(&state, &backend, owner, CollectionKind::Vault);
    let inventory_before = stored(&state, &backend, owner, CollectionKind::Inventory);

    client
        .send(Command::Deposit {
            slot: 1,
            quantity: 3,
        })
        .await;

    let events = client.events();
    assert_eq!(events.len(), 1);
    assert_eq!(console_messages(&events), vec!["Your vault is full."]);
    assert_eq!(slot_updates(&events), 0);
    assert_eq!(stored(&state, &backend, owner, CollectionKind::Vault), vault_before);
    assert_eq!(
        stored(&state, &backend, owner, CollectionKind::Inventory),
        inventory_before
    );
}

#[tokio::test]
async fn test_transfer_needs_open_vault() {
    let (state, _backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "dave").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 10)
        .await
        .unwrap();

    client
        .send(Command::Deposit {
            slot: 1,
            quantity: 10,
        })
        .await;
    let events = client.events();
    assert_eq!(console_messages(&events).len(), 1);
    assert_eq!(slot_updates(&events), 0);

    client.send(Command::OpenVault).await;
    client.send(Command::CloseVault).await;
    let events = client.events();
    assert_eq!(events.last(), Some(&Event::VaultClosed));

    client
        .send(Command::Deposit {
            slot: 1,
            quantity: 10,
        })
        .await;
    assert_eq!(console_messages(&client.events()).len(), 1);
    assert_eq!(total(&state, owner, 1).await, 10);
}

#[tokio::test]
async fn test_zero_quantity_rejected() {
    let (state, _backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "erin").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 10)
        .await
        .unwrap();

    client
        .send(Command::CommerceOffer {
            slot: 1,
            quantity: 0,
        })
        .await;
    let events = client.events();
    assert_eq!(console_messages(&events).len(), 1);
    assert_eq!(slot_updates(&events), 0);
}

#[tokio::test]
async fn test_commerce_offer_and_retract() {
    let (state, _backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "frank").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 2, 1, 100)
        .await
        .unwrap();

    client
        .send(Command::CommerceOffer {
            slot: 2,
            quantity: 40,
        })
        .await;
    let events = client.events();
    assert!(matches!(events[0], Event::InventorySlotUpdate(ref u) if u.quantity == 60));
    assert!(matches!(events[1], Event::CommerceSlotUpdate(ref u) if u.quantity == 40));

    client
        .send(Command::CommerceRetract {
            slot: 1,
            quantity: 15,
        })
        .await;
    let events = client.events();
    assert!(matches!(events[0], Event::CommerceSlotUpdate(ref u) if u.quantity == 25));
    assert!(matches!(events[1], Event::InventorySlotUpdate(ref u) if u.slot == 2 && u.quantity == 75));

    assert_eq!(total(&state, owner, 1).await, 100);
}

#[tokio::test]
async fn test_transfers_conserve_quantity() {
    let (state, _backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "grace").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 500)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;

    let commands = [
        Command::Deposit {
            slot: 1,
            quantity: 120,
        },
        Command::Withdraw {
            slot: 1,
            quantity: 500,
        },
        Command::Withdraw {
            slot: 1,
            quantity: 20,
        },
        Command::Deposit {
            slot: 9,
            quantity: 1,
        },
        Command::CommerceOffer {
            slot: 1,
            quantity: 33,
        },
        Command::Deposit {
            slot: 1,
            quantity: 1000,
        },
    ];
    for command in commands {
        assert_eq!(client.send(command).await, Flow::Continue);
        assert_eq!(total(&state, owner, 1).await, 500);
    }
    client.events();

    let inventory = state
        .slots
        .list_non_empty(owner, CollectionKind::Inventory)
        .await
        .unwrap();
    assert_eq!(inventory, vec![(1, Slot::new(1, 367))]);
}

#[tokio::test]
async fn test_store_outage_leaves_slots_unchanged() {
    let (state, backend) = test_state();
    let (mut client, owner) = TestClient::in_world(&state, "heidi").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 10)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();

    let retries = state.config.store.retry_attempts;
    backend.fail_next(retries + 10);
    client
        .send(Command::Deposit {
            slot: 1,
            quantity: 10,
        })
        .await;
    let events = client.events();
    assert_eq!(console_messages(&events).len(), 1);
    assert_eq!(slot_updates(&events), 0);

    backend.fail_next(0);
    assert_eq!(total(&state, owner, 1).await, 10);
    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Inventory, 1)
            .await
            .unwrap(),
        Some(Slot::new(1, 10))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_are_serializable() {
    let (state, backend) = test_state();
    let owner = 77;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 1, 100)
        .await
        .unwrap();
    backend.conflict_next(3);

    let mut handles = Vec::new();
    for i in 0..30 {
        let engine = state.transfers.clone();
        handles.push(tokio::spawn(async move {
            let (source, dest, quantity) = if i % 3 == 0 {
                (CollectionKind::Vault, CollectionKind::Inventory, 7)
            } else {
                (CollectionKind::Inventory, CollectionKind::Vault, 5)
            };
            let request = TransferRequest::new(source, dest, owner, 1, quantity);
            (source, quantity, engine.transfer(&request).await.is_ok())
        }));
    }

    let mut deposited = 0u32;
    let mut withdrawn = 0u32;
    for handle in handles {
        let (source, quantity, committed) = handle.await.unwrap();
        if committed {
            match source {
                CollectionKind::Inventory => deposited += quantity,
                _ => withdrawn += quantity,
            }
        }
    }

    let vault = state
        .slots
        .list_non_empty(owner, CollectionKind::Vault)
        .await
        .unwrap();
    let vault_total: u32 = vault.iter().map(|(_, held)| held.quantity).sum();
    assert_eq!(vault_total, deposited - withdrawn);
    assert_eq!(total(&state, owner, 1).await, 100);
    assert!(deposited > 0);
}

#[tokio::test]
async fn test_transfer_before_login_is_rejected() {
    let (state, _backend) = test_state();
    let mut client = TestClient::connect(&state);

    let flow = client
        .send(Command::Deposit {
            slot: 1,
            quantity: 1,
        })
        .await;
    assert_eq!(flow, Flow::Continue);
    assert_eq!(
        console_messages(&client.events()),
        vec!["You are not logged in."]
    );
}

#[tokio::test]
async fn test_engine_shared_between_sessions() {
    let (state, _backend) = test_state();
    let (client, owner) = TestClient::in_world(&state, "ivan").await;
    let engine = Arc::clone(&state.transfers);
    state
        .slots
        .put(owner, CollectionKind::Inventory, 4, 2, 8)
        .await
        .unwrap();

    let request =
        TransferRequest::new(CollectionKind::Inventory, CollectionKind::Vault, owner, 2, 8);
    let outcome = assert_ok!(engine.transfer(&request).await);
    assert_err!(engine.transfer(&request).await);
    assert_eq!(outcome.source_slot, 4);
    assert_eq!(outcome.source_after, None);
    assert_eq!(outcome.dest_after, Slot::new(2, 8));

    client.disconnect().await;
    assert_eq!(total(&state, owner, 2).await, 8);
}

#[tokio::test]
async fn test_disconnect_waits_for_in_flight_deposit() {
    let (state, backend) = slow_state(Duration::from_millis(200));
    let (mut client, owner) = TestClient::in_world(&state, "judy").await;
    let entity = client.entity_id();
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 4, 25)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();

    backend.arm();
    let connection = SessionDispatcher::new(state.clone(), client.session.clone());
    let deposit = tokio::spawn(async move {
        connection
            .dispatch(Command::Deposit {
                slot: 1,
                quantity: 25,
            })
            .await
    });
    backend.commit_started().await;

    // The connection task dies while the commit is still in flight
    deposit.abort();
    let session = client.session.clone();
    let teardown = tokio::spawn(client.disconnect());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!teardown.is_finished());
    assert_eq!(session.in_flight(), 1);
    assert!(state.index.locate(entity).is_some());

    teardown.await.unwrap();
    assert_eq!(session.in_flight(), 0);
    assert_eq!(state.index.locate(entity), None);
    assert_eq!(state.sessions.count(), 0);

    backend.disarm();
    assert_eq!(total(&state, owner, 4).await, 25);
    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Vault, 1)
            .await
            .unwrap(),
        Some(Slot::new(4, 25))
    );
}

#[tokio::test]
async fn test_commit_outage_during_disconnect_conserves_quantity() {
    let (state, backend) = slow_state(Duration::from_millis(50));
    let (mut client, owner) = TestClient::in_world(&state, "kim").await;
    let entity = client.entity_id();
    state
        .slots
        .put(owner, CollectionKind::Inventory, 2, 4, 25)
        .await
        .unwrap();
    client.send(Command::OpenVault).await;
    client.events();

    backend.arm();
    backend.fail_commits();
    let connection = SessionDispatcher::new(state.clone(), client.session.clone());
    let deposit = tokio::spawn(async move {
        connection
            .dispatch(Command::Deposit {
                slot: 2,
                quantity: 10,
            })
            .await
    });
    backend.commit_started().await;

    deposit.abort();
    let session = client.session.clone();
    let teardown = tokio::spawn(client.disconnect());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(state.index.locate(entity).is_some());

    teardown.await.unwrap();
    assert_eq!(session.in_flight(), 0);
    assert_eq!(state.index.locate(entity), None);

    backend.disarm();
    assert_eq!(total(&state, owner, 4).await, 25);
    assert_eq!(
        state
            .slots
            .get(owner, CollectionKind::Inventory, 2)
            .await
            .unwrap(),
        Some(Slot::new(4, 25))
    );
    assert!(stored(&state, &backend.inner, owner, CollectionKind::Vault).is_empty());
}

#[tokio::test]
async fn test_shutdown_drain_waits_for_in_flight_transfer() {
    let (state, backend) = slow_state(Duration::from_millis(150));
    let (client, owner) = TestClient::in_world(&state, "liam").await;
    state
        .slots
        .put(owner, CollectionKind::Inventory, 1, 4, 8)
        .await
        .unwrap();

    backend.arm();
    let connection = SessionDispatcher::new(state.clone(), client.session.clone());
    let offer = tokio::spawn(async move {
        connection
            .dispatch(Command::CommerceOffer {
                slot: 1,
                quantity: 8,
            })
            .await
    });
    backend.commit_started().await;

    // Shutdown closes the connection; its task tears the session down
    state.sessions.close_all();
    offer.abort();
    let teardown = tokio::spawn(client.disconnect());

    assert!(!state.sessions.drain(Duration::from_millis(30)).await);
    assert!(state.sessions.drain(Duration::from_secs(5)).await);
    teardown.await.unwrap();

    backend.disarm();
    assert_eq!(total(&state, owner, 4).await, 8);
    assert_eq!(
        state
            .slots
            .list_non_empty(owner, CollectionKind::Commerce)
            .await
            .unwrap(),
        vec![(1, Slot::new(4, 8))]
    );
}
