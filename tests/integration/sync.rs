//! Poll-driven state sync and poll-data persistence.

use std::time::Duration;

use offer_reconciler::storage;
use offer_reconciler::types::{Action, OfferFilter, OfferState, PartnerId, Proposal, Verdict};

use crate::harness::{id, item, received, sent, wait_until, Harness, PARTNER};

#[tokio::test]
async fn test_poll_discovers_new_and_sent_offers() {
    let h = Harness::new(&[]);
    h.service.add_offer(received("R1", &[item("a1", "5002;6")], &[]));
    h.service.add_offer(sent("S1", &[item("a2", "5002;6")]));

    let summary = h.poller().poll_once().await.unwrap();

    assert_eq!(summary.new_offers, 1);
    assert_eq!(summary.received_active, 1);
    assert_eq!(summary.sent_active, 1);
    assert_eq!(h.engine.queue_snapshot(), vec![id("R1")]);
    assert_eq!(h.engine.known_state(&id("S1")), Some(OfferState::Active));
    assert!(h.engine.is_item_in_trade(&"a1".into()));
    assert!(h.engine.is_item_in_trade(&"a2".into()));
    assert_eq!(
        h.engine.active_proposal_with(&PartnerId::new(PARTNER)),
        Some(id("S1"))
    );
}

#[tokio::test]
async fn test_second_poll_does_not_requeue_handled_offer() {
    let h = Harness::new(&[]);
    h.handler.set_default(Some(Verdict::new(Action::Skip, "LATER")));
    h.service.add_offer(received("R1", &[], &[]));

    h.poller().poll_once().await.unwrap();
    h.engine.process_queue().await;
    h.poller().poll_once().await.unwrap();

    assert!(h.engine.queue_snapshot().is_empty());
    assert_eq!(h.handler.decided(), vec![id("R1")]);
}

#[tokio::test]
async fn test_offer_list_requeues_unhandled_active_offers() {
    let h = Harness::new(&[]);
    let offer = received("R1", &[item("a1", "5002;6")], &[]);
    h.engine.record_state(&offer);

    h.engine
        .on_offer_list(OfferFilter::ActiveOnly, &[], std::slice::from_ref(&offer));

    assert_eq!(h.engine.queue_snapshot(), vec![id("R1")]);
}

#[tokio::test]
async fn test_sent_offer_state_change_is_reconciled() {
    let h = Harness::new(&[item("a2", "5002;6")]);
    h.service.add_offer(sent("S1", &[item("a2", "5002;6")]));
    h.poller().poll_once().await.unwrap();

    h.service.set_state(&id("S1"), OfferState::Accepted);
    let summary = h.poller().poll_once().await.unwrap();

    assert_eq!(summary.changed, 1);
    assert!(!h.engine.is_item_in_trade(&"a2".into()));
    assert_eq!(h.engine.known_state(&id("S1")), Some(OfferState::Accepted));
    assert_eq!(h.handler.changes().len(), 1);
    assert_eq!(h.engine.active_proposal_with(&PartnerId::new(PARTNER)), None);
}

#[tokio::test]
async fn test_failed_inventory_refresh_is_retried() {
    let h = Harness::new(&[item("a2", "5002;6")]);
    h.inventory.fail_refreshes(1);
    h.service.add_offer(sent("S1", &[item("a2", "5002;6")]));
    h.poller().poll_once().await.unwrap();

    h.service.set_state(&id("S1"), OfferState::Declined);
    h.poller().poll_once().await.unwrap();

    let retried = wait_until(Duration::from_secs(1), || {
        h.inventory.refresh_calls() >= 2
    })
    .await;
    assert!(retried);
}

#[tokio::test]
async fn test_poll_data_survives_restart() {
    let path = std::env::temp_dir()
        .join(format!("reconciler_it_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();

    let first = Harness::new(&[]);
    first.service.add_offer(sent("S1", &[item("a2", "5002;6")]));
    first.service.add_offer(received("R1", &[item("a1", "5002;6")], &[]));
    first.poller().poll_once().await.unwrap();
    storage::save_poll_data(&first.engine.poll_data(), Some(&path)).unwrap();

    let restored = storage::load_poll_data(Some(&path)).unwrap().unwrap();
    assert_eq!(restored.state_of(&id("S1")), Some(OfferState::Active));
    assert_eq!(restored.received.len(), 1);

    let second = Harness::new(&[]);
    second.engine.set_poll_data(restored);
    assert!(second.engine.is_item_in_trade(&"a1".into()));
    assert!(second.engine.is_item_in_trade(&"a2".into()));
    assert_eq!(
        second
            .engine
            .trades_with_people(&[PartnerId::new(PARTNER)])
            .get(&PartnerId::new(PARTNER)),
        Some(&2)
    );
    assert_eq!(
        second.engine.poll_data().sent.get(&id("S1")).copied(),
        Some(OfferState::Active)
    );

    storage::delete_poll_data(Some(&path)).unwrap();
}

#[tokio::test]
async fn test_restore_keeps_items_of_confirming_and_escrowed_offers() {
    let first = Harness::new(&[]);
    let confirming = Proposal {
        state: OfferState::NeedsConfirmation,
        ..sent("S1", &[item("a", "5002;6")])
    };
    let escrowed = Proposal {
        state: OfferState::InEscrow,
        ..sent("S2", &[item("b", "5002;6")])
    };
    let closed = Proposal {
        state: OfferState::Declined,
        ..sent("S3", &[item("c", "5002;6")])
    };
    first.engine.record_state(&confirming);
    first.engine.record_state(&escrowed);
    first.engine.record_state(&sent("S3", &[item("c", "5002;6")]));
    first.engine.record_state(&closed);

    first.engine.on_offer_list(
        OfferFilter::ActiveOnly,
        &[confirming, escrowed, closed],
        &[],
    );

    let second = Harness::new(&[]);
    second.engine.set_poll_data(first.engine.poll_data());
    assert!(second.engine.is_item_in_trade(&"a".into()));
    assert!(second.engine.is_item_in_trade(&"b".into()));
    assert!(!second.engine.is_item_in_trade(&"c".into()));
}

#[tokio::test]
async fn test_polled_held_offers_survive_restart() {
    let path = std::env::temp_dir()
        .join(format!("reconciler_it_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();

    let first = Harness::new(&[]);
    first.service.add_offer(Proposal {
        state: OfferState::NeedsConfirmation,
        ..sent("S1", &[item("a", "5002;6")])
    });
    first.service.add_offer(Proposal {
        state: OfferState::InEscrow,
        ..received("R1", &[item("b", "5002;6")], &[])
    });
    first.poller().poll_once().await.unwrap();
    assert!(first.engine.is_item_in_trade(&"a".into()));
    assert!(first.engine.is_item_in_trade(&"b".into()));
    storage::save_poll_data(&first.engine.poll_data(), Some(&path)).unwrap();

    let second = Harness::new(&[]);
    second
        .engine
        .set_poll_data(storage::load_poll_data(Some(&path)).unwrap().unwrap());
    assert!(second.engine.is_item_in_trade(&"a".into()));
    assert!(second.engine.is_item_in_trade(&"b".into()));

    // Unchanged states on the next poll keep the items committed.
    second.service.add_offer(Proposal {
        state: OfferState::NeedsConfirmation,
        ..sent("S1", &[item("a", "5002;6")])
    });
    second.service.add_offer(Proposal {
        state: OfferState::InEscrow,
        ..received("R1", &[item("b", "5002;6")], &[])
    });
    let summary = second.poller().poll_once().await.unwrap();
    assert_eq!(summary.changed, 0);
    assert_eq!(summary.new_offers, 0);
    assert!(second.engine.is_item_in_trade(&"a".into()));
    assert!(second.engine.is_item_in_trade(&"b".into()));

    storage::delete_poll_data(Some(&path)).unwrap();
}
