//! Intake ordering and queue recovery.

use std::time::Duration;

use offer_reconciler::error::ServiceError;
use offer_reconciler::services::paper::PaperOp;
use offer_reconciler::types::{Action, OfferState, Verdict};

use crate::harness::{id, item, received, wait_until, Harness};

#[tokio::test]
async fn test_offers_are_processed_in_arrival_order() {
    let h = Harness::new(&[]);
    h.handler.set_default(Some(Verdict::new(Action::Decline, "TEST")));

    for name in ["A", "B", "C"] {
        h.receive(received(name, &[item(&format!("{name}-1"), "5002;6")], &[]));
    }
    h.engine.process_queue().await;

    assert_eq!(h.handler.decided(), vec![id("A"), id("B"), id("C")]);
    let declined: Vec<_> = h.service.actions().into_iter().map(|(_, p)| p).collect();
    assert_eq!(declined, vec![id("A"), id("B"), id("C")]);
    assert!(h.engine.queue_snapshot().is_empty());
}

#[tokio::test]
async fn test_duplicate_intake_is_ignored() {
    let h = Harness::new(&[]);
    let offer = received("A", &[item("a1", "5002;6")], &[]);
    h.receive(offer.clone());
    h.engine.on_new_offer(&offer);
    h.engine.enqueue(&offer);

    assert_eq!(h.engine.queue_snapshot(), vec![id("A")]);
}

#[tokio::test]
async fn test_failed_fetch_moves_offer_to_the_back() {
    let h = Harness::new(&[]);
    h.receive(received("B", &[], &[]));
    h.receive(received("C", &[], &[]));

    // Both attempts of the first fetch fail.
    h.service
        .fail_times(PaperOp::GetOffer, 2, ServiceError::Transport("socket hang up".into()));
    assert!(h.engine.process_next().await);

    assert_eq!(h.engine.queue_snapshot(), vec![id("C"), id("B")]);
    assert!(h.handler.decided().is_empty());
}

#[tokio::test]
async fn test_failed_fetch_of_only_offer_drops_it() {
    let h = Harness::new(&[]);
    h.receive(received("A", &[], &[]));
    h.service
        .fail_times(PaperOp::GetOffer, 2, ServiceError::Transport("socket hang up".into()));

    assert!(h.engine.process_next().await);
    assert!(h.engine.queue_snapshot().is_empty());
    assert!(!h.engine.process_next().await);
}

#[tokio::test]
async fn test_offer_gone_before_processing_releases_items() {
    let h = Harness::new(&[]);
    h.receive(received("A", &[item("a1", "5002;6")], &[]));
    assert!(h.engine.is_item_in_trade(&"a1".into()));

    h.service.set_state(&id("A"), OfferState::Canceled);
    h.engine.process_queue().await;

    assert!(!h.engine.is_item_in_trade(&"a1".into()));
    assert!(h.handler.decided().is_empty());
}

#[tokio::test]
async fn test_dispatcher_drains_queue_on_its_own() {
    let h = Harness::new(&[]);
    h.handler.set_default(Some(Verdict::new(Action::Accept, "VALID")));
    let _dispatcher = h.engine.spawn_dispatcher();

    h.receive(received("A", &[], &[]));
    h.receive(received("B", &[], &[]));

    let done = wait_until(Duration::from_secs(2), || {
        h.service.actions().len() == 2
    })
    .await;
    assert!(done);
    assert_eq!(h.handler.decided(), vec![id("A"), id("B")]);
}
