//! Counter proposals built by the balancer.

use std::time::Duration;

use offer_reconciler::engine::ActionOutcome;
use offer_reconciler::services::paper::PaperOp;
use offer_reconciler::services::AlertKind;
use offer_reconciler::types::{Action, OfferState, PartnerId, Verdict};

use crate::harness::{
    hat_for_hat_valuation, id, item, received, wait_until, Harness, HAT_OURS, HAT_THEIRS, PARTNER,
    SCRAP, WEAPON,
};

fn hat_offer() -> offer_reconciler::types::Proposal {
    received("A", &[item("o-hat", HAT_OURS)], &[item("t-hat", HAT_THEIRS)])
}

fn counter_verdict() -> Verdict {
    Verdict::new(Action::Counter, "INVALID_VALUE").with_valuation(hat_for_hat_valuation())
}

#[tokio::test]
async fn test_counter_is_balanced_and_sent() {
    let h = Harness::new(&[item("o-hat", HAT_OURS)]);
    h.inventory.set_partner(
        &PartnerId::new(PARTNER),
        &[
            item("t-hat", HAT_THEIRS),
            item("t-scrap-0", SCRAP),
            item("t-scrap-1", SCRAP),
            item("t-scrap-2", SCRAP),
            item("t-weapon", WEAPON),
        ],
    );
    h.handler.set_verdict(&id("A"), counter_verdict());
    h.receive(hat_offer());

    h.engine.process_queue().await;

    let sent = h.service.sent_offers();
    assert_eq!(sent.len(), 1);
    let counter = &sent[0];
    assert_eq!(counter.items_to_give, vec![item("o-hat", HAT_OURS)]);
    assert_eq!(counter.items_to_receive.len(), 4);
    assert!(counter.items_to_receive.contains(&item("t-weapon", WEAPON)));
    let scrap = counter
        .items_to_receive
        .iter()
        .filter(|i| i.sku.as_str() == SCRAP)
        .count();
    assert_eq!(scrap, 2);
    assert_eq!(counter.message, "countered");
    assert_eq!(h.service.offer(&id("A")).unwrap().state, OfferState::Countered);

    let meta = h.engine.offer_meta(&counter.id).unwrap();
    assert!(meta.notify);
    assert!(meta.handled_by_us);
    assert_eq!(meta.action.unwrap().reason, "COUNTERED");
    let valuation = meta.valuation.unwrap();
    assert!(valuation.value.is_balanced());

    assert!(h.alerts.alerts().is_empty());
    assert!(h.engine.is_item_in_trade(&"o-hat".into()));
}

#[tokio::test]
async fn test_counter_keeps_item_committed_after_original_closes() {
    let h = Harness::new(&[item("o-hat", HAT_OURS)]);
    h.inventory.set_partner(
        &PartnerId::new(PARTNER),
        &[
            item("t-hat", HAT_THEIRS),
            item("t-scrap-0", SCRAP),
            item("t-scrap-1", SCRAP),
            item("t-weapon", WEAPON),
        ],
    );
    h.handler.set_verdict(&id("A"), counter_verdict());
    h.receive(hat_offer());
    h.engine.process_queue().await;

    // The original is now countered and drops out of the active list; our
    // hat stays committed to the counter proposal.
    h.poller().poll_once().await.unwrap();
    assert_eq!(h.engine.known_state(&id("A")), Some(OfferState::Countered));
    assert!(h.engine.is_item_in_trade(&"o-hat".into()));

    let counter_id = h.service.sent_offers()[0].id.clone();
    h.service.set_state(&counter_id, OfferState::Declined);
    h.poller().poll_once().await.unwrap();
    assert!(!h.engine.is_item_in_trade(&"o-hat".into()));
}

#[tokio::test]
async fn test_counter_without_fallback_item_declines_original() {
    let h = Harness::new(&[item("o-hat", HAT_OURS)]);
    h.inventory.set_partner(
        &PartnerId::new(PARTNER),
        &[
            item("t-hat", HAT_THEIRS),
            item("t-scrap-0", SCRAP),
            item("t-scrap-1", SCRAP),
            item("t-scrap-2", SCRAP),
        ],
    );
    h.handler.set_verdict(&id("A"), counter_verdict());
    h.receive(hat_offer());

    h.engine.process_queue().await;

    assert_eq!(h.service.calls(PaperOp::Send), 0);
    assert_eq!(h.service.actions(), vec![(PaperOp::Decline, id("A"))]);
    assert_eq!(h.alert_kinds(), vec![AlertKind::FailedCounter]);
    assert!(h.alerts.alerts()[0]
        .text
        .ends_with("The offer has been automatically declined."));

    let meta = h.engine.offer_meta(&id("A")).unwrap();
    assert_eq!(meta.action.unwrap().reason, "COUNTER_INVALID_VALUE_FAILED");
    assert_eq!(
        h.handler.actions().last().cloned(),
        Some((id("A"), Action::Decline, "COUNTER_INVALID_VALUE_FAILED".to_string()))
    );
}

#[tokio::test]
async fn test_counter_with_private_inventory_declines_original() {
    let h = Harness::new(&[item("o-hat", HAT_OURS)]);
    h.handler.set_verdict(&id("A"), counter_verdict());
    let offer = hat_offer();
    h.receive(offer.clone());

    // Apply directly so the outcome can be inspected.
    let outcome = h.engine.apply_action(&offer, counter_verdict()).await;
    assert_eq!(outcome, ActionOutcome::CounterFailedDeclined);
    assert_eq!(h.service.offer(&id("A")).unwrap().state, OfferState::Declined);
}

#[tokio::test]
async fn test_counter_needing_confirmation_is_confirmed() {
    let h = Harness::new(&[item("o-hat", HAT_OURS)]);
    h.service.set_send_needs_confirmation(true);
    h.inventory.set_partner(
        &PartnerId::new(PARTNER),
        &[
            item("t-hat", HAT_THEIRS),
            item("t-scrap-0", SCRAP),
            item("t-scrap-1", SCRAP),
            item("t-weapon", WEAPON),
        ],
    );
    h.handler.set_verdict(&id("A"), counter_verdict());
    h.receive(hat_offer());
    h.engine.process_queue().await;

    let counter_id = h.service.sent_offers()[0].id.clone();
    let confirmed = wait_until(Duration::from_secs(1), || {
        h.service.offer(&counter_id).is_some_and(|p| p.state == OfferState::Active)
    })
    .await;
    assert!(confirmed);
    assert_eq!(
        h.engine.known_state(&counter_id),
        Some(OfferState::NeedsConfirmation)
    );
}
