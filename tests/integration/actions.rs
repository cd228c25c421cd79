//! Accept / decline / skip, failure alerts and automatic retries.

use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use offer_reconciler::engine::ActionOutcome;
use offer_reconciler::error::{ResultCode, ServiceError, TradeError};
use offer_reconciler::services::paper::PaperOp;
use offer_reconciler::services::AlertKind;
use offer_reconciler::types::{AcceptStatus, Action, AssetId, OfferState, Verdict};

use crate::harness::{id, item, received, wait_until, Harness};

fn transport() -> ServiceError {
    ServiceError::Transport("socket hang up".into())
}

#[tokio::test]
async fn test_skip_releases_items_without_remote_calls() {
    let h = Harness::new(&[]);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Skip, "NOT_TRADING"));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));
    assert!(h.engine.is_item_in_trade(&"a1".into()));

    h.engine.process_queue().await;

    assert!(!h.engine.is_item_in_trade(&"a1".into()));
    assert!(h.service.actions().is_empty());
    assert_eq!(h.service.calls(PaperOp::Accept), 0);
    assert_eq!(h.service.calls(PaperOp::Decline), 0);

    let meta = h.engine.offer_meta(&id("A")).unwrap();
    assert!(meta.handled_by_us);
    assert_eq!(meta.action.unwrap().reason, "NOT_TRADING");
}

#[tokio::test]
async fn test_handler_error_leaves_offer_alone() {
    let h = Harness::new(&[]);
    h.handler.fail_on(&id("A"));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));

    h.engine.process_queue().await;

    assert!(h.service.actions().is_empty());
    assert!(h.engine.queue_snapshot().is_empty());
    assert!(!h.engine.offer_meta(&id("A")).unwrap().handled_by_us);
}

#[tokio::test]
async fn test_accept_then_state_change_removes_items() {
    let h = Harness::new(&[item("a1", "5002;6")]);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Accept, "VALID"));
    h.receive(received("A", &[item("a1", "5002;6")], &[item("t1", "5021;6")]));

    h.engine.process_queue().await;
    assert_eq!(h.service.offer(&id("A")).unwrap().state, OfferState::Accepted);
    // Still committed until the state change is reconciled.
    assert!(h.engine.is_item_in_trade(&"a1".into()));

    let summary = assert_ok!(h.poller().poll_once().await);
    assert_eq!(summary.changed, 1);

    assert!(!h.engine.is_item_in_trade(&"a1".into()));
    assert_eq!(h.inventory.removed(), vec![AssetId::new("a1")]);
    assert!(h.inventory.refresh_calls() >= 1);
    assert_eq!(
        h.handler.changes(),
        vec![(id("A"), OfferState::Active, OfferState::Accepted)]
    );

    let meta = h.engine.offer_meta(&id("A")).unwrap();
    assert!(meta.is_accepted);
    assert!(meta.our_items.is_none());
    assert!(meta.finish_timestamp.is_some());
}

#[tokio::test]
async fn test_pending_accept_is_confirmed() {
    let h = Harness::new(&[]);
    h.service.set_accept_status(AcceptStatus::Pending);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Accept, "VALID"));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));

    h.engine.process_queue().await;

    let confirmed = wait_until(Duration::from_secs(1), || {
        h.service.calls(PaperOp::Confirm) == 1
    })
    .await;
    assert!(confirmed);
    assert_eq!(h.service.offer(&id("A")).unwrap().state, OfferState::Accepted);
    assert!(h.alerts.alerts().is_empty());
}

#[tokio::test]
async fn test_failed_accept_alerts_and_retries_once() {
    let h = Harness::new(&[]);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Accept, "VALID"));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));

    // Both attempts of the first accept fail; the automatic retry succeeds.
    h.service.fail_times(PaperOp::Accept, 2, transport());
    h.engine.process_queue().await;

    assert_eq!(h.alert_kinds(), vec![AlertKind::FailedAccept]);
    let alert = &h.alerts.alerts()[0];
    assert!(alert.text.starts_with("Failed to accept on the offer #A. Retrying in"));
    assert_eq!(alert.offer_ids, vec![id("A")]);

    let retried = wait_until(Duration::from_secs(2), || {
        h.service.actions().contains(&(PaperOp::Accept, id("A")))
    })
    .await;
    assert!(retried);
    assert_eq!(h.service.calls(PaperOp::Accept), 3);
    assert!(h
        .handler
        .actions()
        .contains(&(id("A"), Action::Accept, "AUTO-RETRY".to_string())));
}

#[tokio::test]
async fn test_failed_automatic_retry_is_not_retried_again() {
    let h = Harness::new(&[]);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Decline, "BANNED"));
    h.receive(received("A", &[], &[]));

    h.service.fail_times(PaperOp::Decline, 4, transport());
    h.engine.process_queue().await;

    let retried = wait_until(Duration::from_secs(2), || h.alerts.alerts().len() == 2).await;
    assert!(retried);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.service.calls(PaperOp::Decline), 4);
    assert_eq!(
        h.alert_kinds(),
        vec![AlertKind::FailedDecline, AlertKind::FailedDecline]
    );
    // The second alert offers a manual force instead of another retry.
    assert!(!h.alerts.alerts()[1].text.contains("Retrying"));
    assert!(h.alerts.alerts()[1].text.contains("!fdecline A"));
}

#[tokio::test]
async fn test_invalid_state_failure_is_not_alerted() {
    let h = Harness::new(&[]);
    h.handler
        .set_verdict(&id("A"), Verdict::new(Action::Accept, "VALID"));
    h.receive(received("A", &[], &[]));

    h.service.fail_next(
        PaperOp::Accept,
        ServiceError::rejected(ResultCode::InvalidState, "Trade offer is not active"),
    );
    h.engine.process_queue().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.service.calls(PaperOp::Accept), 1);
    assert!(h.alerts.alerts().is_empty());
}

#[tokio::test]
async fn test_force_action() {
    let h = Harness::new(&[]);
    h.service.add_offer(received("A", &[], &[]));

    let outcome = assert_ok!(h.engine.force_action(&id("A"), Action::Decline).await);
    assert!(matches!(outcome, ActionOutcome::Declined));
    assert_eq!(
        h.engine.offer_meta(&id("A")).unwrap().action.unwrap().reason,
        "MANUAL-FORCE"
    );

    // Declined now, so there is nothing left to force.
    let err = assert_err!(h.engine.force_action(&id("A"), Action::Accept).await);
    assert!(matches!(err, TradeError::UnknownOffer(_)));
}

#[tokio::test]
async fn test_failed_forced_action_is_not_retried() {
    let h = Harness::new(&[]);
    h.service.add_offer(received("A", &[], &[]));
    h.service.fail_times(PaperOp::Accept, 2, transport());

    let outcome = assert_ok!(h.engine.force_action(&id("A"), Action::Accept).await);
    assert!(matches!(
        outcome,
        ActionOutcome::Failed {
            action: Action::Accept,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.service.calls(PaperOp::Accept), 2);
    assert_eq!(h.alert_kinds(), vec![AlertKind::FailedAccept]);
}
