//! Escrow intake gate and self-restart on repeated check failures.

use std::time::Duration;

use offer_reconciler::engine::escrow::MonitorPhase;
use offer_reconciler::error::ServiceError;
use offer_reconciler::services::paper::PaperOp;
use offer_reconciler::services::AlertKind;
use offer_reconciler::types::{Action, PartnerId, Verdict};

use crate::harness::{id, item, received, wait_until, Harness, PARTNER};

fn transport() -> ServiceError {
    ServiceError::Transport("ESOCKETTIMEDOUT".into())
}

#[tokio::test]
async fn test_escrow_offer_is_declined_before_deciding() {
    let h = Harness::with_escrow(&[]);
    h.service.set_escrow_days(&PartnerId::new(PARTNER), 15);
    h.handler.set_default(Some(Verdict::new(Action::Accept, "VALID")));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));

    h.engine.process_queue().await;

    assert!(h.handler.decided().is_empty());
    assert_eq!(h.service.actions(), vec![(PaperOp::Decline, id("A"))]);
    let meta = h.engine.offer_meta(&id("A")).unwrap();
    assert_eq!(meta.action.unwrap().reason, "ESCROW");

    let health = h.engine.status().escrow.unwrap();
    assert_eq!(health.phase, MonitorPhase::Healthy);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_clean_offer_passes_the_gate() {
    let h = Harness::with_escrow(&[]);
    h.handler.set_default(Some(Verdict::new(Action::Accept, "VALID")));
    h.receive(received("A", &[], &[]));

    h.engine.process_queue().await;

    assert_eq!(h.handler.decided(), vec![id("A")]);
    assert_eq!(h.service.actions(), vec![(PaperOp::Accept, id("A"))]);
}

#[tokio::test]
async fn test_failed_check_skips_offer_and_releases_items() {
    let h = Harness::with_escrow(&[]);
    h.handler.set_default(Some(Verdict::new(Action::Accept, "VALID")));
    h.receive(received("A", &[item("a1", "5002;6")], &[]));

    h.service.fail_times(PaperOp::Escrow, 2, transport());
    h.engine.process_queue().await;

    assert!(h.handler.decided().is_empty());
    assert!(h.service.actions().is_empty());
    assert!(!h.engine.is_item_in_trade(&"a1".into()));
    assert_eq!(
        h.engine.offer_meta(&id("A")).unwrap().action.unwrap().reason,
        "ESCROW_CHECK_FAILED"
    );
    assert_eq!(h.engine.escrow().unwrap().consecutive_failures(), 1);
}

#[tokio::test]
async fn test_two_failed_checks_restart_exactly_once() {
    let h = Harness::with_escrow(&[]);
    h.receive(received("A", &[], &[]));
    h.receive(received("B", &[], &[]));

    // Every attempt of both checks fails.
    h.service.fail_times(PaperOp::Escrow, 4, transport());
    h.engine.process_queue().await;

    assert_eq!(h.engine.escrow().unwrap().consecutive_failures(), 2);
    assert!(h.engine.status().escrow.unwrap().restart_pending);

    tokio::time::timeout(Duration::from_secs(2), h.restart_signal.notified())
        .await
        .expect("restart was not requested");

    let settled = wait_until(Duration::from_secs(1), || {
        !h.engine.status().escrow.unwrap().restart_pending
    })
    .await;
    assert!(settled);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.alert_kinds(), vec![AlertKind::EscrowRestart]);
}

#[tokio::test]
async fn test_success_between_failures_prevents_restart() {
    let h = Harness::with_escrow(&[]);
    h.receive(received("A", &[], &[]));
    h.receive(received("B", &[], &[]));
    h.receive(received("C", &[], &[]));

    // A fails, B succeeds, C fails: never two in a row.
    h.service.fail_times(PaperOp::Escrow, 2, transport());
    assert!(h.engine.process_next().await);
    assert!(h.engine.process_next().await);
    h.service.fail_times(PaperOp::Escrow, 2, transport());
    assert!(h.engine.process_next().await);

    assert_eq!(h.engine.escrow().unwrap().consecutive_failures(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.alerts.alerts().is_empty());
}
