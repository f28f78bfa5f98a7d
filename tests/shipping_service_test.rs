mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{mock_profile, sign_webhook, MockConnector, TestHarness};
use parcelhub_api::carriers::LabelOptions;
use parcelhub_api::errors::ServiceError;
use parcelhub_api::events::Event;
use parcelhub_api::models::shipment::ShipmentStatus;
use parcelhub_api::tasks::tracking_poller::TrackingPoller;

#[tokio::test]
async fn rates_sorted_cheapest_first_and_unavailable_carriers_dropped() {
    let cj = Arc::new(MockConnector::new(mock_profile("cj", 1)));
    let hanjin = Arc::new(MockConnector::new(mock_profile("hanjin", 2)));
    let lotte = Arc::new(MockConnector::new(mock_profile("lotte", 3)));
    cj.set_quote(Some(dec!(4500)));
    hanjin.set_quote(None);
    lotte.set_quote(Some(dec!(3800)));

    let harness = TestHarness::with_connectors(vec![cj, hanjin, lotte]).await;
    let order = harness.insert_order("06236", 2.0).await;

    let rates = harness.service.calculate_rates(order.id).await.unwrap();

    let codes: Vec<&str> = rates.iter().map(|r| r.carrier_code.as_str()).collect();
    assert_eq!(codes, vec!["lotte", "cj"]);
    assert_eq!(rates[0].cost, dec!(3800));
    assert_eq!(rates[1].cost, dec!(4500));
}

#[tokio::test]
async fn rate_shopping_survives_slow_and_failing_carriers() {
    let slow = Arc::new(MockConnector::new(mock_profile("cj", 1)));
    let broken = Arc::new(MockConnector::new(mock_profile("hanjin", 2)));
    let healthy = Arc::new(MockConnector::new(mock_profile("lotte", 3)));
    // Harness quote timeout is one second.
    slow.set_quote_delay(Duration::from_secs(5));
    broken.fail_quotes.store(true, Ordering::SeqCst);
    healthy.set_quote(Some(dec!(4200)));

    let harness = TestHarness::with_connectors(vec![slow, broken, healthy]).await;
    let order = harness.insert_order("06236", 1.0).await;

    let rates = harness.service.calculate_rates(order.id).await.unwrap();

    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0].carrier_code, "lotte");
}

#[tokio::test]
async fn rates_for_missing_order_fail() {
    let (harness, _) = TestHarness::single_carrier().await;
    let result = harness.service.calculate_rates(Uuid::new_v4()).await;
    assert_matches!(result, Err(ServiceError::OrderNotFound(_)));
}

#[tokio::test]
async fn create_label_persists_snapshot_and_links_order() {
    let (mut harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 2.5).await;

    let shipment = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await
        .unwrap();

    assert_eq!(shipment.status, ShipmentStatus::Pending);
    assert_eq!(shipment.carrier_code, "cj");
    assert_eq!(shipment.recipient_name, "Kim Minji");
    assert_eq!(shipment.recipient_postal_code, "06236");
    assert!((shipment.weight_kg - 2.5).abs() < f32::EPSILON);
    assert_eq!(shipment.shipping_cost, Some(dec!(3000)));
    let tracking_number = shipment.tracking_number.clone().unwrap();

    let order_after = harness.store.find_order(order.id).await.unwrap().unwrap();
    assert_eq!(order_after.tracking_number, Some(tracking_number));

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShipmentCreated { order_id, .. } if *order_id == order.id)));
}

#[tokio::test]
async fn second_label_for_same_order_conflicts() {
    let (harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;

    harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await
        .unwrap();
    let second = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await;

    assert_matches!(second, Err(ServiceError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_label_requests_issue_exactly_one_label() {
    let (harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;

    // Two simultaneous requests for the same order: only one may reach the
    // carrier, the other must observe the occupied slot and conflict.
    let (first, second) = tokio::join!(
        harness
            .service
            .create_label(order.id, "cj", LabelOptions::default()),
        harness
            .service
            .create_label(order.id, "cj", LabelOptions::default()),
    );

    let succeeded = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(succeeded, 1, "exactly one label may be issued");
    let loser = if first.is_err() { first } else { second };
    assert_matches!(loser, Err(ServiceError::Conflict(_)));

    let rows = harness
        .service
        .get_shipping_history(order.id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "only one shipment row may persist");
}

#[tokio::test]
async fn concurrent_tracking_refreshes_apply_the_transition_once() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-110", ShipmentStatus::Pending)
        .await;
    connector.set_track_result("CJ-110", Ok(ShipmentStatus::InTransit));

    // Poll and webhook racing on the same row: both succeed, but the
    // transition is recorded (and announced) exactly once.
    let (first, second) = tokio::join!(
        harness.service.track_shipment("CJ-110", None),
        harness.service.track_shipment("CJ-110", None),
    );

    assert_eq!(first.unwrap().status, ShipmentStatus::InTransit);
    assert_eq!(second.unwrap().status, ShipmentStatus::InTransit);

    let changes = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::ShipmentStatusChanged { .. }))
        .count();
    assert_eq!(changes, 1);
}

#[tokio::test]
async fn cancelled_shipment_frees_the_order_for_a_new_label() {
    let (harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;

    let first = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await
        .unwrap();
    harness
        .service
        .cancel_shipment(&first.tracking_number.unwrap())
        .await
        .unwrap();

    let second = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn unsupported_carrier_and_options_rejected() {
    let lotte = Arc::new(MockConnector::new(mock_profile("lotte", 3)));
    let harness = TestHarness::with_connectors(vec![lotte]).await;
    let order = harness.insert_order("06236", 1.0).await;

    let unknown = harness
        .service
        .create_label(order.id, "fedex", LabelOptions::default())
        .await;
    assert_matches!(unknown, Err(ServiceError::CarrierNotSupported(_)));

    // The lotte mock profile does not support insurance.
    let insured = harness
        .service
        .create_label(
            order.id,
            "lotte",
            LabelOptions {
                cod: false,
                insurance_amount: Some(dec!(50000)),
            },
        )
        .await;
    assert_matches!(insured, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn carrier_label_failure_leaves_no_shipment_row() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    connector.fail_labels.store(true, Ordering::SeqCst);
    let order = harness.insert_order("06236", 1.0).await;

    let result = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await;

    assert_matches!(result, Err(ServiceError::CarrierApiError(_)));
    assert!(harness
        .service
        .get_shipping_history(order.id)
        .await
        .unwrap()
        .is_empty());
    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShipmentLabelFailed { .. })));
}

#[tokio::test]
async fn tracking_advances_status_and_stamps_shipped_at() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-100", ShipmentStatus::Pending)
        .await;
    connector.set_track_result("CJ-100", Ok(ShipmentStatus::InTransit));

    let refreshed = harness.service.track_shipment("CJ-100", None).await.unwrap();

    assert_eq!(refreshed.status, ShipmentStatus::InTransit);
    assert!(refreshed.shipped_at.is_some());
    assert_eq!(refreshed.current_location.as_deref(), Some("Daejeon Hub"));

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ShipmentStatusChanged {
            old_status: ShipmentStatus::Pending,
            new_status: ShipmentStatus::InTransit,
            ..
        }
    )));
}

#[tokio::test]
async fn stale_carrier_report_is_discarded() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-101", ShipmentStatus::InTransit)
        .await;
    connector.set_track_result("CJ-101", Ok(ShipmentStatus::PickedUp));

    let refreshed = harness.service.track_shipment("CJ-101", None).await.unwrap();

    assert_eq!(refreshed.status, ShipmentStatus::InTransit);
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn replaying_the_current_status_is_a_noop() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-102", ShipmentStatus::InTransit)
        .await;
    connector.set_track_result("CJ-102", Ok(ShipmentStatus::InTransit));

    let refreshed = harness.service.track_shipment("CJ-102", None).await.unwrap();

    assert_eq!(refreshed.status, ShipmentStatus::InTransit);
    assert!(harness.drain_events().is_empty());
}

#[tokio::test]
async fn delivery_marks_the_order_delivered() {
    let (mut harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-103", ShipmentStatus::OutForDelivery)
        .await;
    connector.set_track_result("CJ-103", Ok(ShipmentStatus::Delivered));

    let refreshed = harness.service.track_shipment("CJ-103", None).await.unwrap();

    assert_eq!(refreshed.status, ShipmentStatus::Delivered);
    assert!(refreshed.delivered_at.is_some());

    let order_after = harness.store.find_order(order.id).await.unwrap().unwrap();
    assert_eq!(order_after.status, "delivered");
    assert!(order_after.delivered_at.is_some());

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShipmentDelivered { .. })));
}

#[tokio::test]
async fn terminal_shipments_are_not_re_polled() {
    let (harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-104", ShipmentStatus::Delivered)
        .await;

    let refreshed = harness.service.track_shipment("CJ-104", None).await.unwrap();

    assert_eq!(refreshed.status, ShipmentStatus::Delivered);
    assert_eq!(connector.track_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_pending_shipment_clears_order_tracking() {
    let (mut harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    let shipment = harness
        .service
        .create_label(order.id, "cj", LabelOptions::default())
        .await
        .unwrap();
    let tracking_number = shipment.tracking_number.unwrap();

    let cancelled = harness
        .service
        .cancel_shipment(&tracking_number)
        .await
        .unwrap();

    assert_eq!(cancelled.status, ShipmentStatus::Cancelled);
    let order_after = harness.store.find_order(order.id).await.unwrap().unwrap();
    assert_eq!(order_after.tracking_number, None);

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShipmentCancelled { .. })));
}

#[tokio::test]
async fn cancel_rejected_once_the_parcel_moves() {
    let (harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-105", ShipmentStatus::InTransit)
        .await;

    let result = harness.service.cancel_shipment("CJ-105").await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn carrier_side_cancel_rejection_keeps_the_shipment() {
    let (harness, connector) = TestHarness::single_carrier().await;
    connector.accept_cancel.store(false, Ordering::SeqCst);
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-106", ShipmentStatus::Pending)
        .await;

    let result = harness.service.cancel_shipment("CJ-106").await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));

    let row = harness
        .store
        .find_by_tracking("CJ-106")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ShipmentStatus::Pending);
}

#[tokio::test]
async fn sweep_isolates_per_shipment_failures() {
    let (harness, connector) = TestHarness::single_carrier().await;
    for i in 0..5 {
        let order = harness.insert_order("06236", 1.0).await;
        harness
            .insert_shipment(order.id, &format!("CJ-2{i:02}"), ShipmentStatus::PickedUp)
            .await;
    }
    connector.set_default_track_status(ShipmentStatus::InTransit);
    connector.set_track_result("CJ-202", Err("tracking endpoint down"));

    let summary = harness.service.update_all_tracking().await.unwrap();

    assert_eq!(summary.total, 5);
    assert_eq!(summary.refreshed, 4);
    assert_eq!(summary.failed, 1);

    let failed_row = harness
        .store
        .find_by_tracking("CJ-202")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed_row.status, ShipmentStatus::PickedUp);
    let ok_row = harness
        .store
        .find_by_tracking("CJ-204")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ok_row.status, ShipmentStatus::InTransit);
}

#[tokio::test]
async fn sweep_counts_untrackable_rows_as_skipped() {
    let (harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness.insert_shipment_without_tracking(order.id).await;

    let summary = harness.service.update_all_tracking().await.unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.refreshed, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(connector.track_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sweep_ignores_terminal_shipments() {
    let (harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-300", ShipmentStatus::Cancelled)
        .await;

    let summary = harness.service.update_all_tracking().await.unwrap();

    assert_eq!(summary.total, 0);
    assert_eq!(connector.track_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn webhook_fast_path_applies_the_update() {
    let (harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-400", ShipmentStatus::Pending)
        .await;
    connector.set_track_result("CJ-400", Ok(ShipmentStatus::PickedUp));

    let body = json!({"tracking_number": "CJ-400", "status": "picked_up"});
    let processed = harness
        .service
        .handle_carrier_webhook("cj", body.to_string().as_bytes(), None)
        .await
        .unwrap();

    assert!(processed);
    let row = harness
        .store
        .find_by_tracking("CJ-400")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ShipmentStatus::PickedUp);
}

#[tokio::test]
async fn garbage_webhook_is_swallowed() {
    let (harness, _) = TestHarness::single_carrier().await;
    let processed = harness
        .service
        .handle_carrier_webhook("cj", b"<not json>", None)
        .await
        .unwrap();
    assert!(!processed);
}

#[tokio::test]
async fn webhook_for_unknown_shipment_is_swallowed() {
    let (harness, _) = TestHarness::single_carrier().await;
    let body = json!({"tracking_number": "NO-SUCH", "status": "in_transit"});
    let processed = harness
        .service
        .handle_carrier_webhook("cj", body.to_string().as_bytes(), None)
        .await
        .unwrap();
    assert!(!processed);
}

#[tokio::test]
async fn webhook_signature_is_enforced_when_configured() {
    let secret = "hook-secret";
    let connector = Arc::new(MockConnector::new(mock_profile("cj", 1)).with_secret(secret));
    let harness = TestHarness::with_connectors(vec![connector.clone()]).await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-500", ShipmentStatus::Pending)
        .await;
    connector.set_track_result("CJ-500", Ok(ShipmentStatus::InTransit));

    let body = json!({"tracking_number": "CJ-500", "status": "in_transit"}).to_string();

    // Missing and forged signatures are dropped without touching the row.
    for bad in [None, Some("deadbeef")] {
        let processed = harness
            .service
            .handle_carrier_webhook("cj", body.as_bytes(), bad)
            .await
            .unwrap();
        assert!(!processed);
    }
    let row = harness
        .store
        .find_by_tracking("CJ-500")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ShipmentStatus::Pending);

    let signature = sign_webhook(secret, body.as_bytes());
    let processed = harness
        .service
        .handle_carrier_webhook("cj", body.as_bytes(), Some(&signature))
        .await
        .unwrap();
    assert!(processed);
}

#[tokio::test]
async fn bulk_labels_report_per_order_outcomes() {
    let (harness, _) = TestHarness::single_carrier().await;
    let first = harness.insert_order("06236", 1.0).await;
    let second = harness.insert_order("06236", 2.0).await;
    let missing = Uuid::new_v4();

    let result = harness
        .service
        .create_labels_bulk(vec![first.id, second.id, missing], "cj")
        .await
        .unwrap();

    assert_eq!(result.total, 3);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    let failed_entry = result.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed_entry.order_id, missing);
    assert!(failed_entry.error.is_some());
}

#[tokio::test]
async fn stats_group_by_carrier_and_status() {
    let (harness, _) = TestHarness::single_carrier().await;
    for status in [
        ShipmentStatus::Pending,
        ShipmentStatus::InTransit,
        ShipmentStatus::InTransit,
        ShipmentStatus::Delivered,
    ] {
        let order = harness.insert_order("06236", 1.0).await;
        harness
            .insert_shipment(order.id, &format!("CJ-6{}", Uuid::new_v4().simple()), status)
            .await;
    }

    let stats = harness.service.shipping_stats(None, None).await.unwrap();

    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_carrier.len(), 1);
    assert_eq!(stats.by_carrier[0].carrier_code, "cj");
    assert_eq!(stats.by_carrier[0].count, 4);
    assert_eq!(stats.by_carrier[0].avg_cost, Some(dec!(3000)));

    let in_transit = stats
        .by_status
        .iter()
        .find(|s| s.status == ShipmentStatus::InTransit)
        .unwrap();
    assert_eq!(in_transit.count, 2);
}

#[tokio::test]
async fn shipping_history_is_newest_first() {
    let (harness, _) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-700", ShipmentStatus::Cancelled)
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    harness
        .insert_shipment(order.id, "CJ-701", ShipmentStatus::Pending)
        .await;

    let history = harness
        .service
        .get_shipping_history(order.id)
        .await
        .unwrap();

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].tracking_number.as_deref(), Some("CJ-701"));
}

#[tokio::test]
async fn poller_run_once_publishes_a_sweep_summary() {
    let (harness, connector) = TestHarness::single_carrier().await;
    let order = harness.insert_order("06236", 1.0).await;
    harness
        .insert_shipment(order.id, "CJ-800", ShipmentStatus::Pending)
        .await;
    connector.set_track_result("CJ-800", Ok(ShipmentStatus::PickedUp));

    let poller = TrackingPoller::new(harness.service.clone(), Duration::from_secs(3600));
    let last_sweep = poller.last_sweep();

    let summary = poller.run_once().await.unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.failed, 0);

    let published = (*last_sweep.borrow()).expect("summary published");
    assert_eq!(published.total, 1);
}
