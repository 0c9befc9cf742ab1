//! Node start-up, self-healing and shutdown against the in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use fhir_tbs::MemGateway;
use fhir_tbs::RemoteSubscriptionRecord;
use fhir_tbs::SubscriptionGateway;
use fhir_tbs::SubscriptionStatus;

use crate::commons::build_node;
use crate::commons::bundle;
use crate::commons::config;
use crate::commons::default_node;
use crate::commons::eventually;
use crate::commons::post;
use crate::commons::CollectingHandler;
use crate::commons::APP_URL;
use crate::commons::TOKEN;

fn endpoints(records: &[RemoteSubscriptionRecord]) -> Vec<String> {
    let mut endpoints: Vec<String> = records.iter().map(|r| r.channel_endpoint.clone()).collect();
    endpoints.sort();
    endpoints
}

#[tokio::test]
async fn start_creates_one_record_per_definition() {
    let test = default_node();

    let report = test.node.start().await.unwrap().unwrap();

    assert_eq!(report.created, vec!["appointments", "encounters"]);
    let records = test.gateway.records();
    assert_eq!(
        endpoints(&records),
        vec![
            format!("{APP_URL}/webhook/appointments"),
            format!("{APP_URL}/webhook/encounters"),
        ]
    );
    let appointments = records
        .iter()
        .find(|r| r.channel_endpoint.ends_with("/appointments"))
        .unwrap();
    assert_eq!(appointments.criteria.as_deref(), Some("Appointment?status=booked"));
    assert_eq!(appointments.channel_headers, vec![format!("X-Api-Key: {TOKEN}")]);

    test.node.stop().await;
}

#[tokio::test]
async fn restart_is_idempotent() {
    let gateway = Arc::new(MemGateway::new());
    let first = build_node(config(), gateway.clone(), CollectingHandler::new(), CollectingHandler::new());
    first.node.start().await.unwrap();
    first.node.stop().await;
    let after_first = gateway.counts();

    let second = build_node(config(), gateway.clone(), CollectingHandler::new(), CollectingHandler::new());
    let report = second.node.start().await.unwrap().unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(gateway.counts().mutations(), after_first.mutations());
    assert_eq!(gateway.records().len(), 2);
    second.node.stop().await;
}

#[tokio::test]
async fn retired_definitions_are_cleaned_up_and_foreign_records_kept() {
    let gateway = Arc::new(MemGateway::new());
    let seeded = build_node(config(), gateway.clone(), CollectingHandler::new(), CollectingHandler::new());
    seeded.node.start().await.unwrap();
    seeded.node.stop().await;

    let template = gateway.records().remove(0);
    let mut retired = template.clone();
    retired.remote_id = "retired-1".into();
    retired.channel_endpoint = format!("{APP_URL}/webhook/discharges");
    gateway.insert_record(retired);
    let mut foreign = template;
    foreign.remote_id = "foreign-1".into();
    foreign.channel_endpoint = "https://billing.example.org/hooks/appointments".into();
    gateway.insert_record(foreign);

    let restarted = build_node(config(), gateway.clone(), CollectingHandler::new(), CollectingHandler::new());
    let report = restarted.node.start().await.unwrap().unwrap();

    assert_eq!(report.deleted, vec!["discharges"]);
    assert!(gateway.record("retired-1").is_none());
    assert!(gateway.record("foreign-1").is_some());
    restarted.node.stop().await;
}

#[tokio::test]
async fn error_notification_recreates_the_subscription() {
    let test = default_node();
    test.node.start().await.unwrap();
    let original = test
        .gateway
        .list(&format!("{APP_URL}/webhook"))
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.channel_endpoint.ends_with("/appointments"))
        .unwrap();
    test.gateway.set_status(&original.remote_id, SubscriptionStatus::Error);

    let status = post(&test.routes, "appointments", Some(TOKEN), bundle("error", 3, &[], vec![])).await;
    assert_eq!(status, 200);

    let gateway = test.gateway.clone();
    let original_id = original.remote_id.clone();
    let recreated = eventually(Duration::from_secs(5), move || {
        gateway.record(&original_id).is_none()
            && gateway
                .records()
                .iter()
                .any(|r| r.channel_endpoint.ends_with("/appointments") && r.status.is_live())
    })
    .await;
    assert!(recreated);
    assert_eq!(test.gateway.records().len(), 2);

    let failures = test.node.delivery_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].webhook_id, "appointments");
    test.node.stop().await;
}

#[tokio::test]
async fn unavailable_gateway_is_retried_by_later_passes() {
    let gateway = Arc::new(MemGateway::new());
    gateway.set_unavailable(true);
    let mut config = config();
    config.reconcile.interval_ms = 50;
    let test = build_node(config, gateway.clone(), CollectingHandler::new(), CollectingHandler::new());

    assert!(test.node.start().await.unwrap().is_none());
    assert!(gateway.records().is_empty());

    gateway.set_unavailable(false);
    let watched = gateway.clone();
    assert!(eventually(Duration::from_secs(5), move || watched.records().len() == 2).await);
    test.node.stop().await;
}

#[tokio::test]
async fn stop_rejects_new_notifications() {
    let test = default_node();
    test.node.start().await.unwrap();
    test.node.stop().await;

    let status = post(
        &test.routes,
        "appointments",
        Some(TOKEN),
        bundle("active", 1, &[(1, "Appointment/1")], vec![]),
    )
    .await;

    assert_eq!(status, 503);
    assert!(test.appointments.deliveries().is_empty());
}
