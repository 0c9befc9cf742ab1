use std::sync::Arc;

use fhir_tbs::DeliveryFailureKind;
use fhir_tbs::MemGateway;
use serde_json::json;

use crate::commons::build_node;
use crate::commons::bundle;
use crate::commons::config;
use crate::commons::default_node;
use crate::commons::post;
use crate::commons::CollectingHandler;
use crate::commons::TOKEN;

#[tokio::test]
async fn id_only_events_reach_the_handler_in_order() {
    let test = default_node();
    test.node.start().await.unwrap();

    let body = bundle(
        "active",
        3,
        &[(3, "Appointment/c"), (1, "http://fhir.example.org/Appointment/a/_history/2"), (2, "Appointment/b")],
        vec![],
    );
    assert_eq!(post(&test.routes, "appointments", Some(TOKEN), body).await, 200);

    assert_eq!(
        test.appointments.references(),
        vec!["Appointment/a", "Appointment/b", "Appointment/c"]
    );
    let deliveries = test.appointments.deliveries();
    assert!(deliveries.iter().all(|d| d.tenant == "clinic-a" && d.included.is_empty()));
    assert!(test.encounters.deliveries().is_empty());
    test.node.stop().await;
}

#[tokio::test]
async fn full_resource_events_carry_their_focus_resource() {
    let test = default_node();
    test.node.start().await.unwrap();

    let encounter = json!({ "resourceType": "Encounter", "id": "e1", "status": "finished" });
    let unrelated = json!({ "resourceType": "Patient", "id": "p9" });
    let body = bundle(
        "active",
        1,
        &[(1, "Encounter/e1")],
        vec![unrelated, encounter.clone()],
    );
    assert_eq!(post(&test.routes, "encounters", Some(TOKEN), body).await, 200);

    let deliveries = test.encounters.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].included, vec![encounter]);
    test.node.stop().await;
}

#[tokio::test]
async fn requests_without_the_token_are_rejected() {
    let test = default_node();
    test.node.start().await.unwrap();
    let body = bundle("active", 1, &[(1, "Appointment/1")], vec![]);

    assert_eq!(post(&test.routes, "appointments", None, body.clone()).await, 401);
    assert_eq!(post(&test.routes, "appointments", Some("wrong"), body).await, 401);
    assert!(test.appointments.deliveries().is_empty());
    test.node.stop().await;
}

#[tokio::test]
async fn unknown_webhooks_and_malformed_bodies() {
    let test = default_node();
    test.node.start().await.unwrap();

    let body = bundle("active", 1, &[(1, "Appointment/1")], vec![]);
    assert_eq!(post(&test.routes, "discharges", Some(TOKEN), body).await, 404);
    assert_eq!(
        post(&test.routes, "appointments", Some(TOKEN), b"{\"resourceType\":\"Bundle\"".to_vec()).await,
        400
    );
    test.node.stop().await;
}

#[tokio::test]
async fn handler_failure_does_not_block_later_events() {
    let test = build_node(
        config(),
        Arc::new(MemGateway::new()),
        CollectingHandler::failing_on(&["Appointment/2"]),
        CollectingHandler::new(),
    );
    test.node.start().await.unwrap();

    let body = bundle(
        "active",
        3,
        &[(1, "Appointment/1"), (2, "Appointment/2"), (3, "Appointment/3")],
        vec![],
    );
    assert_eq!(post(&test.routes, "appointments", Some(TOKEN), body).await, 200);

    assert_eq!(
        test.appointments.references(),
        vec!["Appointment/1", "Appointment/2", "Appointment/3"]
    );
    let failures = test.node.delivery_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0].kind,
        DeliveryFailureKind::Handler { event_number: 2, reference, .. } if reference == "Appointment/2"
    ));
    test.node.stop().await;
}

#[tokio::test]
async fn skipped_notifications_are_reported_as_missed_events() {
    let test = default_node();
    test.node.start().await.unwrap();

    let first = bundle("active", 5, &[(5, "Appointment/5")], vec![]);
    let second = bundle("active", 9, &[(9, "Appointment/9")], vec![]);
    assert_eq!(post(&test.routes, "appointments", Some(TOKEN), first).await, 200);
    assert_eq!(post(&test.routes, "appointments", Some(TOKEN), second).await, 200);

    assert_eq!(test.appointments.references(), vec!["Appointment/5", "Appointment/9"]);
    let failures = test.node.delivery_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].kind,
        DeliveryFailureKind::MissedEvents {
            gap: 3,
            events_since_start: 9
        }
    ));
    test.node.stop().await;
}

#[tokio::test]
async fn heartbeats_update_the_health_view() {
    let test = default_node();
    test.node.start().await.unwrap();
    assert!(test.node.health().last_heartbeat_at("appointments").is_none());

    let body = bundle("active", 0, &[], vec![]);
    assert_eq!(post(&test.routes, "appointments", Some(TOKEN), body).await, 200);

    assert!(test.node.health().last_heartbeat_at("appointments").is_some());
    assert!(test.appointments.deliveries().is_empty());
    let snapshot = test.node.reconciler().unwrap().snapshot();
    let appointments = snapshot
        .iter()
        .find(|r| r.channel_endpoint.ends_with("/appointments"))
        .unwrap();
    assert!(appointments.last_heartbeat_at.is_some());
    test.node.stop().await;
}
