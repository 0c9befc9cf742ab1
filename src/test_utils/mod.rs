//! Shared helpers for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

use crate::DefinitionSet;
use crate::DefinitionSetBuilder;
use crate::HandlerError;
use crate::Resource;
use crate::Subscription;
use crate::SubscriptionHandler;

/// Opaque application context passed to handlers in tests.
#[derive(Debug, Default)]
pub struct TestContext {
    pub name: &'static str,
}

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerCall {
    pub context_name: &'static str,
    pub reference: String,
    pub included: Vec<Resource>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Handler recording every call; fails for references listed in `fail_on`.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<HandlerCall>>,
    pub fail_on: Vec<String>,
    /// Yield to the runtime before recording to expose ordering bugs.
    pub yield_first: bool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(references: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_on: references.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn yielding() -> Arc<Self> {
        Arc::new(Self {
            yield_first: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().clone()
    }

    pub fn references(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.reference.clone()).collect()
    }
}

#[async_trait]
impl SubscriptionHandler<TestContext> for RecordingHandler {
    async fn handle(
        &self,
        ctx: &TestContext,
        reference: &str,
        included: Vec<Resource>,
        timestamp: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), HandlerError> {
        if self.yield_first {
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        self.calls.lock().push(HandlerCall {
            context_name: ctx.name,
            reference: reference.to_string(),
            included,
            timestamp,
        });
        if self.fail_on.iter().any(|r| r == reference) {
            return Err(format!("handler refused {reference}").into());
        }
        Ok(())
    }
}

pub const APPOINTMENT_TOPIC: &str = "http://example.org/topic/appointment-booked";
pub const ENCOUNTER_TOPIC: &str = "http://example.org/topic/encounter-finished";

/// A single-subscription definition set routed at `webhook_id`.
pub fn single_definition(
    webhook_id: &str,
    payload_content: crate::PayloadContent,
    handler: Arc<RecordingHandler>,
) -> DefinitionSet<TestContext> {
    DefinitionSetBuilder::new()
        .subscribe(
            Subscription::new(APPOINTMENT_TOPIC, handler)
                .webhook_id(webhook_id)
                .filter(crate::FilterBy::new("Appointment", "status", "booked"))
                .payload_content(payload_content),
        )
        .build()
        .expect("valid definitions")
}

/// R4B notification bundle with one `SubscriptionStatus` entry followed by
/// `included` resources.
pub fn notification_bundle(
    status: &str,
    events_since_start: u64,
    events: &[(u64, &str)],
    included: Vec<Value>,
) -> Value {
    let notification_events: Vec<Value> = events
        .iter()
        .map(|(number, reference)| {
            json!({
                "eventNumber": number.to_string(),
                "timestamp": "2024-05-01T10:00:00Z",
                "focus": { "reference": reference },
            })
        })
        .collect();

    let mut status_resource = json!({
        "resourceType": "SubscriptionStatus",
        "status": status,
        "type": if events.is_empty() { "heartbeat" } else { "event-notification" },
        "eventsSinceSubscriptionStart": events_since_start.to_string(),
        "topic": APPOINTMENT_TOPIC,
    });
    if !notification_events.is_empty() {
        status_resource["notificationEvent"] = Value::Array(notification_events);
    }

    let mut entries = vec![json!({ "resource": status_resource })];
    entries.extend(included.into_iter().map(|r| json!({ "resource": r })));

    json!({
        "resourceType": "Bundle",
        "type": "history",
        "timestamp": "2024-05-01T10:00:01Z",
        "entry": entries,
    })
}

pub fn enable_logger() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
