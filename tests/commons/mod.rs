use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use fhir_tbs::DefinitionSetBuilder;
use fhir_tbs::FilterBy;
use fhir_tbs::HandlerError;
use fhir_tbs::MemGateway;
use fhir_tbs::PayloadContent;
use fhir_tbs::Resource;
use fhir_tbs::Subscription;
use fhir_tbs::SubscriptionHandler;
use fhir_tbs::TbsBuilder;
use fhir_tbs::TbsConfig;
use fhir_tbs::TbsNode;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;
use tokio::sync::watch;
use warp::filters::BoxedFilter;
use warp::reply::Response;

pub const APP_URL: &str = "https://app.example.org";
pub const TOKEN: &str = "integration-secret";
pub const APPOINTMENT_TOPIC: &str = "http://example.org/topic/appointment-booked";
pub const ENCOUNTER_TOPIC: &str = "http://example.org/topic/encounter-finished";

/// Context handed to every handler by the host application.
pub struct AppContext {
    pub tenant: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tenant: String,
    pub reference: String,
    pub included: Vec<Resource>,
}

#[derive(Default)]
pub struct CollectingHandler {
    deliveries: Mutex<Vec<Delivery>>,
    failing: Vec<String>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(references: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
            failing: references.iter().map(|r| r.to_string()).collect(),
        })
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn references(&self) -> Vec<String> {
        self.deliveries.lock().iter().map(|d| d.reference.clone()).collect()
    }
}

#[async_trait]
impl SubscriptionHandler<AppContext> for CollectingHandler {
    async fn handle(
        &self,
        ctx: &AppContext,
        reference: &str,
        included: Vec<Resource>,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), HandlerError> {
        self.deliveries.lock().push(Delivery {
            tenant: ctx.tenant.clone(),
            reference: reference.to_string(),
            included,
        });
        if self.failing.iter().any(|r| r == reference) {
            return Err(format!("cannot process {reference}").into());
        }
        Ok(())
    }
}

pub fn config() -> TbsConfig {
    let mut config = TbsConfig::default();
    config.webhook.app_url = Some(APP_URL.into());
    config.webhook.token = Some(TOKEN.into());
    config.webhook.drain_timeout_ms = 500;
    config.delivery.handle_delivery_errors = true;
    config
}

pub struct TestNode {
    pub node: TbsNode<AppContext>,
    pub routes: BoxedFilter<(Response,)>,
    pub gateway: Arc<MemGateway>,
    pub appointments: Arc<CollectingHandler>,
    pub encounters: Arc<CollectingHandler>,
    _shutdown_tx: watch::Sender<()>,
}

/// Node with an id-only appointment subscription and a full-resource
/// encounter subscription, backed by an in-memory gateway.
pub fn build_node(
    config: TbsConfig,
    gateway: Arc<MemGateway>,
    appointments: Arc<CollectingHandler>,
    encounters: Arc<CollectingHandler>,
) -> TestNode {
    let definitions = DefinitionSetBuilder::<AppContext>::new()
        .subscribe(
            Subscription::<AppContext>::new(APPOINTMENT_TOPIC, appointments.clone())
                .webhook_id("appointments")
                .filter(FilterBy::new("Appointment", "status", "booked")),
        )
        .subscribe(
            Subscription::<AppContext>::new(ENCOUNTER_TOPIC, encounters.clone())
                .webhook_id("encounters")
                .payload_content(PayloadContent::FullResource),
        )
        .build()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let node = TbsBuilder::new(config, shutdown_rx)
        .definitions(definitions)
        .gateway(gateway.clone())
        .build()
        .unwrap();
    let routes = node.routes(Arc::new(AppContext {
        tenant: "clinic-a".into(),
    }));

    TestNode {
        node,
        routes,
        gateway,
        appointments,
        encounters,
        _shutdown_tx: shutdown_tx,
    }
}

pub fn default_node() -> TestNode {
    build_node(
        config(),
        Arc::new(MemGateway::new()),
        CollectingHandler::new(),
        CollectingHandler::new(),
    )
}

/// R4B notification bundle: a `SubscriptionStatus` followed by `included`.
pub fn bundle(
    status: &str,
    events_since_start: u64,
    events: &[(u64, &str)],
    included: Vec<Value>,
) -> Vec<u8> {
    let notification_events: Vec<Value> = events
        .iter()
        .map(|(number, reference)| {
            json!({
                "eventNumber": number.to_string(),
                "focus": { "reference": reference },
            })
        })
        .collect();

    let mut entries = vec![json!({
        "resource": {
            "resourceType": "SubscriptionStatus",
            "status": status,
            "type": if events.is_empty() { "heartbeat" } else { "event-notification" },
            "eventsSinceSubscriptionStart": events_since_start.to_string(),
            "notificationEvent": notification_events,
        }
    })];
    entries.extend(included.into_iter().map(|r| json!({ "resource": r })));

    serde_json::to_vec(&json!({
        "resourceType": "Bundle",
        "type": "history",
        "timestamp": "2024-05-01T10:00:01Z",
        "entry": entries,
    }))
    .unwrap()
}

pub async fn post(
    routes: &BoxedFilter<(Response,)>,
    webhook_id: &str,
    token: Option<&str>,
    body: Vec<u8>,
) -> u16 {
    let mut request = warp::test::request()
        .method("POST")
        .path(&format!("/webhook/{webhook_id}"))
        .body(body);
    if let Some(token) = token {
        request = request.header("x-api-key", token);
    }
    request.reply(routes).await.status().as_u16()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(
    timeout: Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
