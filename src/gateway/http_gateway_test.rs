use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Reply;

use super::*;
use crate::test_utils::single_definition;
use crate::test_utils::RecordingHandler;
use crate::Error;
use crate::GatewayConfig;

/// `client:secret`
const AUTHORIZATION: &str = "Basic Y2xpZW50OnNlY3JldA==";

/// Minimal FHIR server keeping Subscription resources in memory.
#[derive(Default)]
struct FakeFhir {
    base: Mutex<String>,
    store: Mutex<BTreeMap<String, Value>>,
    next_id: Mutex<u64>,
    searches: Mutex<Vec<HashMap<String, String>>>,
    down: AtomicBool,
}

fn reply(
    status: StatusCode,
    body: Value,
) -> Response {
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

impl FakeFhir {
    fn refuse(
        &self,
        authorization: Option<String>,
    ) -> Option<Response> {
        if self.down.load(Ordering::SeqCst) {
            return Some(reply(StatusCode::SERVICE_UNAVAILABLE, json!({})));
        }
        if authorization.as_deref() != Some(AUTHORIZATION) {
            return Some(reply(StatusCode::UNAUTHORIZED, json!({})));
        }
        None
    }

    fn search(
        &self,
        query: HashMap<String, String>,
    ) -> Response {
        let count: usize = query.get("_count").and_then(|c| c.parse().ok()).unwrap_or(100);
        let page: usize = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        self.searches.lock().push(query);

        let all: Vec<Value> = self.store.lock().values().cloned().collect();
        let entries: Vec<Value> = all
            .iter()
            .skip((page - 1) * count)
            .take(count)
            .map(|r| json!({ "resource": r }))
            .collect();
        let mut bundle = json!({ "resourceType": "Bundle", "type": "searchset", "entry": entries });
        if page * count < all.len() {
            let next = format!("{}/Subscription?_count={}&page={}", self.base.lock(), count, page + 1);
            bundle["link"] = json!([{ "relation": "next", "url": next }]);
        }
        reply(StatusCode::OK, bundle)
    }

    fn create(
        &self,
        mut resource: Value,
    ) -> Response {
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            format!("sub-{}", *next_id)
        };
        resource["id"] = json!(id);
        self.store.lock().insert(id, resource.clone());
        reply(StatusCode::CREATED, resource)
    }

    fn update(
        &self,
        id: String,
        resource: Value,
    ) -> Response {
        let mut store = self.store.lock();
        if !store.contains_key(&id) {
            return reply(StatusCode::NOT_FOUND, json!({}));
        }
        store.insert(id, resource.clone());
        reply(StatusCode::OK, resource)
    }

    fn delete(
        &self,
        id: String,
    ) -> Response {
        match self.store.lock().remove(&id) {
            Some(_) => reply(StatusCode::OK, json!({})),
            None => reply(StatusCode::NOT_FOUND, json!({})),
        }
    }

    fn read(
        &self,
        resource_type: String,
        id: String,
    ) -> Response {
        reply(StatusCode::OK, json!({ "resourceType": resource_type, "id": id }))
    }
}

fn routes(fhir: Arc<FakeFhir>) -> BoxedFilter<(Response,)> {
    let authorization = || warp::header::optional::<String>("authorization");
    let with_fhir = move || {
        let fhir = fhir.clone();
        warp::any().map(move || fhir.clone())
    };

    let search = warp::get()
        .and(warp::path!("fhir" / "Subscription"))
        .and(warp::query::<HashMap<String, String>>())
        .and(authorization())
        .and(with_fhir())
        .map(|query: HashMap<String, String>, auth: Option<String>, fhir: Arc<FakeFhir>| {
            fhir.refuse(auth).unwrap_or_else(|| fhir.search(query))
        });
    let create = warp::post()
        .and(warp::path!("fhir" / "Subscription"))
        .and(warp::body::json())
        .and(authorization())
        .and(with_fhir())
        .map(|body: Value, auth: Option<String>, fhir: Arc<FakeFhir>| {
            fhir.refuse(auth).unwrap_or_else(|| fhir.create(body))
        });
    let update = warp::put()
        .and(warp::path!("fhir" / "Subscription" / String))
        .and(warp::body::json())
        .and(authorization())
        .and(with_fhir())
        .map(|id: String, body: Value, auth: Option<String>, fhir: Arc<FakeFhir>| {
            fhir.refuse(auth).unwrap_or_else(|| fhir.update(id, body))
        });
    let delete = warp::delete()
        .and(warp::path!("fhir" / "Subscription" / String))
        .and(authorization())
        .and(with_fhir())
        .map(|id: String, auth: Option<String>, fhir: Arc<FakeFhir>| {
            fhir.refuse(auth).unwrap_or_else(|| fhir.delete(id))
        });
    let read = warp::get()
        .and(warp::path!("fhir" / String / String))
        .and(authorization())
        .and(with_fhir())
        .map(|resource_type: String, id: String, auth: Option<String>, fhir: Arc<FakeFhir>| {
            fhir.refuse(auth).unwrap_or_else(|| fhir.read(resource_type, id))
        });

    search
        .or(create)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
        .or(read)
        .unify()
        .boxed()
}

async fn start_fhir() -> Arc<FakeFhir> {
    let fhir = Arc::new(FakeFhir::default());
    let (addr, server) = warp::serve(routes(fhir.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    *fhir.base.lock() = format!("http://{addr}/fhir");
    fhir
}

fn gateway(
    fhir: &FakeFhir,
    version: FhirVersion,
) -> HttpGateway {
    let config = GatewayConfig {
        base_url: Some(fhir.base.lock().clone()),
        fhir_version: version,
        username: Some("client".into()),
        password: Some("secret".into()),
        page_size: 2,
        ..Default::default()
    };
    HttpGateway::new(&config).unwrap()
}

fn endpoints() -> WebhookEndpoints {
    WebhookEndpoints::new("https://app.example.org", "webhook")
}

fn spec(webhook_id: &str) -> SubscriptionSpec {
    let definitions = single_definition(webhook_id, PayloadContent::FullResource, RecordingHandler::new());
    let definition = definitions.get(webhook_id).unwrap();
    SubscriptionSpec::for_definition(definition, &endpoints(), Some("secret")).unwrap()
}

#[tokio::test]
async fn r4b_records_are_created_listed_updated_and_deleted() {
    let fhir = start_fhir().await;
    let gateway = gateway(&fhir, FhirVersion::R4b);
    let spec = spec("appointments");

    let created = gateway.create(&spec).await.unwrap();
    assert_eq!(created.remote_id, "sub-1");
    assert_eq!(created.status, SubscriptionStatus::Requested);
    assert!(created.matches_spec(&spec));
    assert_eq!(fhir.store.lock()["sub-1"]["channel"]["type"], "rest-hook");

    // Someone else's subscription on the same server
    let mut foreign = r4b::to_subscription(&spec);
    foreign["channel"]["endpoint"] = json!("https://elsewhere.example.org/hook");
    let _ = fhir.create(foreign);

    let listed = gateway.list(endpoints().tag()).await.unwrap();
    assert_eq!(listed, vec![created.clone()]);
    assert_eq!(
        fhir.searches.lock()[0].get("url:below").map(String::as_str),
        Some("https://app.example.org/webhook")
    );

    let mut changed = spec.clone();
    changed.channel_heartbeat_period = 45;
    let updated = gateway.update(&created.remote_id, &changed).await.unwrap();
    assert_eq!(updated.remote_id, "sub-1");
    assert!(updated.matches_spec(&changed));

    gateway.delete(&created.remote_id).await.unwrap();
    assert!(matches!(
        gateway.delete(&created.remote_id).await,
        Err(Error::Gateway(GatewayError::NotFound(_)))
    ));
    assert!(gateway.list(endpoints().tag()).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_follows_next_links() {
    let fhir = start_fhir().await;
    let gateway = gateway(&fhir, FhirVersion::R4b);
    for webhook_id in ["a", "b", "c"] {
        gateway.create(&spec(webhook_id)).await.unwrap();
    }

    let listed = gateway.list(endpoints().tag()).await.unwrap();

    let ids: Vec<&str> = listed.iter().map(|r| r.remote_id.as_str()).collect();
    assert_eq!(ids, vec!["sub-1", "sub-2", "sub-3"]);
    assert_eq!(fhir.searches.lock().len(), 2);
}

#[tokio::test]
async fn r5_server_receives_r5_resources() {
    let fhir = start_fhir().await;
    let gateway = gateway(&fhir, FhirVersion::R5);
    let spec = spec("appointments");

    let created = gateway.create(&spec).await.unwrap();

    let stored = fhir.store.lock()[&created.remote_id].clone();
    assert_eq!(stored["topic"], json!(spec.topic));
    assert_eq!(stored["channelType"]["code"], "rest-hook");
    assert!(stored.get("channel").is_none());
    assert_eq!(gateway.list(endpoints().tag()).await.unwrap(), vec![created]);
}

#[tokio::test]
async fn fetch_resource_reads_by_reference() {
    let fhir = start_fhir().await;
    let gateway = gateway(&fhir, FhirVersion::R4b);

    let resource = gateway.fetch_resource("Appointment/7").await.unwrap();

    assert_eq!(resource, json!({ "resourceType": "Appointment", "id": "7" }));
}

#[tokio::test]
async fn http_failures_map_to_gateway_errors() {
    let fhir = start_fhir().await;

    let mut config = GatewayConfig {
        base_url: Some(fhir.base.lock().clone()),
        username: Some("client".into()),
        password: Some("wrong".into()),
        ..Default::default()
    };
    let unauthorized = HttpGateway::new(&config).unwrap();
    assert!(matches!(
        unauthorized.list(endpoints().tag()).await,
        Err(Error::Gateway(GatewayError::Rejected(_)))
    ));

    fhir.down.store(true, Ordering::SeqCst);
    assert!(matches!(
        gateway(&fhir, FhirVersion::R4b).create(&spec("a")).await,
        Err(Error::Gateway(GatewayError::Unavailable(_)))
    ));

    config.base_url = Some("http://127.0.0.1:1/fhir".into());
    let unreachable = HttpGateway::new(&config).unwrap();
    assert!(matches!(
        unreachable.list(endpoints().tag()).await,
        Err(Error::Gateway(GatewayError::Unavailable(_)))
    ));
}

#[test]
fn missing_base_url_is_refused() {
    assert!(HttpGateway::new(&GatewayConfig::default()).is_err());
}
