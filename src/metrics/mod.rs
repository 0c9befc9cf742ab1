
use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref NOTIFICATIONS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("notifications_received", "Decoded notification envelopes per webhook"),
        &["webhook_id"]
    )
    .expect("metric can not be created");

    pub static ref HANDLER_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("handler_failures", "Handler invocations that returned an error"),
        &["webhook_id"]
    )
    .expect("metric can not be created");

    pub static ref MISSED_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("missed_events", "Events skipped according to the remote event counter"),
        &["webhook_id"]
    )
    .expect("metric can not be created");

    pub static ref RECONCILE_ACTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("reconcile_actions", "Remote subscription mutations issued by the reconciler"),
        &["action"]
    )
    .expect("metric can not be created");

    pub static ref STALE_SUBSCRIPTIONS: IntGauge =
        IntGauge::new("stale_subscriptions", "Subscriptions currently considered stale")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(NOTIFICATIONS_RECEIVED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(MISSED_EVENTS.clone()),
        Box::new(RECONCILE_ACTIONS.clone()),
        Box::new(STALE_SUBSCRIPTIONS.clone()),
    ];
    for collector in collectors {
        // Registering twice only happens when the server is restarted in-process
        if let Err(e) = registry.register(collector) {
            error!("collector can not be registered: {}", e);
        }
    }
}

/// Serve `/metrics` until `shutdown_signal` fires.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let (addr, server) = warp::serve(metrics_route()).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        let _ = shutdown_signal.changed().await;
    });
    info!(%addr, "metrics endpoint listening");
    server.await;
}

pub fn metrics_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::get().and(warp::path!("metrics")).and_then(metrics_handler)
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(encode(&REGISTRY))
}

/// Text exposition of `registry`.
pub fn encode(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
