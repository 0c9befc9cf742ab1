//! The assembled subscription service.
//!
//! ## Key Responsibilities
//! - Runs the initial reconciliation and the background reconcile and
//!   health loops
//! - Exposes the webhook routes for the host's HTTP server
//! - Drains in-flight notifications on shutdown
//!
//! ## Example Usage
//! ```ignore
//! node.start().await?;
//! server::serve(node.routes(Arc::new(app)), addr, shutdown_rx).await?;
//! node.stop().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use warp::filters::BoxedFilter;
use warp::reply::Response;
use warp::Filter;

use crate::metrics;
use crate::server::webhook_filter;
use crate::DefinitionSet;
use crate::DeliveryFailure;
use crate::HealthMonitor;
use crate::Reconciler;
use crate::RecordingDeliveryErrorHandler;
use crate::ReconcileReport;
use crate::Result;
use crate::TbsConfig;
use crate::WebhookDispatcher;

pub struct TbsNode<C> {
    pub(super) config: Arc<TbsConfig>,
    pub(super) definitions: Arc<DefinitionSet<C>>,
    pub(super) dispatcher: Arc<WebhookDispatcher<C>>,
    pub(super) health: Arc<HealthMonitor>,
    /// Absent when subscriptions are not managed
    pub(super) reconciler: Option<Arc<Reconciler>>,
    pub(super) recorder: Option<Arc<RecordingDeliveryErrorHandler>>,
    pub(super) shutdown_signal: watch::Receiver<()>,
}

impl<C> TbsNode<C>
where
    C: Send + Sync + 'static,
{
    /// Start background work.
    ///
    /// When subscriptions are managed an initial pass runs before the loops
    /// start; its failure is logged and left to the scheduled passes. The
    /// report is returned when the pass could list the remote records.
    pub async fn start(&self) -> Result<Option<ReconcileReport>> {
        if self.config.server.metrics_enabled {
            let port = self.config.server.metrics_port;
            let shutdown_signal = self.shutdown_signal.clone();
            tokio::spawn(async move {
                metrics::start_server(port, shutdown_signal).await;
            });
        }

        let Some(reconciler) = &self.reconciler else {
            info!(
                subscriptions = self.definitions.len(),
                "subscription management disabled, serving webhooks only"
            );
            return Ok(None);
        };

        let report = match reconciler.reconcile().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("initial reconciliation failed, retrying on schedule: {}", e);
                None
            }
        };

        reconciler.start()?;
        self.health.start(reconciler.handle());
        info!(subscriptions = self.definitions.len(), "subscription service started");
        Ok(report)
    }

    /// Reject new notifications, drain in-flight ones, then stop the loops.
    pub async fn stop(&self) {
        self.dispatcher.begin_shutdown();
        let drain_timeout = Duration::from_millis(self.config.webhook.drain_timeout_ms);
        if !self.dispatcher.drain(drain_timeout).await {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "in-flight notifications still running after drain timeout"
            );
        }

        self.health.stop().await;
        if let Some(reconciler) = &self.reconciler {
            reconciler.stop().await;
        }
        info!("subscription service stopped");
    }

    /// Webhook routes with `ctx` forwarded to every handler.
    pub fn routes(
        &self,
        ctx: Arc<C>,
    ) -> BoxedFilter<(Response,)> {
        webhook_filter(
            self.dispatcher.clone(),
            ctx,
            self.config.webhook.prefix_segments(),
            self.config.webhook.max_body_bytes,
        )
        .boxed()
    }

    pub fn config(&self) -> &TbsConfig {
        &self.config
    }

    pub fn definitions(&self) -> &Arc<DefinitionSet<C>> {
        &self.definitions
    }

    pub fn dispatcher(&self) -> &Arc<WebhookDispatcher<C>> {
        &self.dispatcher
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn reconciler(&self) -> Option<&Arc<Reconciler>> {
        self.reconciler.as_ref()
    }

    /// Failures kept by the default recording handler; empty otherwise.
    pub fn delivery_failures(&self) -> Vec<DeliveryFailure> {
        self.recorder.as_ref().map(|r| r.failures()).unwrap_or_default()
    }
}
