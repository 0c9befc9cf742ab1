//! Inbound webhook state machine.
//!
//! Every request walks route, authenticate, decode, classify and dispatch.
//! Only the first three steps can fail the request; handler failures are
//! reported to the [`DeliveryErrorHandler`] and the remote server still gets
//! a success response.

mod delivery;
pub use delivery::*;


use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::metrics::HANDLER_FAILURES;
use crate::metrics::MISSED_EVENTS;
use crate::metrics::NOTIFICATIONS_RECEIVED;
use crate::DefinitionSet;
use crate::HealthMonitor;
use crate::NotificationEnvelope;
use crate::PayloadContent;
use crate::ReconcileHandle;
use crate::ReconcileTrigger;
use crate::SubscriptionDefinition;
use crate::SubscriptionStatus;
use crate::WebhookError;

/// How an accepted envelope was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Heartbeat,
    /// The remote record is `error` or `off`; a reconciliation was requested
    Unhealthy(SubscriptionStatus),
    Events,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub kind: EnvelopeKind,
    pub delivered: usize,
    pub failed: usize,
    /// Events skipped between the previous envelope and this one
    pub missed_events: Option<u64>,
}

/// Per-subscription stream position.
#[derive(Debug, Default)]
struct StreamState {
    events_since_start: Option<u64>,
}

pub struct WebhookDispatcher<C> {
    definitions: Arc<DefinitionSet<C>>,
    token: Option<String>,
    health: Arc<HealthMonitor>,
    reconcile: Option<ReconcileHandle>,
    delivery_errors: Arc<dyn DeliveryErrorHandler>,

    /// Serialises handler invocation per webhook id
    streams: DashMap<String, Arc<tokio::sync::Mutex<StreamState>>>,

    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl<C> WebhookDispatcher<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(
        definitions: Arc<DefinitionSet<C>>,
        token: Option<String>,
        health: Arc<HealthMonitor>,
        delivery_errors: Arc<dyn DeliveryErrorHandler>,
    ) -> Self {
        Self {
            definitions,
            token,
            health,
            reconcile: None,
            delivery_errors,
            streams: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Where unhealthy subscriptions are sent. Without it they are only
    /// recorded.
    pub fn with_reconcile_handle(
        mut self,
        reconcile: ReconcileHandle,
    ) -> Self {
        self.reconcile = Some(reconcile);
        self
    }

    /// Handle one inbound notification for `webhook_id`.
    ///
    /// # Errors
    /// Only transport-level failures: unknown webhook id, bad token,
    /// malformed body, or shutdown in progress.
    #[instrument(skip(self, api_key, body, ctx), fields(body_len = body.len()))]
    pub async fn handle(
        &self,
        webhook_id: &str,
        api_key: Option<&str>,
        body: &[u8],
        ctx: &C,
    ) -> Result<DispatchOutcome, WebhookError> {
        let _guard = InFlightGuard::enter(self);
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("rejecting notification during shutdown");
            return Err(WebhookError::ShuttingDown);
        }

        // Route
        let definition = self
            .definitions
            .get(webhook_id)
            .ok_or_else(|| WebhookError::UnknownWebhookId(webhook_id.to_string()))?;

        // Authenticate
        if let Some(token) = &self.token {
            let authorized = api_key.is_some_and(|key| constant_time_eq(key.as_bytes(), token.as_bytes()));
            if !authorized {
                warn!("rejecting notification with missing or invalid api key");
                return Err(WebhookError::Unauthorized(webhook_id.to_string()));
            }
        }

        // Decode
        let envelope = NotificationEnvelope::decode(body).inspect_err(|e| {
            warn!("malformed notification: {}", e);
        })?;
        NOTIFICATIONS_RECEIVED.with_label_values(&[webhook_id]).inc();

        let stream = self
            .streams
            .entry(webhook_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut stream = stream.lock().await;

        let missed_events = self.track_position(webhook_id, &mut stream, &envelope);

        // Classify
        let kind = if !envelope.subscription_status.is_live() {
            let status = envelope.subscription_status;
            self.health.record_problem(webhook_id, status);
            self.delivery_errors.report(DeliveryFailure::new(
                webhook_id,
                DeliveryFailureKind::SubscriptionError { status },
            ));
            match &self.reconcile {
                Some(reconcile) => reconcile.request(ReconcileTrigger::scoped([webhook_id])),
                None => debug!("no reconciler attached, unhealthy subscription left as is"),
            }
            EnvelopeKind::Unhealthy(status)
        } else if envelope.is_heartbeat() {
            self.health.observe_heartbeat(webhook_id, envelope.timestamp);
            debug!("heartbeat received");
            EnvelopeKind::Heartbeat
        } else {
            EnvelopeKind::Events
        };

        // Dispatch
        let (delivered, failed) = self.dispatch(definition, &envelope, ctx).await;
        if delivered + failed > 0 {
            self.health.observe_event(webhook_id);
        }

        Ok(DispatchOutcome {
            kind,
            delivered,
            failed,
            missed_events,
        })
    }

    /// Compare the remote counter with the previous envelope and remember it.
    fn track_position(
        &self,
        webhook_id: &str,
        stream: &mut StreamState,
        envelope: &NotificationEnvelope,
    ) -> Option<u64> {
        let current = envelope.events_since_subscription_start?;
        let previous = stream.events_since_start.replace(current)?;

        if current < previous {
            warn!(previous, current, "remote event counter regressed");
            self.delivery_errors.report(DeliveryFailure::new(
                webhook_id,
                DeliveryFailureKind::RemoteReset { previous, current },
            ));
            return None;
        }

        let gap = current
            .saturating_sub(previous)
            .saturating_sub(envelope.event_count);
        if gap == 0 {
            return None;
        }

        MISSED_EVENTS.with_label_values(&[webhook_id]).inc_by(gap);
        self.delivery_errors.report(DeliveryFailure::new(
            webhook_id,
            DeliveryFailureKind::MissedEvents {
                gap,
                events_since_start: current,
            },
        ));
        Some(gap)
    }

    /// Invoke the handler once per event in ascending event number order.
    async fn dispatch(
        &self,
        definition: &SubscriptionDefinition<C>,
        envelope: &NotificationEnvelope,
        ctx: &C,
    ) -> (usize, usize) {
        let webhook_id = definition.webhook_id.as_str();
        let mut delivered = 0;
        let mut failed = 0;

        for event in &envelope.notification_events {
            let included = match definition.payload_content {
                PayloadContent::IdOnly => Vec::new(),
                PayloadContent::FullResource => envelope.included_for(event),
            };

            match definition
                .handler
                .handle(ctx, &event.focus_reference, included, envelope.timestamp_for(event))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    HANDLER_FAILURES.with_label_values(&[webhook_id]).inc();
                    error!(
                        event_number = event.event_number,
                        reference = %event.focus_reference,
                        topic = %definition.topic,
                        "handler failed: {}",
                        e
                    );
                    self.delivery_errors.report(DeliveryFailure::new(
                        webhook_id,
                        DeliveryFailureKind::Handler {
                            event_number: event.event_number,
                            reference: event.focus_reference.clone(),
                            message: e.to_string(),
                        },
                    ));
                }
            }
        }

        (delivered, failed)
    }

    /// Reject every request arriving from now on with `ShuttingDown`.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "webhook dispatcher shutting down");
        }
    }

    /// Wait until in-flight requests finish. False when `timeout` elapsed
    /// first.
    pub async fn drain(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(in_flight = self.in_flight(), "drain timed out");
                return self.in_flight() == 0;
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn definitions(&self) -> &Arc<DefinitionSet<C>> {
        &self.definitions
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a AtomicUsize,
    idle: &'a Notify,
}

impl<'a> InFlightGuard<'a> {
    fn enter<C>(dispatcher: &'a WebhookDispatcher<C>) -> Self {
        dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            in_flight: &dispatcher.in_flight,
            idle: &dispatcher.idle,
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
pub(crate) fn constant_time_eq(
    a: &[u8],
    b: &[u8],
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
