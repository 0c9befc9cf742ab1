//! Subscription liveness tracking.
//!
//! Heartbeats and delivered events both count as liveness. A subscription
//! becomes stale once nothing has been seen for
//! `heartbeat_period * stale_factor`; before its first observation it is
//! given `timeout_seconds` of extra grace. Stale subscriptions are handed to
//! the reconciler as a scoped recreate.


use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::STALE_SUBSCRIPTIONS;
use crate::DefinitionSet;
use crate::HealthConfig;
use crate::ReconcileHandle;
use crate::ReconcileTrigger;
use crate::SubscriptionStatus;

#[derive(Debug, Clone)]
struct SubscriptionHealth {
    heartbeat_period: Duration,
    initial_grace: Duration,
    registered_at: Instant,
    last_seen: Option<Instant>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    problem: Option<SubscriptionStatus>,
}

impl SubscriptionHealth {
    fn is_stale(
        &self,
        now: Instant,
        stale_factor: u32,
    ) -> bool {
        let allowed = self.heartbeat_period * stale_factor;
        match self.last_seen {
            Some(seen) => now.saturating_duration_since(seen) > allowed,
            None => now.saturating_duration_since(self.registered_at) > self.initial_grace + allowed,
        }
    }
}

pub struct HealthMonitor {
    stale_factor: u32,
    check_interval: Duration,
    subscriptions: DashMap<String, SubscriptionHealth>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            stale_factor: config.stale_factor.max(2),
            check_interval: Duration::from_millis(config.check_interval_ms),
            subscriptions: DashMap::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Monitor with every definition of `definitions` registered.
    pub fn for_definitions<C>(
        config: &HealthConfig,
        definitions: &DefinitionSet<C>,
    ) -> Self {
        let monitor = Self::new(config);
        for definition in definitions.iter() {
            monitor.register(
                &definition.webhook_id,
                definition.timeout_seconds,
                definition.heartbeat_period_seconds,
            );
        }
        monitor
    }

    pub fn register(
        &self,
        webhook_id: &str,
        timeout_seconds: u32,
        heartbeat_period_seconds: u32,
    ) {
        self.subscriptions.insert(
            webhook_id.to_string(),
            SubscriptionHealth {
                heartbeat_period: Duration::from_secs(heartbeat_period_seconds as u64),
                initial_grace: Duration::from_secs(timeout_seconds as u64),
                registered_at: Instant::now(),
                last_seen: None,
                last_heartbeat_at: None,
                problem: None,
            },
        );
    }

    /// Forget observations for a freshly (re)created remote record.
    pub fn reset(
        &self,
        webhook_id: &str,
    ) {
        if let Some(mut health) = self.subscriptions.get_mut(webhook_id) {
            health.registered_at = Instant::now();
            health.last_seen = None;
            health.last_heartbeat_at = None;
            health.problem = None;
        }
    }

    /// Record a heartbeat. `at` is the remote timestamp when the envelope
    /// carried one.
    pub fn observe_heartbeat(
        &self,
        webhook_id: &str,
        at: Option<DateTime<Utc>>,
    ) {
        match self.subscriptions.get_mut(webhook_id) {
            Some(mut health) => {
                health.last_seen = Some(Instant::now());
                health.last_heartbeat_at = Some(at.unwrap_or_else(Utc::now));
                trace!(webhook_id, "heartbeat observed");
            }
            None => debug!(webhook_id, "heartbeat for unregistered subscription"),
        }
    }

    /// Delivered events prove liveness but do not move `last_heartbeat_at`.
    pub fn observe_event(
        &self,
        webhook_id: &str,
    ) {
        if let Some(mut health) = self.subscriptions.get_mut(webhook_id) {
            health.last_seen = Some(Instant::now());
        }
    }

    /// Remember that the remote server reported `status` for a subscription.
    pub fn record_problem(
        &self,
        webhook_id: &str,
        status: SubscriptionStatus,
    ) {
        if let Some(mut health) = self.subscriptions.get_mut(webhook_id) {
            warn!(webhook_id, %status, "remote subscription reported unhealthy status");
            health.problem = Some(status);
        }
    }

    pub fn problem(
        &self,
        webhook_id: &str,
    ) -> Option<SubscriptionStatus> {
        self.subscriptions.get(webhook_id).and_then(|h| h.problem)
    }

    pub fn last_heartbeat_at(
        &self,
        webhook_id: &str,
    ) -> Option<DateTime<Utc>> {
        self.subscriptions.get(webhook_id).and_then(|h| h.last_heartbeat_at)
    }

    /// Webhook ids considered stale at `now`.
    pub fn check_staleness(
        &self,
        now: Instant,
    ) -> BTreeSet<String> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().is_stale(now, self.stale_factor))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Spawn the periodic staleness checker. Stale subscriptions are sent to
    /// `reconcile` as a scoped pass.
    pub fn start(
        self: &Arc<Self>,
        reconcile: ReconcileHandle,
    ) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("health monitor already running");
            return;
        }

        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            monitor.run(reconcile).await;
        }));
        info!(check_interval = ?self.check_interval, "health monitor started");
    }

    async fn run(
        &self,
        reconcile: ReconcileHandle,
    ) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let stale = self.check_staleness(Instant::now());
                    STALE_SUBSCRIPTIONS.set(stale.len() as i64);
                    if !stale.is_empty() {
                        warn!(?stale, "stale subscriptions detected, requesting scoped reconciliation");
                        reconcile.request(ReconcileTrigger::Scoped(stale));
                    }
                }
            }
        }
    }

    /// Cancel the checker and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("health monitor task failed: {:?}", e);
            }
        }
    }
}
