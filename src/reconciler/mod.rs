//! Converges remote subscription records towards the declared definitions.
//!
//! A pass lists managed records fresh from the gateway, computes a
//! [`ReconcilePlan`] and applies it one operation at a time. Only one pass
//! runs at any moment; triggers arriving while a pass is running are merged
//! and served by the next pass.

mod plan;
mod trigger;
pub use plan::*;
pub use trigger::*;


use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::metrics::RECONCILE_ACTIONS;
use crate::DefinitionSet;
use crate::Error;
use crate::GatewayError;
use crate::HealthMonitor;
use crate::OperationFailure;
use crate::ReconcileConfig;
use crate::ReconcileError;
use crate::RemoteSubscriptionRecord;
use crate::Result;
use crate::SubscriptionGateway;
use crate::SubscriptionSpec;
use crate::WebhookEndpoints;

/// Outcome of one pass, keyed by webhook id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    pub failures: Vec<OperationFailure>,
    /// Set when shutdown stopped the pass before every action was applied
    pub interrupted: bool,
}

impl ReconcileReport {
    pub fn mutations(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn collected failures into [`ReconcileError::PartialReconciliationFailure`].
    pub fn into_result(self) -> std::result::Result<Self, ReconcileError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ReconcileError::PartialReconciliationFailure(self.failures))
        }
    }
}

pub struct Reconciler {
    /// Desired remote state in declaration order
    specs: Vec<SubscriptionSpec>,
    endpoints: WebhookEndpoints,
    gateway: Arc<dyn SubscriptionGateway>,
    health: Option<Arc<HealthMonitor>>,
    config: ReconcileConfig,

    pass_lock: tokio::sync::Mutex<()>,
    snapshot: ArcSwap<Vec<RemoteSubscriptionRecord>>,

    trigger_tx: mpsc::Sender<ReconcileTrigger>,
    trigger_rx: Mutex<Option<mpsc::Receiver<ReconcileTrigger>>>,
    overflow: Arc<AtomicBool>,

    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    /// # Errors
    /// Fails when a definition's filters cannot be rendered as criteria.
    pub fn new<C>(
        definitions: &DefinitionSet<C>,
        gateway: Arc<dyn SubscriptionGateway>,
        endpoints: WebhookEndpoints,
        token: Option<&str>,
        config: ReconcileConfig,
    ) -> Result<Self> {
        let specs = definitions
            .iter()
            .map(|d| SubscriptionSpec::for_definition(d, &endpoints, token))
            .collect::<Result<Vec<_>>>()?;

        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_queue_size.max(1));

        Ok(Self {
            specs,
            endpoints,
            gateway,
            health: None,
            config,
            pass_lock: tokio::sync::Mutex::new(()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            overflow: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Health observations are reset whenever a record is (re)created.
    pub fn with_health(
        mut self,
        health: Arc<HealthMonitor>,
    ) -> Self {
        self.health = Some(health);
        self
    }

    pub fn endpoints(&self) -> &WebhookEndpoints {
        &self.endpoints
    }

    /// Sender side of the trigger queue, for the dispatcher and health monitor.
    pub fn handle(&self) -> ReconcileHandle {
        ReconcileHandle::new(self.trigger_tx.clone(), self.overflow.clone())
    }

    /// Ask the background loop for a pass. Never blocks.
    pub fn request(
        &self,
        trigger: ReconcileTrigger,
    ) {
        self.handle().request(trigger);
    }

    /// Compute the actions that would converge `records`.
    ///
    /// With a `scope`, only the named webhook ids are considered and their
    /// matching records are recreated even when they look unchanged.
    pub fn plan(
        &self,
        records: &[RemoteSubscriptionRecord],
        scope: Option<&BTreeSet<String>>,
    ) -> ReconcilePlan {
        ReconcilePlan::compute(&self.specs, records, &self.endpoints, scope)
    }

    /// Full pass over every definition.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.run_pass(None).await
    }

    /// Recreate the remote records of `webhook_ids` only.
    pub async fn reconcile_scoped(
        &self,
        webhook_ids: &BTreeSet<String>,
    ) -> Result<ReconcileReport> {
        self.run_pass(Some(webhook_ids)).await
    }

    /// Managed records as of the last pass, with heartbeat observations
    /// filled in.
    pub fn snapshot(&self) -> Vec<RemoteSubscriptionRecord> {
        let records = self.snapshot.load();
        records
            .iter()
            .map(|record| {
                let mut record = record.clone();
                if let (Some(health), Some(id)) = (
                    &self.health,
                    self.endpoints.webhook_id_of(&record.channel_endpoint),
                ) {
                    record.last_heartbeat_at = health.last_heartbeat_at(id);
                }
                record
            })
            .collect()
    }

    #[instrument(skip(self), fields(scoped = scope.is_some()))]
    async fn run_pass(
        &self,
        scope: Option<&BTreeSet<String>>,
    ) -> Result<ReconcileReport> {
        let _pass = self.pass_lock.lock().await;

        let records = match self.gateway.list(self.endpoints.tag()).await {
            Ok(records) => records,
            Err(Error::Gateway(e)) => {
                warn!("listing managed subscriptions failed: {}", e);
                return Err(ReconcileError::GatewayUnavailable(e).into());
            }
            Err(e) => return Err(e),
        };

        let plan = self.plan(&records, scope);
        debug!(actions = plan.actions.len(), "reconcile plan computed");

        let mut current: BTreeMap<String, RemoteSubscriptionRecord> = records
            .into_iter()
            .filter(|r| self.endpoints.webhook_id_of(&r.channel_endpoint).is_some())
            .map(|r| (r.remote_id.clone(), r))
            .collect();

        let mut report = ReconcileReport::default();
        for action in plan.actions {
            if self.cancel.is_cancelled() {
                warn!("shutdown requested, leaving remaining reconcile actions for the next start");
                report.interrupted = true;
                break;
            }
            self.apply(action, &mut current, &mut report).await;
        }

        self.snapshot.store(Arc::new(current.into_values().collect()));

        if report.is_clean() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                unchanged = report.unchanged.len(),
                "reconcile pass finished"
            );
        } else {
            warn!(failures = ?report.failures, "reconcile pass finished with failures");
        }
        Ok(report)
    }

    async fn apply(
        &self,
        action: PlannedAction,
        current: &mut BTreeMap<String, RemoteSubscriptionRecord>,
        report: &mut ReconcileReport,
    ) {
        match action {
            PlannedAction::Unchanged { webhook_id, .. } => {
                report.unchanged.push(webhook_id);
            }
            PlannedAction::Create { spec } => {
                let created = self.gateway.create(&spec).await;
                match created {
                    Ok(record) => {
                        info!(webhook_id = %spec.webhook_id, remote_id = %record.remote_id, "created remote subscription");
                        RECONCILE_ACTIONS.with_label_values(&["create"]).inc();
                        self.reset_health(&spec.webhook_id);
                        current.insert(record.remote_id.clone(), record);
                        report.created.push(spec.webhook_id);
                    }
                    Err(e) => report.failures.push(failure(&spec.webhook_id, "create", e)),
                }
            }
            PlannedAction::Update {
                remote_id,
                spec,
                reason,
            } => {
                debug!(webhook_id = %spec.webhook_id, %remote_id, ?reason, "updating remote subscription");
                let replaced = self.replace(&remote_id, &spec).await;
                match replaced {
                    Ok(record) => {
                        info!(webhook_id = %spec.webhook_id, remote_id = %record.remote_id, ?reason, "updated remote subscription");
                        RECONCILE_ACTIONS.with_label_values(&["update"]).inc();
                        self.reset_health(&spec.webhook_id);
                        current.remove(&remote_id);
                        current.insert(record.remote_id.clone(), record);
                        report.updated.push(spec.webhook_id);
                    }
                    Err((deleted, e)) => {
                        if deleted {
                            current.remove(&remote_id);
                        }
                        report.failures.push(failure(&spec.webhook_id, "update", e));
                    }
                }
            }
            PlannedAction::Delete {
                webhook_id,
                remote_id,
            } => match self.delete(&remote_id).await {
                Ok(()) => {
                    info!(%webhook_id, %remote_id, "deleted remote subscription");
                    RECONCILE_ACTIONS.with_label_values(&["delete"]).inc();
                    current.remove(&remote_id);
                    report.deleted.push(webhook_id);
                }
                Err(e) => report.failures.push(failure(&webhook_id, "delete", e)),
            },
        }
    }

    /// Either update in place or delete then recreate. On failure the flag
    /// tells whether the old record is already gone.
    async fn replace(
        &self,
        remote_id: &str,
        spec: &SubscriptionSpec,
    ) -> std::result::Result<RemoteSubscriptionRecord, (bool, Error)> {
        if self.config.update_in_place {
            return self.gateway.update(remote_id, spec).await.map_err(|e| (false, e));
        }

        self.delete(remote_id).await.map_err(|e| (false, e))?;
        self.gateway.create(spec).await.map_err(|e| (true, e))
    }

    /// Delete tolerating records that are already gone.
    async fn delete(
        &self,
        remote_id: &str,
    ) -> Result<()> {
        match self.gateway.delete(remote_id).await {
            Ok(()) => Ok(()),
            Err(Error::Gateway(GatewayError::NotFound(_))) => {
                debug!(%remote_id, "remote subscription already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reset_health(
        &self,
        webhook_id: &str,
    ) {
        if let Some(health) = &self.health {
            health.reset(webhook_id);
        }
    }

    /// Spawn the background loop: scheduled full passes plus triggered ones.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let rx = self
            .trigger_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Fatal("reconciler already started".to_string()))?;

        let reconciler = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            reconciler.run(rx).await;
        }));
        info!(interval_ms = self.config.interval_ms, "reconciler started");
        Ok(())
    }

    async fn run(
        &self,
        mut rx: mpsc::Receiver<ReconcileTrigger>,
    ) {
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("reconciler loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if !self.jitter().await {
                        return;
                    }
                    ReconcileTrigger::Full
                }
                Some(trigger) = rx.recv() => trigger,
            };

            let trigger = self.coalesce(trigger, &mut rx);
            let outcome = match &trigger {
                ReconcileTrigger::Full => self.reconcile().await,
                ReconcileTrigger::Scoped(ids) => self.reconcile_scoped(ids).await,
            };
            if let Err(e) = outcome {
                error!("reconcile pass failed: {}", e);
            }
        }
    }

    /// Merge every trigger queued behind `first`.
    fn coalesce(
        &self,
        first: ReconcileTrigger,
        rx: &mut mpsc::Receiver<ReconcileTrigger>,
    ) -> ReconcileTrigger {
        let mut trigger = first;
        while let Ok(next) = rx.try_recv() {
            trigger = trigger.merge(next);
        }
        if self.overflow.swap(false, Ordering::AcqRel) {
            trigger = ReconcileTrigger::Full;
        }
        trigger
    }

    /// Sleep a random part of `jitter_ms`. False when cancelled meanwhile.
    async fn jitter(&self) -> bool {
        if self.config.jitter_ms == 0 {
            return true;
        }
        let delay = rand::thread_rng().gen_range(0..=self.config.jitter_ms);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => true,
        }
    }

    /// Stop the loop. A running pass finishes its current operation first.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("reconciler task failed: {:?}", e);
            }
        }
    }
}

fn failure(
    webhook_id: &str,
    operation: &'static str,
    e: Error,
) -> OperationFailure {
    error!(%webhook_id, operation, "remote subscription operation failed: {}", e);
    OperationFailure {
        webhook_id: webhook_id.to_string(),
        operation,
        message: e.to_string(),
    }
}
