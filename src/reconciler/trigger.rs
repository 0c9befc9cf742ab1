use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Why a reconciliation pass is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileTrigger {
    Full,
    /// Recreate the records of these webhook ids only
    Scoped(BTreeSet<String>),
}

impl ReconcileTrigger {
    pub fn scoped<I, S>(webhook_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReconcileTrigger::Scoped(webhook_ids.into_iter().map(Into::into).collect())
    }

    /// A full pass absorbs any scoped one; scoped passes union their ids.
    pub fn merge(
        self,
        other: ReconcileTrigger,
    ) -> ReconcileTrigger {
        match (self, other) {
            (ReconcileTrigger::Scoped(mut ids), ReconcileTrigger::Scoped(more)) => {
                ids.extend(more);
                ReconcileTrigger::Scoped(ids)
            }
            _ => ReconcileTrigger::Full,
        }
    }
}

/// Cloneable, non-blocking way to ask the reconciler for a pass.
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    tx: mpsc::Sender<ReconcileTrigger>,
    overflow: Arc<AtomicBool>,
}

impl ReconcileHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<ReconcileTrigger>,
        overflow: Arc<AtomicBool>,
    ) -> Self {
        Self { tx, overflow }
    }

    /// Queue `trigger`. When the queue is full the next pass is widened to a
    /// full one instead of waiting for room.
    pub fn request(
        &self,
        trigger: ReconcileTrigger,
    ) {
        match self.tx.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(trigger)) => {
                debug!(?trigger, "reconcile queue full, next pass will be a full one");
                self.overflow.store(true, Ordering::Release);
            }
            Err(TrySendError::Closed(trigger)) => {
                debug!(?trigger, "reconciler stopped, trigger dropped");
            }
        }
    }
}
