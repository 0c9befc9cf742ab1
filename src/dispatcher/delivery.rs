use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::error;
use tracing::warn;

use crate::SubscriptionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailureKind {
    /// A handler returned an error for one event
    Handler {
        event_number: u64,
        reference: String,
        message: String,
    },
    /// `events_since_subscription_start` skipped ahead
    MissedEvents { gap: u64, events_since_start: u64 },
    /// `events_since_subscription_start` went backwards
    RemoteReset { previous: u64, current: u64 },
    /// The envelope reported the subscription as `error` or `off`
    SubscriptionError { status: SubscriptionStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub webhook_id: String,
    pub kind: DeliveryFailureKind,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryFailure {
    pub fn new(
        webhook_id: impl Into<String>,
        kind: DeliveryFailureKind,
    ) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            kind,
            occurred_at: Utc::now(),
        }
    }
}

/// Receives every failure or anomaly observed while dispatching.
///
/// Redelivery is not attempted by the dispatcher; implementations decide
/// what, if anything, to do with a failure.
pub trait DeliveryErrorHandler: Send + Sync + 'static {
    fn report(
        &self,
        failure: DeliveryFailure,
    );
}

/// Default handler: log and forget.
#[derive(Debug, Default)]
pub struct LoggingDeliveryErrorHandler;

impl DeliveryErrorHandler for LoggingDeliveryErrorHandler {
    fn report(
        &self,
        failure: DeliveryFailure,
    ) {
        log_failure(&failure);
    }
}

/// Keeps the most recent failures in a bounded buffer.
#[derive(Debug)]
pub struct RecordingDeliveryErrorHandler {
    capacity: usize,
    failures: Mutex<VecDeque<DeliveryFailure>>,
}

impl RecordingDeliveryErrorHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Recorded failures, oldest first.
    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.failures.lock().clear();
    }
}

impl DeliveryErrorHandler for RecordingDeliveryErrorHandler {
    fn report(
        &self,
        failure: DeliveryFailure,
    ) {
        log_failure(&failure);
        let mut failures = self.failures.lock();
        if failures.len() == self.capacity {
            failures.pop_front();
        }
        failures.push_back(failure);
    }
}

fn log_failure(failure: &DeliveryFailure) {
    let webhook_id = failure.webhook_id.as_str();
    match &failure.kind {
        DeliveryFailureKind::Handler {
            event_number,
            reference,
            message,
        } => error!(webhook_id, event_number, %reference, "handler failed: {}", message),
        DeliveryFailureKind::MissedEvents {
            gap,
            events_since_start,
        } => warn!(webhook_id, gap, events_since_start, "missed events detected"),
        DeliveryFailureKind::RemoteReset { previous, current } => {
            warn!(webhook_id, previous, current, "remote event counter went backwards")
        }
        DeliveryFailureKind::SubscriptionError { status } => {
            warn!(webhook_id, %status, "subscription reported unhealthy")
        }
    }
}
