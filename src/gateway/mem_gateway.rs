use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::RemoteSubscriptionRecord;
use super::SubscriptionGateway;
use super::SubscriptionSpec;
use super::SubscriptionStatus;
use crate::GatewayError;
use crate::Resource;
use crate::Result;

/// Counts of mutating calls received by a [`MemGateway`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatewayCallCounts {
    pub list: u64,
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl GatewayCallCounts {
    pub fn mutations(&self) -> u64 {
        self.create + self.update + self.delete
    }
}

/// In-process gateway keeping subscription records and resources in memory.
///
/// Created records start as `requested` unless
/// [`MemGateway::activate_on_create`] is set.
#[derive(Default)]
pub struct MemGateway {
    records: Mutex<BTreeMap<String, RemoteSubscriptionRecord>>,
    resources: Mutex<HashMap<String, Resource>>,
    next_id: AtomicU64,
    counts: Mutex<GatewayCallCounts>,
    failing_webhooks: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
    activate_on_create: bool,
}

impl MemGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// New records are reported as `active` right away.
    pub fn activate_on_create() -> Self {
        Self {
            activate_on_create: true,
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<RemoteSubscriptionRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn record(
        &self,
        remote_id: &str,
    ) -> Option<RemoteSubscriptionRecord> {
        self.records.lock().get(remote_id).cloned()
    }

    /// Insert a record as if another client had created it.
    pub fn insert_record(
        &self,
        record: RemoteSubscriptionRecord,
    ) {
        self.records.lock().insert(record.remote_id.clone(), record);
    }

    pub fn set_status(
        &self,
        remote_id: &str,
        status: SubscriptionStatus,
    ) {
        if let Some(record) = self.records.lock().get_mut(remote_id) {
            record.status = status;
        }
    }

    pub fn put_resource(
        &self,
        reference: impl Into<String>,
        resource: Resource,
    ) {
        self.resources.lock().insert(reference.into(), resource);
    }

    pub fn counts(&self) -> GatewayCallCounts {
        *self.counts.lock()
    }

    /// Make create/update calls for `webhook_id` fail until cleared.
    pub fn fail_webhook(
        &self,
        webhook_id: &str,
    ) {
        self.failing_webhooks.lock().insert(webhook_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_webhooks.lock().clear();
        *self.unavailable.lock() = false;
    }

    /// Make every call fail as if the remote server were down.
    pub fn set_unavailable(
        &self,
        unavailable: bool,
    ) {
        *self.unavailable.lock() = unavailable;
    }

    fn check_available(&self) -> Result<()> {
        if *self.unavailable.lock() {
            return Err(GatewayError::Unavailable("in-memory gateway marked unavailable".into()).into());
        }
        Ok(())
    }

    fn check_webhook(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<()> {
        if self.failing_webhooks.lock().contains(&spec.webhook_id) {
            return Err(GatewayError::Rejected(format!("injected failure for {}", spec.webhook_id)).into());
        }
        Ok(())
    }

    fn initial_status(&self) -> SubscriptionStatus {
        if self.activate_on_create {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Requested
        }
    }
}

#[async_trait]
impl SubscriptionGateway for MemGateway {
    async fn list(
        &self,
        tag: &str,
    ) -> Result<Vec<RemoteSubscriptionRecord>> {
        self.counts.lock().list += 1;
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.channel_endpoint.starts_with(tag))
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord> {
        self.counts.lock().create += 1;
        self.check_available()?;
        self.check_webhook(spec)?;

        let remote_id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = RemoteSubscriptionRecord::from_spec(remote_id.clone(), self.initial_status(), spec);
        debug!(remote_id = %remote_id, webhook_id = %spec.webhook_id, "mem gateway created subscription");
        self.records.lock().insert(remote_id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        remote_id: &str,
        spec: &SubscriptionSpec,
    ) -> Result<RemoteSubscriptionRecord> {
        self.counts.lock().update += 1;
        self.check_available()?;
        self.check_webhook(spec)?;

        let mut records = self.records.lock();
        if !records.contains_key(remote_id) {
            return Err(GatewayError::NotFound(remote_id.to_string()).into());
        }
        let record = RemoteSubscriptionRecord::from_spec(remote_id, self.initial_status(), spec);
        records.insert(remote_id.to_string(), record.clone());
        Ok(record)
    }

    async fn delete(
        &self,
        remote_id: &str,
    ) -> Result<()> {
        self.counts.lock().delete += 1;
        self.check_available()?;
        match self.records.lock().remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(remote_id.to_string()).into()),
        }
    }

    async fn fetch_resource(
        &self,
        reference: &str,
    ) -> Result<Resource> {
        self.check_available()?;
        self.resources
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()).into())
    }
}
