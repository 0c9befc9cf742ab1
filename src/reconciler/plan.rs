use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::RemoteSubscriptionRecord;
use crate::SubscriptionSpec;
use crate::SubscriptionStatus;
use crate::WebhookEndpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    /// A declared field differs from the remote record
    Drifted,
    /// The remote server reports the record as `error` or `off`
    Unhealthy(SubscriptionStatus),
    /// Requested by a scoped pass
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create {
        spec: SubscriptionSpec,
    },
    Unchanged {
        webhook_id: String,
        remote_id: String,
    },
    Update {
        remote_id: String,
        spec: SubscriptionSpec,
        reason: UpdateReason,
    },
    Delete {
        webhook_id: String,
        remote_id: String,
    },
}

impl PlannedAction {
    pub fn webhook_id(&self) -> &str {
        match self {
            PlannedAction::Create { spec } | PlannedAction::Update { spec, .. } => &spec.webhook_id,
            PlannedAction::Unchanged { webhook_id, .. } | PlannedAction::Delete { webhook_id, .. } => webhook_id,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, PlannedAction::Unchanged { .. })
    }
}

/// Actions converging the remote records, definitions first in declaration
/// order, then deletions of records no definition claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: Vec<PlannedAction>,
}

impl ReconcilePlan {
    pub fn compute(
        specs: &[SubscriptionSpec],
        records: &[RemoteSubscriptionRecord],
        endpoints: &WebhookEndpoints,
        scope: Option<&BTreeSet<String>>,
    ) -> Self {
        // Unmanaged records never enter the plan
        let mut managed: BTreeMap<&str, Vec<&RemoteSubscriptionRecord>> = BTreeMap::new();
        for record in records {
            if let Some(webhook_id) = endpoints.webhook_id_of(&record.channel_endpoint) {
                managed.entry(webhook_id).or_default().push(record);
            }
        }

        let mut actions = Vec::with_capacity(specs.len());
        for spec in specs {
            if scope.is_some_and(|ids| !ids.contains(&spec.webhook_id)) {
                continue;
            }

            let candidates = managed.remove(spec.webhook_id.as_str()).unwrap_or_default();
            if candidates.is_empty() {
                actions.push(PlannedAction::Create { spec: spec.clone() });
                continue;
            }

            let primary = candidates
                .iter()
                .position(|r| r.status.is_live() && r.matches_spec(spec))
                .unwrap_or(0);
            let record = candidates[primary];

            let reason = if scope.is_some() {
                Some(UpdateReason::Forced)
            } else if !record.status.is_live() {
                Some(UpdateReason::Unhealthy(record.status))
            } else if !record.matches_spec(spec) {
                Some(UpdateReason::Drifted)
            } else {
                None
            };

            actions.push(match reason {
                Some(reason) => PlannedAction::Update {
                    remote_id: record.remote_id.clone(),
                    spec: spec.clone(),
                    reason,
                },
                None => PlannedAction::Unchanged {
                    webhook_id: spec.webhook_id.clone(),
                    remote_id: record.remote_id.clone(),
                },
            });

            // Exactly one record per definition
            for (i, duplicate) in candidates.iter().enumerate() {
                if i != primary {
                    actions.push(PlannedAction::Delete {
                        webhook_id: spec.webhook_id.clone(),
                        remote_id: duplicate.remote_id.clone(),
                    });
                }
            }
        }

        if scope.is_none() {
            for (webhook_id, orphans) in managed {
                for record in orphans {
                    actions.push(PlannedAction::Delete {
                        webhook_id: webhook_id.to_string(),
                        remote_id: record.remote_id.clone(),
                    });
                }
            }
        }

        Self { actions }
    }

    pub fn mutations(&self) -> usize {
        self.actions.iter().filter(|a| a.is_mutation()).count()
    }
}
