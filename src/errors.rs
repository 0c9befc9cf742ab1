//! Topic-Based Subscription Error Hierarchy
//!
//! Errors are grouped by the layer that raises them:
//! - construction-time problems with declared subscriptions (fatal at startup)
//! - transport-level webhook failures (mapped to HTTP status codes)
//! - remote gateway failures (recovered by the next reconciliation pass)

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by application handlers.
///
/// Handler failures never leave the dispatcher as an [`Error`]; they are
/// logged and forwarded to the delivery error handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid subscription declarations
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Inbound webhook request rejected before any handler ran
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Remote subscription gateway failures
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Reconciliation finished with some operations failing
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Background task join failures
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Duplicate webhook id `{0}`")]
    DuplicateWebhookId(String),

    #[error("Invalid payload content `{0}`, expected `id-only` or `full-resource`")]
    InvalidPayloadContent(String),

    #[error("Subscription topic must not be empty")]
    EmptyTopic,

    #[error("Webhook id `{0}` is not a valid path segment")]
    InvalidWebhookId(String),

    #[error("{field} must be a positive integer for `{webhook_id}`")]
    NonPositive {
        webhook_id: String,
        field: &'static str,
    },

    /// Criteria syntax only expresses filters over a single resource type
    #[error("Filters mix resource types `{first}` and `{other}`")]
    MixedFilterResourceTypes { first: String, other: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("No subscription is registered for webhook id `{0}`")]
    UnknownWebhookId(String),

    #[error("Missing or invalid X-Api-Key for webhook id `{0}`")]
    Unauthorized(String),

    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),

    /// Requests arriving after shutdown began
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

impl WebhookError {
    /// HTTP status returned to the remote server for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::UnknownWebhookId(_) => 404,
            WebhookError::Unauthorized(_) => 401,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::ShuttingDown => 503,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transient transport failure talking to the remote server
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote subscription `{0}` not found")]
    NotFound(String),

    /// The remote server refused the request (validation, permissions)
    #[error("Remote server rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected remote resource shape: {0}")]
    Decode(String),
}

/// One failed operation inside a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub webhook_id: String,
    pub operation: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Reconciliation partially failed: {} operation(s)", .0.len())]
    PartialReconciliationFailure(Vec<OperationFailure>),

    #[error("Gateway unavailable while listing managed subscriptions: {0}")]
    GatewayUnavailable(#[source] GatewayError),
}
