//! A builder assembling a [`TbsNode`] from configuration and the host
//! application's collaborators.
//!
//! ## Key Design Points
//! - **Required**: the subscription definitions, plus a gateway whenever
//!   `reconcile.manage_subscriptions` is enabled. Without an explicit one an
//!   [`HttpGateway`] is built from `gateway.base_url`.
//! - **Defaults**: the delivery error handler falls back to a logging one, or
//!   a bounded recording one when `delivery.handle_delivery_errors` is set.
//! - **Lifecycle**: `build()` only wires components; background tasks start
//!   with [`TbsNode::start`].
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let node = TbsBuilder::new(config, shutdown_rx)
//!     .definitions(definitions)
//!     .gateway(Arc::new(my_gateway))
//!     .build()?;
//! node.start().await?;
//! ```

use std::sync::Arc;

use config::ConfigError;
use tokio::sync::watch;
use tracing::debug;

use crate::DefinitionSet;
use crate::DeliveryErrorHandler;
use crate::Error;
use crate::HealthMonitor;
use crate::HttpGateway;
use crate::LoggingDeliveryErrorHandler;
use crate::Reconciler;
use crate::RecordingDeliveryErrorHandler;
use crate::Result;
use crate::SubscriptionGateway;
use crate::TbsConfig;
use crate::TbsNode;
use crate::WebhookDispatcher;
use crate::WebhookEndpoints;

pub struct TbsBuilder<C> {
    config: TbsConfig,
    definitions: Option<DefinitionSet<C>>,
    gateway: Option<Arc<dyn SubscriptionGateway>>,
    delivery_error_handler: Option<Arc<dyn DeliveryErrorHandler>>,
    shutdown_signal: watch::Receiver<()>,
}

impl<C> TbsBuilder<C>
where
    C: Send + Sync + 'static,
{
    /// `config` is expected to be validated already.
    pub fn new(
        config: TbsConfig,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            definitions: None,
            gateway: None,
            delivery_error_handler: None,
            shutdown_signal,
        }
    }

    pub fn definitions(
        mut self,
        definitions: DefinitionSet<C>,
    ) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn gateway(
        mut self,
        gateway: Arc<dyn SubscriptionGateway>,
    ) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Replaces the default delivery error handler.
    pub fn delivery_error_handler(
        mut self,
        handler: Arc<dyn DeliveryErrorHandler>,
    ) -> Self {
        self.delivery_error_handler = Some(handler);
        self
    }

    /// Wire the components together.
    ///
    /// # Errors
    /// - no definitions were given
    /// - subscriptions are managed but no gateway or `webhook.app_url` is set
    /// - a definition's filters cannot be rendered as criteria
    pub fn build(self) -> Result<TbsNode<C>> {
        let config = self.config;
        let definitions = Arc::new(
            self.definitions
                .ok_or_else(|| Error::Fatal("no subscription definitions were provided".to_string()))?,
        );

        let health = Arc::new(HealthMonitor::for_definitions(&config.health, &definitions));

        let mut recorder = None;
        let delivery_errors: Arc<dyn DeliveryErrorHandler> = match self.delivery_error_handler {
            Some(handler) => handler,
            None if config.delivery.handle_delivery_errors => {
                let recording = Arc::new(RecordingDeliveryErrorHandler::new(config.delivery.failure_log_capacity));
                recorder = Some(recording.clone());
                recording
            }
            None => Arc::new(LoggingDeliveryErrorHandler),
        };

        let reconciler = if config.reconcile.manage_subscriptions {
            let gateway: Arc<dyn SubscriptionGateway> = match (self.gateway, config.gateway.base_url.is_some()) {
                (Some(gateway), _) => gateway,
                (None, true) => Arc::new(HttpGateway::new(&config.gateway)?),
                (None, false) => {
                    return Err(Error::Fatal(
                        "reconcile.manage_subscriptions is enabled but no gateway was provided".to_string(),
                    ))
                }
            };
            let app_url = config.webhook.app_url.as_deref().ok_or_else(|| {
                Error::Config(ConfigError::Message(
                    "webhook.app_url is required when reconcile.manage_subscriptions is enabled".into(),
                ))
            })?;
            let endpoints = WebhookEndpoints::new(app_url, &config.webhook.path_prefix);
            debug!(tag = endpoints.tag(), "managed subscription endpoints");

            let reconciler = Reconciler::new(
                &definitions,
                gateway,
                endpoints,
                config.webhook.token.as_deref(),
                config.reconcile.clone(),
            )?
            .with_health(health.clone());
            Some(Arc::new(reconciler))
        } else {
            None
        };

        let mut dispatcher = WebhookDispatcher::new(
            definitions.clone(),
            config.webhook.token.clone(),
            health.clone(),
            delivery_errors,
        );
        if let Some(reconciler) = &reconciler {
            dispatcher = dispatcher.with_reconcile_handle(reconciler.handle());
        }

        Ok(TbsNode {
            config: Arc::new(config),
            definitions,
            dispatcher: Arc::new(dispatcher),
            health,
            reconciler,
            recorder,
            shutdown_signal: self.shutdown_signal,
        })
    }
}
